//! The composed view of every subgraph: merged types, field ownership and
//! entity keys. A `Supergraph` is immutable once published.

use std::collections::HashMap;
use std::fmt;

use graphql_parser::schema::Type;
use indexmap::IndexMap;

use crate::ServiceConfig;
use crate::operation::OperationKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Enum,
    Scalar,
    InputObject,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TypeKind::Object => "object",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
            TypeKind::Scalar => "scalar",
            TypeKind::InputObject => "input object",
        })
    }
}

/// A GraphQL type reference such as `[Product!]!`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named(),
        }
    }

    /// Number of list wrappers between the field and its named type.
    pub fn list_depth(&self) -> usize {
        match self {
            TypeRef::Named(_) => 0,
            TypeRef::NonNull(inner) => inner.list_depth(),
            TypeRef::List(inner) => 1 + inner.list_depth(),
        }
    }

    /// Element type if this is a (possibly non-null) list.
    pub fn list_item(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::List(inner) => Some(inner),
            TypeRef::NonNull(inner) => inner.list_item(),
            TypeRef::Named(_) => None,
        }
    }
}

impl<'a> From<&Type<'a, String>> for TypeRef {
    fn from(ty: &Type<'a, String>) -> Self {
        match ty {
            Type::NamedType(name) => TypeRef::Named(name.clone()),
            Type::ListType(inner) => TypeRef::List(Box::new(TypeRef::from(inner.as_ref()))),
            Type::NonNullType(inner) => TypeRef::NonNull(Box::new(TypeRef::from(inner.as_ref()))),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Clone, Debug)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    pub fields: IndexMap<String, FieldDef>,
    /// Union members, or the object types implementing an interface.
    pub possible_types: Vec<String>,
    /// Entity key fields per subgraph declaring `@key` on this type.
    pub keys: IndexMap<String, Vec<String>>,
}

impl TypeDef {
    pub(crate) fn new(name: &str, kind: TypeKind) -> Self {
        TypeDef {
            name: name.to_owned(),
            kind,
            fields: IndexMap::new(),
            possible_types: Vec::new(),
            keys: IndexMap::new(),
        }
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.kind, TypeKind::Interface | TypeKind::Union)
    }
}

/// `"Type.field"` to the subgraphs able to resolve it, in configuration order.
#[derive(Clone, Debug, Default)]
pub struct OwnershipMap {
    owners: HashMap<String, Vec<String>>,
}

impl OwnershipMap {
    pub fn owners(&self, type_name: &str, field: &str) -> &[String] {
        self.owners
            .get(&format!("{type_name}.{field}"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn add(&mut self, type_name: &str, field: &str, service: &str) {
        let owners = self.owners.entry(format!("{type_name}.{field}")).or_default();
        if !owners.iter().any(|owner| owner == service) {
            owners.push(service.to_owned());
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Supergraph {
    pub(crate) version: u64,
    pub(crate) services: Vec<ServiceConfig>,
    pub(crate) sdls: Vec<String>,
    pub(crate) types: IndexMap<String, TypeDef>,
    pub(crate) ownership: OwnershipMap,
    pub(crate) query_type: String,
    pub(crate) mutation_type: String,
    pub(crate) subscription_type: String,
}

impl Supergraph {
    /// Monotonic version assigned when the registry published this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn services(&self) -> &[ServiceConfig] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|service| service.name == name)
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldDef> {
        self.types.get(type_name)?.fields.get(field)
    }

    pub fn ownership(&self) -> &OwnershipMap {
        &self.ownership
    }

    pub fn owners(&self, type_name: &str, field: &str) -> &[String] {
        self.ownership.owners(type_name, field)
    }

    pub fn entity_key(&self, type_name: &str, service: &str) -> Option<&[String]> {
        self.types
            .get(type_name)?
            .keys
            .get(service)
            .map(Vec::as_slice)
    }

    pub fn is_abstract(&self, type_name: &str) -> bool {
        self.types.get(type_name).is_some_and(TypeDef::is_abstract)
    }

    pub fn possible_types(&self, type_name: &str) -> &[String] {
        self.types
            .get(type_name)
            .map(|def| def.possible_types.as_slice())
            .unwrap_or(&[])
    }

    /// Whether a fragment on `condition` applies to an object of `runtime_type`.
    pub fn type_condition_matches(&self, condition: &str, runtime_type: &str) -> bool {
        condition == runtime_type
            || self
                .possible_types(condition)
                .iter()
                .any(|possible| possible == runtime_type)
    }

    pub fn root_type_name(&self, kind: OperationKind) -> Option<&str> {
        let name = match kind {
            OperationKind::Query => &self.query_type,
            OperationKind::Mutation => &self.mutation_type,
            OperationKind::Subscription => &self.subscription_type,
        };
        self.types
            .get(name)
            .filter(|def| !def.fields.is_empty())
            .map(|_| name.as_str())
    }

    /// True when this snapshot was composed from exactly these inputs.
    pub fn is_composed_from(&self, subgraphs: &[(ServiceConfig, String)]) -> bool {
        self.services.len() == subgraphs.len()
            && self
                .services
                .iter()
                .zip(&self.sdls)
                .zip(subgraphs)
                .all(|((service, sdl), (other_service, other_sdl))| {
                    service == other_service && sdl == other_sdl
                })
    }
}
