//! Merges subgraph SDLs into a [`Supergraph`].
//!
//! Types with the same name across subgraphs merge field by field. A field's
//! owners are the subgraphs declaring it without `@external`; key fields count
//! as owned by every subgraph that declares the `@key`.

use std::collections::HashMap;

use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Directive, Document, Field, TypeDefinition, TypeExtension, Value};
use indexmap::IndexMap;

use crate::ServiceConfig;
use crate::error::CompositionError;
use crate::supergraph::{FieldDef, OwnershipMap, Supergraph, TypeDef, TypeKind, TypeRef};

pub fn compose(subgraphs: Vec<(ServiceConfig, String)>) -> Result<Supergraph, CompositionError> {
    let documents = subgraphs
        .iter()
        .map(|(service, sdl)| {
            parse_schema::<String>(sdl).map_err(|e| CompositionError::InvalidSdl {
                service: service.name.clone(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut composer = Composer::default();
    for document in &documents {
        composer.read_root_names(document);
    }
    for ((service, _), document) in subgraphs.iter().zip(&documents) {
        composer.add_document(&service.name, document)?;
    }
    drop(documents);
    let supergraph = composer.finish(subgraphs)?;
    tracing::debug!(
        types = supergraph.types.len(),
        owned_fields = supergraph.ownership.len(),
        "composed supergraph"
    );
    Ok(supergraph)
}

#[derive(Default)]
struct Composer {
    types: IndexMap<String, TypeDef>,
    declared_by: HashMap<String, String>,
    field_declarations: HashMap<String, (String, TypeRef)>,
    implementations: Vec<(String, String)>,
    ownership: OwnershipMap,
    query_type: Option<String>,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
}

/// Fields and directives shared by object and interface declarations.
struct CompositeDeclaration<'d, 'a> {
    name: &'d str,
    kind: TypeKind,
    implements: &'d [String],
    directives: &'d [Directive<'a, String>],
    fields: &'d [Field<'a, String>],
}

impl Composer {
    fn read_root_names(&mut self, document: &Document<'_, String>) {
        for definition in &document.definitions {
            if let Definition::SchemaDefinition(schema) = definition {
                if self.query_type.is_none() {
                    self.query_type = schema.query.clone();
                }
                if self.mutation_type.is_none() {
                    self.mutation_type = schema.mutation.clone();
                }
                if self.subscription_type.is_none() {
                    self.subscription_type = schema.subscription.clone();
                }
            }
        }
    }

    fn add_document(
        &mut self,
        service: &str,
        document: &Document<'_, String>,
    ) -> Result<(), CompositionError> {
        for definition in &document.definitions {
            match definition {
                Definition::TypeDefinition(definition) => self.add_type_definition(service, definition)?,
                Definition::TypeExtension(extension) => self.add_type_extension(service, extension)?,
                Definition::SchemaDefinition(_) | Definition::DirectiveDefinition(_) => {}
            }
        }
        Ok(())
    }

    fn add_type_definition(
        &mut self,
        service: &str,
        definition: &TypeDefinition<'_, String>,
    ) -> Result<(), CompositionError> {
        match definition {
            TypeDefinition::Object(object) => self.add_composite(
                service,
                CompositeDeclaration {
                    name: &object.name,
                    kind: TypeKind::Object,
                    implements: &object.implements_interfaces,
                    directives: &object.directives,
                    fields: &object.fields,
                },
            ),
            TypeDefinition::Interface(interface) => self.add_composite(
                service,
                CompositeDeclaration {
                    name: &interface.name,
                    kind: TypeKind::Interface,
                    implements: &[],
                    directives: &interface.directives,
                    fields: &interface.fields,
                },
            ),
            TypeDefinition::Union(union) => self.add_union(service, &union.name, &union.types),
            TypeDefinition::Enum(enum_type) => self.declare(service, &enum_type.name, TypeKind::Enum).map(drop),
            TypeDefinition::Scalar(scalar) => self.declare(service, &scalar.name, TypeKind::Scalar).map(drop),
            TypeDefinition::InputObject(input) => {
                self.declare(service, &input.name, TypeKind::InputObject).map(drop)
            }
        }
    }

    fn add_type_extension(
        &mut self,
        service: &str,
        extension: &TypeExtension<'_, String>,
    ) -> Result<(), CompositionError> {
        match extension {
            TypeExtension::Object(object) => self.add_composite(
                service,
                CompositeDeclaration {
                    name: &object.name,
                    kind: TypeKind::Object,
                    implements: &object.implements_interfaces,
                    directives: &object.directives,
                    fields: &object.fields,
                },
            ),
            TypeExtension::Interface(interface) => self.add_composite(
                service,
                CompositeDeclaration {
                    name: &interface.name,
                    kind: TypeKind::Interface,
                    implements: &[],
                    directives: &interface.directives,
                    fields: &interface.fields,
                },
            ),
            TypeExtension::Union(union) => self.add_union(service, &union.name, &union.types),
            TypeExtension::Enum(enum_type) => self.declare(service, &enum_type.name, TypeKind::Enum).map(drop),
            TypeExtension::Scalar(scalar) => self.declare(service, &scalar.name, TypeKind::Scalar).map(drop),
            TypeExtension::InputObject(input) => {
                self.declare(service, &input.name, TypeKind::InputObject).map(drop)
            }
        }
    }

    /// Registers `name` as declared by `service`, failing if an earlier
    /// subgraph declared it with a different kind. Federation plumbing types
    /// return `None` and are left out of the supergraph.
    fn declare(
        &mut self,
        service: &str,
        name: &str,
        kind: TypeKind,
    ) -> Result<Option<&mut TypeDef>, CompositionError> {
        if is_federation_type(name) {
            return Ok(None);
        }
        if let Some(existing) = self.types.get(name) {
            if existing.kind != kind {
                return Err(CompositionError::TypeKindConflict {
                    type_name: name.to_owned(),
                    first_service: self.declared_by.get(name).cloned().unwrap_or_default(),
                    first_kind: existing.kind.to_string(),
                    second_service: service.to_owned(),
                    second_kind: kind.to_string(),
                });
            }
        }
        self.declared_by
            .entry(name.to_owned())
            .or_insert_with(|| service.to_owned());
        Ok(Some(
            self.types
                .entry(name.to_owned())
                .or_insert_with(|| TypeDef::new(name, kind)),
        ))
    }

    fn add_composite(
        &mut self,
        service: &str,
        declaration: CompositeDeclaration<'_, '_>,
    ) -> Result<(), CompositionError> {
        let name = declaration.name;
        let is_root = self.is_root_type(name);
        let Some(type_def) = self.declare(service, name, declaration.kind)? else {
            return Ok(());
        };

        let key = declaration
            .directives
            .iter()
            .filter(|directive| directive.name == "key")
            .find_map(key_fields);
        if let Some(key) = key {
            type_def.keys.entry(service.to_owned()).or_insert(key);
        }
        let key = type_def.keys.get(service).cloned().unwrap_or_default();

        for interface in declaration.implements {
            self.implementations.push((interface.clone(), name.to_owned()));
        }

        for field in declaration.fields {
            if is_root && field.name.starts_with('_') {
                continue;
            }
            let ty = TypeRef::from(&field.field_type);
            let declaration_key = format!("{name}.{}", field.name);
            match self.field_declarations.get(&declaration_key) {
                Some((first_service, first_type)) if *first_type != ty => {
                    return Err(CompositionError::FieldTypeConflict {
                        type_name: name.to_owned(),
                        field: field.name.clone(),
                        first_service: first_service.clone(),
                        first_type: first_type.to_string(),
                        second_service: service.to_owned(),
                        second_type: ty.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    self.field_declarations
                        .insert(declaration_key, (service.to_owned(), ty.clone()));
                }
            }

            if let Some(type_def) = self.types.get_mut(name) {
                type_def
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| FieldDef {
                        name: field.name.clone(),
                        ty,
                    });
            }

            let external = field.directives.iter().any(|d| d.name == "external");
            if !external || key.contains(&field.name) {
                self.ownership.add(name, &field.name, service);
            }
        }
        Ok(())
    }

    fn add_union(
        &mut self,
        service: &str,
        name: &str,
        members: &[String],
    ) -> Result<(), CompositionError> {
        if let Some(type_def) = self.declare(service, name, TypeKind::Union)? {
            for member in members {
                if !type_def.possible_types.contains(member) {
                    type_def.possible_types.push(member.clone());
                }
            }
        }
        Ok(())
    }

    fn is_root_type(&self, name: &str) -> bool {
        name == self.query_type.as_deref().unwrap_or("Query")
            || name == self.mutation_type.as_deref().unwrap_or("Mutation")
            || name == self.subscription_type.as_deref().unwrap_or("Subscription")
    }

    fn finish(mut self, subgraphs: Vec<(ServiceConfig, String)>) -> Result<Supergraph, CompositionError> {
        for (interface, implementor) in std::mem::take(&mut self.implementations) {
            if let Some(type_def) = self.types.get_mut(&interface) {
                if type_def.kind == TypeKind::Interface && !type_def.possible_types.contains(&implementor) {
                    type_def.possible_types.push(implementor);
                }
            }
        }

        let query_type = self.query_type.unwrap_or_else(|| "Query".to_owned());
        let has_query_fields = self
            .types
            .get(&query_type)
            .is_some_and(|def| def.kind == TypeKind::Object && !def.fields.is_empty());
        if !has_query_fields {
            return Err(CompositionError::MissingQueryType);
        }

        let (services, sdls) = subgraphs.into_iter().unzip();
        Ok(Supergraph {
            version: 0,
            services,
            sdls,
            types: self.types,
            ownership: self.ownership,
            query_type,
            mutation_type: self.mutation_type.unwrap_or_else(|| "Mutation".to_owned()),
            subscription_type: self
                .subscription_type
                .unwrap_or_else(|| "Subscription".to_owned()),
        })
    }
}

/// Reads `@key(fields: "...")`. Nested selections in a key are not supported
/// and such keys are skipped.
fn key_fields(directive: &Directive<'_, String>) -> Option<Vec<String>> {
    let fields = directive.arguments.iter().find_map(|(name, value)| match value {
        Value::String(fields) if name == "fields" => Some(fields),
        _ => None,
    })?;
    if fields.contains('{') {
        tracing::warn!(%fields, "ignoring @key with nested fields");
        return None;
    }
    let fields: Vec<String> = fields.split_whitespace().map(str::to_owned).collect();
    (!fields.is_empty()).then_some(fields)
}

fn is_federation_type(name: &str) -> bool {
    name.starts_with('_') || name.contains("__")
}
