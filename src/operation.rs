//! Client operations, parsed and normalized against a supergraph.
//!
//! Normalization resolves every field's type, inlines named fragments as
//! typed inline fragments and prints argument values back to GraphQL so the
//! planner can copy them verbatim into subgraph operations.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use graphql_parser::parse_query;
use graphql_parser::query::{
    Definition, Directive as AstDirective, FragmentDefinition, OperationDefinition,
    Selection as AstSelection, SelectionSet, TypeCondition, Value as AstValue,
    VariableDefinition as AstVariableDefinition,
};

use crate::error::PlanningError;
use crate::supergraph::{Supergraph, TypeRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub ty: TypeRef,
    /// Default value, printed as GraphQL.
    pub default_value: Option<String>,
}

/// An argument whose value is printed as GraphQL.
#[derive(Clone, Debug, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub arguments: Vec<Argument>,
}

impl Directive {
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments
            .iter()
            .find(|argument| argument.name == name)
            .map(|argument| argument.value.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<Argument>,
    pub directives: Vec<Directive>,
    pub selections: Vec<Selection>,
    /// Type the field was selected on.
    pub parent_type: String,
    pub ty: TypeRef,
    /// Variables used by this field's arguments and directives.
    pub variables: Vec<String>,
}

impl Field {
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// A plain field without arguments or sub-selections, such as a key field.
    pub(crate) fn leaf(parent_type: &str, name: &str, ty: TypeRef) -> Field {
        Field {
            alias: None,
            name: name.to_owned(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selections: Vec::new(),
            parent_type: parent_type.to_owned(),
            ty,
            variables: Vec::new(),
        }
    }

    pub(crate) fn typename(parent_type: &str) -> Field {
        Field::leaf(
            parent_type,
            "__typename",
            TypeRef::NonNull(Box::new(TypeRef::Named("String".to_owned()))),
        )
    }

    pub(crate) fn without_selections(&self) -> Field {
        Field {
            alias: self.alias.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            directives: self.directives.clone(),
            selections: Vec::new(),
            parent_type: self.parent_type.clone(),
            ty: self.ty.clone(),
            variables: self.variables.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub directives: Vec<Directive>,
    pub selections: Vec<Selection>,
    pub variables: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(Field),
    InlineFragment(InlineFragment),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub root_type: String,
    pub variable_definitions: Vec<VariableDefinition>,
    pub selections: Vec<Selection>,
}

impl Operation {
    /// Parses `query` and normalizes the selected operation. A missing or
    /// empty `operation_name` is only accepted when the document holds a
    /// single operation.
    pub fn parse(
        schema: &Supergraph,
        query: &str,
        operation_name: Option<&str>,
    ) -> Result<Operation, PlanningError> {
        let document =
            parse_query::<String>(query).map_err(|e| PlanningError::Parse(e.to_string()))?;

        let mut operations = Vec::new();
        let mut fragments = HashMap::new();
        for definition in &document.definitions {
            match definition {
                Definition::Operation(operation) => operations.push(operation),
                Definition::Fragment(fragment) => {
                    fragments.insert(fragment.name.as_str(), fragment);
                }
            }
        }

        let operation = match operation_name.filter(|name| !name.is_empty()) {
            Some(name) => operations
                .iter()
                .copied()
                .find(|operation| operation_name_of(operation) == Some(name))
                .ok_or_else(|| PlanningError::UnknownOperation(name.to_owned()))?,
            None => match operations.as_slice() {
                [single] => *single,
                [] => return Err(PlanningError::NoOperation),
                _ => return Err(PlanningError::OperationNameRequired),
            },
        };

        let (kind, variable_definitions, selection_set) = match operation {
            OperationDefinition::SelectionSet(set) => (OperationKind::Query, &[][..], set),
            OperationDefinition::Query(query) => (
                OperationKind::Query,
                &query.variable_definitions[..],
                &query.selection_set,
            ),
            OperationDefinition::Mutation(mutation) => (
                OperationKind::Mutation,
                &mutation.variable_definitions[..],
                &mutation.selection_set,
            ),
            OperationDefinition::Subscription(subscription) => (
                OperationKind::Subscription,
                &subscription.variable_definitions[..],
                &subscription.selection_set,
            ),
        };

        let root_type = schema
            .root_type_name(kind)
            .ok_or_else(|| PlanningError::MissingRootType(kind.to_string()))?
            .to_owned();

        let mut normalizer = Normalizer {
            schema,
            fragments,
            declared_variables: variable_definitions
                .iter()
                .map(|definition| definition.name.clone())
                .collect(),
            spreading: Vec::new(),
        };
        let selections = normalizer.selection_set(&root_type, selection_set)?;

        Ok(Operation {
            kind,
            name: operation_name_of(operation).map(str::to_owned),
            root_type,
            variable_definitions: variable_definitions.iter().map(variable_definition).collect(),
            selections,
        })
    }

    pub fn variable_definition(&self, name: &str) -> Option<&VariableDefinition> {
        self.variable_definitions
            .iter()
            .find(|definition| definition.name == name)
    }
}

fn operation_name_of<'a>(operation: &'a OperationDefinition<'_, String>) -> Option<&'a str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(query) => query.name.as_deref(),
        OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
    }
}

fn variable_definition(definition: &AstVariableDefinition<'_, String>) -> VariableDefinition {
    VariableDefinition {
        name: definition.name.clone(),
        ty: TypeRef::from(&definition.var_type),
        default_value: definition.default_value.as_ref().map(|value| {
            let mut printed = String::new();
            print_value(value, &mut printed, &mut Vec::new());
            printed
        }),
    }
}

struct Normalizer<'s, 'd, 'a> {
    schema: &'s Supergraph,
    fragments: HashMap<&'d str, &'d FragmentDefinition<'a, String>>,
    declared_variables: Vec<String>,
    spreading: Vec<String>,
}

impl<'s, 'd, 'a> Normalizer<'s, 'd, 'a> {
    fn selection_set(
        &mut self,
        parent_type: &str,
        set: &'d SelectionSet<'a, String>,
    ) -> Result<Vec<Selection>, PlanningError> {
        let mut selections = Vec::with_capacity(set.items.len());
        for item in &set.items {
            let selection = match item {
                AstSelection::Field(field) => {
                    // `__`-prefixed response keys carry the gateway's own helper fields.
                    if let Some(alias) = field.alias.as_ref().filter(|alias| alias.starts_with("__")) {
                        return Err(PlanningError::ReservedAlias(alias.clone()));
                    }
                    let ty = if field.name == "__typename" {
                        Field::typename(parent_type).ty
                    } else {
                        self.schema
                            .field(parent_type, &field.name)
                            .ok_or_else(|| PlanningError::UnknownField {
                                type_name: parent_type.to_owned(),
                                field: field.name.clone(),
                            })?
                            .ty
                            .clone()
                    };

                    let nested = if field.selection_set.items.is_empty() {
                        Vec::new()
                    } else {
                        let named = ty.named().to_owned();
                        if self.schema.type_def(&named).is_none() {
                            return Err(PlanningError::UnknownType(named));
                        }
                        self.selection_set(&named, &field.selection_set)?
                    };

                    let mut variables = Vec::new();
                    let arguments = field
                        .arguments
                        .iter()
                        .map(|(name, value)| Argument {
                            name: name.clone(),
                            value: print_to_string(value, &mut variables),
                        })
                        .collect();
                    let directives = self.directives(&field.directives, &mut variables)?;
                    self.check_variables(&variables)?;

                    Selection::Field(Field {
                        alias: field.alias.clone(),
                        name: field.name.clone(),
                        arguments,
                        directives,
                        selections: nested,
                        parent_type: parent_type.to_owned(),
                        ty,
                        variables,
                    })
                }
                AstSelection::InlineFragment(fragment) => {
                    let type_condition = match &fragment.type_condition {
                        Some(TypeCondition::On(name)) => Some(self.known_type(name)?),
                        None => None,
                    };
                    let scope = type_condition.as_deref().unwrap_or(parent_type).to_owned();
                    let nested = self.selection_set(&scope, &fragment.selection_set)?;
                    let mut variables = Vec::new();
                    let directives = self.directives(&fragment.directives, &mut variables)?;
                    Selection::InlineFragment(InlineFragment {
                        type_condition,
                        directives,
                        selections: nested,
                        variables,
                    })
                }
                AstSelection::FragmentSpread(spread) => {
                    let name = spread.fragment_name.as_str();
                    let fragment = *self
                        .fragments
                        .get(name)
                        .ok_or_else(|| PlanningError::UnknownFragment(name.to_owned()))?;
                    if self.spreading.iter().any(|active| active == name) {
                        return Err(PlanningError::FragmentCycle(name.to_owned()));
                    }
                    let TypeCondition::On(condition) = &fragment.type_condition;
                    let condition = self.known_type(condition)?;

                    self.spreading.push(name.to_owned());
                    let nested = self.selection_set(&condition, &fragment.selection_set);
                    self.spreading.pop();

                    let mut variables = Vec::new();
                    let directives = self.directives(&spread.directives, &mut variables)?;
                    Selection::InlineFragment(InlineFragment {
                        type_condition: Some(condition),
                        directives,
                        selections: nested?,
                        variables,
                    })
                }
            };
            selections.push(selection);
        }
        Ok(selections)
    }

    fn known_type(&self, name: &str) -> Result<String, PlanningError> {
        match self.schema.type_def(name) {
            Some(_) => Ok(name.to_owned()),
            None => Err(PlanningError::UnknownType(name.to_owned())),
        }
    }

    fn directives(
        &self,
        directives: &[AstDirective<'a, String>],
        variables: &mut Vec<String>,
    ) -> Result<Vec<Directive>, PlanningError> {
        let directives = directives
            .iter()
            .map(|directive| Directive {
                name: directive.name.clone(),
                arguments: directive
                    .arguments
                    .iter()
                    .map(|(name, value)| Argument {
                        name: name.clone(),
                        value: print_to_string(value, variables),
                    })
                    .collect(),
            })
            .collect();
        self.check_variables(variables)?;
        Ok(directives)
    }

    fn check_variables(&self, variables: &[String]) -> Result<(), PlanningError> {
        match variables
            .iter()
            .find(|used| !self.declared_variables.contains(used))
        {
            Some(unknown) => Err(PlanningError::UnknownVariable(unknown.clone())),
            None => Ok(()),
        }
    }
}

fn print_to_string(value: &AstValue<'_, String>, variables: &mut Vec<String>) -> String {
    let mut printed = String::new();
    print_value(value, &mut printed, variables);
    printed
}

/// Prints a GraphQL input value, recording every variable it references.
pub(crate) fn print_value(value: &AstValue<'_, String>, out: &mut String, variables: &mut Vec<String>) {
    match value {
        AstValue::Variable(name) => {
            out.push('$');
            out.push_str(name);
            if !variables.contains(name) {
                variables.push(name.clone());
            }
        }
        AstValue::Int(number) => {
            let _ = write!(out, "{}", number.as_i64().unwrap_or_default());
        }
        AstValue::Float(number) => {
            let _ = write!(out, "{number:?}");
        }
        AstValue::String(string) => {
            out.push_str(&serde_json::Value::String(string.clone()).to_string());
        }
        AstValue::Boolean(boolean) => {
            let _ = write!(out, "{boolean}");
        }
        AstValue::Null => out.push_str("null"),
        AstValue::Enum(name) => out.push_str(name),
        AstValue::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                print_value(item, out, variables);
            }
            out.push(']');
        }
        AstValue::Object(fields) => {
            out.push('{');
            for (i, (name, item)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(name);
                out.push(':');
                print_value(item, out, variables);
            }
            out.push('}');
        }
    }
}
