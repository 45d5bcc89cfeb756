//! Projects merged subgraph data onto the client's selection set.
//!
//! Only requested response keys survive, in request order. Fields the planner
//! injected (`__typename`, key fields) are dropped unless the client asked
//! for them. Missing values come out as `null`.

use serde_json::{Map, Value};

use crate::operation::{Directive, Operation, Selection};
use crate::supergraph::{Supergraph, TypeRef};
use crate::json_ext::ValueExt;

pub(crate) fn shape_response(
    schema: &Supergraph,
    operation: &Operation,
    data: &Value,
    variables: &Map<String, Value>,
) -> Value {
    let shaper = Shaper {
        schema,
        operation,
        variables,
    };
    Value::Object(shaper.object(&operation.root_type, &operation.selections, data.as_object()))
}

struct Shaper<'a> {
    schema: &'a Supergraph,
    operation: &'a Operation,
    variables: &'a Map<String, Value>,
}

impl Shaper<'_> {
    fn object(
        &self,
        parent_type: &str,
        selections: &[Selection],
        source: Option<&Map<String, Value>>,
    ) -> Map<String, Value> {
        let mut shaped = Map::new();
        let runtime_type = source
            .and_then(|object| object.get("__typename"))
            .and_then(Value::as_str)
            .unwrap_or(parent_type);
        self.apply(runtime_type, selections, source, &mut shaped);
        shaped
    }

    fn apply(
        &self,
        runtime_type: &str,
        selections: &[Selection],
        source: Option<&Map<String, Value>>,
        shaped: &mut Map<String, Value>,
    ) {
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    if !self.included(&field.directives) {
                        continue;
                    }
                    let key = field.response_key();
                    let value = if field.name == "__typename" {
                        Value::String(runtime_type.to_owned())
                    } else {
                        self.value(&field.ty, &field.selections, source.and_then(|object| object.get(key)))
                    };
                    match shaped.get_mut(key) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            shaped.insert(key.to_owned(), value);
                        }
                    }
                }
                Selection::InlineFragment(fragment) => {
                    if !self.included(&fragment.directives) {
                        continue;
                    }
                    let applies = fragment
                        .type_condition
                        .as_deref()
                        .is_none_or(|condition| self.schema.type_condition_matches(condition, runtime_type));
                    if applies {
                        self.apply(runtime_type, &fragment.selections, source, shaped);
                    }
                }
            }
        }
    }

    fn value(&self, ty: &TypeRef, selections: &[Selection], value: Option<&Value>) -> Value {
        match value {
            None | Some(Value::Null) => Value::Null,
            Some(Value::Array(items)) => {
                let item_type = ty.list_item().unwrap_or(ty);
                Value::Array(
                    items
                        .iter()
                        .map(|item| self.value(item_type, selections, Some(item)))
                        .collect(),
                )
            }
            Some(Value::Object(object)) if !selections.is_empty() => {
                Value::Object(self.object(ty.named(), selections, Some(object)))
            }
            Some(other) => other.clone(),
        }
    }

    /// Evaluates `@skip(if:)` and `@include(if:)`.
    fn included(&self, directives: &[Directive]) -> bool {
        directives.iter().all(|directive| {
            let condition = directive.argument("if").and_then(|value| self.resolve_bool(value));
            match (directive.name.as_str(), condition) {
                ("skip", Some(true)) => false,
                ("include", Some(false)) => false,
                _ => true,
            }
        })
    }

    fn resolve_bool(&self, printed: &str) -> Option<bool> {
        match printed {
            "true" => Some(true),
            "false" => Some(false),
            _ => {
                let name = printed.strip_prefix('$')?;
                match self.variables.get(name) {
                    Some(value) => value.as_bool(),
                    None => self
                        .operation
                        .variable_definition(name)?
                        .default_value
                        .as_deref()
                        .and_then(|default| default.parse().ok()),
                }
            }
        }
    }
}
