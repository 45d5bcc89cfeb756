//! Response paths and the JSON merge operations the plan executor relies on.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::operation::Field;

/// One step of a response path. `Flatten` stands for "every element of the
/// list at this position" and only appears in plan paths.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathElement {
    Key(String),
    Index(usize),
    Flatten,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Self {
        Path(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut joined = self.0.clone();
        joined.extend(other.0.iter().cloned());
        Path(joined)
    }

    pub fn with_key(&self, key: &str) -> Path {
        let mut path = self.clone();
        path.0.push(PathElement::Key(key.to_owned()));
        path
    }

    /// Path below `field`: its response key followed by one `@` per list level.
    pub(crate) fn for_field(&self, field: &Field) -> Path {
        let mut path = self.with_key(field.response_key());
        for _ in 0..field.ty.list_depth() {
            path.0.push(PathElement::Flatten);
        }
        path
    }

    /// The leading part of a plan path up to its first `@`, which is a
    /// concrete response path.
    pub(crate) fn before_flatten(&self) -> Path {
        Path(
            self.0
                .iter()
                .take_while(|element| **element != PathElement::Flatten)
                .cloned()
                .collect(),
        )
    }

    pub(crate) fn push(&mut self, element: PathElement) {
        self.0.push(element);
    }

    pub(crate) fn pop(&mut self) {
        self.0.pop();
    }
}

impl From<Vec<PathElement>> for Path {
    fn from(elements: Vec<PathElement>) -> Self {
        Path(elements)
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Key(key) => f.write_str(key),
            PathElement::Index(index) => write!(f, "{index}"),
            PathElement::Flatten => f.write_str("@"),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}

impl Serialize for PathElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathElement::Key(key) => serializer.serialize_str(key),
            PathElement::Index(index) => serializer.serialize_u64(*index as u64),
            PathElement::Flatten => serializer.serialize_str("@"),
        }
    }
}

impl<'de> Deserialize<'de> for PathElement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(key) if key == "@" => Ok(PathElement::Flatten),
            Value::String(key) => Ok(PathElement::Key(key)),
            Value::Number(number) => number
                .as_u64()
                .map(|index| PathElement::Index(index as usize))
                .ok_or_else(|| D::Error::custom("path index must be a positive integer")),
            other => Err(D::Error::custom(format!("invalid path element {other}"))),
        }
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<PathElement>::deserialize(deserializer).map(Path)
    }
}

pub trait ValueExt {
    /// Merges `other` into `self`. Objects merge key by key, lists element by
    /// element, and `null` never overwrites an existing value.
    fn deep_merge(&mut self, other: Value);

    /// Merges `value` at a concrete path (keys and indexes only), creating
    /// intermediate objects and `null`-padded lists as needed.
    fn insert_at_path(&mut self, path: &Path, value: Value);

    /// Visits every value matching a plan path, expanding `@` over list
    /// elements, together with its concrete path.
    fn select_values_and_paths<'a>(&'a self, path: &Path, f: &mut dyn FnMut(&Path, &'a Value));
}

impl ValueExt for Value {
    fn deep_merge(&mut self, other: Value) {
        match (self, other) {
            (Value::Object(target), Value::Object(source)) => {
                for (key, value) in source {
                    match target.get_mut(&key) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            target.insert(key, value);
                        }
                    }
                }
            }
            (Value::Array(target), Value::Array(source)) => {
                for (index, value) in source.into_iter().enumerate() {
                    match target.get_mut(index) {
                        Some(existing) => existing.deep_merge(value),
                        None => target.push(value),
                    }
                }
            }
            (_, Value::Null) => {}
            (target, source) => *target = source,
        }
    }

    fn insert_at_path(&mut self, path: &Path, value: Value) {
        let mut current = self;
        for element in path.iter() {
            current = match element {
                PathElement::Key(key) => {
                    if !current.is_object() {
                        *current = Value::Object(Map::new());
                    }
                    match current {
                        Value::Object(object) => object.entry(key.clone()).or_insert(Value::Null),
                        _ => return,
                    }
                }
                PathElement::Index(index) => {
                    if !current.is_array() {
                        *current = Value::Array(Vec::new());
                    }
                    match current {
                        Value::Array(items) => {
                            if items.len() <= *index {
                                items.resize(*index + 1, Value::Null);
                            }
                            &mut items[*index]
                        }
                        _ => return,
                    }
                }
                PathElement::Flatten => return,
            };
        }
        current.deep_merge(value);
    }

    fn select_values_and_paths<'a>(&'a self, path: &Path, f: &mut dyn FnMut(&Path, &'a Value)) {
        let mut current = Path::empty();
        select_recursive(self, &path.0, &mut current, f);
    }
}

fn select_recursive<'a>(
    value: &'a Value,
    remaining: &[PathElement],
    current: &mut Path,
    f: &mut dyn FnMut(&Path, &'a Value),
) {
    let Some((head, rest)) = remaining.split_first() else {
        f(current, value);
        return;
    };
    match (head, value) {
        (PathElement::Key(key), Value::Object(object)) => {
            if let Some(child) = object.get(key) {
                current.push(head.clone());
                select_recursive(child, rest, current, f);
                current.pop();
            }
        }
        (PathElement::Index(index), Value::Array(items)) => {
            if let Some(child) = items.get(*index) {
                current.push(head.clone());
                select_recursive(child, rest, current, f);
                current.pop();
            }
        }
        (PathElement::Flatten, Value::Array(items)) => {
            for (index, child) in items.iter().enumerate() {
                current.push(PathElement::Index(index));
                select_recursive(child, rest, current, f);
                current.pop();
            }
        }
        _ => {}
    }
}
