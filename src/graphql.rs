//! GraphQL response and error shapes shared by the gateway and its subgraphs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::json_ext::Path;

/// A GraphQL error as it appears in a response's `errors` array.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl Error {
    pub fn new(message: impl Into<String>) -> Self {
        Error {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(self, code: &str) -> Self {
        self.with_extension("code", Value::String(code.to_owned()))
    }

    pub fn with_path(mut self, path: Option<Path>) -> Self {
        self.path = path;
        self
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions.insert(key.to_owned(), value);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.extensions.get("code").and_then(Value::as_str)
    }
}

/// A GraphQL response: `data` plus an optional list of errors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Error>,
}

impl Response {
    pub fn from_error(error: Error) -> Self {
        Response {
            data: None,
            errors: vec![error],
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"errors":[{"message":"failed to serialize response"}]}"#.to_owned()
        })
    }
}

/// Reads the `errors` payload of a subscription message, which some servers
/// send as a single object and others as a list.
pub(crate) fn errors_from_payload(payload: Value) -> Vec<Error> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    let mut errors: Vec<Error> = items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<Error>(item.clone())
                .unwrap_or_else(|_| Error::new(item.to_string()))
        })
        .collect();
    if errors.is_empty() {
        errors.push(Error::new("subscription failed upstream"));
    }
    errors
}
