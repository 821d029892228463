//! Operation descriptors, verbs and responses.

mod error;

pub use error::{codes, OperationError};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP verbs an operation may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Put,
    Patch,
    Delete,
}

impl Verb {
    /// Parses a verb, ignoring ASCII case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(Verb::Get),
            "PUT" => Some(Verb::Put),
            "PATCH" => Some(Verb::Patch),
            "DELETE" => Some(Verb::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }

    /// True for verbs that mutate rows.
    pub fn is_write(&self) -> bool {
        !matches!(self, Verb::Get)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client-supplied operation: `{href, verb, body?}`.
///
/// The verb is kept as sent; an unsupported verb fails only its own
/// operation, not the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub href: String,
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl OperationDescriptor {
    pub fn new(verb: Verb, href: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            href: href.into(),
            verb: verb.as_str().to_string(),
            body,
        }
    }

    pub fn get(href: impl Into<String>) -> Self {
        Self::new(Verb::Get, href, None)
    }

    pub fn put(href: impl Into<String>, body: Value) -> Self {
        Self::new(Verb::Put, href, Some(body))
    }

    pub fn patch(href: impl Into<String>, body: Value) -> Self {
        Self::new(Verb::Patch, href, Some(body))
    }

    pub fn delete(href: impl Into<String>) -> Self {
        Self::new(Verb::Delete, href, None)
    }

    /// The parsed verb, if supported.
    pub fn parsed_verb(&self) -> Option<Verb> {
        Verb::parse(&self.verb)
    }

    /// True when the operation may mutate rows. Unsupported verbs never do.
    pub fn is_write(&self) -> bool {
        self.parsed_verb().map(|v| v.is_write()).unwrap_or(false)
    }
}

/// The terminal result of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub status: u16,
    pub body: Value,
}

impl OperationResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

impl From<&OperationError> for OperationResponse {
    fn from(err: &OperationError) -> Self {
        Self {
            status: err.status,
            body: err.to_body(),
        }
    }
}
