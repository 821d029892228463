//! Security predicates evaluated during the authorize phase.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sqlrest_storage::schema::key_string;
use sqlrest_storage::Row;

use crate::error::DomainError;
use crate::operation::{OperationError, Verb};

/// A declarative access rule.
///
/// Parsed from `public`, `authenticated`, `owner:<column>`, `read_only`
/// or `deny`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccessRule {
    Public,
    Authenticated,
    /// The principal must equal the row's value in this column.
    Owner(String),
    /// Allows reads, rejects writes.
    ReadOnly,
    Deny,
}

impl FromStr for AccessRule {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AccessRule::Public),
            "authenticated" => Ok(AccessRule::Authenticated),
            "read_only" => Ok(AccessRule::ReadOnly),
            "deny" => Ok(AccessRule::Deny),
            other => match other.strip_prefix("owner:") {
                Some(column) if !column.is_empty() => Ok(AccessRule::Owner(column.to_string())),
                _ => Err(DomainError::InvalidAccessRule {
                    value: other.to_string(),
                }),
            },
        }
    }
}

impl TryFrom<String> for AccessRule {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccessRule> for String {
    fn from(rule: AccessRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessRule::Public => f.write_str("public"),
            AccessRule::Authenticated => f.write_str("authenticated"),
            AccessRule::Owner(column) => write!(f, "owner:{column}"),
            AccessRule::ReadOnly => f.write_str("read_only"),
            AccessRule::Deny => f.write_str("deny"),
        }
    }
}

/// What an access check gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub verb: Verb,
    pub principal: Option<&'a str>,
    /// The current row, when the target instance exists.
    pub existing: Option<&'a Row>,
    /// The request body for writes.
    pub body: Option<&'a Value>,
}

/// Code-level access predicate for a resource.
pub trait AccessPolicy: Send + Sync {
    /// Returns an `unauthenticated` or `forbidden` error to reject.
    fn check(&self, request: &AccessRequest<'_>) -> Result<(), OperationError>;

    /// Filters rows in collection listings.
    fn row_visible(&self, _principal: Option<&str>, _row: &Row) -> bool {
        true
    }
}

/// The policy built from a resource's `read` and `write` rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePolicy {
    pub read: AccessRule,
    pub write: AccessRule,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self {
            read: AccessRule::Public,
            write: AccessRule::Public,
        }
    }
}

impl RulePolicy {
    pub fn new(read: AccessRule, write: AccessRule) -> Self {
        Self { read, write }
    }
}

fn owns(principal: &str, row: Option<&Row>, body: Option<&Value>, column: &str) -> bool {
    let value = match row {
        Some(row) => row.get(column),
        None => body.and_then(|b| b.get(column)),
    };
    value
        .filter(|v| !v.is_null())
        .map(|v| key_string(v) == principal)
        .unwrap_or(false)
}

impl AccessPolicy for RulePolicy {
    fn check(&self, request: &AccessRequest<'_>) -> Result<(), OperationError> {
        let rule = if request.verb.is_write() {
            &self.write
        } else {
            &self.read
        };
        match rule {
            AccessRule::Public => Ok(()),
            AccessRule::ReadOnly if request.verb.is_write() => Err(OperationError::forbidden()),
            AccessRule::ReadOnly => Ok(()),
            AccessRule::Deny => Err(OperationError::forbidden()),
            AccessRule::Authenticated => request
                .principal
                .map(|_| ())
                .ok_or_else(OperationError::unauthenticated),
            AccessRule::Owner(column) => {
                let principal = request
                    .principal
                    .ok_or_else(OperationError::unauthenticated)?;
                // Collection reads are filtered per row instead.
                if request.existing.is_none() && !request.verb.is_write() {
                    return Ok(());
                }
                if owns(principal, request.existing, request.body, column) {
                    Ok(())
                } else {
                    Err(OperationError::forbidden())
                }
            }
        }
    }

    fn row_visible(&self, principal: Option<&str>, row: &Row) -> bool {
        match &self.read {
            AccessRule::Owner(column) => principal
                .map(|p| owns(p, Some(row), None, column))
                .unwrap_or(false),
            AccessRule::Deny => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn request<'a>(
        verb: Verb,
        principal: Option<&'a str>,
        existing: Option<&'a Row>,
        body: Option<&'a Value>,
    ) -> AccessRequest<'a> {
        AccessRequest {
            verb,
            principal,
            existing,
            body,
        }
    }

    #[test]
    fn test_parse_rules() {
        assert_eq!("public".parse::<AccessRule>().unwrap(), AccessRule::Public);
        assert_eq!(
            "owner:user_id".parse::<AccessRule>().unwrap(),
            AccessRule::Owner("user_id".to_string())
        );
        assert!("owner:".parse::<AccessRule>().is_err());
        assert!("everyone".parse::<AccessRule>().is_err());
        assert_eq!(AccessRule::ReadOnly.to_string(), "read_only");
    }

    #[test]
    fn test_rule_deserializes_from_string() {
        let rule: AccessRule = serde_json::from_value(json!("authenticated")).unwrap();
        assert_eq!(rule, AccessRule::Authenticated);
        assert!(serde_json::from_value::<AccessRule>(json!("nope")).is_err());
    }

    #[test]
    fn test_authenticated_rule() {
        let policy = RulePolicy::new(AccessRule::Authenticated, AccessRule::Authenticated);
        let err = policy
            .check(&request(Verb::Get, None, None, None))
            .unwrap_err();
        assert_eq!(err.status, 401);
        assert!(policy
            .check(&request(Verb::Get, Some("alice"), None, None))
            .is_ok());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let policy = RulePolicy::new(AccessRule::Public, AccessRule::ReadOnly);
        assert!(policy.check(&request(Verb::Get, None, None, None)).is_ok());
        let err = policy
            .check(&request(Verb::Put, Some("a"), None, None))
            .unwrap_err();
        assert_eq!(err.status, 403);
    }

    #[test]
    fn test_owner_rule_uses_existing_row_then_body() {
        let policy = RulePolicy::new(
            AccessRule::Owner("owner".to_string()),
            AccessRule::Owner("owner".to_string()),
        );
        let existing = row(json!({"id": 1, "owner": "alice"}));
        assert!(policy
            .check(&request(Verb::Patch, Some("alice"), Some(&existing), None))
            .is_ok());
        assert_eq!(
            policy
                .check(&request(Verb::Patch, Some("bob"), Some(&existing), None))
                .unwrap_err()
                .status,
            403
        );

        let body = json!({"owner": "bob"});
        assert!(policy
            .check(&request(Verb::Put, Some("bob"), None, Some(&body)))
            .is_ok());
        assert!(policy
            .check(&request(Verb::Put, Some("carol"), None, Some(&body)))
            .is_err());
    }

    #[test]
    fn test_owner_rule_filters_listing() {
        let policy = RulePolicy::new(AccessRule::Owner("owner".to_string()), AccessRule::Public);
        let mine = row(json!({"id": 1, "owner": "alice"}));
        let theirs = row(json!({"id": 2, "owner": "bob"}));
        assert!(policy.row_visible(Some("alice"), &mine));
        assert!(!policy.row_visible(Some("alice"), &theirs));
        assert!(!policy.row_visible(None, &mine));
    }
}
