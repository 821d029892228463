//! Resource definitions, configuration mapping and href routing.

pub mod access;
pub mod hooks;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sqlrest_storage::{ColumnDef, ColumnType, ForeignKey, Row, TableSchema};

use crate::error::{DomainError, DomainResult};
use crate::operation::OperationError;

pub use access::{AccessPolicy, AccessRequest, AccessRule, RulePolicy};
pub use hooks::{HookContext, InternalRequester, NestedOutcome, ResourceHooks};

/// A REST resource mapped onto one table.
#[derive(Clone)]
pub struct ResourceDefinition {
    pub name: String,
    pub table: TableSchema,
    /// Columns never returned in response bodies.
    pub hidden: Vec<String>,
    /// Values used for columns a PUT body leaves out.
    pub defaults: Row,
    pub policy: Arc<dyn AccessPolicy>,
    pub hooks: Option<Arc<dyn ResourceHooks>>,
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("table", &self.table.name)
            .field("hidden", &self.hidden)
            .field("has_hooks", &self.hooks.is_some())
            .finish()
    }
}

impl ResourceDefinition {
    pub fn builder(name: impl Into<String>, table: TableSchema) -> ResourceBuilder {
        ResourceBuilder {
            name: name.into(),
            table,
            hidden: Vec::new(),
            defaults: Row::new(),
            policy: Arc::new(RulePolicy::default()),
            hooks: None,
        }
    }

    pub fn key_type(&self) -> ColumnType {
        self.table
            .column(&self.table.key)
            .map(|c| c.ty)
            .unwrap_or(ColumnType::Text)
    }

    /// Removes hidden columns from a row.
    pub fn strip_hidden(&self, mut row: Row) -> Row {
        for column in &self.hidden {
            row.remove(column);
        }
        row
    }
}

/// Builder for [`ResourceDefinition`].
pub struct ResourceBuilder {
    name: String,
    table: TableSchema,
    hidden: Vec<String>,
    defaults: Row,
    policy: Arc<dyn AccessPolicy>,
    hooks: Option<Arc<dyn ResourceHooks>>,
}

impl ResourceBuilder {
    pub fn hidden(mut self, column: impl Into<String>) -> Self {
        self.hidden.push(column.into());
        self
    }

    pub fn default_value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(column.into(), value);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn rules(self, read: AccessRule, write: AccessRule) -> Self {
        self.policy(Arc::new(RulePolicy::new(read, write)))
    }

    pub fn hooks(mut self, hooks: Arc<dyn ResourceHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> DomainResult<ResourceDefinition> {
        let invalid = |message: String| DomainError::InvalidResource {
            name: self.name.clone(),
            message,
        };
        if self.name.is_empty() || self.name == "batch" || self.name == "batch_streaming" {
            return Err(invalid(format!("reserved resource name '{}'", self.name)));
        }
        self.table
            .validate()
            .map_err(|e| invalid(e.to_string()))?;
        for column in &self.hidden {
            if self.table.column(column).is_none() {
                return Err(invalid(format!("hidden column '{column}' does not exist")));
            }
        }
        for (column, value) in &self.defaults {
            let def = self
                .table
                .column(column)
                .ok_or_else(|| invalid(format!("default for unknown column '{column}'")))?;
            if !def.ty.accepts(value) {
                return Err(invalid(format!(
                    "default for '{column}' is not a valid {}",
                    def.ty.sql_type()
                )));
            }
        }
        Ok(ResourceDefinition {
            name: self.name,
            table: self.table,
            hidden: self.hidden,
            defaults: self.defaults,
            policy: self.policy,
            hooks: self.hooks,
        })
    }
}

fn default_key() -> String {
    "id".to_string()
}

fn default_nullable() -> bool {
    true
}

fn default_rule() -> AccessRule {
    AccessRule::Public
}

/// A column as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSettings {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub references: Option<ForeignKey>,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A resource mapping as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSettings {
    pub name: String,
    /// Table name; defaults to the resource name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_key")]
    pub key: String,
    pub columns: Vec<ColumnSettings>,
    #[serde(default)]
    pub hidden: Vec<String>,
    #[serde(default = "default_rule")]
    pub read: AccessRule,
    #[serde(default = "default_rule")]
    pub write: AccessRule,
}

impl ResourceSettings {
    pub fn to_definition(&self) -> DomainResult<ResourceDefinition> {
        let columns = self
            .columns
            .iter()
            .map(|c| ColumnDef {
                name: c.name.clone(),
                ty: c.ty,
                nullable: c.nullable,
                unique: c.unique,
                references: c.references.clone(),
            })
            .collect();
        let table = TableSchema::new(
            self.table.clone().unwrap_or_else(|| self.name.clone()),
            self.key.clone(),
            columns,
        );
        let mut builder = ResourceDefinition::builder(self.name.clone(), table)
            .rules(self.read.clone(), self.write.clone());
        for column in &self.hidden {
            builder = builder.hidden(column.clone());
        }
        for column in &self.columns {
            if let Some(value) = &column.default {
                builder = builder.default_value(column.name.clone(), value.clone());
            }
        }
        builder.build()
    }
}

/// A resolved href.
#[derive(Debug, Clone)]
pub struct Route {
    pub resource: Arc<ResourceDefinition>,
    /// Raw instance segment; `None` for collection hrefs.
    pub id: Option<String>,
}

/// Path segments of an href, ignoring any query string.
fn segments(href: &str) -> Option<Vec<&str>> {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    let path = path.strip_prefix('/')?;
    let path = path.strip_suffix('/').unwrap_or(path);
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}

/// First path segment of an href (its resource type), if well formed.
pub fn resource_segment(href: &str) -> Option<&str> {
    segments(href).and_then(|s| s.first().copied())
}

/// All mounted resources, by name.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<ResourceDefinition>>,
    order: Vec<String>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resources", &self.order)
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configuration and checks cross-resource references.
    pub fn from_settings(settings: &[ResourceSettings]) -> DomainResult<Self> {
        let mut registry = Self::new();
        for resource in settings {
            registry.register(resource.to_definition()?)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, definition: ResourceDefinition) -> DomainResult<()> {
        if self.resources.contains_key(&definition.name) {
            return Err(DomainError::DuplicateResource {
                name: definition.name,
            });
        }
        self.order.push(definition.name.clone());
        self.resources
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Attaches hooks to an already registered resource.
    pub fn set_hooks(&mut self, name: &str, hooks: Arc<dyn ResourceHooks>) -> DomainResult<()> {
        let resource = self.resource_mut(name)?;
        resource.hooks = Some(hooks);
        Ok(())
    }

    /// Replaces the access policy of an already registered resource.
    pub fn set_policy(&mut self, name: &str, policy: Arc<dyn AccessPolicy>) -> DomainResult<()> {
        let resource = self.resource_mut(name)?;
        resource.policy = policy;
        Ok(())
    }

    fn resource_mut(&mut self, name: &str) -> DomainResult<&mut ResourceDefinition> {
        self.resources
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| DomainError::InvalidResource {
                name: name.to_string(),
                message: "resource is not registered".to_string(),
            })
    }

    /// Every foreign key must point at a mapped table.
    pub fn validate(&self) -> DomainResult<()> {
        let tables: HashSet<&str> = self
            .resources
            .values()
            .map(|r| r.table.name.as_str())
            .collect();
        for resource in self.resources.values() {
            for column in &resource.table.columns {
                if let Some(fk) = &column.references {
                    if !tables.contains(fk.table.as_str()) {
                        return Err(DomainError::UnknownReference {
                            resource: resource.name.clone(),
                            table: fk.table.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceDefinition>> {
        self.resources.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resolves `/<resource>` or `/<resource>/<id>`.
    pub fn route(&self, href: &str) -> Result<Route, OperationError> {
        let parts = segments(href).ok_or_else(|| OperationError::no_matching_route(href))?;
        let resource = self
            .resources
            .get(parts[0])
            .ok_or_else(|| OperationError::no_matching_route(href))?;
        match parts.len() {
            1 => Ok(Route {
                resource: Arc::clone(resource),
                id: None,
            }),
            2 => Ok(Route {
                resource: Arc::clone(resource),
                id: Some(parts[1].to_string()),
            }),
            _ => Err(OperationError::no_matching_route(href)),
        }
    }

    /// Table schemas ordered so that referenced tables come first.
    pub fn tables(&self) -> Vec<TableSchema> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut schemas: Vec<TableSchema> = Vec::new();
        let mut pending: Vec<TableSchema> = Vec::new();
        for name in &self.order {
            if let Some(resource) = self.resources.get(name) {
                if !pending.iter().any(|t| t.name == resource.table.name) {
                    pending.push(resource.table.clone());
                }
            }
        }
        while !pending.is_empty() {
            let ready = pending.iter().position(|t| {
                t.columns.iter().all(|c| match &c.references {
                    Some(fk) => fk.table == t.name || seen.contains(&fk.table),
                    None => true,
                })
            });
            // A reference cycle falls back to registration order.
            let table = pending.remove(ready.unwrap_or(0));
            seen.insert(table.name.clone());
            schemas.push(table);
        }
        schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn communities() -> ResourceSettings {
        serde_json::from_value(json!({
            "name": "communities",
            "columns": [
                {"name": "id", "type": "integer", "nullable": false},
                {"name": "name", "type": "text", "nullable": false, "unique": true},
                {"name": "secret", "type": "text"},
                {"name": "visibility", "type": "text", "default": "public"}
            ],
            "hidden": ["secret"],
            "write": "authenticated"
        }))
        .unwrap()
    }

    fn messages() -> ResourceSettings {
        serde_json::from_value(json!({
            "name": "messages",
            "columns": [
                {"name": "id", "type": "integer", "nullable": false},
                {"name": "community_id", "type": "integer",
                 "references": {"table": "communities", "column": "id"}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_settings_defaults() {
        let settings = communities();
        assert_eq!(settings.key, "id");
        assert_eq!(settings.read, AccessRule::Public);
        assert_eq!(settings.write, AccessRule::Authenticated);
        let def = settings.to_definition().unwrap();
        assert_eq!(def.table.name, "communities");
        assert_eq!(def.defaults["visibility"], "public");
        assert_eq!(def.key_type(), ColumnType::Integer);
    }

    #[test]
    fn test_strip_hidden() {
        let def = communities().to_definition().unwrap();
        let row = json!({"id": 1, "name": "x", "secret": "s"})
            .as_object()
            .cloned()
            .unwrap();
        let stripped = def.strip_hidden(row);
        assert!(stripped.get("secret").is_none());
        assert_eq!(stripped["name"], "x");
    }

    #[test]
    fn test_builder_rejects_unknown_hidden_column() {
        let table = TableSchema::new("t", "id", vec![ColumnDef::new("id", ColumnType::Text)]);
        let result = ResourceDefinition::builder("t", table).hidden("nope").build();
        assert!(matches!(result, Err(DomainError::InvalidResource { .. })));
    }

    #[test]
    fn test_builder_rejects_reserved_name() {
        let table = TableSchema::new("b", "id", vec![ColumnDef::new("id", ColumnType::Text)]);
        assert!(ResourceDefinition::builder("batch", table).build().is_err());
    }

    #[test]
    fn test_registry_routes() {
        let registry = ResourceRegistry::from_settings(&[communities(), messages()]).unwrap();

        let route = registry.route("/communities/7").unwrap();
        assert_eq!(route.resource.name, "communities");
        assert_eq!(route.id.as_deref(), Some("7"));

        let route = registry.route("/messages?limit=5").unwrap();
        assert!(route.id.is_none());

        for href in ["/nope/1", "communities/1", "/communities/1/extra", "//", ""] {
            let err = registry.route(href).unwrap_err();
            assert_eq!(err.code, "no.matching.route", "href {href}");
            assert_eq!(err.status, 404);
        }
    }

    #[test]
    fn test_resource_segment() {
        assert_eq!(resource_segment("/messages/1"), Some("messages"));
        assert_eq!(resource_segment("/messages/"), Some("messages"));
        assert_eq!(resource_segment("messages"), None);
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_references() {
        assert!(matches!(
            ResourceRegistry::from_settings(&[communities(), communities()]),
            Err(DomainError::DuplicateResource { .. })
        ));
        assert!(matches!(
            ResourceRegistry::from_settings(&[messages()]),
            Err(DomainError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_tables_put_referenced_tables_first() {
        let registry = ResourceRegistry::from_settings(&[messages(), communities()]).unwrap();
        let names: Vec<String> = registry.tables().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["communities", "messages"]);
    }

    #[test]
    fn test_set_policy_replaces_rules() {
        let mut registry = ResourceRegistry::from_settings(&[communities()]).unwrap();
        registry
            .set_policy(
                "communities",
                Arc::new(RulePolicy::new(AccessRule::Deny, AccessRule::Deny)),
            )
            .unwrap();
        assert!(registry.set_policy("ghost", Arc::new(RulePolicy::default())).is_err());
    }
}
