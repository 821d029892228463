//! The Operation Executor: runs one operation through the phase pipeline.
//!
//! The executor is driven one phase at a time by the batch engine. It never
//! persists anything itself: the [`Phase::Persist`] step is performed by the
//! engine, which folds pending writes of many operations into multi-row
//! statements.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use sqlrest_storage::{MutationKind, Row, Transaction};

use crate::operation::{OperationDescriptor, OperationError, OperationResponse, Verb};
use crate::phase::Phase;
use crate::resource::{AccessRequest, HookContext, InternalRequester, ResourceDefinition, ResourceRegistry};

/// Default cap on rows returned by a collection GET.
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// The transaction shared by every operation of a batch run.
///
/// Locked per database call; never held across a phase barrier.
pub type SharedTransaction = Arc<Mutex<Box<dyn Transaction>>>;

/// Everything an operation may touch besides its own state.
#[derive(Clone)]
pub struct OperationEnv {
    pub transaction: SharedTransaction,
    pub requester: Arc<dyn InternalRequester>,
}

/// The mutation an operation wants persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub kind: MutationKind,
    /// Full row for inserts and updates; only the key for deletes.
    pub row: Row,
    /// Status reported on success (201 for inserts, 200 otherwise).
    pub status: u16,
}

/// Result of one phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// Proceed to the next phase.
    Continue,
    /// The operation finished successfully with this response.
    Complete(OperationResponse),
}

/// Mutable per-operation state threaded through the phases.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub descriptor: OperationDescriptor,
    pub principal: Option<String>,
    pub verb: Option<Verb>,
    pub resource: Option<Arc<ResourceDefinition>>,
    /// Typed key of the target instance; `None` for collections.
    pub key: Option<Value>,
    /// The target row as loaded during authorization.
    pub existing: Option<Row>,
    pub write: Option<PendingWrite>,
    pub read: Option<Value>,
}

impl OperationContext {
    pub fn new(descriptor: OperationDescriptor, principal: Option<String>) -> Self {
        Self {
            descriptor,
            principal,
            verb: None,
            resource: None,
            key: None,
            existing: None,
            write: None,
            read: None,
        }
    }

    pub fn is_write(&self) -> bool {
        self.descriptor.is_write()
    }

    fn resource(&self) -> Result<Arc<ResourceDefinition>, OperationError> {
        self.resource
            .clone()
            .ok_or_else(|| OperationError::internal("operation was not authorized"))
    }
}

/// Executes operations one phase per call.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        phase: Phase,
        op: &mut OperationContext,
        env: &OperationEnv,
    ) -> Result<PhaseOutcome, OperationError>;
}

/// The executor for resources mapped through a [`ResourceRegistry`].
#[derive(Debug, Clone)]
pub struct ResourceExecutor {
    registry: Arc<ResourceRegistry>,
    list_limit: usize,
}

impl ResourceExecutor {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            registry,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_list_limit(mut self, list_limit: usize) -> Self {
        self.list_limit = list_limit;
        self
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    async fn authorize(
        &self,
        op: &mut OperationContext,
        env: &OperationEnv,
    ) -> Result<(), OperationError> {
        let href = op.descriptor.href.clone();
        let verb = op
            .descriptor
            .parsed_verb()
            .ok_or_else(|| OperationError::verb_unsupported(&op.descriptor.verb, &href))?;
        let route = self.registry.route(&href)?;
        let resource = route.resource;

        let key = match &route.id {
            Some(raw) => Some(
                resource
                    .key_type()
                    .parse_key(raw)
                    .ok_or_else(|| OperationError::not_found(&href))?,
            ),
            None if verb == Verb::Get => None,
            None => return Err(OperationError::verb_unsupported(verb.as_str(), &href)),
        };

        let existing = match &key {
            Some(key) => env.transaction.lock().await.fetch(&resource.table, key).await?,
            None => None,
        };

        resource.policy.check(&AccessRequest {
            verb,
            principal: op.principal.as_deref(),
            existing: existing.as_ref(),
            body: op.descriptor.body.as_ref(),
        })?;

        op.verb = Some(verb);
        op.resource = Some(resource);
        op.key = key;
        op.existing = existing;
        Ok(())
    }

    async fn build(
        &self,
        op: &mut OperationContext,
        env: &OperationEnv,
    ) -> Result<(), OperationError> {
        let resource = op.resource()?;
        let href = op.descriptor.href.as_str();
        let verb = op
            .verb
            .ok_or_else(|| OperationError::internal("operation was not authorized"))?;

        match (verb, &op.key) {
            (Verb::Get, Some(_)) => {
                let row = op
                    .existing
                    .clone()
                    .ok_or_else(|| OperationError::not_found(href))?;
                op.read = Some(Value::Object(row));
            }
            (Verb::Get, None) => {
                let rows = env
                    .transaction
                    .lock()
                    .await
                    .fetch_all(&resource.table, self.list_limit)
                    .await?;
                let principal = op.principal.as_deref();
                let visible: Vec<Value> = rows
                    .into_iter()
                    .filter(|row| resource.policy.row_visible(principal, row))
                    .map(Value::Object)
                    .collect();
                op.read = Some(Value::Array(visible));
            }
            (_, None) => {
                return Err(OperationError::verb_unsupported(verb.as_str(), href));
            }
            (Verb::Put, Some(key)) => {
                let body = body_object(&op.descriptor)?;
                validate_body(&resource, body, key)?;
                let mut row = Row::new();
                for column in &resource.table.columns {
                    let value = body
                        .get(&column.name)
                        .or_else(|| resource.defaults.get(&column.name))
                        .cloned()
                        .unwrap_or(Value::Null);
                    row.insert(column.name.clone(), value);
                }
                row.insert(resource.table.key.clone(), key.clone());
                let (kind, status) = if op.existing.is_some() {
                    (MutationKind::Update, 200)
                } else {
                    (MutationKind::Insert, 201)
                };
                op.write = Some(PendingWrite { kind, row, status });
            }
            (Verb::Patch, Some(key)) => {
                let mut row = op
                    .existing
                    .clone()
                    .ok_or_else(|| OperationError::not_found(href))?;
                let body = body_object(&op.descriptor)?;
                validate_body(&resource, body, key)?;
                for (column, value) in body {
                    row.insert(column.clone(), value.clone());
                }
                op.write = Some(PendingWrite {
                    kind: MutationKind::Update,
                    row,
                    status: 200,
                });
            }
            (Verb::Delete, Some(key)) => {
                if op.existing.is_none() {
                    return Err(OperationError::not_found(href));
                }
                let mut row = Row::new();
                row.insert(resource.table.key.clone(), key.clone());
                op.write = Some(PendingWrite {
                    kind: MutationKind::Delete,
                    row,
                    status: 200,
                });
            }
        }
        Ok(())
    }

    async fn before_hooks(
        &self,
        op: &mut OperationContext,
        env: &OperationEnv,
    ) -> Result<(), OperationError> {
        let resource = op.resource()?;
        let Some(hooks) = resource.hooks.clone() else {
            return Ok(());
        };
        let OperationContext {
            descriptor,
            principal,
            existing,
            write,
            key,
            ..
        } = op;
        let Some(write) = write.as_mut() else {
            return Ok(());
        };
        let ctx = HookContext {
            descriptor,
            principal: principal.as_deref(),
            existing: existing.as_ref(),
            requester: env.requester.as_ref(),
        };
        hooks.before(&ctx, write).await?;

        // Hooks may rewrite the row but not retarget it.
        if let Some(key) = key.as_ref() {
            if write.row.get(&resource.table.key) != Some(key) {
                return Err(OperationError::validation(
                    "before hook changed the row key",
                ));
            }
        }
        for (column, value) in &write.row {
            check_column(&resource, column, value)?;
        }
        Ok(())
    }

    async fn after_hooks(
        &self,
        op: &mut OperationContext,
        env: &OperationEnv,
    ) -> Result<(), OperationError> {
        let resource = op.resource()?;
        let (Some(hooks), Some(write)) = (resource.hooks.as_ref(), op.write.as_ref()) else {
            return Ok(());
        };
        let ctx = HookContext {
            descriptor: &op.descriptor,
            principal: op.principal.as_deref(),
            existing: op.existing.as_ref(),
            requester: env.requester.as_ref(),
        };
        hooks.after(&ctx, write).await
    }

    fn transform(&self, op: &mut OperationContext) -> Result<OperationResponse, OperationError> {
        let resource = op.resource()?;
        if let Some(write) = &op.write {
            let body = match write.kind {
                MutationKind::Delete => json!({}),
                _ => Value::Object(resource.strip_hidden(write.row.clone())),
            };
            return Ok(OperationResponse::new(write.status, body));
        }
        let read = op
            .read
            .take()
            .ok_or_else(|| OperationError::internal("operation produced no result"))?;
        let body = match read {
            Value::Object(row) => Value::Object(resource.strip_hidden(row)),
            Value::Array(rows) => Value::Array(
                rows.into_iter()
                    .map(|r| match r {
                        Value::Object(row) => Value::Object(resource.strip_hidden(row)),
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        };
        Ok(OperationResponse::new(200, body))
    }
}

fn body_object(descriptor: &OperationDescriptor) -> Result<&Row, OperationError> {
    match &descriptor.body {
        None | Some(Value::Null) => Err(OperationError::no_body()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(OperationError::validation("request body must be a JSON object")),
    }
}

fn check_column(
    resource: &ResourceDefinition,
    column: &str,
    value: &Value,
) -> Result<(), OperationError> {
    let def = resource.table.column(column).ok_or_else(|| {
        OperationError::validation(format!("unknown column '{column}'"))
            .with_detail(json!({ "column": column }))
    })?;
    if !def.ty.accepts(value) {
        return Err(OperationError::validation(format!(
            "column '{column}' expects {}",
            def.ty.sql_type()
        ))
        .with_detail(json!({ "column": column })));
    }
    Ok(())
}

fn validate_body(
    resource: &ResourceDefinition,
    body: &Row,
    key: &Value,
) -> Result<(), OperationError> {
    for (column, value) in body {
        check_column(resource, column, value)?;
    }
    match body.get(&resource.table.key) {
        Some(value) if value != key => Err(OperationError::validation(
            "key in body does not match the href",
        )
        .with_detail(json!({ "column": resource.table.key }))),
        _ => Ok(()),
    }
}

#[async_trait]
impl OperationExecutor for ResourceExecutor {
    #[instrument(skip_all, fields(phase = %phase, href = %op.descriptor.href))]
    async fn execute(
        &self,
        phase: Phase,
        op: &mut OperationContext,
        env: &OperationEnv,
    ) -> Result<PhaseOutcome, OperationError> {
        match phase {
            Phase::Authorize => self.authorize(op, env).await?,
            Phase::Build => self.build(op, env).await?,
            Phase::BeforeHooks => self.before_hooks(op, env).await?,
            Phase::Persist => {
                debug!("persist is performed by the batch engine");
            }
            Phase::AfterHooks => self.after_hooks(op, env).await?,
            Phase::Transform => return self.transform(op).map(PhaseOutcome::Complete),
        }
        Ok(PhaseOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::codes;
    use crate::resource::{
        AccessRule, NestedOutcome, ResourceHooks, ResourceSettings,
    };
    use sqlrest_storage::{Database, MemoryDatabase, MultiRowStatement};

    struct NoNesting;

    #[async_trait]
    impl InternalRequester for NoNesting {
        async fn batch(
            &self,
            _operations: Vec<OperationDescriptor>,
        ) -> Result<NestedOutcome, OperationError> {
            Err(OperationError::internal("nested batches unavailable"))
        }
    }

    struct Uppercase;

    #[async_trait]
    impl ResourceHooks for Uppercase {
        async fn before(
            &self,
            _ctx: &HookContext<'_>,
            write: &mut PendingWrite,
        ) -> Result<(), OperationError> {
            if let Some(Value::String(name)) = write.row.get("name").cloned() {
                write
                    .row
                    .insert("name".to_string(), Value::String(name.to_uppercase()));
            }
            Ok(())
        }
    }

    fn settings() -> Vec<ResourceSettings> {
        serde_json::from_value(json!([
            {
                "name": "users",
                "columns": [
                    {"name": "id", "type": "integer", "nullable": false},
                    {"name": "name", "type": "text"},
                    {"name": "role", "type": "text", "default": "member"},
                    {"name": "password", "type": "text"}
                ],
                "hidden": ["password"]
            },
            {
                "name": "secrets",
                "key": "name",
                "columns": [{"name": "name", "type": "text"}],
                "write": "authenticated"
            }
        ]))
        .unwrap()
    }

    struct Fixture {
        db: MemoryDatabase,
        executor: ResourceExecutor,
        env: OperationEnv,
    }

    async fn fixture_with(registry: ResourceRegistry) -> Fixture {
        let db = MemoryDatabase::new();
        db.migrate(&registry.tables()).await.unwrap();
        db.seed(
            "users",
            vec![json!({"id": 1, "name": "ann", "role": "admin", "password": "pw"})
                .as_object()
                .cloned()
                .unwrap()],
        )
        .unwrap();
        let tx = db.begin().await.unwrap();
        Fixture {
            db,
            executor: ResourceExecutor::new(Arc::new(registry)),
            env: OperationEnv {
                transaction: Arc::new(Mutex::new(tx)),
                requester: Arc::new(NoNesting),
            },
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(ResourceRegistry::from_settings(&settings()).unwrap()).await
    }

    /// Drives every phase, persisting the write inline.
    async fn run(
        fx: &Fixture,
        descriptor: OperationDescriptor,
        principal: Option<&str>,
    ) -> Result<OperationResponse, OperationError> {
        let mut op = OperationContext::new(descriptor, principal.map(str::to_string));
        for phase in Phase::ALL {
            if phase == Phase::Persist {
                if let (Some(write), Some(resource)) = (&op.write, &op.resource) {
                    let statement = MultiRowStatement::new(
                        resource.table.clone(),
                        write.kind,
                        vec![write.row.clone()],
                    );
                    fx.env
                        .transaction
                        .lock()
                        .await
                        .execute(&statement)
                        .await?;
                }
                continue;
            }
            if let PhaseOutcome::Complete(response) =
                fx.executor.execute(phase, &mut op, &fx.env).await?
            {
                return Ok(response);
            }
        }
        Err(OperationError::internal("no response"))
    }

    #[tokio::test]
    async fn test_get_strips_hidden_columns() {
        let fx = fixture().await;
        let response = run(&fx, OperationDescriptor::get("/users/1"), None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["name"], "ann");
        assert!(response.body.get("password").is_none());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let fx = fixture().await;
        let err = run(&fx, OperationDescriptor::get("/users/99"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.code, codes::NOT_FOUND);

        let err = run(&fx, OperationDescriptor::get("/users/abc"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_collection() {
        let fx = fixture().await;
        let response = run(&fx, OperationDescriptor::get("/users"), None)
            .await
            .unwrap();
        let rows = response.body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].get("password").is_none());
    }

    #[tokio::test]
    async fn test_put_inserts_full_row_with_defaults() {
        let fx = fixture().await;
        let response = run(
            &fx,
            OperationDescriptor::put("/users/2", json!({"name": "bo"})),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(
            response.body,
            json!({"id": 2, "name": "bo", "role": "member"})
        );
    }

    #[tokio::test]
    async fn test_put_existing_replaces_row() {
        let fx = fixture().await;
        let response = run(
            &fx,
            OperationDescriptor::put("/users/1", json!({"name": "anna"})),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["role"], "member");
        let stored = fx
            .env
            .transaction
            .lock()
            .await
            .fetch(&fx.executor.registry().get("users").unwrap().table, &json!(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["password"], Value::Null);
    }

    #[tokio::test]
    async fn test_patch_merges_onto_existing() {
        let fx = fixture().await;
        let response = run(
            &fx,
            OperationDescriptor::patch("/users/1", json!({"name": "anna"})),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["role"], "admin");
        assert_eq!(response.body["name"], "anna");

        let err = run(
            &fx,
            OperationDescriptor::patch("/users/5", json!({"name": "x"})),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn test_delete() {
        let fx = fixture().await;
        let response = run(&fx, OperationDescriptor::delete("/users/1"), None)
            .await
            .unwrap();
        assert_eq!(response, OperationResponse::new(200, json!({})));
        let err = run(&fx, OperationDescriptor::delete("/users/1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn test_body_validation() {
        let fx = fixture().await;
        let err = run(
            &fx,
            OperationDescriptor::new(Verb::Put, "/users/3", None),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!((err.status, err.code.as_str()), (400, codes::NO_BODY));

        let err = run(
            &fx,
            OperationDescriptor::put("/users/3", json!({"nickname": "x"})),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!((err.status, err.code.as_str()), (409, codes::VALIDATION_FAILED));

        let err = run(
            &fx,
            OperationDescriptor::put("/users/3", json!({"name": 5})),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, codes::VALIDATION_FAILED);

        let err = run(
            &fx,
            OperationDescriptor::put("/users/3", json!({"id": 4})),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, codes::VALIDATION_FAILED);
    }

    #[tokio::test]
    async fn test_unsupported_verbs() {
        let fx = fixture().await;
        let post = OperationDescriptor {
            href: "/users/1".to_string(),
            verb: "POST".to_string(),
            body: None,
        };
        let err = run(&fx, post, None).await.unwrap_err();
        assert_eq!((err.status, err.code.as_str()), (405, codes::VERB_UNSUPPORTED));

        let err = run(&fx, OperationDescriptor::put("/users", json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, 405);
    }

    #[tokio::test]
    async fn test_write_rule_requires_principal() {
        let fx = fixture().await;
        let err = run(
            &fx,
            OperationDescriptor::put("/secrets/k", json!({})),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!((err.status, err.code.as_str()), (401, codes::UNAUTHENTICATED));

        let response = run(
            &fx,
            OperationDescriptor::put("/secrets/k", json!({})),
            Some("alice"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 201);
    }

    #[tokio::test]
    async fn test_before_hook_rewrites_row() {
        let mut registry = ResourceRegistry::from_settings(&settings()).unwrap();
        registry.set_hooks("users", Arc::new(Uppercase)).unwrap();
        let fx = fixture_with(registry).await;
        let response = run(
            &fx,
            OperationDescriptor::put("/users/7", json!({"name": "zed"})),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.body["name"], "ZED");
    }

    #[tokio::test]
    async fn test_deny_rule_is_forbidden() {
        let mut registry = ResourceRegistry::from_settings(&settings()).unwrap();
        registry
            .set_policy(
                "users",
                Arc::new(crate::resource::RulePolicy::new(
                    AccessRule::Deny,
                    AccessRule::Public,
                )),
            )
            .unwrap();
        let fx = fixture_with(registry).await;
        let err = run(&fx, OperationDescriptor::get("/users/1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
        // Committed state is untouched by the executor.
        assert_eq!(fx.db.committed_rows("users").len(), 1);
    }
}
