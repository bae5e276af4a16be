//! Model synchronization against the remote controller
//!
//! A sync computes the operations that move the cached remote state toward
//! the model, runs them in order, refreshes the cache for every kind it
//! touched, then routes the outcome: success goes to the status queue,
//! failures are classified into retry, quick-sync or fatal paths.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use lbsync_common::{metrics, Error, Result, SyncConfig};

use super::{classify, ErrorClass, RemoteClient, RemoteError, RestMethod, RestOp};
use crate::cache::{RemoteCache, MODEL_MARKER_KEY};
use crate::graph::{ModelName, ModelNode, ModelRegistry, ObjectGraph};
use crate::queue::WorkHandler;
use crate::retry::{RetryClass, RetryDecision, RetryQueues};
use crate::scheduler::QuickSyncHandle;
use crate::shutdown::ShutdownSignal;
use crate::status::{StatusCondition, StatusQueue, StatusUpdate};

/// Result of one [`RestSynchronizer::sync`] call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Remote state matches the model
    Synced {
        /// Operations executed
        ops: usize,
    },
    /// Deletes ran but creates and updates were withheld (delete-config mode)
    Withheld {
        /// Operations executed
        ops: usize,
        /// Create and update operations not sent
        withheld: usize,
    },
    /// A retry was scheduled
    Retrying {
        /// Queue the model was sent to
        class: RetryClass,
        /// Retry number
        attempt: u32,
    },
    /// The retry budget is exhausted
    Abandoned {
        /// Failures counted
        attempts: u32,
    },
    /// A concurrent writer got in the way; a quick sync was requested
    Resyncing,
    /// The failure was reported and will not be retried automatically
    Failed {
        /// Failure detail
        message: String,
    },
}

/// Shared components a [`RestSynchronizer`] works with
///
/// Grouped so construction stays readable at the call site.
#[derive(Clone)]
pub struct SyncContext {
    /// Pipeline configuration
    pub config: Arc<SyncConfig>,
    /// Desired-state models
    pub registry: Arc<ModelRegistry>,
    /// Mirror of the remote inventory
    pub cache: Arc<RemoteCache>,
    /// Transport to the controller
    pub client: Arc<dyn RemoteClient>,
    /// Fast and slow retry queues
    pub retry: Arc<RetryQueues>,
    /// Status feedback queue
    pub status: Arc<StatusQueue>,
    /// Handle to request a quick full sync
    pub quick_sync: QuickSyncHandle,
    /// Process-wide stop signal
    pub shutdown: ShutdownSignal,
}

/// Diffs models against the cache and applies the difference
pub struct RestSynchronizer {
    ctx: SyncContext,
    controller_user: String,
}

impl RestSynchronizer {
    /// Create a synchronizer
    pub fn new(ctx: SyncContext) -> Self {
        let controller_user = ctx.config.controller_user();
        Self {
            ctx,
            controller_user,
        }
    }

    /// Operations that move the cached remote state to `graph`.
    ///
    /// Creates and updates come first, parents before children. Deletes of
    /// owned objects the model no longer wants follow, children first.
    pub fn plan(&self, graph: &ObjectGraph) -> Vec<RestOp> {
        let model = graph.name();
        let tenant = model.tenant();
        let mut ops = Vec::new();
        let mut desired: HashSet<(&str, &str)> = HashSet::new();

        for node in graph.ordered_nodes() {
            desired.insert((node.id.kind.as_str(), node.id.name.as_str()));
            match self.ctx.cache.get(&node.id.kind, tenant, &node.id.name) {
                None => ops.push(self.op(
                    RestMethod::Post,
                    format!("/api/{}", node.id.kind),
                    Some(self.render(model, node)),
                    model,
                    tenant,
                    &node.id.kind,
                    &node.id.name,
                )),
                Some(entry) if entry.checksum.as_deref() != Some(node.checksum.as_str()) => {
                    ops.push(self.op(
                        RestMethod::Put,
                        format!("/api/{}/{}", node.id.kind, entry.uuid),
                        Some(self.render(model, node)),
                        model,
                        &entry.tenant,
                        &node.id.kind,
                        &node.id.name,
                    ))
                }
                Some(_) => {}
            }
        }

        let mut stale: Vec<_> = self
            .ctx
            .cache
            .owned_by(model)
            .into_iter()
            .filter(|(kind, entry)| !desired.contains(&(kind.as_str(), entry.name.as_str())))
            .collect();
        stale.reverse();
        for (kind, entry) in stale {
            ops.push(self.op(
                RestMethod::Delete,
                format!("/api/{kind}/{}", entry.uuid),
                None,
                model,
                &entry.tenant,
                &kind,
                &entry.name,
            ));
        }

        ops
    }

    /// Execute `ops` in order, recording each failure on its op.
    ///
    /// After the first failure every later op is marked aborted and not
    /// sent. Returns the index of the failed op, if any.
    pub async fn execute(&self, ops: &mut [RestOp]) -> Option<usize> {
        let mut failed_at = None;
        for (idx, op) in ops.iter_mut().enumerate() {
            if failed_at.is_some() {
                metrics::record_rest_op(op.method.as_str(), &op.model_kind, "aborted");
                op.error = Some(RemoteError::aborted());
                continue;
            }
            if self.ctx.config.delete_config && op.method != RestMethod::Delete {
                warn!(model = %op.model, op = %op, "delete-config mode, skipping non-delete operation");
                metrics::record_rest_op(op.method.as_str(), &op.model_kind, "skipped");
                continue;
            }
            if let Err(e) = self.execute_one(op).await {
                op.error = Some(e);
                failed_at = Some(idx);
            }
        }
        failed_at
    }

    /// Bring one model's remote objects in line with its graph
    pub async fn sync(&self, model: &ModelName) -> Result<SyncOutcome> {
        if self.ctx.shutdown.is_stopped() {
            return Err(Error::shutdown(format!("not syncing {model}, pipeline stopping")));
        }

        let graph = self
            .ctx
            .registry
            .snapshot(model)
            .unwrap_or_else(|| ObjectGraph::new(model.clone()));
        let mut ops = self.plan(&graph);
        debug!(model = %model, nodes = graph.len(), ops = ops.len(), "planned sync");

        let failed_at = self.execute(&mut ops).await;
        self.refresh_touched(&ops).await;

        match failed_at.and_then(|idx| ops.get(idx)) {
            None => {
                let withheld = self.withheld(&ops);
                if withheld > 0 {
                    Ok(self.on_withheld(model, &graph, ops.len() - withheld, withheld))
                } else {
                    Ok(self.on_success(model, &graph, ops.len()))
                }
            }
            Some(op) => {
                let err = op.error.clone().unwrap_or_else(RemoteError::aborted);
                self.on_failure(model, &graph, op, err)
            }
        }
    }

    async fn execute_one(&self, op: &RestOp) -> std::result::Result<(), RemoteError> {
        let method = op.method.as_str();
        match self.ctx.client.execute(op).await {
            Ok(_) => {
                debug!(model = %op.model, op = %op, tenant = %op.tenant, "rest operation succeeded");
                metrics::record_rest_op(method, &op.model_kind, "success");
                if op.method == RestMethod::Delete {
                    self.ctx.cache.evict(&op.model_kind, &op.tenant, &op.object_name);
                }
                Ok(())
            }
            Err(e) if op.method == RestMethod::Delete && e.is_not_found() => {
                debug!(model = %op.model, op = %op, "object already gone");
                metrics::record_rest_op(method, &op.model_kind, "not_found");
                self.ctx.cache.evict(&op.model_kind, &op.tenant, &op.object_name);
                Ok(())
            }
            Err(e)
                if classify(&e) == ErrorClass::ElevateTenant
                    && op.tenant != self.ctx.config.admin_tenant =>
            {
                warn!(
                    model = %op.model,
                    op = %op,
                    tenant = %op.tenant,
                    admin_tenant = %self.ctx.config.admin_tenant,
                    "forbidden, retrying under the admin tenant"
                );
                let mut elevated = op.clone();
                elevated.tenant = self.ctx.config.admin_tenant.clone();
                match self.ctx.client.execute(&elevated).await {
                    Ok(_) => {
                        metrics::record_rest_op(method, &op.model_kind, "success");
                        Ok(())
                    }
                    Err(e) => {
                        metrics::record_rest_op(method, &op.model_kind, "error");
                        Err(e)
                    }
                }
            }
            Err(e) => {
                metrics::record_rest_op(method, &op.model_kind, "error");
                Err(e)
            }
        }
    }

    /// Re-scan every kind an executed op touched, once each
    async fn refresh_touched(&self, ops: &[RestOp]) {
        let mut seen = HashSet::new();
        for op in ops {
            if op.error.as_ref().is_some_and(RemoteError::is_aborted) {
                continue;
            }
            if !seen.insert(op.model_kind.as_str()) {
                continue;
            }
            if let Err(e) = self.ctx.cache.refresh(&op.model_kind).await {
                warn!(kind = %op.model_kind, error = %e, "cache refresh failed");
            }
        }
    }

    fn on_success(&self, model: &ModelName, graph: &ObjectGraph, ops: usize) -> SyncOutcome {
        if ops > 0 {
            info!(model = %model, ops, "model synchronized");
        }
        self.ctx.registry.reset_retry(model);
        self.ctx.retry.forget(model);
        self.publish_status(graph, StatusCondition::synced);

        if graph.is_empty() && self.ctx.registry.remove_if_empty(model) {
            debug!(model = %model, "removed empty model");
        }
        SyncOutcome::Synced { ops }
    }

    fn withheld(&self, ops: &[RestOp]) -> usize {
        if !self.ctx.config.delete_config {
            return 0;
        }
        ops.iter().filter(|op| op.method != RestMethod::Delete).count()
    }

    fn on_withheld(
        &self,
        model: &ModelName,
        graph: &ObjectGraph,
        ops: usize,
        withheld: usize,
    ) -> SyncOutcome {
        info!(model = %model, ops, withheld, "delete-config mode, model left unsynchronized");
        self.ctx.registry.reset_retry(model);
        self.ctx.retry.forget(model);
        let message = format!("delete-config mode, {withheld} create or update operations withheld");
        self.publish_status(graph, |generation| {
            StatusCondition::pending(message.clone(), generation)
        });
        SyncOutcome::Withheld { ops, withheld }
    }

    fn on_failure(
        &self,
        model: &ModelName,
        graph: &ObjectGraph,
        op: &RestOp,
        err: RemoteError,
    ) -> Result<SyncOutcome> {
        let class = classify(&err);
        let detail = format!("{op}: {}", err.message);
        warn!(
            model = %model,
            op = %op,
            status = err.status,
            class = class.as_str(),
            error = %err.message,
            "rest operation failed"
        );

        match class {
            ErrorClass::Fatal => {
                metrics::record_fatal_shutdown("rest");
                self.ctx
                    .shutdown
                    .trigger_fatal(format!("controller rejected credentials: {}", err.message));
                Err(Error::shutdown(format!("credentials rejected while syncing {model}")))
            }
            ErrorClass::FastRetry => Ok(self.retry(model, graph, RetryClass::Fast, &detail)),
            ErrorClass::SlowRetry => Ok(self.retry(model, graph, RetryClass::Slow, &detail)),
            ErrorClass::ConcurrentUpdate => {
                if !self.ctx.quick_sync.trigger() {
                    debug!(model = %model, "scheduler stopped, quick sync not requested");
                }
                self.publish_status(graph, |generation| {
                    StatusCondition::pending(detail.clone(), generation)
                });
                Ok(SyncOutcome::Resyncing)
            }
            ErrorClass::ElevateTenant | ErrorClass::Failed => {
                self.publish_status(graph, |generation| {
                    StatusCondition::sync_failed(detail.clone(), generation)
                });
                Ok(SyncOutcome::Failed { message: detail })
            }
        }
    }

    fn retry(
        &self,
        model: &ModelName,
        graph: &ObjectGraph,
        class: RetryClass,
        detail: &str,
    ) -> SyncOutcome {
        match self.ctx.retry.schedule(model, class) {
            RetryDecision::Scheduled { attempt } => {
                self.publish_status(graph, |generation| {
                    StatusCondition::pending(detail, generation)
                });
                SyncOutcome::Retrying { class, attempt }
            }
            RetryDecision::Abandoned { attempts } => {
                self.publish_status(graph, |generation| {
                    StatusCondition::retry_exhausted(
                        format!("gave up after {attempts} attempts: {detail}"),
                        generation,
                    )
                });
                SyncOutcome::Abandoned { attempts }
            }
        }
    }

    fn publish_status(&self, graph: &ObjectGraph, condition: impl Fn(Option<i64>) -> StatusCondition) {
        for (key, generation) in graph.origins() {
            self.ctx.status.publish(StatusUpdate {
                key: key.clone(),
                condition: condition(generation),
            });
        }
    }

    /// Desired payload plus the ownership markers the cache relies on
    fn render(&self, model: &ModelName, node: &ModelNode) -> Value {
        let mut object = node.payload.as_object().cloned().unwrap_or_default();
        object.insert("name".to_string(), json!(node.id.name));
        object.insert("tenant".to_string(), json!(model.tenant()));
        object.insert("created_by".to_string(), json!(self.controller_user));
        object.insert("cloud_config_cksum".to_string(), json!(node.checksum));
        object.insert(
            "markers".to_string(),
            json!([{ "key": MODEL_MARKER_KEY, "values": [model.as_str()] }]),
        );
        Value::Object(object)
    }

    #[allow(clippy::too_many_arguments)]
    fn op(
        &self,
        method: RestMethod,
        path: String,
        payload: Option<Value>,
        model: &ModelName,
        tenant: &str,
        kind: &str,
        name: &str,
    ) -> RestOp {
        RestOp {
            method,
            path,
            payload,
            tenant: tenant.to_string(),
            model_kind: kind.to_string(),
            object_name: name.to_string(),
            model: model.clone(),
            error: None,
        }
    }
}

#[async_trait]
impl WorkHandler<ModelName> for RestSynchronizer {
    async fn handle(&self, model: ModelName) -> Result<()> {
        self.sync(&model).await.map(|_| ())
    }
}
