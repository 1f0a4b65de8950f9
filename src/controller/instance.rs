//! Instance reconciler
//!
//! Drives the instance runtime against the cluster: resources are processed
//! in topological order on every pass; each desired object is delta-gated,
//! server-side applied under the namespace's impersonation identity, and
//! re-read so downstream expressions see real field values. Readiness gates
//! dependents while independent branches continue. A reap step prunes
//! managed objects that fell out of the desired set, and deletion walks the
//! topological order in reverse under a finalizer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::controller::delta;
use crate::crd::{Condition, ConditionStatus, InstanceState, ResourceState, ResourceStatus};
use crate::error::Error;
use crate::expr::ExpressionEngine;
use crate::graph::{CompiledResource, Graph};
use crate::runtime::{EvalContext, InstanceRuntime};
use crate::Result;
use crate::{
    INSTANCE_FINALIZER, INSTANCE_NAMESPACE_LABEL, INSTANCE_NAME_LABEL, INSTANCE_UID_LABEL,
    OWNED_LABEL, RESOURCE_ID_ANNOTATION,
};

/// Requeue interval while resources are not yet ready
const REQUEUE_WAITING: Duration = Duration::from_secs(30);

/// Requeue interval once the instance is active
const REQUEUE_ACTIVE: Duration = Duration::from_secs(300);

/// Requeue interval after a permanent failure (the user may fix the instance)
const REQUEUE_FAILED: Duration = Duration::from_secs(120);

/// Per-pass deadline; an overrunning pass returns and requeues
const PASS_DEADLINE: Duration = Duration::from_secs(120);

/// Shared context for one emitted CRD's instance controller
pub struct InstanceContext {
    /// The immutable compiled graph
    pub graph: Arc<Graph>,
    /// Shared expression engine
    pub engine: Arc<ExpressionEngine>,
    /// Cluster access seam
    pub cluster: Arc<dyn ClusterClient>,
}

impl InstanceContext {
    /// Create a context over a compiled graph
    pub fn new(
        graph: Arc<Graph>,
        engine: Arc<ExpressionEngine>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            graph,
            engine,
            cluster,
        }
    }

    /// Cluster client for writes into the given namespace, honoring the
    /// definition's impersonation identities
    async fn client_for(&self, namespace: &str) -> Result<Arc<dyn ClusterClient>> {
        match self.graph.service_account_for(namespace) {
            Some(service_account) => self.cluster.impersonate(service_account, namespace).await,
            None => Ok(self.cluster.clone()),
        }
    }
}

/// Reconcile one instance of an emitted CRD
pub async fn reconcile(
    instance: Arc<DynamicObject>,
    ctx: Arc<InstanceContext>,
) -> Result<Action> {
    let value = serde_json::to_value(&*instance).map_err(|e| Error::serialization(e.to_string()))?;
    match tokio::time::timeout(PASS_DEADLINE, reconcile_value(value, ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("reconcile pass exceeded deadline, requeueing");
            Ok(Action::requeue(REQUEUE_WAITING))
        }
    }
}

/// Requeue policy on reconcile errors
pub fn error_policy(
    _instance: Arc<DynamicObject>,
    error: &Error,
    _ctx: Arc<InstanceContext>,
) -> Action {
    if error.is_retryable() {
        Action::requeue(REQUEUE_WAITING)
    } else {
        Action::requeue(REQUEUE_FAILED)
    }
}

/// Outcome of processing one resource within a pass
enum Processed {
    /// All items applied and ready; context published
    Ready,
    /// Applied but readiness pending, or waiting on a missing external ref
    NotReady(String),
    /// Excluded by includeWhen
    Skipped,
    /// Blocked behind a not-ready dependency
    Blocked(String),
}

pub(crate) async fn reconcile_value(value: Value, ctx: Arc<InstanceContext>) -> Result<Action> {
    let meta = InstanceMeta::from_value(&value)?;

    if meta.deleting {
        return reconcile_deletion(&value, &meta, &ctx).await;
    }

    // Taking ownership comes first: without the finalizer a deletion could
    // race ahead of cleanup
    if !meta.has_finalizer {
        add_finalizer(&meta, &ctx).await?;
    }

    let runtime = InstanceRuntime::new(&ctx.graph, &ctx.engine);
    let mut eval_ctx = runtime.root_context(&value);

    let mut statuses: Vec<ResourceStatus> = Vec::new();
    let mut desired_keys: BTreeSet<(String, String, String, String)> = BTreeSet::new();
    let mut not_ready: BTreeSet<String> = BTreeSet::new();
    let mut failure: Option<Error> = None;

    for resource in &ctx.graph.resources {
        // Readiness gating: anything downstream of a not-ready resource
        // waits, while independent branches continue
        if let Some(blocker) = resource
            .dependencies
            .iter()
            .find(|d| not_ready.contains(*d))
        {
            let wait = Error::DependencyNotReady {
                resource: resource.id.clone(),
                dependency: blocker.clone(),
            };
            statuses.push(ResourceStatus {
                id: resource.id.clone(),
                state: ResourceState::Pending,
                message: Some(wait.to_string()),
            });
            not_ready.insert(resource.id.clone());
            continue;
        }

        match process_resource(resource, &runtime, &mut eval_ctx, &meta, &ctx, &mut desired_keys)
            .await
        {
            Ok(Processed::Ready) => statuses.push(ResourceStatus {
                id: resource.id.clone(),
                state: ResourceState::Ready,
                message: None,
            }),
            Ok(Processed::NotReady(message)) => {
                statuses.push(ResourceStatus {
                    id: resource.id.clone(),
                    state: ResourceState::Applied,
                    message: Some(message),
                });
                not_ready.insert(resource.id.clone());
            }
            Ok(Processed::Skipped) => statuses.push(ResourceStatus {
                id: resource.id.clone(),
                state: ResourceState::Skipped,
                message: None,
            }),
            Ok(Processed::Blocked(message)) => {
                statuses.push(ResourceStatus {
                    id: resource.id.clone(),
                    state: ResourceState::Pending,
                    message: Some(message),
                });
                not_ready.insert(resource.id.clone());
            }
            Err(e) if e.is_retryable() => {
                // Transient cluster trouble: surface what we know, then let
                // the error policy requeue the key
                let _ = update_status(
                    &meta,
                    &ctx,
                    &runtime,
                    &eval_ctx,
                    InstanceState::InProgress,
                    statuses,
                    Some(e.to_string()),
                )
                .await;
                return Err(e);
            }
            Err(e) => {
                statuses.push(ResourceStatus {
                    id: resource.id.clone(),
                    state: ResourceState::Failed,
                    message: Some(e.to_string()),
                });
                not_ready.insert(resource.id.clone());
                failure = Some(e);
                // downstream resources cannot proceed; record them as pending
                continue;
            }
        }
    }

    reap(&meta, &ctx, &desired_keys).await?;

    let all_ready = statuses
        .iter()
        .all(|s| matches!(s.state, ResourceState::Ready | ResourceState::Skipped));

    let (state, action) = match (&failure, all_ready) {
        (Some(_), _) => (InstanceState::Failed, Action::requeue(REQUEUE_FAILED)),
        (None, true) => (InstanceState::Active, Action::requeue(REQUEUE_ACTIVE)),
        (None, false) => (InstanceState::InProgress, Action::requeue(REQUEUE_WAITING)),
    };

    update_status(
        &meta,
        &ctx,
        &runtime,
        &eval_ctx,
        state,
        statuses,
        failure.map(|e| e.to_string()),
    )
    .await?;

    Ok(action)
}

/// Process one resource: includeWhen, expansion, resolve, delta-gated apply,
/// context publication, readiness.
async fn process_resource(
    resource: &CompiledResource,
    runtime: &InstanceRuntime<'_>,
    eval_ctx: &mut EvalContext,
    meta: &InstanceMeta,
    ctx: &InstanceContext,
    desired_keys: &mut BTreeSet<(String, String, String, String)>,
) -> Result<Processed> {
    if !runtime.evaluate_include(resource, eval_ctx)? {
        debug!(resource = %resource.id, "excluded by includeWhen");
        return Ok(Processed::Skipped);
    }

    if resource.is_external() {
        return read_external(resource, runtime, eval_ctx, meta, ctx).await;
    }

    let ar = resource.api_resource();
    let tuples = runtime.expand(resource, eval_ctx)?;
    let mut observed_items = Vec::with_capacity(tuples.len());
    let mut ready = true;

    for tuple in &tuples {
        let mut item = runtime.resolve_item(resource, eval_ctx, tuple)?;
        decorate(&mut item.desired, resource, meta);

        let name = item
            .name()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::evaluation(&resource.id, "/metadata/name", "desired object has no name")
            })?;
        let namespace = item
            .namespace()
            .map(str::to_string)
            .unwrap_or_else(|| meta.namespace.clone());

        desired_keys.insert((
            resource.api_version.clone(),
            resource.kind.clone(),
            namespace.clone(),
            name.clone(),
        ));

        let client = ctx.client_for(&namespace).await?;
        let observed = client.get(&ar, Some(&namespace), &name).await?;

        let live = match observed {
            Some(observed) if delta::compare(&item.desired, &observed).is_empty() => {
                debug!(resource = %resource.id, name = %name, "no drift, skipping apply");
                observed
            }
            _ => {
                info!(resource = %resource.id, name = %name, "applying object");
                client
                    .apply(&ar, Some(&namespace), &name, &item.desired)
                    .await
                    .map_err(|e| classify_apply_error(&resource.id, e))?
            }
        };

        if !runtime.evaluate_ready(resource, &live, tuple, eval_ctx)? {
            ready = false;
        }
        observed_items.push(live);
    }

    // Downstream expressions consume observed data whenever possible
    let published = if resource.is_collection() {
        Value::Array(observed_items)
    } else {
        observed_items.into_iter().next().unwrap_or(Value::Null)
    };
    eval_ctx.publish(resource.id.clone(), published);

    if ready {
        Ok(Processed::Ready)
    } else {
        Ok(Processed::NotReady("readiness checks pending".to_string()))
    }
}

/// External references contribute no writes; readiness is bare existence
async fn read_external(
    resource: &CompiledResource,
    runtime: &InstanceRuntime<'_>,
    eval_ctx: &mut EvalContext,
    meta: &InstanceMeta,
    ctx: &InstanceContext,
) -> Result<Processed> {
    let (name, namespace) = runtime.external_target(resource, eval_ctx)?;
    let namespace = namespace.unwrap_or_else(|| meta.namespace.clone());
    let ar = resource.api_resource();

    match ctx.cluster.get(&ar, Some(&namespace), &name).await? {
        Some(observed) => {
            eval_ctx.publish(resource.id.clone(), observed);
            Ok(Processed::Ready)
        }
        None => Ok(Processed::Blocked(
            Error::ExternalRefMissing {
                resource: resource.id.clone(),
                name: format!("{namespace}/{name}"),
            }
            .to_string(),
        )),
    }
}

/// Prune managed objects that are no longer desired.
///
/// Lists by the ownership label per graph GVK and deletes, in name order,
/// every managed object absent from the desired set. The resource-id
/// annotation distinguishes managed objects from foreign ones even through
/// renames.
async fn reap(
    meta: &InstanceMeta,
    ctx: &InstanceContext,
    desired_keys: &BTreeSet<(String, String, String, String)>,
) -> Result<()> {
    let selector = format!("{INSTANCE_UID_LABEL}={}", meta.uid);

    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    for resource in &ctx.graph.resources {
        if resource.is_external() {
            continue;
        }
        let key = (resource.api_version.clone(), resource.kind.clone());
        if !seen.insert(key) {
            continue;
        }
        let ar = resource.api_resource();

        let mut owned = ctx.cluster.list(&ar, None, &selector).await?;
        owned.sort_by_key(object_sort_key);
        for object in owned {
            if object.pointer(&annotation_pointer()).is_none() {
                // not one of ours even though it carries the label
                continue;
            }
            let name = object
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let namespace = object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let key = (
                resource.api_version.clone(),
                resource.kind.clone(),
                namespace.clone(),
                name.clone(),
            );
            if desired_keys.contains(&key) {
                continue;
            }
            info!(kind = %resource.kind, namespace = %namespace, name = %name, "reaping undesired object");
            let client = ctx.client_for(&namespace).await?;
            client.delete(&ar, Some(&namespace), &name).await?;
        }
    }
    Ok(())
}

/// Deletion path: walk the topological order in reverse, wait for each
/// resource's managed objects to clear before touching its upstreams, then
/// strip the finalizer.
async fn reconcile_deletion(
    _value: &Value,
    meta: &InstanceMeta,
    ctx: &InstanceContext,
) -> Result<Action> {
    if !meta.has_finalizer {
        return Ok(Action::await_change());
    }

    let selector = format!("{INSTANCE_UID_LABEL}={}", meta.uid);

    for id in ctx.graph.topological_order.iter().rev() {
        let Some(resource) = ctx.graph.get(id) else {
            continue;
        };
        if resource.is_external() {
            continue;
        }
        let ar = resource.api_resource();
        let owned: Vec<Value> = ctx
            .cluster
            .list(&ar, None, &selector)
            .await?
            .into_iter()
            .filter(|o| {
                o.pointer(&annotation_pointer())
                    .and_then(Value::as_str)
                    .is_some_and(|a| a == resource.id)
            })
            .collect();

        if owned.is_empty() {
            continue;
        }

        for object in owned {
            let name = object
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let namespace = object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or_default();
            info!(resource = %resource.id, name = %name, "deleting managed object");
            let client = ctx.client_for(namespace).await?;
            client.delete(&ar, Some(namespace), name).await?;
        }

        // objects of this resource still existed; wait for them to clear
        // before advancing to its upstreams
        let status = json!({
            "state": InstanceState::Deleting,
            "synced": false,
        });
        let _ = ctx
            .cluster
            .patch_status(
                &ctx.graph.instance_api_resource(),
                Some(&meta.namespace),
                &meta.name,
                &status,
            )
            .await;
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    remove_finalizer(meta, ctx).await?;
    Ok(Action::await_change())
}

fn classify_apply_error(resource: &str, error: Error) -> Error {
    match error {
        Error::Kube {
            source: kube::Error::Api(ae),
        } => Error::ApplyRejected {
            resource: resource.to_string(),
            message: ae.message,
            code: Some(ae.code),
        },
        other => other,
    }
}

/// Stamp ownership labels, the resource-id annotation, the default
/// namespace, and (same-namespace only) an owner reference for GC.
fn decorate(desired: &mut Value, resource: &CompiledResource, meta: &InstanceMeta) {
    let Some(metadata) = ensure_object(desired, "metadata") else {
        return;
    };

    if !metadata.contains_key("namespace") {
        metadata.insert("namespace".to_string(), json!(meta.namespace));
    }
    let same_namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .is_some_and(|ns| ns == meta.namespace);

    let labels = metadata
        .entry("labels".to_string())
        .or_insert_with(|| json!({}));
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(OWNED_LABEL.to_string(), json!("true"));
        labels.insert(INSTANCE_UID_LABEL.to_string(), json!(meta.uid));
        labels.insert(INSTANCE_NAME_LABEL.to_string(), json!(meta.name));
        labels.insert(
            INSTANCE_NAMESPACE_LABEL.to_string(),
            json!(meta.namespace),
        );
    }

    let annotations = metadata
        .entry("annotations".to_string())
        .or_insert_with(|| json!({}));
    if let Some(annotations) = annotations.as_object_mut() {
        annotations.insert(RESOURCE_ID_ANNOTATION.to_string(), json!(resource.id));
    }

    // cross-namespace owner references are invalid; the reaper handles those
    if same_namespace {
        metadata.insert(
            "ownerReferences".to_string(),
            json!([{
                "apiVersion": meta.api_version,
                "kind": meta.kind,
                "name": meta.name,
                "uid": meta.uid,
                "controller": true,
                "blockOwnerDeletion": false,
            }]),
        );
    }
}

fn ensure_object<'a>(
    value: &'a mut Value,
    key: &str,
) -> Option<&'a mut serde_json::Map<String, Value>> {
    let object = value.as_object_mut()?;
    object
        .entry(key.to_string())
        .or_insert_with(|| json!({}))
        .as_object_mut()
}

fn annotation_pointer() -> String {
    format!(
        "/metadata/annotations/{}",
        RESOURCE_ID_ANNOTATION.replace('~', "~0").replace('/', "~1")
    )
}

fn object_sort_key(object: &Value) -> String {
    format!(
        "{}/{}",
        object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    )
}

async fn add_finalizer(meta: &InstanceMeta, ctx: &InstanceContext) -> Result<()> {
    let mut finalizers = meta.finalizers.clone();
    finalizers.push(INSTANCE_FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    ctx.cluster
        .patch_merge(
            &ctx.graph.instance_api_resource(),
            Some(&meta.namespace),
            &meta.name,
            &patch,
        )
        .await?;
    Ok(())
}

async fn remove_finalizer(meta: &InstanceMeta, ctx: &InstanceContext) -> Result<()> {
    let finalizers: Vec<String> = meta
        .finalizers
        .iter()
        .filter(|f| *f != INSTANCE_FINALIZER)
        .cloned()
        .collect();
    let patch = json!({"metadata": {"finalizers": finalizers}});
    ctx.cluster
        .patch_merge(
            &ctx.graph.instance_api_resource(),
            Some(&meta.namespace),
            &meta.name,
            &patch,
        )
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn update_status(
    meta: &InstanceMeta,
    ctx: &InstanceContext,
    runtime: &InstanceRuntime<'_>,
    eval_ctx: &EvalContext,
    state: InstanceState,
    resources: Vec<ResourceStatus>,
    failure: Option<String>,
) -> Result<()> {
    let (mut status, projection_errors) = runtime.project_status(eval_ctx);
    for error in &projection_errors {
        debug!(error = %error, "status projection incomplete");
    }

    let graph_resolved = state != InstanceState::Failed;
    let resources_ready = state == InstanceState::Active;
    let ready = graph_resolved && resources_ready;

    let conditions = vec![
        condition("InstanceManaged", true, "FinalizerSet", ""),
        condition(
            "GraphResolved",
            graph_resolved,
            if graph_resolved { "Resolved" } else { "ResolutionFailed" },
            failure.as_deref().unwrap_or(""),
        ),
        condition(
            "ResourcesReady",
            resources_ready,
            if resources_ready { "AllReady" } else { "Waiting" },
            "",
        ),
        condition(
            "Ready",
            ready,
            if ready { "Ready" } else { "NotReady" },
            "",
        ),
    ];

    if let Some(object) = status.as_object_mut() {
        object.insert("state".to_string(), serde_json::to_value(state).unwrap_or_default());
        object.insert("synced".to_string(), json!(ready));
        object.insert(
            "conditions".to_string(),
            serde_json::to_value(&conditions).unwrap_or_default(),
        );
        object.insert(
            "resources".to_string(),
            serde_json::to_value(&resources).unwrap_or_default(),
        );
        object.insert(
            "topologicalOrder".to_string(),
            serde_json::to_value(&ctx.graph.topological_order).unwrap_or_default(),
        );
    }

    ctx.cluster
        .patch_status(
            &ctx.graph.instance_api_resource(),
            Some(&meta.namespace),
            &meta.name,
            &status,
        )
        .await
}

fn condition(type_: &str, holds: bool, reason: &str, message: &str) -> Condition {
    Condition::new(
        type_,
        if holds {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason,
        message,
    )
}

/// Identity fields of the instance being reconciled
struct InstanceMeta {
    api_version: String,
    kind: String,
    name: String,
    namespace: String,
    uid: String,
    finalizers: Vec<String>,
    has_finalizer: bool,
    deleting: bool,
}

impl InstanceMeta {
    fn from_value(value: &Value) -> Result<Self> {
        let metadata = value
            .get("metadata")
            .ok_or_else(|| Error::serialization("instance has no metadata"))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::serialization("instance has no name"))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let finalizers: Vec<String> = metadata
            .get("finalizers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let has_finalizer = finalizers.iter().any(|f| f == INSTANCE_FINALIZER);

        Ok(Self {
            api_version: value
                .get("apiVersion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind: value
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name,
            namespace,
            uid: metadata
                .get("uid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            finalizers,
            has_finalizer,
            deleting: metadata.get("deletionTimestamp").is_some(),
        })
    }
}
