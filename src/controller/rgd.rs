//! ResourceGraphDefinition controller
//!
//! Compiles each RGD once per observed generation. A successful compile
//! applies the instance CRD, publishes the topological order on the status,
//! and (re)starts the dynamic instance controller. Compile failures mark the
//! definition inactive with the error condition and are not retried until
//! the user changes the definition.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{error, info, warn};

use crate::cluster::{DuckTypedResolver, SchemaResolver};
use crate::controller::runner::ControllerRegistry;
use crate::events::EventPublisher;
use crate::crd::{
    Condition, ConditionStatus, ResourceGraphDefinition, ResourceGraphDefinitionStatus, RgdState,
};
use crate::error::Error;
use crate::expr::ExpressionEngine;
use crate::graph::{Graph, GraphBuilder};
use crate::Result;

/// Finalizer on RGDs: the emitted CRD and the dynamic controller need
/// cleanup before the definition goes away
pub const RGD_FINALIZER: &str = "kro.run/graph-cleanup";

/// Shared context for the RGD controller
pub struct RgdContext {
    /// Direct API access for CRD registration and status patches
    pub client: Client,
    /// Registry of dynamic instance controllers
    pub registry: Arc<ControllerRegistry>,
    /// Event sink for compile outcomes
    pub events: Arc<dyn EventPublisher>,
}

impl RgdContext {
    /// Create the controller context
    pub fn new(
        client: Client,
        registry: Arc<ControllerRegistry>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            registry,
            events,
        }
    }
}

/// Compile a definition into a graph, using the duck-typed resolver for
/// foreign kinds
pub fn compile_definition(rgd: &ResourceGraphDefinition) -> Result<Graph> {
    let engine = ExpressionEngine::new();
    let resolver: &dyn SchemaResolver = &DuckTypedResolver;
    GraphBuilder::new(&engine, resolver).build(rgd)
}

/// Reconcile one ResourceGraphDefinition
pub async fn reconcile(
    rgd: Arc<ResourceGraphDefinition>,
    ctx: Arc<RgdContext>,
) -> Result<Action> {
    let name = rgd.name_any();

    if rgd.metadata.deletion_timestamp.is_some() {
        return reconcile_deletion(&rgd, &ctx).await;
    }

    ensure_finalizer(&rgd, &ctx).await?;

    match compile_definition(&rgd) {
        Ok(graph) => {
            let crd_name = graph
                .instance_crd
                .metadata
                .name
                .clone()
                .unwrap_or_default();
            info!(rgd = %name, crd = %crd_name, "definition compiled, applying instance CRD");

            let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
            crds.patch(
                &crd_name,
                &PatchParams::apply(crate::FIELD_MANAGER).force(),
                &Patch::Apply(&graph.instance_crd),
            )
            .await?;

            let status = ResourceGraphDefinitionStatus {
                state: RgdState::Active,
                conditions: vec![Condition::new(
                    "GraphCompiled",
                    ConditionStatus::True,
                    "Compiled",
                    format!("{} resources in graph", graph.resources.len()),
                )],
                topological_order: graph.topological_order.clone(),
            };
            patch_status(&ctx.client, &name, &status).await?;

            let generation = rgd.metadata.generation.unwrap_or_default();
            ctx.registry
                .ensure(&name, generation, Arc::new(graph))
                .await;

            ctx.events
                .publish(
                    &rgd.object_ref(&()),
                    EventType::Normal,
                    "GraphCompiled",
                    "Compile",
                    Some(format!("instance CRD {crd_name} is being served")),
                )
                .await;

            Ok(Action::requeue(Duration::from_secs(600)))
        }
        Err(e) => {
            // compile errors are terminal until the user edits the definition
            error!(rgd = %name, error = %e, "definition failed to compile");
            ctx.registry.stop(&name).await;

            let status = ResourceGraphDefinitionStatus {
                state: RgdState::Inactive,
                conditions: vec![Condition::new(
                    "GraphCompiled",
                    ConditionStatus::False,
                    e.reason(),
                    e.to_string(),
                )],
                topological_order: vec![],
            };
            patch_status(&ctx.client, &name, &status).await?;

            ctx.events
                .publish(
                    &rgd.object_ref(&()),
                    EventType::Warning,
                    e.reason(),
                    "Compile",
                    Some(e.to_string()),
                )
                .await;

            Ok(Action::await_change())
        }
    }
}

/// Requeue policy on reconcile errors
pub fn error_policy(
    _rgd: Arc<ResourceGraphDefinition>,
    error: &Error,
    _ctx: Arc<RgdContext>,
) -> Action {
    warn!(error = %error, "rgd reconcile error");
    Action::requeue(Duration::from_secs(30))
}

/// Deleting an RGD first removes the emitted CRD, which cascades instance
/// deletion through owner references, then stops the dynamic controller.
async fn reconcile_deletion(
    rgd: &ResourceGraphDefinition,
    ctx: &RgdContext,
) -> Result<Action> {
    let name = rgd.name_any();
    if !has_finalizer(rgd) {
        return Ok(Action::await_change());
    }

    ctx.registry.stop(&name).await;

    let plural = crate::graph::pluralize_kind(&rgd.spec.schema.kind);
    let crd_name = format!("{plural}.{}", rgd.spec.schema.group());
    let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    match crds.delete(&crd_name, &Default::default()).await {
        Ok(_) => info!(rgd = %name, crd = %crd_name, "deleted instance CRD"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    let finalizers: Vec<String> = rgd
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != RGD_FINALIZER)
        .collect();
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());
    api.patch_metadata(
        &name,
        &PatchParams::default(),
        &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
    )
    .await?;

    Ok(Action::await_change())
}

fn has_finalizer(rgd: &ResourceGraphDefinition) -> bool {
    rgd.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == RGD_FINALIZER))
}

async fn ensure_finalizer(rgd: &ResourceGraphDefinition, ctx: &RgdContext) -> Result<()> {
    if has_finalizer(rgd) {
        return Ok(());
    }
    let mut finalizers = rgd.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(RGD_FINALIZER.to_string());
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());
    api.patch_metadata(
        &rgd.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
    )
    .await?;
    Ok(())
}

async fn patch_status(
    client: &Client,
    name: &str,
    status: &ResourceGraphDefinitionStatus,
) -> Result<()> {
    let api: Api<ResourceGraphDefinition> = Api::all(client.clone());
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(&json!({"status": status})),
    )
    .await?;
    Ok(())
}
