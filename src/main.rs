//! Weft operator entrypoint
//!
//! Installs the ResourceGraphDefinition CRD, then runs the RGD controller;
//! instance controllers are started dynamically as definitions compile.

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Config, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use weft::cluster::KubeClusterClient;
use weft::controller::{rgd, ControllerRegistry, RgdContext};
use weft::crd::ResourceGraphDefinition;
use weft::events::KubeEventPublisher;

/// Weft - resource graph operator for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "weft", version, about, long_about = None)]
struct Cli {
    /// Generate the ResourceGraphDefinition CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ResourceGraphDefinition::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("failed to infer kube config: {e}"))?;
    let client = Client::try_from(config.clone())?;

    ensure_crd_installed(&client).await?;

    let cluster = Arc::new(KubeClusterClient::new(client.clone(), config));
    let registry = Arc::new(ControllerRegistry::new(client.clone(), cluster));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "weft-rgd-controller"));
    let ctx = Arc::new(RgdContext::new(client.clone(), registry, events));

    tracing::info!("starting ResourceGraphDefinition controller");
    let definitions: Api<ResourceGraphDefinition> = Api::all(client);
    Controller::new(definitions, WatcherConfig::default())
        .shutdown_on_signal()
        .run(rgd::reconcile, rgd::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "rgd reconciled"),
                Err(e) => tracing::error!(error = ?e, "rgd reconcile error"),
            }
        })
        .await;

    tracing::info!("controller stopped");
    Ok(())
}

/// Install/update the RGD CRD on startup with server-side apply, so the CRD
/// version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = ResourceGraphDefinition::crd();
    let name = crd
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| "resourcegraphdefinitions.kro.run".to_string());

    tracing::info!(crd = %name, "installing CRD");
    crds.patch(
        &name,
        &PatchParams::apply(weft::FIELD_MANAGER).force(),
        &Patch::Apply(&crd),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {name}: {e}"))?;

    Ok(())
}
