//! Dynamic instance controllers
//!
//! Each active ResourceGraphDefinition gets one controller watching its
//! emitted CRD. The registry starts a controller when an RGD compiles,
//! replaces it when the RGD generation changes, and shuts it down when the
//! RGD goes inactive or away.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cluster::ClusterClient;
use crate::controller::instance::{self, InstanceContext};
use crate::expr::ExpressionEngine;
use crate::graph::Graph;

struct RunningController {
    generation: i64,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Registry of per-RGD instance controllers
pub struct ControllerRegistry {
    client: Client,
    cluster: Arc<dyn ClusterClient>,
    engine: Arc<ExpressionEngine>,
    running: Mutex<HashMap<String, RunningController>>,
}

impl ControllerRegistry {
    /// Create a registry over the given cluster access
    pub fn new(client: Client, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            cluster,
            engine: Arc::new(ExpressionEngine::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a controller is running for this RGD at this generation.
    ///
    /// A generation change replaces the controller so reconciles pick up the
    /// freshly compiled graph.
    pub async fn ensure(&self, rgd_name: &str, generation: i64, graph: Arc<Graph>) {
        let mut running = self.running.lock().await;
        if let Some(existing) = running.get(rgd_name) {
            if existing.generation == generation && !existing.handle.is_finished() {
                debug!(rgd = %rgd_name, generation, "instance controller already running");
                return;
            }
        }
        if let Some(previous) = running.remove(rgd_name) {
            info!(rgd = %rgd_name, "replacing instance controller");
            let _ = previous.stop.send(());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = spawn_instance_controller(
            self.client.clone(),
            self.cluster.clone(),
            self.engine.clone(),
            graph,
            stop_rx,
        );
        running.insert(
            rgd_name.to_string(),
            RunningController {
                generation,
                stop: stop_tx,
                handle,
            },
        );
    }

    /// Stop and forget the controller for an RGD, if any
    pub async fn stop(&self, rgd_name: &str) {
        if let Some(previous) = self.running.lock().await.remove(rgd_name) {
            info!(rgd = %rgd_name, "stopping instance controller");
            let _ = previous.stop.send(());
        }
    }

    /// Whether a controller is currently registered for this RGD
    pub async fn is_running(&self, rgd_name: &str) -> bool {
        self.running.lock().await.contains_key(rgd_name)
    }
}

fn spawn_instance_controller(
    client: Client,
    cluster: Arc<dyn ClusterClient>,
    engine: Arc<ExpressionEngine>,
    graph: Arc<Graph>,
    stop: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    let ar = graph.instance_api_resource();
    let kind = graph.kind.clone();
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    let ctx = Arc::new(InstanceContext::new(graph, engine, cluster));

    tokio::spawn(async move {
        info!(kind = %kind, "starting instance controller");
        Controller::new_with(api, WatcherConfig::default(), ar)
            .graceful_shutdown_on(async move {
                let _ = stop.await;
            })
            .run(instance::reconcile, instance::error_policy, ctx)
            .for_each(|result| {
                let kind = kind.clone();
                async move {
                    match result {
                        Ok(action) => debug!(kind = %kind, ?action, "instance reconciled"),
                        Err(e) => error!(kind = %kind, error = %e, "instance reconcile error"),
                    }
                }
            })
            .await;
    })
}
