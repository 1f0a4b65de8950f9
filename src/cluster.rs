//! Cluster client seam
//!
//! The only coupling to Kubernetes I/O. Controllers talk to the cluster
//! through the [`ClusterClient`] trait, so reconciliation logic is testable
//! against mocks; the real implementation wraps kube-rs dynamic APIs and
//! server-side apply. Watches are not part of the seam: the controller
//! runtime owns them.
//!
//! Also hosts the [`SchemaResolver`] seam used at compile time to type
//! cross-resource field references.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::expr::metadata_schema;
use crate::Result;

/// Resolves a structural type for a cluster kind.
///
/// Used by the graph builder to type cross-resource references like
/// `${vpc.status.vpcID}`.
pub trait SchemaResolver: Send + Sync {
    /// Structural schema for the given apiVersion/kind
    fn resolve(&self, api_version: &str, kind: &str) -> Result<JSONSchemaProps>;
}

/// Duck-typed resolver: every kind gets a metadata block plus an untyped
/// remainder, so any field access type-checks and is decided at runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct DuckTypedResolver;

impl SchemaResolver for DuckTypedResolver {
    fn resolve(&self, _api_version: &str, _kind: &str) -> Result<JSONSchemaProps> {
        let mut properties = std::collections::BTreeMap::new();
        properties.insert("apiVersion".to_string(), string_schema());
        properties.insert("kind".to_string(), string_schema());
        properties.insert("metadata".to_string(), metadata_schema());
        Ok(JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(properties),
            x_kubernetes_preserve_unknown_fields: Some(true),
            ..Default::default()
        })
    }
}

fn string_schema() -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("string".to_string()),
        ..Default::default()
    }
}

/// Trait abstracting cluster reads and writes for the reconcilers.
///
/// Objects cross this boundary as unstructured JSON; the implementation maps
/// them onto dynamic APIs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Read an object; `None` when it does not exist
    async fn get<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// List objects matching a label selector
    async fn list<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        label_selector: &str,
    ) -> Result<Vec<serde_json::Value>>;

    /// Server-side apply the desired object and return the live result
    async fn apply<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        object: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Delete an object; absent objects are not an error
    async fn delete<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<()>;

    /// JSON merge-patch an object (finalizer bookkeeping)
    async fn patch_merge<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Merge-patch the status subresource
    async fn patch_status<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()>;

    /// A scoped sub-client acting as the given service account
    async fn impersonate(
        &self,
        service_account: &str,
        namespace: &str,
    ) -> Result<Arc<dyn ClusterClient>>;
}

/// Production implementation over kube-rs
pub struct KubeClusterClient {
    client: Client,
    config: Config,
    /// Impersonated sub-clients, cached per identity for the process lifetime
    impersonated: Mutex<HashMap<String, Arc<KubeClusterClient>>>,
}

impl KubeClusterClient {
    /// Wrap a client together with the config used to build it (needed to
    /// derive impersonated clients)
    pub fn new(client: Client, config: Config) -> Self {
        Self {
            client,
            config,
            impersonated: Mutex::new(HashMap::new()),
        }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<Option<serde_json::Value>> {
        match self.api(ar, namespace).get_opt(name).await? {
            Some(object) => Ok(Some(
                serde_json::to_value(&object).map_err(|e| Error::serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn list<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        label_selector: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let params = ListParams::default().labels(label_selector);
        let list = self.api(ar, namespace).list(&params).await?;
        list.items
            .iter()
            .map(|object| {
                serde_json::to_value(object).map_err(|e| Error::serialization(e.to_string()))
            })
            .collect()
    }

    async fn apply<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        object: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let params = PatchParams::apply(crate::FIELD_MANAGER).force();
        let applied = self
            .api(ar, namespace)
            .patch(name, &params, &Patch::Apply(object))
            .await?;
        serde_json::to_value(&applied).map_err(|e| Error::serialization(e.to_string()))
    }

    async fn delete<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<()> {
        match self
            .api(ar, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_merge<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let params = PatchParams::default();
        let patched = self
            .api(ar, namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await?;
        serde_json::to_value(&patched).map_err(|e| Error::serialization(e.to_string()))
    }

    async fn patch_status<'a>(
        &self,
        ar: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()> {
        let params = PatchParams::default();
        let patch = serde_json::json!({ "status": status });
        self.api(ar, namespace)
            .patch_status(name, &params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn impersonate(
        &self,
        service_account: &str,
        namespace: &str,
    ) -> Result<Arc<dyn ClusterClient>> {
        let identity = format!("system:serviceaccount:{namespace}:{service_account}");

        let mut cache = self.impersonated.lock().await;
        if let Some(existing) = cache.get(&identity) {
            return Ok(existing.clone() as Arc<dyn ClusterClient>);
        }

        debug!(identity = %identity, "creating impersonated cluster client");
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(identity.clone());
        let client = Client::try_from(config.clone())?;
        let wrapped = Arc::new(KubeClusterClient::new(client, config));
        cache.insert(identity, wrapped.clone());
        Ok(wrapped as Arc<dyn ClusterClient>)
    }
}
