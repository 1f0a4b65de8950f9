//! Graph compilation
//!
//! The builder turns a ResourceGraphDefinition into an immutable
//! [`Graph`]: compiled resources in topological order, status projections,
//! and the instance CRD to register. The compiled graph is shared across all
//! reconciles of the same definition.

mod builder;
mod emit;
mod resource;

pub use builder::GraphBuilder;
pub use emit::{emit_instance_crd, pluralize_kind};
pub use resource::{
    CompiledProjection, CompiledResource, FieldBinding, IteratorBinding, ResourceOrigin,
};

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::discovery::ApiResource;

use crate::simpleschema::CompiledSchema;

/// Immutable output of the graph builder
#[derive(Debug)]
pub struct Graph {
    /// Name of the defining RGD
    pub name: String,

    /// Compiled resources, already in topological order
    pub resources: Vec<CompiledResource>,

    /// Resource ids in creation order
    pub topological_order: Vec<String>,

    /// Compiled spec/status schemas
    pub schema: CompiledSchema,

    /// User status projections compiled against the full environment
    pub projections: Vec<CompiledProjection>,

    /// The CRD served to end users
    pub instance_crd: CustomResourceDefinition,

    /// API group of the synthesized kind
    pub group: String,

    /// Version of the synthesized kind
    pub version: String,

    /// The synthesized kind
    pub kind: String,

    /// Plural of the synthesized kind
    pub plural: String,

    /// Impersonation identities: namespace -> service account, `*` wildcard
    pub default_service_accounts: BTreeMap<String, String>,
}

impl Graph {
    /// Look up a compiled resource by id
    pub fn get(&self, id: &str) -> Option<&CompiledResource> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// The dynamic API coordinates of the synthesized kind
    pub fn instance_api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: format!("{}/{}", self.group, self.version),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// Impersonation identity for a target namespace, falling back to the
    /// wildcard entry
    pub fn service_account_for(&self, namespace: &str) -> Option<&str> {
        self.default_service_accounts
            .get(namespace)
            .or_else(|| self.default_service_accounts.get("*"))
            .map(String::as_str)
    }
}
