//! Compiled resource model
//!
//! A compiled resource is one node of the immutable graph: its origin
//! (template or external reference), the field bindings extracted from the
//! template, the inferred upstream dependencies, and the compiled forEach /
//! includeWhen / readyWhen programs.

use std::collections::BTreeSet;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kube::discovery::ApiResource;

use crate::crd::ExternalRef;
use crate::expr::CompiledExpression;
use crate::graph::pluralize_kind;

/// Where a resource's objects come from
#[derive(Clone, Debug)]
pub enum ResourceOrigin {
    /// An inline object template with expression bindings
    Template(serde_json::Value),
    /// A pre-existing object that is only read
    ExternalRef(ExternalRef),
}

/// One expression-bearing field of a template
#[derive(Clone, Debug)]
pub struct FieldBinding {
    /// JSON pointer of the field within the template
    pub pointer: String,
    /// The compiled field expression (class, sources, free variables)
    pub expression: CompiledExpression,
    /// Structurally-inferred result type, when the expression is a plain path
    pub expected_type: Option<JSONSchemaProps>,
}

/// One forEach dimension: an iterator name bound over a list expression
#[derive(Clone, Debug)]
pub struct IteratorBinding {
    /// The iterator variable name
    pub name: String,
    /// The compiled list expression
    pub expression: CompiledExpression,
}

/// A compiled status projection: where to write, and what to evaluate
#[derive(Clone, Debug)]
pub struct CompiledProjection {
    /// JSON pointer inside `.status`
    pub pointer: String,
    /// The compiled expression field
    pub expression: CompiledExpression,
}

/// One node of the compiled graph
#[derive(Clone, Debug)]
pub struct CompiledResource {
    /// Stable id within the graph
    pub id: String,

    /// Template or external reference
    pub origin: ResourceOrigin,

    /// Expression-bearing fields of the template (empty for external refs)
    pub bindings: Vec<FieldBinding>,

    /// Upstream resource ids this resource's expressions reference
    pub dependencies: BTreeSet<String>,

    /// Iterator dimensions, in declaration order
    pub for_each: Vec<IteratorBinding>,

    /// Compiled creation guards; all must hold
    pub include_when: Vec<CompiledExpression>,

    /// Compiled readiness checks; all must hold
    pub ready_when: Vec<CompiledExpression>,

    /// apiVersion of the produced objects
    pub api_version: String,

    /// Kind of the produced objects
    pub kind: String,
}

impl CompiledResource {
    /// Whether this resource expands into many items per instance
    pub fn is_collection(&self) -> bool {
        !self.for_each.is_empty()
    }

    /// Whether this resource only reads a pre-existing object
    pub fn is_external(&self) -> bool {
        matches!(self.origin, ResourceOrigin::ExternalRef(_))
    }

    /// Whether this resource has no upstream dependencies
    pub fn is_static(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Upstream dependencies as a sorted list
    pub fn get_dependencies(&self) -> Vec<&str> {
        self.dependencies.iter().map(String::as_str).collect()
    }

    /// Dynamic API coordinates of the produced objects
    pub fn api_resource(&self) -> ApiResource {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        ApiResource {
            group,
            version,
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            plural: pluralize_kind(&self.kind),
        }
    }
}
