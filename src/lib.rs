//! Weft - resource graph operator for Kubernetes
//!
//! Weft lets platform operators declare a *resource graph*: a parameterized
//! collection of Kubernetes objects whose fields reference one another through
//! `${...}` expressions. From such a ResourceGraphDefinition it synthesizes a
//! new CRD for end users, and reconciles every instance of that CRD into a
//! concrete, ordered set of managed cluster objects.
//!
//! # Architecture
//!
//! A ResourceGraphDefinition is compiled once into an immutable [`graph::Graph`]:
//! the compact schema becomes an OpenAPI structural schema, every `${...}`
//! expression is extracted and checked against a typed environment, and the
//! inferred dependencies are ordered topologically. The compiled graph drives a
//! per-instance runtime that resolves expressions in order, expands collection
//! resources, and hands desired objects to the reconciler.
//!
//! # Modules
//!
//! - [`crd`] - the ResourceGraphDefinition CRD and shared status types
//! - [`simpleschema`] - compact schema compiler (markers, custom types)
//! - [`expr`] - expression extraction, typed environment, and the engine
//! - [`dag`] - generic directed acyclic graph with deterministic topo sort
//! - [`graph`] - graph builder, compiled resources, instance CRD emitter
//! - [`runtime`] - per-instance expression resolution and collection expansion
//! - [`cluster`] - cluster client seam (reads, server-side apply, impersonation)
//! - [`controller`] - RGD and instance reconcilers, delta computer
//! - [`events`] - fire-and-forget Kubernetes Event publishing
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod cluster;
pub mod controller;
pub mod crd;
pub mod dag;
pub mod error;
pub mod events;
pub mod expr;
pub mod graph;
pub mod runtime;
pub mod simpleschema;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for the ResourceGraphDefinition CRD and default instance group
pub const API_GROUP: &str = "kro.run";

/// Field manager used for all server-side apply patches
pub const FIELD_MANAGER: &str = "weft-controller";

/// Finalizer placed on instances while they own managed objects
pub const INSTANCE_FINALIZER: &str = "kro.run/finalizer";

/// Label marking an object as managed by weft
pub const OWNED_LABEL: &str = "kro.run/owned";

/// Label carrying the owning instance uid
pub const INSTANCE_UID_LABEL: &str = "kro.run/instance-uid";

/// Label carrying the owning instance name
pub const INSTANCE_NAME_LABEL: &str = "kro.run/instance-name";

/// Label carrying the owning instance namespace
pub const INSTANCE_NAMESPACE_LABEL: &str = "kro.run/instance-namespace";

/// Annotation carrying the graph resource id an object was created from
pub const RESOURCE_ID_ANNOTATION: &str = "kro.run/resource-id";

/// Variable name bound to the instance schema in every expression scope
pub const SCHEMA_VARIABLE: &str = "schema";

/// Variable name bound to the current collection item in readyWhen scopes
pub const EACH_VARIABLE: &str = "each";
