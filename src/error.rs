//! Error types for the weft operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant is a stable, user-visible kind: compile-time kinds mark the
//! ResourceGraphDefinition inactive, runtime kinds surface on the instance
//! status and drive requeue policy.

use thiserror::Error;

/// Main error type for weft operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The compact schema failed to parse or a marker misused its type
    #[error("invalid schema at {path}: {message}")]
    SchemaInvalid {
        /// JSON path of the offending field
        path: String,
        /// Description of what's invalid
        message: String,
    },

    /// The custom-type graph or the resource DAG is cyclic
    #[error("cycle detected: {}", members.join(" -> "))]
    CycleDetected {
        /// Vertices participating in the cycle
        members: Vec<String>,
    },

    /// An expression failed to parse or type-check
    #[error("invalid expression in {resource} at {path}: {message}")]
    ExpressionInvalid {
        /// Resource id carrying the expression
        resource: String,
        /// Field path of the expression within the resource
        path: String,
        /// Description of what's invalid
        message: String,
    },

    /// An expression references a variable that is not in scope
    #[error("unresolved reference in {resource}: variable '{variable}' is not in scope")]
    UnresolvedReference {
        /// Resource id carrying the expression
        resource: String,
        /// The unknown variable name
        variable: String,
    },

    /// Runtime expression evaluation failed
    #[error("evaluation failed in {resource} at {path}: {message}")]
    EvaluationFailed {
        /// Resource id being evaluated
        resource: String,
        /// Field path of the failing expression
        path: String,
        /// Description of what failed
        message: String,
    },

    /// The API server rejected a desired object
    #[error("apply rejected for {resource}: {message}")]
    ApplyRejected {
        /// Resource id being applied
        resource: String,
        /// Server-provided failure message
        message: String,
        /// HTTP status code when known
        code: Option<u16>,
    },

    /// An upstream readyWhen has not passed yet
    #[error("dependency not ready: {resource} waits for {dependency}")]
    DependencyNotReady {
        /// Resource id that is blocked
        resource: String,
        /// Dependency that has not become ready
        dependency: String,
    },

    /// An externalRef target does not exist yet
    #[error("external reference missing for {resource}: {name}")]
    ExternalRefMissing {
        /// Resource id declaring the external reference
        resource: String,
        /// Qualified name of the missing object
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a schema error with the given JSON path and message
    pub fn schema(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaInvalid {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a cycle error from the offending vertices
    pub fn cycle(members: Vec<String>) -> Self {
        Self::CycleDetected { members }
    }

    /// Create an expression error with resource and field context
    pub fn expression(
        resource: impl Into<String>,
        path: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ExpressionInvalid {
            resource: resource.into(),
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an unresolved-reference error
    pub fn unresolved(resource: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            resource: resource.into(),
            variable: variable.into(),
        }
    }

    /// Create an evaluation error with resource and field context
    pub fn evaluation(
        resource: impl Into<String>,
        path: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::EvaluationFailed {
            resource: resource.into(),
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an apply-rejected error without a status code
    pub fn apply_rejected(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ApplyRejected {
            resource: resource.into(),
            message: msg.into(),
            code: None,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error is terminal at compile time.
    ///
    /// Terminal errors mark the ResourceGraphDefinition inactive and are not
    /// retried until the user changes the definition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::SchemaInvalid { .. }
                | Error::CycleDetected { .. }
                | Error::ExpressionInvalid { .. }
                | Error::UnresolvedReference { .. }
        )
    }

    /// Whether a reconcile pass hitting this error should requeue with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 4xx responses need a spec change; everything else may recover
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 404 && ae.code != 409
                )
            }
            Error::SchemaInvalid { .. }
            | Error::CycleDetected { .. }
            | Error::ExpressionInvalid { .. }
            | Error::UnresolvedReference { .. }
            | Error::Serialization { .. } => false,
            Error::EvaluationFailed { .. } => false,
            Error::ApplyRejected { code, .. } => {
                // Conflicts and races recover on the next pass
                matches!(code, Some(c) if !(400..500).contains(c) || *c == 409)
            }
            Error::DependencyNotReady { .. } | Error::ExternalRefMissing { .. } => true,
        }
    }

    /// The graph resource id associated with this error, when known
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::ExpressionInvalid { resource, .. }
            | Error::UnresolvedReference { resource, .. }
            | Error::EvaluationFailed { resource, .. }
            | Error::ApplyRejected { resource, .. }
            | Error::DependencyNotReady { resource, .. }
            | Error::ExternalRefMissing { resource, .. } => Some(resource),
            _ => None,
        }
    }

    /// Stable machine-readable reason for status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::SchemaInvalid { .. } => "SchemaInvalid",
            Error::CycleDetected { .. } => "CycleDetected",
            Error::ExpressionInvalid { .. } => "ExpressionInvalid",
            Error::UnresolvedReference { .. } => "UnresolvedReference",
            Error::EvaluationFailed { .. } => "EvaluationFailed",
            Error::ApplyRejected { .. } => "ApplyRejected",
            Error::DependencyNotReady { .. } => "DependencyNotReady",
            Error::ExternalRefMissing { .. } => "ExternalRefMissing",
            Error::Serialization { .. } => "SerializationError",
        }
    }
}
