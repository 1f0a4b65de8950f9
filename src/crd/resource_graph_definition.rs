//! ResourceGraphDefinition Custom Resource Definition
//!
//! The RGD is the operator-facing declaration: a compact schema describing
//! the API to synthesize, plus the resource templates whose `${...}`
//! expressions form the graph.

use std::collections::BTreeMap;

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;
use crate::error::Error;

/// Ids reserved for built-in variables
pub const RESERVED_IDS: [&str; 2] = [crate::SCHEMA_VARIABLE, crate::EACH_VARIABLE];

/// Specification for a ResourceGraphDefinition
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kro.run",
    version = "v1alpha1",
    kind = "ResourceGraphDefinition",
    plural = "resourcegraphdefinitions",
    shortname = "rgd",
    status = "ResourceGraphDefinitionStatus",
    namespaced = false,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.schema.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionSpec {
    /// The API to synthesize for end users
    pub schema: SchemaDefinition,

    /// Resource declarations forming the graph
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,

    /// Impersonation identities: target namespace -> service account name,
    /// with `*` as the wildcard default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service_accounts: Option<BTreeMap<String, String>>,
}

/// The compact schema block of an RGD
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    /// Version of the synthesized API (e.g. `v1alpha1`); immutable
    pub api_version: String,

    /// Kind of the synthesized API (PascalCase, at most 63 chars); immutable
    pub kind: String,

    /// API group of the synthesized kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Compact spec tree: leaves are `type | marker=value ...` strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,

    /// Compact status tree; leaves may be `${...}` projections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,

    /// Named custom types usable in spec and status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<serde_json::Value>,

    /// Extra printer columns on the synthesized CRD
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_printer_columns: Vec<PrinterColumn>,
}

impl SchemaDefinition {
    /// Effective API group of the synthesized kind
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or(crate::API_GROUP)
    }

    /// Validate the immutable naming fields
    pub fn validate(&self) -> Result<(), Error> {
        let version = Regex::new(r"^v\d+(alpha\d+|beta\d+)?$")
            .map_err(|e| Error::schema("schema.apiVersion", e.to_string()))?;
        if !version.is_match(&self.api_version) {
            return Err(Error::schema(
                "schema.apiVersion",
                format!(
                    "'{}' must match v<N>, v<N>alpha<M>, or v<N>beta<M>",
                    self.api_version
                ),
            ));
        }

        if self.kind.len() > 63 {
            return Err(Error::schema(
                "schema.kind",
                format!("'{}' exceeds 63 characters", self.kind),
            ));
        }
        let kind = Regex::new(r"^[A-Z][A-Za-z0-9]*$")
            .map_err(|e| Error::schema("schema.kind", e.to_string()))?;
        if !kind.is_match(&self.kind) {
            return Err(Error::schema(
                "schema.kind",
                format!("'{}' must be a PascalCase identifier", self.kind),
            ));
        }

        Ok(())
    }
}

/// A printer column on the synthesized CRD
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrinterColumn {
    /// Column header
    pub name: String,

    /// OpenAPI type of the column value
    #[serde(rename = "type")]
    pub type_: String,

    /// JSONPath into the instance object
    pub json_path: String,

    /// Optional column description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One node of the resource graph
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDeclaration {
    /// Stable id, unique within the graph; a lower-camel identifier not
    /// reserved by built-ins
    pub id: String,

    /// Inline object template (exclusive with `externalRef`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,

    /// Reference to a pre-existing object to read (exclusive with `template`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,

    /// Boolean expressions gating creation; all must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,

    /// Boolean expressions over the resource itself gating readiness
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,

    /// Ordered iterator dimensions; each maps one iterator name to a
    /// list-typed expression
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub for_each: Vec<BTreeMap<String, String>>,
}

impl ResourceDeclaration {
    /// Whether this resource expands into many items per instance
    pub fn is_collection(&self) -> bool {
        !self.for_each.is_empty()
    }

    /// Validate the id and the template/externalRef exclusivity
    pub fn validate(&self) -> Result<(), Error> {
        let id_pattern = Regex::new(r"^[a-z][a-zA-Z0-9]*$")
            .map_err(|e| Error::schema("resources", e.to_string()))?;
        if !id_pattern.is_match(&self.id) {
            return Err(Error::schema(
                format!("resources.{}", self.id),
                format!("id '{}' must be a lower-camel identifier", self.id),
            ));
        }
        if RESERVED_IDS.contains(&self.id.as_str()) {
            return Err(Error::schema(
                format!("resources.{}", self.id),
                format!("id '{}' is reserved", self.id),
            ));
        }
        match (&self.template, &self.external_ref) {
            (Some(_), Some(_)) => Err(Error::schema(
                format!("resources.{}", self.id),
                "exactly one of template or externalRef must be set, found both",
            )),
            (None, None) => Err(Error::schema(
                format!("resources.{}", self.id),
                "exactly one of template or externalRef must be set, found neither",
            )),
            _ => Ok(()),
        }?;
        for (i, dimension) in self.for_each.iter().enumerate() {
            if dimension.len() != 1 {
                return Err(Error::schema(
                    format!("resources.{}.forEach[{i}]", self.id),
                    "each dimension must map exactly one iterator name to an expression",
                ));
            }
        }
        Ok(())
    }
}

/// Reference to a pre-existing cluster object
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    /// apiVersion of the referenced object
    pub api_version: String,

    /// Kind of the referenced object
    pub kind: String,

    /// Name of the referenced object
    pub name: String,

    /// Namespace of the referenced object; instance namespace when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Coarse compile outcome for an RGD
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RgdState {
    /// Not yet compiled, or compilation failed
    #[default]
    Inactive,
    /// Compiled; the instance CRD is being served
    Active,
}

/// Status for a ResourceGraphDefinition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionStatus {
    /// Compile outcome
    #[serde(default)]
    pub state: RgdState,

    /// Detailed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Resource ids in creation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topological_order: Vec<String>,
}
