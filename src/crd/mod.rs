//! Custom Resource Definitions for weft
//!
//! Contains the ResourceGraphDefinition CRD itself plus the shared condition
//! and state types that appear on both RGD and instance statuses.

mod conditions;
mod resource_graph_definition;

pub use conditions::{Condition, ConditionStatus, InstanceState, ResourceState, ResourceStatus};
pub use resource_graph_definition::{
    ExternalRef, PrinterColumn, ResourceDeclaration, ResourceGraphDefinition,
    ResourceGraphDefinitionSpec, ResourceGraphDefinitionStatus, RgdState, SchemaDefinition,
};
