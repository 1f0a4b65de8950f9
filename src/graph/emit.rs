//! Instance CRD emitter
//!
//! Derives the CRD that the RGD controller registers so end users can create
//! instances: names from the schema kind, one served+storage version carrying
//! the compiled spec schema, a status schema extended with the system-added
//! conditions and aggregate state, and printer columns.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps, JSONSchemaPropsOrArray,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::Resource;

use crate::crd::ResourceGraphDefinition;

/// Simple pluralization for Kubernetes resource kinds
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

/// Build the instance CRD for a compiled definition.
///
/// `status_schema` is the user-declared status schema; the system-added
/// fields (`state`, `synced`, `conditions`, `resources`,
/// `topologicalOrder`) are merged on top.
pub fn emit_instance_crd(
    rgd: &ResourceGraphDefinition,
    spec_schema: &JSONSchemaProps,
    status_schema: &JSONSchemaProps,
) -> CustomResourceDefinition {
    let schema = &rgd.spec.schema;
    let group = schema.group().to_string();
    let plural = pluralize_kind(&schema.kind);
    let singular = schema.kind.to_lowercase();

    let mut columns = vec![
        CustomResourceColumnDefinition {
            name: "State".to_string(),
            type_: "string".to_string(),
            json_path: ".status.state".to_string(),
            ..Default::default()
        },
        CustomResourceColumnDefinition {
            name: "Synced".to_string(),
            type_: "boolean".to_string(),
            json_path: ".status.synced".to_string(),
            ..Default::default()
        },
    ];
    for column in &schema.additional_printer_columns {
        columns.push(CustomResourceColumnDefinition {
            name: column.name.clone(),
            type_: column.type_.clone(),
            json_path: column.json_path.clone(),
            description: column.description.clone(),
            ..Default::default()
        });
    }

    // The emitted CRD is owned by the RGD so deletion cascades through it
    let owner_references = rgd.meta().uid.as_ref().map(|uid| {
        vec![OwnerReference {
            api_version: ResourceGraphDefinition::api_version(&()).to_string(),
            kind: ResourceGraphDefinition::kind(&()).to_string(),
            name: rgd.meta().name.clone().unwrap_or_default(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });

    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(format!("{plural}.{group}")),
            owner_references,
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group,
            names: CustomResourceDefinitionNames {
                kind: schema.kind.clone(),
                list_kind: Some(format!("{}List", schema.kind)),
                plural,
                singular: Some(singular),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: schema.api_version.clone(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(root_schema(spec_schema, status_schema)),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(serde_json::Value::Object(
                        Default::default(),
                    ))),
                    ..Default::default()
                }),
                additional_printer_columns: Some(columns),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

fn root_schema(spec_schema: &JSONSchemaProps, status_schema: &JSONSchemaProps) -> JSONSchemaProps {
    let mut properties = BTreeMap::new();
    properties.insert("spec".to_string(), spec_schema.clone());
    properties.insert("status".to_string(), full_status_schema(status_schema));
    JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        ..Default::default()
    }
}

/// Merge the system status fields onto the user-declared status schema
fn full_status_schema(user: &JSONSchemaProps) -> JSONSchemaProps {
    let mut properties = user.properties.clone().unwrap_or_default();

    properties.insert("state".to_string(), string_schema());
    properties.insert("synced".to_string(), atomic("boolean"));
    properties.insert("conditions".to_string(), conditions_schema());
    properties.insert("resources".to_string(), resources_schema());
    properties.insert(
        "topologicalOrder".to_string(),
        array_of(string_schema()),
    );

    JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        ..Default::default()
    }
}

fn conditions_schema() -> JSONSchemaProps {
    let mut properties = BTreeMap::new();
    properties.insert("type".to_string(), string_schema());
    properties.insert("status".to_string(), string_schema());
    properties.insert("reason".to_string(), string_schema());
    properties.insert("message".to_string(), string_schema());
    properties.insert("lastTransitionTime".to_string(), string_schema());
    array_of(JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        required: Some(vec!["type".to_string(), "status".to_string()]),
        ..Default::default()
    })
}

fn resources_schema() -> JSONSchemaProps {
    let mut properties = BTreeMap::new();
    properties.insert("id".to_string(), string_schema());
    properties.insert("state".to_string(), string_schema());
    properties.insert("message".to_string(), string_schema());
    array_of(JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        required: Some(vec!["id".to_string(), "state".to_string()]),
        ..Default::default()
    })
}

fn atomic(type_: &str) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some(type_.to_string()),
        ..Default::default()
    }
}

fn string_schema() -> JSONSchemaProps {
    atomic("string")
}

fn array_of(items: JSONSchemaProps) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("array".to_string()),
        items: Some(JSONSchemaPropsOrArray::Schema(Box::new(items))),
        ..Default::default()
    }
}
