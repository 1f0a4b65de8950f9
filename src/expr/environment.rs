//! Typed expression environment
//!
//! Models the variable scope a resource's expressions compile against: the
//! `schema` variable (instance spec plus a metadata subset), one variable per
//! already-ordered resource (its kind schema, or a list of it for
//! collections), and iterator variables scoped to the current resource only.
//!
//! Access paths are checked structurally against the variables' schemas.
//! Subtrees without structural information (preserve-unknown-fields, or
//! object schemas with no declared properties) are *dynamic*: any access
//! type-checks, matching duck-typed field access on foreign kinds.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool,
};

/// Result of resolving a dotted access path
#[derive(Clone, Debug)]
pub enum PathType {
    /// The path resolves to a structurally-known schema
    Known(JSONSchemaProps),
    /// The path runs through an untyped subtree; its type is decided at runtime
    Dynamic,
    /// The leading variable is not in scope
    UnknownVariable(String),
    /// A field along the path does not exist in the structural schema
    UnknownField {
        /// The variable the path starts from
        variable: String,
        /// The dotted path that failed to resolve
        path: String,
    },
}

/// A typed variable scope
#[derive(Clone, Debug, Default)]
pub struct TypedEnvironment {
    variables: BTreeMap<String, JSONSchemaProps>,
}

impl TypedEnvironment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable with its structural schema
    pub fn declare(&mut self, name: impl Into<String>, schema: JSONSchemaProps) {
        self.variables.insert(name.into(), schema);
    }

    /// Declare a variable typed as a list of the given schema
    pub fn declare_list(&mut self, name: impl Into<String>, element: JSONSchemaProps) {
        self.variables.insert(name.into(), list_of(element));
    }

    /// Whether a variable is in scope
    pub fn declared(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// The schema of a variable, if declared
    pub fn schema_of(&self, name: &str) -> Option<&JSONSchemaProps> {
        self.variables.get(name)
    }

    /// A scoped copy extended with additional variables (iterator bindings)
    pub fn extended(&self, bindings: &BTreeMap<String, JSONSchemaProps>) -> Self {
        let mut scoped = self.clone();
        for (name, schema) in bindings {
            scoped.declare(name.clone(), schema.clone());
        }
        scoped
    }

    /// Resolve a dotted access path like `db.status.endpoint`.
    ///
    /// Array indexes in segments (`items[0]`) descend into the element type.
    pub fn type_of_path(&self, path: &str) -> PathType {
        let mut segments = path.split('.');
        let Some(head) = segments.next() else {
            return PathType::UnknownVariable(path.to_string());
        };
        let (variable, index) = split_index(head);
        let Some(root) = self.variables.get(variable) else {
            return PathType::UnknownVariable(variable.to_string());
        };

        let mut current = root.clone();
        if index {
            match element_type(&current) {
                Some(element) => current = element,
                None => return PathType::Dynamic,
            }
        }

        for segment in segments {
            if is_dynamic(&current) {
                return PathType::Dynamic;
            }
            let (field, index) = split_index(segment);

            match field_type(&current, field) {
                FieldLookup::Found(schema) => current = schema,
                FieldLookup::Dynamic => return PathType::Dynamic,
                FieldLookup::Missing => {
                    return PathType::UnknownField {
                        variable: variable.to_string(),
                        path: path.to_string(),
                    }
                }
            }

            if index {
                match element_type(&current) {
                    Some(element) => current = element,
                    None => return PathType::Dynamic,
                }
            }
        }

        PathType::Known(current)
    }
}

enum FieldLookup {
    Found(JSONSchemaProps),
    Dynamic,
    Missing,
}

fn field_type(schema: &JSONSchemaProps, field: &str) -> FieldLookup {
    match schema.type_.as_deref() {
        Some("object") | None => {
            if let Some(properties) = &schema.properties {
                if let Some(prop) = properties.get(field) {
                    return FieldLookup::Found(prop.clone());
                }
                if let Some(boxed) = &schema.additional_properties {
                    return match boxed {
                        JSONSchemaPropsOrBool::Schema(value) => {
                            FieldLookup::Found((**value).clone())
                        }
                        JSONSchemaPropsOrBool::Bool(_) => FieldLookup::Dynamic,
                    };
                }
                return FieldLookup::Missing;
            }
            if let Some(boxed) = &schema.additional_properties {
                return match boxed {
                    JSONSchemaPropsOrBool::Schema(value) => FieldLookup::Found((**value).clone()),
                    JSONSchemaPropsOrBool::Bool(_) => FieldLookup::Dynamic,
                };
            }
            // object with no structural information
            FieldLookup::Dynamic
        }
        // attribute access on arrays and scalars has no structural meaning;
        // leave it to runtime evaluation
        _ => FieldLookup::Dynamic,
    }
}

fn is_dynamic(schema: &JSONSchemaProps) -> bool {
    schema.x_kubernetes_preserve_unknown_fields == Some(true)
        || (schema.type_.is_none()
            && schema.properties.is_none()
            && schema.additional_properties.is_none())
}

fn split_index(segment: &str) -> (&str, bool) {
    match segment.find('[') {
        Some(pos) => (&segment[..pos], true),
        None => (segment, false),
    }
}

/// Element schema of an array type
pub fn element_type(schema: &JSONSchemaProps) -> Option<JSONSchemaProps> {
    if schema.type_.as_deref() != Some("array") {
        return None;
    }
    match &schema.items {
        Some(JSONSchemaPropsOrArray::Schema(items)) => Some((**items).clone()),
        Some(JSONSchemaPropsOrArray::Schemas(items)) => items.first().cloned(),
        None => None,
    }
}

/// Wrap a schema into an array-of schema
pub fn list_of(element: JSONSchemaProps) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("array".to_string()),
        items: Some(JSONSchemaPropsOrArray::Schema(Box::new(element))),
        ..Default::default()
    }
}

/// Schema of the `schema` variable: the instance spec plus the metadata
/// subset expressions may reference.
pub fn instance_variable_schema(spec: &JSONSchemaProps) -> JSONSchemaProps {
    let mut properties = BTreeMap::new();
    properties.insert("spec".to_string(), spec.clone());
    properties.insert("metadata".to_string(), metadata_schema());
    JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        ..Default::default()
    }
}

/// The metadata subset available to expressions
pub fn metadata_schema() -> JSONSchemaProps {
    let string = JSONSchemaProps {
        type_: Some("string".to_string()),
        ..Default::default()
    };
    let string_map = JSONSchemaProps {
        type_: Some("object".to_string()),
        additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(string.clone()))),
        ..Default::default()
    };
    let mut properties = BTreeMap::new();
    properties.insert("name".to_string(), string.clone());
    properties.insert("namespace".to_string(), string);
    properties.insert("labels".to_string(), string_map.clone());
    properties.insert("annotations".to_string(), string_map);
    JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_schema() -> JSONSchemaProps {
        JSONSchemaProps {
            type_: Some("string".to_string()),
            ..Default::default()
        }
    }

    fn object_with(fields: &[(&str, JSONSchemaProps)]) -> JSONSchemaProps {
        JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn spec_env() -> TypedEnvironment {
        let spec = object_with(&[
            ("name", string_schema()),
            ("values", list_of(string_schema())),
        ]);
        let mut env = TypedEnvironment::new();
        env.declare("schema", instance_variable_schema(&spec));
        env
    }

    #[test]
    fn test_known_path_resolves() {
        let env = spec_env();
        match env.type_of_path("schema.spec.name") {
            PathType::Known(schema) => assert_eq!(schema.type_.as_deref(), Some("string")),
            other => panic!("expected known type, got {other:?}"),
        }
    }

    #[test]
    fn test_metadata_subset_available() {
        let env = spec_env();
        assert!(matches!(
            env.type_of_path("schema.metadata.name"),
            PathType::Known(_)
        ));
        assert!(matches!(
            env.type_of_path("schema.metadata.labels.app"),
            PathType::Known(_)
        ));
    }

    #[test]
    fn test_unknown_variable() {
        let env = spec_env();
        match env.type_of_path("databse.status.id") {
            PathType::UnknownVariable(name) => assert_eq!(name, "databse"),
            other => panic!("expected unknown variable, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_field_under_typed_schema() {
        let env = spec_env();
        match env.type_of_path("schema.spec.nmae") {
            PathType::UnknownField { variable, path } => {
                assert_eq!(variable, "schema");
                assert_eq!(path, "schema.spec.nmae");
            }
            other => panic!("expected unknown field, got {other:?}"),
        }
    }

    #[test]
    fn test_dynamic_subtree_accepts_any_path() {
        let mut env = TypedEnvironment::new();
        env.declare(
            "vpc",
            JSONSchemaProps {
                x_kubernetes_preserve_unknown_fields: Some(true),
                ..Default::default()
            },
        );
        assert!(matches!(
            env.type_of_path("vpc.status.vpcID"),
            PathType::Dynamic
        ));
    }

    #[test]
    fn test_indexed_access_descends_into_elements() {
        let mut env = TypedEnvironment::new();
        env.declare_list(
            "pods",
            object_with(&[("metadata", object_with(&[("name", string_schema())]))]),
        );
        match env.type_of_path("pods[0].metadata.name") {
            PathType::Known(schema) => assert_eq!(schema.type_.as_deref(), Some("string")),
            other => panic!("expected known type, got {other:?}"),
        }
    }

    #[test]
    fn test_extended_scope_does_not_leak() {
        let env = spec_env();
        let mut bindings = BTreeMap::new();
        bindings.insert("value".to_string(), string_schema());
        let scoped = env.extended(&bindings);

        assert!(scoped.declared("value"));
        assert!(!env.declared("value"));
    }

    #[test]
    fn test_element_type_of_list() {
        let list = list_of(string_schema());
        assert_eq!(
            element_type(&list).unwrap().type_.as_deref(),
            Some("string")
        );
        assert!(element_type(&string_schema()).is_none());
    }

    #[test]
    fn test_map_values_resolve_through_additional_properties() {
        let mut env = TypedEnvironment::new();
        let map = JSONSchemaProps {
            type_: Some("object".to_string()),
            additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(string_schema()))),
            ..Default::default()
        };
        env.declare("schema", instance_variable_schema(&object_with(&[("endpoints", map)])));
        match env.type_of_path("schema.spec.endpoints.primary") {
            PathType::Known(schema) => assert_eq!(schema.type_.as_deref(), Some("string")),
            other => panic!("expected known type, got {other:?}"),
        }
    }
}
