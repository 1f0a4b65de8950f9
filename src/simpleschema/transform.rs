//! Schema transformation
//!
//! Compiles the `types:`, `spec:`, and `status:` trees of a
//! ResourceGraphDefinition schema into structural OpenAPI schemas. Custom
//! types are resolved in dependency order through the DAG; `status:` leaves
//! holding `${...}` expressions are collected as projections for the runtime
//! instead of being schema'd as literal types.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{JSONSchemaProps, JSON};
use serde_json::Value;

use super::markers::{apply_markers, Marker, MarkerKind};
use super::types::{parse_field, ResolveCustomType, SimpleType};
use crate::dag::DirectedAcyclicGraph;
use crate::error::Error;
use crate::Result;

/// A `status:` leaf whose value is one or more `${...}` expressions.
///
/// The runtime evaluates the raw string against the final context and writes
/// the result at `pointer` (a JSON pointer relative to `.status`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusProjection {
    /// JSON pointer of the leaf inside the status object
    pub pointer: String,
    /// The raw field string, `${...}` included
    pub raw: String,
}

/// Output of compiling an RGD schema: the spec and status structural schemas
/// plus the user's status projections.
#[derive(Clone, Debug, Default)]
pub struct CompiledSchema {
    /// Structural schema for `.spec` of instances
    pub spec: JSONSchemaProps,
    /// Structural schema for the user-declared part of `.status`
    pub status: JSONSchemaProps,
    /// Status leaves to evaluate at runtime
    pub projections: Vec<StatusProjection>,
}

/// A resolved custom type with its own `required=true` state
#[derive(Clone, Debug)]
struct CustomType {
    schema: JSONSchemaProps,
    required: bool,
}

/// Compiles compact schemas, resolving named custom types
#[derive(Debug, Default)]
pub struct Transformer {
    custom_types: BTreeMap<String, CustomType>,
}

impl ResolveCustomType for Transformer {
    fn resolve(&self, path: &str, name: &str) -> Result<JSONSchemaProps> {
        self.custom_types
            .get(name)
            .map(|ct| ct.schema.clone())
            .ok_or_else(|| Error::schema(path, format!("unknown type: {name}")))
    }
}

impl Transformer {
    /// Create a transformer with no custom types loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a full RGD schema: custom types first, then spec and status
    pub fn compile(
        &mut self,
        types: Option<&Value>,
        spec: Option<&Value>,
        status: Option<&Value>,
    ) -> Result<CompiledSchema> {
        if let Some(types) = types {
            self.load_custom_types(types)?;
        }

        let spec_schema = match spec {
            Some(spec) => self.build_object_schema("spec", as_object(spec, "spec")?)?,
            None => empty_object(),
        };

        let (status_schema, projections) = match status {
            Some(status) => self.build_status_schema(as_object(status, "status")?)?,
            None => (empty_object(), vec![]),
        };

        Ok(CompiledSchema {
            spec: spec_schema,
            status: status_schema,
            projections,
        })
    }

    /// Load and resolve the `types:` map in dependency order
    pub fn load_custom_types(&mut self, types: &Value) -> Result<()> {
        let entries = as_object(types, "types")?;
        if entries.is_empty() {
            return Ok(());
        }

        // Parse all type specs with their markers
        let mut parsed: BTreeMap<String, ParsedSpec> = BTreeMap::new();
        for (name, spec) in entries {
            let path = format!("types.{name}");
            parsed.insert(name.clone(), ParsedSpec::parse(&path, spec)?);
        }

        // Order by referential dependencies; cycles are definitive errors
        let mut graph = DirectedAcyclicGraph::new();
        for (i, name) in parsed.keys().enumerate() {
            graph
                .add_vertex(name.clone(), i)
                .map_err(|e| Error::schema("types", e.to_string()))?;
        }
        for (name, spec) in &parsed {
            for dep in spec.deps() {
                if !graph.contains(&dep) {
                    return Err(Error::schema(
                        format!("types.{name}"),
                        format!("unknown type: {dep}"),
                    ));
                }
                graph.add_dependency(name, &dep).map_err(|e| match e.cycle_members() {
                    Some(members) => Error::cycle(members.to_vec()),
                    None => Error::schema(format!("types.{name}"), e.to_string()),
                })?;
            }
        }
        let order = graph.topological_sort().map_err(|e| match e.cycle_members() {
            Some(members) => Error::cycle(members.to_vec()),
            None => Error::schema("types", e.to_string()),
        })?;

        // Resolve schemas in topological order
        for name in order {
            let spec = &parsed[&name];
            let path = format!("types.{name}");
            let (mut schema, markers) = spec.schema(&path, self)?;

            let required = markers
                .iter()
                .any(|m| m.kind == MarkerKind::Required && m.value == "true");

            // Non-required markers attach to the type schema itself
            let mut dummy_parent = JSONSchemaProps::default();
            apply_markers(&path, &mut schema, &markers, &name, &mut dummy_parent)?;

            self.custom_types.insert(name, CustomType { schema, required });
        }

        Ok(())
    }

    /// Build an object schema from a compact tree of field specs
    pub fn build_object_schema(
        &self,
        path: &str,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<JSONSchemaProps> {
        let mut schema = empty_object();
        let mut properties = BTreeMap::new();
        let mut child_has_default = false;

        for (name, field_spec) in fields {
            let child_path = format!("{path}.{name}");
            let field_schema = self.build_field_schema(&child_path, name, field_spec, &mut schema)?;
            if field_schema.default.is_some() {
                child_has_default = true;
            }
            properties.insert(name.clone(), field_schema);
        }

        schema.properties = Some(properties);

        // Defaults must propagate through optional containers
        if child_has_default {
            schema.default = Some(JSON(serde_json::json!({})));
        }

        Ok(schema)
    }

    fn build_field_schema(
        &self,
        path: &str,
        name: &str,
        spec: &Value,
        parent: &mut JSONSchemaProps,
    ) -> Result<JSONSchemaProps> {
        match spec {
            Value::String(field) => self.build_field_from_string(path, name, field, parent),
            Value::Object(map) => self.build_object_schema(path, map),
            other => Err(Error::schema(
                path,
                format!("field spec must be a string or a map, got: {other}"),
            )),
        }
    }

    fn build_field_from_string(
        &self,
        path: &str,
        name: &str,
        field: &str,
        parent: &mut JSONSchemaProps,
    ) -> Result<JSONSchemaProps> {
        let (typ, markers) = parse_field(path, field)?;
        let mut schema = typ.schema(path, self)?;

        // A custom type carrying required=true marks the referencing field
        if let SimpleType::Custom(ref custom) = typ {
            if self.custom_types.get(custom).is_some_and(|ct| ct.required) {
                parent
                    .required
                    .get_or_insert_with(Vec::new)
                    .push(name.to_string());
            }
        }

        apply_markers(path, &mut schema, &markers, name, parent)?;
        Ok(schema)
    }

    /// Build the status schema, collecting `${...}` leaves as projections.
    ///
    /// Projection leaves get a preserve-unknown-fields node; the graph builder
    /// refines them to the expression's inferred type where it can.
    pub fn build_status_schema(
        &self,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<(JSONSchemaProps, Vec<StatusProjection>)> {
        let mut projections = Vec::new();
        let schema = self.build_status_object("status", "", fields, &mut projections)?;
        Ok((schema, projections))
    }

    fn build_status_object(
        &self,
        path: &str,
        pointer: &str,
        fields: &serde_json::Map<String, Value>,
        projections: &mut Vec<StatusProjection>,
    ) -> Result<JSONSchemaProps> {
        let mut schema = empty_object();
        let mut properties = BTreeMap::new();

        for (name, field_spec) in fields {
            let child_path = format!("{path}.{name}");
            let child_pointer = format!("{pointer}/{name}");
            let field_schema = match field_spec {
                Value::String(field) if field.contains("${") => {
                    projections.push(StatusProjection {
                        pointer: child_pointer,
                        raw: field.clone(),
                    });
                    dynamic_node()
                }
                Value::String(field) => {
                    self.build_field_from_string(&child_path, name, field, &mut schema)?
                }
                Value::Object(map) => {
                    self.build_status_object(&child_path, &child_pointer, map, projections)?
                }
                other => {
                    return Err(Error::schema(
                        child_path,
                        format!("field spec must be a string or a map, got: {other}"),
                    ))
                }
            };
            properties.insert(name.clone(), field_schema);
        }

        schema.properties = Some(properties);
        Ok(schema)
    }
}

/// Fill absent fields with their schema defaults, recursively.
///
/// Containers whose schema declares a `{}` default materialize before their
/// children are filled, so nested defaults land even when the user omitted
/// the whole subtree.
pub fn apply_defaults(value: &mut Value, schema: &JSONSchemaProps) {
    let Some(properties) = &schema.properties else {
        return;
    };
    let Some(object) = value.as_object_mut() else {
        return;
    };
    for (name, prop) in properties {
        if !object.contains_key(name) {
            if let Some(JSON(default)) = &prop.default {
                object.insert(name.clone(), default.clone());
            }
        }
        if let Some(child) = object.get_mut(name) {
            apply_defaults(child, prop);
        }
    }
}

/// A custom type spec: either a compact field string or a nested tree
#[derive(Debug)]
enum ParsedSpec {
    Field(SimpleType, Vec<Marker>),
    Tree(BTreeMap<String, ParsedSpec>),
}

impl ParsedSpec {
    fn parse(path: &str, spec: &Value) -> Result<Self> {
        match spec {
            Value::String(field) => {
                let (typ, markers) = parse_field(path, field)?;
                Ok(ParsedSpec::Field(typ, markers))
            }
            Value::Object(map) => {
                let mut tree = BTreeMap::new();
                for (name, child) in map {
                    let child_path = format!("{path}.{name}");
                    tree.insert(name.clone(), ParsedSpec::parse(&child_path, child)?);
                }
                Ok(ParsedSpec::Tree(tree))
            }
            other => Err(Error::schema(
                path,
                format!("type spec must be a string or a map, got: {other}"),
            )),
        }
    }

    fn deps(&self) -> Vec<String> {
        match self {
            ParsedSpec::Field(typ, _) => typ.deps(),
            ParsedSpec::Tree(tree) => tree.values().flat_map(|s| s.deps()).collect(),
        }
    }

    /// Resolve into a schema plus the top-level markers (empty for trees)
    fn schema(&self, path: &str, resolver: &Transformer) -> Result<(JSONSchemaProps, Vec<Marker>)> {
        match self {
            ParsedSpec::Field(typ, markers) => Ok((typ.schema(path, resolver)?, markers.clone())),
            ParsedSpec::Tree(tree) => {
                let mut schema = empty_object();
                let mut properties = BTreeMap::new();
                let mut child_has_default = false;
                for (name, child) in tree {
                    let child_path = format!("{path}.{name}");
                    let child_schema = match child {
                        ParsedSpec::Field(typ, markers) => {
                            let mut s = typ.schema(&child_path, resolver)?;
                            apply_markers(&child_path, &mut s, markers, name, &mut schema)?;
                            s
                        }
                        tree @ ParsedSpec::Tree(_) => tree.schema(&child_path, resolver)?.0,
                    };
                    if child_schema.default.is_some() {
                        child_has_default = true;
                    }
                    properties.insert(name.clone(), child_schema);
                }
                schema.properties = Some(properties);
                if child_has_default {
                    schema.default = Some(JSON(serde_json::json!({})));
                }
                Ok((schema, vec![]))
            }
        }
    }
}

fn empty_object() -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".to_string()),
        ..Default::default()
    }
}

/// A node whose runtime type is decided by an expression
fn dynamic_node() -> JSONSchemaProps {
    JSONSchemaProps {
        x_kubernetes_preserve_unknown_fields: Some(true),
        ..Default::default()
    }
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::schema(path, "expected a map"))
}
