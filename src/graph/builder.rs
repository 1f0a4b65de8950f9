//! Graph builder
//!
//! Compiles a ResourceGraphDefinition into an immutable [`Graph`]. Per
//! resource: extract `${...}` expressions, compile them against the evolving
//! typed environment, infer dependencies from free variables, and publish the
//! resource's type for downstream resources. Resources are processed in
//! passes: a pass that makes no progress while unresolved resources remain is
//! a definitive cycle.
//!
//! Dependency inference from free variables keeps authoring declarative: the
//! user writes `${db.status.endpoint}` and ordering falls out.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use serde_json::Value;

use crate::cluster::SchemaResolver;
use crate::crd::{ResourceDeclaration, ResourceGraphDefinition};
use crate::dag::DirectedAcyclicGraph;
use crate::error::Error;
use crate::expr::{
    element_type, extract_fields, instance_variable_schema, BindingClass, CompiledExpression,
    ExpressionEngine, PathType, TypedEnvironment,
};
use crate::graph::{
    emit_instance_crd, pluralize_kind, CompiledProjection, CompiledResource, FieldBinding, Graph,
    IteratorBinding, ResourceOrigin,
};
use crate::simpleschema::Transformer;
use crate::Result;
use crate::{EACH_VARIABLE, SCHEMA_VARIABLE};

/// Compiles ResourceGraphDefinitions into immutable graphs
pub struct GraphBuilder<'a> {
    engine: &'a ExpressionEngine,
    resolver: &'a dyn SchemaResolver,
}

/// Outcome of one compile attempt: done, or waiting on unprocessed upstreams
enum Attempt {
    Compiled(Box<CompiledResource>, JSONSchemaProps),
    Deferred,
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder over the given engine and schema resolver
    pub fn new(engine: &'a ExpressionEngine, resolver: &'a dyn SchemaResolver) -> Self {
        Self { engine, resolver }
    }

    /// Compile a full definition
    pub fn build(&self, rgd: &ResourceGraphDefinition) -> Result<Graph> {
        rgd.spec.schema.validate()?;

        let mut ids = BTreeSet::new();
        for declaration in &rgd.spec.resources {
            declaration.validate()?;
            if !ids.insert(declaration.id.clone()) {
                return Err(Error::schema(
                    format!("resources.{}", declaration.id),
                    format!("duplicate resource id '{}'", declaration.id),
                ));
            }
        }

        let mut transformer = Transformer::new();
        let schema = &rgd.spec.schema;
        let compiled_schema = transformer.compile(
            schema.types.as_ref(),
            schema.spec.as_ref(),
            schema.status.as_ref(),
        )?;

        let mut env = TypedEnvironment::new();
        env.declare(
            SCHEMA_VARIABLE,
            instance_variable_schema(&compiled_schema.spec),
        );

        // Declaration index doubles as topological-sort priority
        let indexes: BTreeMap<String, usize> = rgd
            .spec
            .resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        let mut pending: Vec<&ResourceDeclaration> = rgd.spec.resources.iter().collect();
        let mut compiled: BTreeMap<String, CompiledResource> = BTreeMap::new();

        while !pending.is_empty() {
            let mut progress = false;
            let mut still_pending = Vec::new();

            for declaration in pending {
                match self.try_compile(declaration, &env, &ids, &compiled)? {
                    Attempt::Compiled(resource, published) => {
                        if declaration.is_collection() {
                            env.declare_list(declaration.id.clone(), published);
                        } else {
                            env.declare(declaration.id.clone(), published);
                        }
                        compiled.insert(declaration.id.clone(), *resource);
                        progress = true;
                    }
                    Attempt::Deferred => still_pending.push(declaration),
                }
            }

            if !progress && !still_pending.is_empty() {
                let members: Vec<String> =
                    still_pending.iter().map(|r| r.id.clone()).collect();
                return Err(Error::cycle(members));
            }
            pending = still_pending;
        }

        // Topological order over the inferred dependency edges
        let mut dag = DirectedAcyclicGraph::new();
        for (id, index) in &indexes {
            dag.add_vertex(id.clone(), *index)
                .map_err(|e| Error::schema("resources", e.to_string()))?;
        }
        for resource in compiled.values() {
            for dependency in &resource.dependencies {
                dag.add_dependency(&resource.id, dependency)
                    .map_err(|e| match e.cycle_members() {
                        Some(members) => Error::cycle(members.to_vec()),
                        None => Error::schema("resources", e.to_string()),
                    })?;
            }
        }
        let topological_order = dag.topological_sort().map_err(|e| match e.cycle_members() {
            Some(members) => Error::cycle(members.to_vec()),
            None => Error::schema("resources", e.to_string()),
        })?;

        let resources: Vec<CompiledResource> = topological_order
            .iter()
            .filter_map(|id| compiled.remove(id))
            .collect();

        // Status projections compile against the full environment
        let mut status_schema = compiled_schema.status.clone();
        let mut projections = Vec::new();
        for projection in &compiled_schema.projections {
            let expression =
                self.engine
                    .compile("status", &projection.pointer, &projection.raw)?;
            for variable in &expression.variables {
                if !env.declared(variable) {
                    return Err(Error::unresolved("status", variable.clone()));
                }
            }
            check_paths(&env, "status", &projection.pointer, &expression)?;

            // Refine the status schema where the projected type is known
            if expression.class == BindingClass::Typed {
                if let Some(path) = as_simple_path(&expression.expressions[0]) {
                    if let PathType::Known(known) = env.type_of_path(path) {
                        refine_status_node(&mut status_schema, &projection.pointer, known);
                    }
                }
            }

            projections.push(CompiledProjection {
                pointer: projection.pointer.clone(),
                expression,
            });
        }

        let instance_crd = emit_instance_crd(rgd, &compiled_schema.spec, &status_schema);
        let mut compiled_schema = compiled_schema;
        compiled_schema.status = status_schema;

        Ok(Graph {
            name: rgd.metadata.name.clone().unwrap_or_default(),
            resources,
            topological_order,
            schema: compiled_schema,
            projections,
            instance_crd,
            group: schema.group().to_string(),
            version: schema.api_version.clone(),
            kind: schema.kind.clone(),
            plural: pluralize_kind(&schema.kind),
            default_service_accounts: rgd
                .spec
                .default_service_accounts
                .clone()
                .unwrap_or_default(),
        })
    }

    /// Compile a single resource against the current environment.
    ///
    /// Defers when an expression references a declared-but-not-yet-compiled
    /// resource id; any other unknown variable is an error.
    fn try_compile(
        &self,
        declaration: &ResourceDeclaration,
        env: &TypedEnvironment,
        ids: &BTreeSet<String>,
        compiled: &BTreeMap<String, CompiledResource>,
    ) -> Result<Attempt> {
        let id = &declaration.id;

        let (origin, api_version, kind, template_doc) = self.origin_of(declaration)?;
        let kind_schema = self.resolver.resolve(&api_version, &kind)?;

        let mut dependencies = BTreeSet::new();

        // forEach dimensions compile in the outer scope: a dimension may not
        // reference a sibling iterator
        let mut iterators: Vec<IteratorBinding> = Vec::new();
        let mut iterator_schemas: BTreeMap<String, JSONSchemaProps> = BTreeMap::new();
        let iterator_names: BTreeSet<String> = declaration
            .for_each
            .iter()
            .flat_map(|d| d.keys().cloned())
            .collect();

        for (i, dimension) in declaration.for_each.iter().enumerate() {
            // validated to hold exactly one entry
            let Some((name, raw)) = dimension.iter().next() else {
                continue;
            };
            let pointer = format!("/forEach/{i}/{name}");

            if env.declared(name) || ids.contains(name) || name == EACH_VARIABLE {
                return Err(Error::expression(
                    id,
                    &pointer,
                    format!("iterator '{name}' shadows a variable already in scope"),
                ));
            }
            if iterator_schemas.contains_key(name) {
                return Err(Error::expression(
                    id,
                    &pointer,
                    format!("duplicate iterator '{name}'"),
                ));
            }

            let expression = self.engine.compile(id, &pointer, raw)?;
            if expression.class != BindingClass::Typed {
                return Err(Error::expression(
                    id,
                    &pointer,
                    "a forEach dimension must be a single `${...}` expression",
                ));
            }
            for variable in &expression.variables {
                if iterator_names.contains(variable) {
                    return Err(Error::expression(
                        id,
                        &pointer,
                        format!("dimension may not reference iterator '{variable}'"),
                    ));
                }
            }
            match self.scope_check(id, &expression, env, ids, compiled, &BTreeSet::new(), false)? {
                ScopeCheck::Deferred => return Ok(Attempt::Deferred),
                ScopeCheck::Ok => {}
            }
            check_paths(env, id, &pointer, &expression)?;

            // When the dimension is a plain path we can insist it is a list
            let element = match as_simple_path(&expression.expressions[0]) {
                Some(path) => match env.type_of_path(path) {
                    PathType::Known(schema) => match element_type(&schema) {
                        Some(element) => element,
                        None => {
                            return Err(Error::expression(
                                id,
                                &pointer,
                                format!("forEach expression '{path}' must be list-typed"),
                            ))
                        }
                    },
                    _ => dynamic_schema(),
                },
                None => dynamic_schema(),
            };

            dependencies.extend(resource_refs(&expression, ids, id));
            iterator_schemas.insert(name.clone(), element.clone());
            iterators.push(IteratorBinding {
                name: name.clone(),
                expression,
            });
        }

        let iter_env = env.extended(&iterator_schemas);

        // Template (or external-ref metadata) field bindings
        let mut bindings = Vec::new();
        for field in extract_fields(id, &template_doc)? {
            let expression = self.engine.compile(id, &field.pointer, &field.raw)?;
            match self.scope_check(
                id,
                &expression,
                &iter_env,
                ids,
                compiled,
                &iterator_names,
                false,
            )? {
                ScopeCheck::Deferred => return Ok(Attempt::Deferred),
                ScopeCheck::Ok => {}
            }
            check_paths(&iter_env, id, &field.pointer, &expression)?;

            let expected_type = match expression.class {
                BindingClass::Typed => as_simple_path(&expression.expressions[0])
                    .and_then(|path| match iter_env.type_of_path(path) {
                        PathType::Known(schema) => Some(schema),
                        _ => None,
                    }),
                BindingClass::Interpolated => {
                    // every inner expression must stringify
                    for source in &expression.expressions {
                        if let Some(path) = as_simple_path(source) {
                            if let PathType::Known(schema) = iter_env.type_of_path(path) {
                                if matches!(schema.type_.as_deref(), Some("object") | Some("array"))
                                {
                                    return Err(Error::expression(
                                        id,
                                        &field.pointer,
                                        format!(
                                            "'{path}' is {} and cannot be interpolated into a string",
                                            schema.type_.as_deref().unwrap_or("untyped"),
                                        ),
                                    ));
                                }
                            }
                        }
                    }
                    None
                }
                BindingClass::Literal => None,
            };

            dependencies.extend(resource_refs(&expression, ids, id));
            bindings.push(FieldBinding {
                pointer: field.pointer,
                expression,
                expected_type,
            });
        }

        // includeWhen evaluates before expansion: outer scope, no iterators
        let mut include_when = Vec::new();
        for (i, raw) in declaration.include_when.iter().enumerate() {
            let pointer = format!("/includeWhen/{i}");
            let expression = self.engine.compile(id, &pointer, raw)?;
            for variable in &expression.variables {
                if iterator_names.contains(variable) {
                    return Err(Error::expression(
                        id,
                        &pointer,
                        format!("includeWhen may not reference iterator '{variable}'"),
                    ));
                }
            }
            match self.scope_check(id, &expression, env, ids, compiled, &BTreeSet::new(), false)? {
                ScopeCheck::Deferred => return Ok(Attempt::Deferred),
                ScopeCheck::Ok => {}
            }
            check_paths(env, id, &pointer, &expression)?;
            dependencies.extend(resource_refs(&expression, ids, id));
            include_when.push(expression);
        }

        // readyWhen may additionally reference the resource itself, and the
        // current item through `each` for collections
        let mut ready_env = iter_env.clone();
        if declaration.is_collection() {
            ready_env.declare_list(id.clone(), kind_schema.clone());
            ready_env.declare(EACH_VARIABLE, kind_schema.clone());
        } else {
            ready_env.declare(id.clone(), kind_schema.clone());
        }
        let mut ready_when = Vec::new();
        for (i, raw) in declaration.ready_when.iter().enumerate() {
            let pointer = format!("/readyWhen/{i}");
            let expression = self.engine.compile(id, &pointer, raw)?;
            match self.scope_check(
                id,
                &expression,
                &ready_env,
                ids,
                compiled,
                &iterator_names,
                true,
            )? {
                ScopeCheck::Deferred => return Ok(Attempt::Deferred),
                ScopeCheck::Ok => {}
            }
            check_paths(&ready_env, id, &pointer, &expression)?;
            dependencies.extend(resource_refs(&expression, ids, id));
            ready_when.push(expression);
        }

        let resource = CompiledResource {
            id: id.clone(),
            origin,
            bindings,
            dependencies,
            for_each: iterators,
            include_when,
            ready_when,
            api_version,
            kind,
        };

        Ok(Attempt::Compiled(Box::new(resource), kind_schema))
    }

    /// Check that every free variable of an expression is in scope.
    ///
    /// A reference to a declared-but-uncompiled resource defers the whole
    /// resource to a later pass; anything else unknown is terminal.
    #[allow(clippy::too_many_arguments)]
    fn scope_check(
        &self,
        id: &str,
        expression: &CompiledExpression,
        env: &TypedEnvironment,
        ids: &BTreeSet<String>,
        compiled: &BTreeMap<String, CompiledResource>,
        iterator_names: &BTreeSet<String>,
        allow_self: bool,
    ) -> Result<ScopeCheck> {
        for variable in &expression.variables {
            if variable == id {
                if allow_self || env.declared(variable) {
                    continue;
                }
                return Err(Error::expression(
                    id,
                    "",
                    format!("resource '{id}' cannot reference itself outside readyWhen"),
                ));
            }
            if env.declared(variable) || iterator_names.contains(variable) {
                continue;
            }
            if ids.contains(variable) && !compiled.contains_key(variable) {
                return Ok(ScopeCheck::Deferred);
            }
            return Err(Error::unresolved(id, variable.clone()));
        }
        Ok(ScopeCheck::Ok)
    }

    /// Resolve a declaration's origin, the produced GVK, and the document to
    /// scan for expressions
    fn origin_of(
        &self,
        declaration: &ResourceDeclaration,
    ) -> Result<(ResourceOrigin, String, String, Value)> {
        let id = &declaration.id;
        if let Some(template) = &declaration.template {
            let api_version = literal_string_field(id, template, "apiVersion")?;
            let kind = literal_string_field(id, template, "kind")?;
            return Ok((
                ResourceOrigin::Template(template.clone()),
                api_version,
                kind,
                template.clone(),
            ));
        }
        if let Some(external) = &declaration.external_ref {
            // name and namespace may carry expressions; scan them like a
            // template
            let doc = serde_json::json!({
                "name": external.name,
                "namespace": external.namespace,
            });
            return Ok((
                ResourceOrigin::ExternalRef(external.clone()),
                external.api_version.clone(),
                external.kind.clone(),
                doc,
            ));
        }
        // unreachable: declaration.validate() enforces exactly one
        Err(Error::schema(
            format!("resources.{id}"),
            "resource has neither template nor externalRef",
        ))
    }
}

enum ScopeCheck {
    Ok,
    Deferred,
}

/// Variables that refer to other resources (dependency inference)
fn resource_refs(
    expression: &CompiledExpression,
    ids: &BTreeSet<String>,
    own_id: &str,
) -> BTreeSet<String> {
    expression
        .variables
        .iter()
        .filter(|v| ids.contains(*v) && *v != own_id)
        .cloned()
        .collect()
}

/// Check every dotted access path against the environment's schemas
fn check_paths(
    env: &TypedEnvironment,
    resource: &str,
    pointer: &str,
    expression: &CompiledExpression,
) -> Result<()> {
    for path in &expression.paths {
        if let PathType::UnknownField { path, .. } = env.type_of_path(path) {
            return Err(Error::expression(
                resource,
                pointer,
                format!("'{path}' does not exist in the structural schema"),
            ));
        }
    }
    Ok(())
}

/// A bare access path like `schema.spec.values` or `pods[0].metadata.name`
fn as_simple_path(source: &str) -> Option<&str> {
    let mut chars = source.chars().peekable();
    let mut first = true;
    while let Some(c) = chars.next() {
        let valid = if first {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '[' || c == ']'
        };
        if !valid {
            return None;
        }
        first = false;
        if c == '[' {
            // only literal indexes keep path shape
            match chars.peek() {
                Some(d) if d.is_ascii_digit() => {}
                _ => return None,
            }
        }
    }
    if source.is_empty() {
        None
    } else {
        Some(source)
    }
}

fn dynamic_schema() -> JSONSchemaProps {
    JSONSchemaProps {
        x_kubernetes_preserve_unknown_fields: Some(true),
        ..Default::default()
    }
}

fn literal_string_field(id: &str, template: &Value, field: &str) -> Result<String> {
    match template.get(field) {
        Some(Value::String(s)) if !s.contains("${") => Ok(s.clone()),
        Some(Value::String(s)) => Err(Error::expression(
            id,
            format!("/{field}"),
            format!("'{s}': {field} must be a literal, not an expression"),
        )),
        _ => Err(Error::schema(
            format!("resources.{id}"),
            format!("template is missing a string '{field}'"),
        )),
    }
}

/// Replace a status-schema node at a JSON pointer with a refined type
fn refine_status_node(schema: &mut JSONSchemaProps, pointer: &str, refined: JSONSchemaProps) {
    let mut current = schema;
    let segments: Vec<&str> = pointer.split('/').filter(|s| !s.is_empty()).collect();
    for (i, segment) in segments.iter().enumerate() {
        let Some(properties) = current.properties.as_mut() else {
            return;
        };
        let Some(next) = properties.get_mut(*segment) else {
            return;
        };
        if i == segments.len() - 1 {
            *next = refined;
            return;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DuckTypedResolver;
    use crate::crd::{ExternalRef, ResourceGraphDefinitionSpec, SchemaDefinition};
    use serde_json::json;

    fn rgd(
        spec: Option<Value>,
        resources: Vec<ResourceDeclaration>,
    ) -> ResourceGraphDefinition {
        ResourceGraphDefinition::new(
            "test-graph",
            ResourceGraphDefinitionSpec {
                schema: SchemaDefinition {
                    api_version: "v1alpha1".to_string(),
                    kind: "TestApp".to_string(),
                    group: None,
                    spec,
                    status: None,
                    types: None,
                    additional_printer_columns: vec![],
                },
                resources,
                default_service_accounts: None,
            },
        )
    }

    fn template_resource(id: &str, template: Value) -> ResourceDeclaration {
        ResourceDeclaration {
            id: id.to_string(),
            template: Some(template),
            external_ref: None,
            include_when: vec![],
            ready_when: vec![],
            for_each: vec![],
        }
    }

    fn config_map(name_expr: &str, data: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name_expr},
            "data": data,
        })
    }

    fn build(rgd: &ResourceGraphDefinition) -> Result<Graph> {
        let engine = ExpressionEngine::new();
        let resolver = DuckTypedResolver;
        GraphBuilder::new(&engine, &resolver).build(rgd)
    }

    #[test]
    fn test_single_static_resource() {
        let graph = build(&rgd(
            Some(json!({"name": "string"})),
            vec![template_resource(
                "cm",
                config_map("${schema.spec.name}-cm", json!({"k": "v"})),
            )],
        ))
        .expect("graph should compile");

        assert_eq!(graph.topological_order, vec!["cm"]);
        let cm = graph.get("cm").unwrap();
        assert!(cm.is_static());
        assert_eq!(cm.bindings.len(), 1);
    }

    #[test]
    fn test_dependency_ordering_from_expressions() {
        let graph = build(&rgd(
            Some(json!({"name": "string"})),
            vec![
                template_resource(
                    "app",
                    config_map("app-cm", json!({"version": "${db.data.version}"})),
                ),
                template_resource("db", config_map("db-cm", json!({"version": "v1"}))),
            ],
        ))
        .expect("graph should compile");

        assert_eq!(graph.topological_order, vec!["db", "app"]);
        let app = graph.get("app").unwrap();
        assert_eq!(app.get_dependencies(), vec!["db"]);
        assert!(!app.is_static());
    }

    #[test]
    fn test_cycle_rejected_with_members() {
        let err = build(&rgd(
            Some(json!({"name": "string"})),
            vec![
                template_resource("a", config_map("a-cm", json!({"x": "${b.data.x}"}))),
                template_resource("b", config_map("b-cm", json!({"x": "${a.data.x}"}))),
            ],
        ))
        .unwrap_err();

        match err {
            Error::CycleDetected { members } => {
                assert!(members.contains(&"a".to_string()));
                assert!(members.contains(&"b".to_string()));
            }
            other => panic!("expected CycleDetected, got {other}"),
        }
    }

    #[test]
    fn test_unresolved_reference_rejected() {
        let err = build(&rgd(
            Some(json!({"name": "string"})),
            vec![template_resource(
                "app",
                config_map("app-cm", json!({"x": "${databse.data.x}"})),
            )],
        ))
        .unwrap_err();

        match err {
            Error::UnresolvedReference { resource, variable } => {
                assert_eq!(resource, "app");
                assert_eq!(variable, "databse");
            }
            other => panic!("expected UnresolvedReference, got {other}"),
        }
    }

    #[test]
    fn test_schema_typo_rejected() {
        let err = build(&rgd(
            Some(json!({"name": "string"})),
            vec![template_resource(
                "cm",
                config_map("${schema.spec.nmae}", json!({})),
            )],
        ))
        .unwrap_err();
        assert!(matches!(err, Error::ExpressionInvalid { .. }));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = build(&rgd(
            Some(json!({"name": "string"})),
            vec![
                template_resource("cm", config_map("a", json!({}))),
                template_resource("cm", config_map("b", json!({}))),
            ],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate resource id"));
    }

    fn collection(id: &str, template: Value, dims: Vec<(&str, &str)>) -> ResourceDeclaration {
        let mut declaration = template_resource(id, template);
        declaration.for_each = dims
            .into_iter()
            .map(|(name, expr)| {
                BTreeMap::from([(name.to_string(), expr.to_string())])
            })
            .collect();
        declaration
    }

    #[test]
    fn test_collection_over_schema_list() {
        let graph = build(&rgd(
            Some(json!({"name": "string", "values": "[]string"})),
            vec![collection(
                "cms",
                config_map("${schema.spec.name}-${value}", json!({"key": "${value}"})),
                vec![("value", "${schema.spec.values}")],
            )],
        ))
        .expect("collection should compile");

        let cms = graph.get("cms").unwrap();
        assert!(cms.is_collection());
        assert_eq!(cms.for_each.len(), 1);
        assert!(cms.is_static());
    }

    #[test]
    fn test_for_each_over_scalar_rejected() {
        let err = build(&rgd(
            Some(json!({"name": "string"})),
            vec![collection(
                "cms",
                config_map("${value}", json!({})),
                vec![("value", "${schema.spec.name}")],
            )],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("must be list-typed"));
    }

    #[test]
    fn test_dimension_may_not_reference_sibling_iterator() {
        let err = build(&rgd(
            Some(json!({"regions": "[]string"})),
            vec![collection(
                "cms",
                config_map("${region}-${tier}", json!({})),
                vec![
                    ("region", "${schema.spec.regions}"),
                    ("tier", "${region}"),
                ],
            )],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("may not reference iterator"));
    }

    #[test]
    fn test_iterator_does_not_leak_downstream() {
        let err = build(&rgd(
            Some(json!({"values": "[]string"})),
            vec![
                collection(
                    "cms",
                    config_map("${value}", json!({})),
                    vec![("value", "${schema.spec.values}")],
                ),
                template_resource("app", config_map("app", json!({"x": "${value}"}))),
            ],
        ))
        .unwrap_err();
        match err {
            Error::UnresolvedReference { resource, variable } => {
                assert_eq!(resource, "app");
                assert_eq!(variable, "value");
            }
            other => panic!("expected UnresolvedReference, got {other}"),
        }
    }

    #[test]
    fn test_collection_chaining_collects_dependency() {
        // a collection whose forEach iterates over another collection
        let graph = build(&rgd(
            Some(json!({"name": "string", "cidrBlocks": "[]string"})),
            vec![
                collection(
                    "subnets",
                    config_map("${schema.spec.name}-${cidr}", json!({"cidr": "${cidr}"})),
                    vec![("cidr", "${schema.spec.cidrBlocks}")],
                ),
                collection(
                    "groups",
                    config_map("${schema.spec.name}-sg-${subnet.metadata.name}", json!({})),
                    vec![("subnet", "${subnets}")],
                ),
            ],
        ))
        .expect("chained collections should compile");

        let groups = graph.get("groups").unwrap();
        assert!(groups.is_collection());
        assert_eq!(groups.get_dependencies(), vec!["subnets"]);
        assert_eq!(graph.topological_order, vec!["subnets", "groups"]);
    }

    #[test]
    fn test_ready_when_may_reference_self() {
        let mut decl = template_resource(
            "db",
            config_map("db-cm", json!({"version": "v1"})),
        );
        decl.ready_when = vec!["${has(db.data.version)}".to_string()];

        let graph = build(&rgd(Some(json!({"name": "string"})), vec![decl]))
            .expect("readyWhen over self should compile");
        let db = graph.get("db").unwrap();
        assert_eq!(db.ready_when.len(), 1);
        // self-reference is not a dependency
        assert!(db.is_static());
    }

    #[test]
    fn test_template_may_not_reference_self() {
        let err = build(&rgd(
            Some(json!({"name": "string"})),
            vec![template_resource(
                "db",
                config_map("${db.data.version}", json!({})),
            )],
        ))
        .unwrap_err();
        assert!(matches!(err, Error::ExpressionInvalid { .. }));
    }

    #[test]
    fn test_collection_ready_when_uses_each() {
        let mut decl = collection(
            "pods",
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "${schema.spec.name}-${value}"},
            }),
            vec![("value", "${schema.spec.values}")],
        );
        decl.ready_when = vec![r#"${each.status.phase == "Running"}"#.to_string()];

        let graph = build(&rgd(
            Some(json!({"name": "string", "values": "[]string"})),
            vec![decl],
        ))
        .expect("each in readyWhen should compile");
        assert_eq!(graph.get("pods").unwrap().ready_when.len(), 1);
    }

    #[test]
    fn test_include_when_may_not_reference_iterator() {
        let mut decl = collection(
            "cms",
            config_map("${value}", json!({})),
            vec![("value", "${schema.spec.values}")],
        );
        decl.include_when = vec!["${has(value)}".to_string()];

        let err = build(&rgd(
            Some(json!({"values": "[]string"})),
            vec![decl],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("includeWhen may not reference iterator"));
    }

    #[test]
    fn test_external_ref_compiles_with_expressions() {
        let decl = ResourceDeclaration {
            id: "shared".to_string(),
            template: None,
            external_ref: Some(ExternalRef {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                name: "${schema.spec.name}-shared".to_string(),
                namespace: None,
            }),
            include_when: vec![],
            ready_when: vec![],
            for_each: vec![],
        };
        let graph = build(&rgd(Some(json!({"name": "string"})), vec![decl]))
            .expect("external ref should compile");
        let shared = graph.get("shared").unwrap();
        assert!(shared.is_external());
        assert_eq!(shared.bindings.len(), 1);
        assert_eq!(shared.bindings[0].pointer, "/name");
    }

    #[test]
    fn test_templated_api_version_rejected() {
        let err = build(&rgd(
            Some(json!({"v": "string"})),
            vec![template_resource(
                "cm",
                json!({"apiVersion": "${schema.spec.v}", "kind": "ConfigMap"}),
            )],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("must be a literal"));
    }

    #[test]
    fn test_status_projections_compile_against_full_environment() {
        let mut definition = rgd(
            Some(json!({"name": "string"})),
            vec![template_resource(
                "db",
                config_map("db-cm", json!({"version": "v1"})),
            )],
        );
        definition.spec.schema.status = Some(json!({
            "dbVersion": "${db.data.version}",
        }));

        let graph = build(&definition).expect("status projection should compile");
        assert_eq!(graph.projections.len(), 1);
        assert_eq!(graph.projections[0].pointer, "/dbVersion");
    }

    #[test]
    fn test_status_projection_unknown_resource_rejected() {
        let mut definition = rgd(Some(json!({"name": "string"})), vec![]);
        definition.spec.schema.status = Some(json!({"x": "${ghost.data.x}"}));
        let err = build(&definition).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { .. }));
    }

    #[test]
    fn test_status_projection_refines_known_type() {
        let mut definition = rgd(Some(json!({"name": "string"})), vec![]);
        definition.spec.schema.status = Some(json!({"echoName": "${schema.spec.name}"}));

        let graph = build(&definition).expect("projection should compile");
        let props = graph.schema.status.properties.as_ref().unwrap();
        assert_eq!(props["echoName"].type_.as_deref(), Some("string"));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let definition = rgd(
            Some(json!({"name": "string", "values": "[]string"})),
            vec![
                template_resource(
                    "app",
                    config_map("app", json!({"v": "${db.data.version}"})),
                ),
                template_resource("db", config_map("db", json!({"version": "v1"}))),
                collection(
                    "cms",
                    config_map("${schema.spec.name}-${value}", json!({})),
                    vec![("value", "${schema.spec.values}")],
                ),
            ],
        );

        let a = build(&definition).unwrap();
        let b = build(&definition).unwrap();
        assert_eq!(a.topological_order, b.topological_order);
        assert_eq!(
            serde_json::to_string(&a.instance_crd).unwrap(),
            serde_json::to_string(&b.instance_crd).unwrap()
        );
    }

    #[test]
    fn test_independent_resources_keep_declaration_order() {
        let graph = build(&rgd(
            Some(json!({"name": "string"})),
            vec![
                template_resource("zeta", config_map("z", json!({}))),
                template_resource("alpha", config_map("a", json!({}))),
            ],
        ))
        .unwrap();
        assert_eq!(graph.topological_order, vec!["zeta", "alpha"]);
    }
}
