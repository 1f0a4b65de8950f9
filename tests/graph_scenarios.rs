//! End-to-end graph scenarios: compile a ResourceGraphDefinition, bind an
//! instance, and check ordering, expansion, and resolution through the
//! public API.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use weft::cluster::DuckTypedResolver;
use weft::crd::{
    ExternalRef, ResourceDeclaration, ResourceGraphDefinition, ResourceGraphDefinitionSpec,
    SchemaDefinition,
};
use weft::expr::ExpressionEngine;
use weft::graph::{Graph, GraphBuilder};
use weft::runtime::InstanceRuntime;
use weft::Error;

fn definition(
    spec: Value,
    status: Option<Value>,
    resources: Vec<ResourceDeclaration>,
) -> ResourceGraphDefinition {
    ResourceGraphDefinition::new(
        "scenario",
        ResourceGraphDefinitionSpec {
            schema: SchemaDefinition {
                api_version: "v1alpha1".to_string(),
                kind: "Scenario".to_string(),
                group: None,
                spec: Some(spec),
                status,
                types: None,
                additional_printer_columns: vec![],
            },
            resources,
            default_service_accounts: None,
        },
    )
}

fn resource(id: &str, template: Value) -> ResourceDeclaration {
    ResourceDeclaration {
        id: id.to_string(),
        template: Some(template),
        external_ref: None,
        include_when: vec![],
        ready_when: vec![],
        for_each: vec![],
    }
}

fn collection(id: &str, template: Value, dims: Vec<(&str, &str)>) -> ResourceDeclaration {
    let mut declaration = resource(id, template);
    declaration.for_each = dims
        .into_iter()
        .map(|(name, expr)| BTreeMap::from([(name.to_string(), expr.to_string())]))
        .collect();
    declaration
}

fn config_map(name: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name},
        "data": data,
    })
}

fn compile(rgd: &ResourceGraphDefinition) -> Result<Graph, Error> {
    let engine = ExpressionEngine::new();
    GraphBuilder::new(&engine, &DuckTypedResolver).build(rgd)
}

fn instance(spec: Value) -> Value {
    json!({
        "apiVersion": "kro.run/v1alpha1",
        "kind": "Scenario",
        "metadata": {"name": "m", "namespace": "default"},
        "spec": spec,
    })
}

/// Fan-out: one collection resource over a string list produces one
/// ConfigMap per element, named `<name>-<value>` with the element as data.
#[test]
fn scenario_fan_out_config_maps() {
    let rgd = definition(
        json!({"name": "string", "values": "[]string"}),
        None,
        vec![collection(
            "cms",
            config_map("${schema.spec.name}-${value}", json!({"key": "${value}"})),
            vec![("value", "${schema.spec.values}")],
        )],
    );
    let graph = compile(&rgd).expect("fan-out definition should compile");

    let engine = ExpressionEngine::new();
    let runtime = InstanceRuntime::new(&graph, &engine);
    let ctx = runtime.root_context(&instance(json!({"name": "m", "values": ["a", "b", "c"]})));

    let cms = graph.get("cms").unwrap();
    let tuples = runtime.expand(cms, &ctx).unwrap();
    assert_eq!(tuples.len(), 3);

    let mut names = Vec::new();
    for (i, tuple) in tuples.iter().enumerate() {
        let item = runtime.resolve_item(cms, &ctx, tuple).unwrap();
        names.push(item.name().unwrap().to_string());
        let expected = ["a", "b", "c"][i];
        assert_eq!(item.desired.pointer("/data/key"), Some(&json!(expected)));
    }
    assert_eq!(names, vec!["m-a", "m-b", "m-c"]);
}

/// Cartesian product: two dimensions expand to every combination, ordered
/// lexicographically by dimension position.
#[test]
fn scenario_cartesian_product() {
    let rgd = definition(
        json!({"name": "string", "regions": "[]string", "tiers": "[]string"}),
        None,
        vec![collection(
            "cms",
            config_map("${schema.spec.name}-${region}-${tier}", json!({})),
            vec![
                ("region", "${schema.spec.regions}"),
                ("tier", "${schema.spec.tiers}"),
            ],
        )],
    );
    let graph = compile(&rgd).expect("cartesian definition should compile");

    let engine = ExpressionEngine::new();
    let runtime = InstanceRuntime::new(&graph, &engine);
    let ctx = runtime.root_context(&instance(
        json!({"name": "m", "regions": ["us", "eu"], "tiers": ["web", "api"]}),
    ));

    let cms = graph.get("cms").unwrap();
    let names: Vec<String> = runtime
        .expand(cms, &ctx)
        .unwrap()
        .iter()
        .map(|tuple| {
            runtime
                .resolve_item(cms, &ctx, tuple)
                .unwrap()
                .name()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(names, vec!["m-us-web", "m-us-api", "m-eu-web", "m-eu-api"]);
}

/// Dependency ordering: `app` references `db`'s data, so `db` sorts first
/// and `app` resolves against db's observed object.
#[test]
fn scenario_dependency_ordering() {
    let rgd = definition(
        json!({"name": "string"}),
        None,
        vec![
            resource(
                "app",
                config_map("app-cm", json!({"version": "${db.data.version}"})),
            ),
            resource("db", config_map("db-cm", json!({"version": "v1"}))),
        ],
    );
    let graph = compile(&rgd).expect("dependent definition should compile");
    assert_eq!(graph.topological_order, vec!["db", "app"]);

    let engine = ExpressionEngine::new();
    let runtime = InstanceRuntime::new(&graph, &engine);
    let mut ctx = runtime.root_context(&instance(json!({"name": "m"})));

    // db resolves first and its observed object enters the context
    let db = graph.get("db").unwrap();
    let db_item = runtime.resolve_item(db, &ctx, &BTreeMap::new()).unwrap();
    ctx.publish("db", db_item.desired.clone());

    let app = graph.get("app").unwrap();
    let app_item = runtime.resolve_item(app, &ctx, &BTreeMap::new()).unwrap();
    assert_eq!(app_item.desired.pointer("/data/version"), Some(&json!("v1")));
}

/// Removing a referenced resource from the definition is a compile error.
#[test]
fn scenario_removed_dependency_fails_compile() {
    let rgd = definition(
        json!({"name": "string"}),
        None,
        vec![resource(
            "app",
            config_map("app-cm", json!({"version": "${db.data.version}"})),
        )],
    );
    let err = compile(&rgd).unwrap_err();
    assert!(matches!(err, Error::UnresolvedReference { .. }));
}

/// includeWhen gates expansion per instance.
#[test]
fn scenario_include_when_toggle() {
    let mut decl = collection(
        "cms",
        config_map("${value}", json!({})),
        vec![("value", "${schema.spec.values}")],
    );
    decl.include_when = vec!["${schema.spec.enabled}".to_string()];
    let rgd = definition(
        json!({"enabled": "boolean", "values": "[]string"}),
        None,
        vec![decl],
    );
    let graph = compile(&rgd).expect("toggled definition should compile");

    let engine = ExpressionEngine::new();
    let runtime = InstanceRuntime::new(&graph, &engine);
    let cms = graph.get("cms").unwrap();

    let ctx = runtime.root_context(&instance(json!({"enabled": false, "values": ["a"]})));
    assert!(!runtime.evaluate_include(cms, &ctx).unwrap());

    let ctx = runtime.root_context(&instance(json!({"enabled": true, "values": ["a"]})));
    assert!(runtime.evaluate_include(cms, &ctx).unwrap());
    assert_eq!(runtime.expand(cms, &ctx).unwrap().len(), 1);
}

/// Deep chain: base -> l1 (over spec items) -> l2 (over l1) -> summary with
/// size(l2). Scaling the input list scales every level and the summary.
#[test]
fn scenario_deep_chain_scaling() {
    let rgd = definition(
        json!({"name": "string", "items": "[]string"}),
        None,
        vec![
            resource("base", config_map("base", json!({"seed": "1"}))),
            collection(
                "l1",
                config_map("${schema.spec.name}-l1-${item}", json!({"v": "${item}"})),
                vec![("item", "${schema.spec.items}")],
            ),
            collection(
                "l2",
                config_map("${schema.spec.name}-l2-${inner.metadata.name}", json!({})),
                vec![("inner", "${l1}")],
            ),
            resource("summary", config_map("summary", json!({"count": "${size(l2)}"}))),
        ],
    );
    let graph = compile(&rgd).expect("deep chain should compile");

    let order = &graph.topological_order;
    let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(pos("l1") < pos("l2"));
    assert!(pos("l2") < pos("summary"));
    assert_eq!(
        graph.get("summary").unwrap().get_dependencies(),
        vec!["l2"]
    );

    let engine = ExpressionEngine::new();
    let runtime = InstanceRuntime::new(&graph, &engine);
    let mut ctx = runtime.root_context(&instance(json!({"name": "m", "items": ["a", "b"]})));

    // resolve l1 and publish its items as the observed list
    let l1 = graph.get("l1").unwrap();
    let l1_items: Vec<Value> = runtime
        .expand(l1, &ctx)
        .unwrap()
        .iter()
        .map(|t| runtime.resolve_item(l1, &ctx, t).unwrap().desired)
        .collect();
    assert_eq!(l1_items.len(), 2);
    ctx.publish("l1", Value::Array(l1_items));

    // l2 fans out over l1's observed items
    let l2 = graph.get("l2").unwrap();
    let l2_items: Vec<Value> = runtime
        .expand(l2, &ctx)
        .unwrap()
        .iter()
        .map(|t| runtime.resolve_item(l2, &ctx, t).unwrap().desired)
        .collect();
    assert_eq!(l2_items.len(), 2);
    let l2_names: Vec<&str> = l2_items
        .iter()
        .map(|i| i.pointer("/metadata/name").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(l2_names, vec!["m-l2-m-l1-a", "m-l2-m-l1-b"]);
    ctx.publish("l2", Value::Array(l2_items));

    // summary sees the scaled size (a typed binding keeps the number)
    let summary = graph.get("summary").unwrap();
    let item = runtime.resolve_item(summary, &ctx, &BTreeMap::new()).unwrap();
    assert_eq!(item.desired.pointer("/data/count"), Some(&json!(2)));

    // scale up: three items at every level, summary follows
    let mut ctx = runtime.root_context(&instance(json!({"name": "m", "items": ["a", "b", "c"]})));
    let l1_items: Vec<Value> = runtime
        .expand(l1, &ctx)
        .unwrap()
        .iter()
        .map(|t| runtime.resolve_item(l1, &ctx, t).unwrap().desired)
        .collect();
    assert_eq!(l1_items.len(), 3);
    ctx.publish("l1", Value::Array(l1_items));
    let l2_items: Vec<Value> = runtime
        .expand(l2, &ctx)
        .unwrap()
        .iter()
        .map(|t| runtime.resolve_item(l2, &ctx, t).unwrap().desired)
        .collect();
    ctx.publish("l2", Value::Array(l2_items));
    let item = runtime.resolve_item(summary, &ctx, &BTreeMap::new()).unwrap();
    assert_eq!(item.desired.pointer("/data/count"), Some(&json!(3)));
}

/// Two resources referencing each other's fields must be rejected with both
/// ids in the cycle report.
#[test]
fn scenario_cycle_rejection() {
    let rgd = definition(
        json!({"name": "string"}),
        None,
        vec![
            resource("a", config_map("a", json!({"x": "${b.data.x}"}))),
            resource("b", config_map("b", json!({"x": "${a.data.x}"}))),
        ],
    );
    let err = compile(&rgd).unwrap_err();
    match err {
        Error::CycleDetected { members } => {
            assert!(members.contains(&"a".to_string()));
            assert!(members.contains(&"b".to_string()));
        }
        other => panic!("expected CycleDetected, got {other}"),
    }
}

/// Compilation is deterministic: identical definitions give byte-identical
/// CRDs and identical orders.
#[test]
fn scenario_deterministic_compilation() {
    let build = || {
        let rgd = definition(
            json!({"name": "string", "values": "[]string"}),
            Some(json!({"first": "${cms[0].metadata.name | orValue(\"none\")}"})),
            vec![
                collection(
                    "cms",
                    config_map("${schema.spec.name}-${value}", json!({})),
                    vec![("value", "${schema.spec.values}")],
                ),
                resource("base", config_map("base", json!({}))),
            ],
        );
        let graph = compile(&rgd).unwrap();
        (
            graph.topological_order.clone(),
            serde_json::to_string(&graph.instance_crd).unwrap(),
        )
    };
    assert_eq!(build(), build());
}

/// External references type-check, contribute reads only, and surface their
/// data to dependents.
#[test]
fn scenario_external_reference_feeds_dependents() {
    let external = ResourceDeclaration {
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
    let rgd = definition(
        json!({"name": "string"}),
        None,
        vec![
            external,
            resource("app", config_map("app", json!({"v": "${shared.data.v}"}))),
        ],
    );
    let graph = compile(&rgd).expect("external ref definition should compile");
    assert_eq!(graph.topological_order, vec!["shared", "app"]);

    let engine = ExpressionEngine::new();
    let runtime = InstanceRuntime::new(&graph, &engine);
    let mut ctx = runtime.root_context(&instance(json!({"name": "m"})));

    let shared = graph.get("shared").unwrap();
    let (name, namespace) = runtime.external_target(shared, &ctx).unwrap();
    assert_eq!(name, "m-shared");
    assert_eq!(namespace, None);

    ctx.publish("shared", json!({"data": {"v": "42"}}));
    let app = graph.get("app").unwrap();
    let item = runtime.resolve_item(app, &ctx, &BTreeMap::new()).unwrap();
    assert_eq!(item.desired.pointer("/data/v"), Some(&json!("42")));
}

/// The emitted CRD carries the compiled spec schema and the system status
/// fields.
#[test]
fn scenario_emitted_crd_shape() {
    let rgd = definition(
        json!({"name": "string | required=true", "replicas": "integer | default=1"}),
        Some(json!({"summary": "${schema.spec.name}"})),
        vec![],
    );
    let graph = compile(&rgd).unwrap();
    let crd = &graph.instance_crd;

    assert_eq!(crd.metadata.name.as_deref(), Some("scenarios.kro.run"));
    let root = crd.spec.versions[0]
        .schema
        .as_ref()
        .unwrap()
        .open_api_v3_schema
        .as_ref()
        .unwrap();
    let spec = &root.properties.as_ref().unwrap()["spec"];
    assert_eq!(spec.required, Some(vec!["name".to_string()]));
    let status = &root.properties.as_ref().unwrap()["status"];
    let status_props = status.properties.as_ref().unwrap();
    assert!(status_props.contains_key("conditions"));
    assert!(status_props.contains_key("summary"));
}
