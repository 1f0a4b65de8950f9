//! Instance runtime
//!
//! Binds a compiled graph to one concrete instance: builds the root
//! evaluation context from the instance's (defaulted) spec, expands
//! collection resources into their cartesian-product items, resolves field
//! bindings into desired objects, and evaluates includeWhen / readyWhen
//! guards. All cluster I/O stays in the reconciler; the runtime is pure
//! evaluation over an accumulating context.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::Error;
use crate::expr::{BindingClass, ExpressionEngine};
use crate::graph::{CompiledResource, Graph, ResourceOrigin};
use crate::simpleschema::apply_defaults;
use crate::Result;
use crate::{EACH_VARIABLE, SCHEMA_VARIABLE};

/// The accumulating evaluation context of one reconcile pass.
///
/// Keys are resource ids plus `schema`; values are the latest observed (or
/// desired) structured data usable by downstream expressions. Skipped
/// resources never publish: their variable stays absent and downstream
/// expressions resolve it null-safely.
#[derive(Clone, Debug, Default)]
pub struct EvalContext {
    values: Map<String, Value>,
}

impl EvalContext {
    /// Publish a value under a resource id (or `schema`)
    pub fn publish(&mut self, id: impl Into<String>, value: Value) {
        self.values.insert(id.into(), value);
    }

    /// The current value for an id, if published
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.values.get(id)
    }

    /// Bindings for expression evaluation
    pub fn bindings(&self) -> minijinja::Value {
        ExpressionEngine::context(&self.values)
    }

    /// Bindings extended with extra scoped variables (iterators, `each`)
    pub fn bindings_with(&self, extra: &Map<String, Value>) -> minijinja::Value {
        let mut merged = self.values.clone();
        for (name, value) in extra {
            merged.insert(name.clone(), value.clone());
        }
        ExpressionEngine::context(&merged)
    }
}

/// One expanded item of a resource: the iterator tuple that identifies it
/// plus the resolved desired object (absent for external references).
#[derive(Clone, Debug)]
pub struct ResolvedItem {
    /// Iterator name -> value for this item; empty for non-collections
    pub iterator: BTreeMap<String, Value>,
    /// The fully resolved desired object
    pub desired: Value,
}

impl ResolvedItem {
    /// `metadata.name` of the desired object
    pub fn name(&self) -> Option<&str> {
        self.desired.pointer("/metadata/name").and_then(Value::as_str)
    }

    /// `metadata.namespace` of the desired object, when set
    pub fn namespace(&self) -> Option<&str> {
        self.desired
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
    }
}

/// Pure evaluation of one instance against a compiled graph
pub struct InstanceRuntime<'g> {
    graph: &'g Graph,
    engine: &'g ExpressionEngine,
}

impl<'g> InstanceRuntime<'g> {
    /// Create a runtime over a compiled graph
    pub fn new(graph: &'g Graph, engine: &'g ExpressionEngine) -> Self {
        Self { graph, engine }
    }

    /// The graph this runtime evaluates
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Build the root context from an instance object: defaulted spec plus
    /// the metadata subset.
    pub fn root_context(&self, instance: &Value) -> EvalContext {
        let mut spec = instance.get("spec").cloned().unwrap_or_else(|| Value::Object(Map::new()));
        apply_defaults(&mut spec, &self.graph.schema.spec);

        let metadata = instance.get("metadata").cloned().unwrap_or_default();
        let schema_value = serde_json::json!({
            "spec": spec,
            "metadata": {
                "name": metadata.get("name").cloned().unwrap_or(Value::Null),
                "namespace": metadata.get("namespace").cloned().unwrap_or(Value::Null),
                "labels": metadata.get("labels").cloned().unwrap_or_else(|| Value::Object(Map::new())),
                "annotations": metadata.get("annotations").cloned().unwrap_or_else(|| Value::Object(Map::new())),
            },
        });

        let mut ctx = EvalContext::default();
        ctx.publish(SCHEMA_VARIABLE, schema_value);
        ctx
    }

    /// Evaluate a resource's includeWhen guards (default true)
    pub fn evaluate_include(&self, resource: &CompiledResource, ctx: &EvalContext) -> Result<bool> {
        let bindings = ctx.bindings();
        for (i, guard) in resource.include_when.iter().enumerate() {
            let pointer = format!("/includeWhen/{i}");
            for source in &guard.expressions {
                if !self
                    .engine
                    .eval_bool(&resource.id, &pointer, source, &bindings)?
                {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Expand a resource into its iterator tuples.
    ///
    /// Non-collections yield a single empty tuple. Each dimension evaluates
    /// in the outer context (iterators never see each other); the tuples are
    /// the cartesian product, lexicographic by dimension position with input
    /// order preserved inside each dimension.
    pub fn expand(
        &self,
        resource: &CompiledResource,
        ctx: &EvalContext,
    ) -> Result<Vec<BTreeMap<String, Value>>> {
        if !resource.is_collection() {
            return Ok(vec![BTreeMap::new()]);
        }

        let bindings = ctx.bindings();
        let mut tuples: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];

        for (i, dimension) in resource.for_each.iter().enumerate() {
            let pointer = format!("/forEach/{i}/{}", dimension.name);
            let value = self.engine.eval_typed(
                &resource.id,
                &pointer,
                &dimension.expression.expressions[0],
                &bindings,
            )?;
            let Value::Array(items) = value else {
                return Err(Error::evaluation(
                    &resource.id,
                    &pointer,
                    "forEach expression did not produce a list",
                ));
            };

            let mut next = Vec::with_capacity(tuples.len() * items.len());
            for tuple in &tuples {
                for item in &items {
                    let mut extended = tuple.clone();
                    extended.insert(dimension.name.clone(), item.clone());
                    next.push(extended);
                }
            }
            tuples = next;
        }

        Ok(tuples)
    }

    /// Resolve one item's desired object from the template and bindings
    pub fn resolve_item(
        &self,
        resource: &CompiledResource,
        ctx: &EvalContext,
        iterator: &BTreeMap<String, Value>,
    ) -> Result<ResolvedItem> {
        let ResourceOrigin::Template(template) = &resource.origin else {
            return Err(Error::evaluation(
                &resource.id,
                "",
                "external references have no desired object",
            ));
        };

        let mut desired = template.clone();
        let extra: Map<String, Value> = iterator
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let bindings = ctx.bindings_with(&extra);

        for binding in &resource.bindings {
            let value = match binding.expression.class {
                BindingClass::Typed => self.engine.eval_typed(
                    &resource.id,
                    &binding.pointer,
                    &binding.expression.expressions[0],
                    &bindings,
                )?,
                BindingClass::Interpolated => Value::String(self.engine.render(
                    &resource.id,
                    &binding.pointer,
                    &binding.expression.raw,
                    &bindings,
                )?),
                BindingClass::Literal => continue,
            };
            if let Some(slot) = desired.pointer_mut(&binding.pointer) {
                *slot = value;
            }
        }

        Ok(ResolvedItem {
            iterator: iterator.clone(),
            desired,
        })
    }

    /// Resolve the concrete target of an external reference
    pub fn external_target(
        &self,
        resource: &CompiledResource,
        ctx: &EvalContext,
    ) -> Result<(String, Option<String>)> {
        let ResourceOrigin::ExternalRef(external) = &resource.origin else {
            return Err(Error::evaluation(
                &resource.id,
                "",
                "resource is not an external reference",
            ));
        };

        let bindings = ctx.bindings();
        let name = if external.name.contains("${") {
            self.engine
                .render(&resource.id, "/name", &external.name, &bindings)?
        } else {
            external.name.clone()
        };
        let namespace = match &external.namespace {
            Some(ns) if ns.contains("${") => Some(self.engine.render(
                &resource.id,
                "/namespace",
                ns,
                &bindings,
            )?),
            Some(ns) => Some(ns.clone()),
            None => None,
        };
        Ok((name, namespace))
    }

    /// Evaluate a resource's readyWhen checks against an observed object.
    ///
    /// For collection items the current item is bound as `each`; the
    /// resource's own id is bound to `observed` (the item itself for
    /// collections, so existing checks keep working while the full list
    /// accumulates).
    pub fn evaluate_ready(
        &self,
        resource: &CompiledResource,
        observed: &Value,
        iterator: &BTreeMap<String, Value>,
        ctx: &EvalContext,
    ) -> Result<bool> {
        if resource.ready_when.is_empty() {
            return Ok(true);
        }

        let mut extra = Map::new();
        extra.insert(resource.id.clone(), observed.clone());
        if resource.is_collection() {
            extra.insert(EACH_VARIABLE.to_string(), observed.clone());
        }
        for (name, value) in iterator {
            extra.insert(name.clone(), value.clone());
        }
        let bindings = ctx.bindings_with(&extra);

        for (i, check) in resource.ready_when.iter().enumerate() {
            let pointer = format!("/readyWhen/{i}");
            for source in &check.expressions {
                if !self
                    .engine
                    .eval_bool(&resource.id, &pointer, source, &bindings)?
                {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Evaluate the user's status projections against the final context.
    ///
    /// Projections over unready upstreams are skipped rather than failing the
    /// pass; the errors are returned for logging.
    pub fn project_status(&self, ctx: &EvalContext) -> (Value, Vec<Error>) {
        let bindings = ctx.bindings();
        let mut status = Value::Object(Map::new());
        let mut errors = Vec::new();

        for projection in &self.graph.projections {
            let result = match projection.expression.class {
                BindingClass::Typed => self.engine.eval_typed(
                    "status",
                    &projection.pointer,
                    &projection.expression.expressions[0],
                    &bindings,
                ),
                _ => self
                    .engine
                    .render(
                        "status",
                        &projection.pointer,
                        &projection.expression.raw,
                        &bindings,
                    )
                    .map(Value::String),
            };
            match result {
                Ok(value) => write_pointer(&mut status, &projection.pointer, value),
                Err(e) => errors.push(e),
            }
        }

        (status, errors)
    }
}

/// Write a value at a JSON pointer, creating intermediate objects
fn write_pointer(root: &mut Value, pointer: &str, value: Value) {
    let segments: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let Some(object) = current.as_object_mut() else {
            return;
        };
        if i == segments.len() - 1 {
            object.insert(segment.clone(), value);
            return;
        }
        current = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
