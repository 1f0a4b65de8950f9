//! Expression engine
//!
//! Embeds the host expression language behind the three operations the rest
//! of the system needs: compile (validate + free variables), eval of a typed
//! expression, and rendering of an interpolated string. The engine is
//! configured with `${...}` variable delimiters and chainable undefined
//! behavior, which gives expressions null-safe field access: `vpc.status.id`
//! stays absent instead of failing when `vpc` has not been observed yet.
//!
//! Stringification in rendered output is canonical: booleans render as
//! `true`/`false`, integers in decimal, floats in their shortest decimal
//! form, strings unquoted.

use std::collections::BTreeSet;

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior, Value};

use super::extract::{classify, parse_segments, BindingClass, Segment};
use super::functions;
use crate::error::Error;
use crate::Result;

/// A validated expression field with its free-variable sets.
///
/// `raw` is the full field string (`${...}` included); `expressions` are the
/// inner sources. `variables` holds top-level free variables for dependency
/// inference; `paths` holds dotted access paths for type checking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledExpression {
    /// The full original field string
    pub raw: String,
    /// Binding class of the field
    pub class: BindingClass,
    /// Inner expression sources in order of appearance
    pub expressions: Vec<String>,
    /// Top-level free variables across all inner expressions
    pub variables: BTreeSet<String>,
    /// Dotted access paths across all inner expressions
    pub paths: BTreeSet<String>,
}

/// Names resolved by the engine itself rather than the evaluation context:
/// the custom library plus the host's builtin globals. These never count as
/// free variables.
const BUILTIN_GLOBALS: [&str; 6] = ["has", "size", "range", "dict", "debug", "namespace"];

/// The expression-language embedding
pub struct ExpressionEngine {
    env: Environment<'static>,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEngine {
    /// Create an engine with `${...}` syntax and the custom library installed.
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded syntax configuration fails to build, which
    /// indicates a library incompatibility rather than a runtime condition.
    pub fn new() -> Self {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .expect("expression syntax configuration is hardcoded and valid");

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        env.add_function("has", functions::has);
        env.add_function("size", functions::size);
        env.add_filter("orValue", functions::or_value);
        env.add_filter("default", functions::or_value);

        Self { env }
    }

    /// Validate a raw field string and collect its free variables.
    ///
    /// `resource` and `path` provide error context only.
    pub fn compile(&self, resource: &str, path: &str, raw: &str) -> Result<CompiledExpression> {
        let segments =
            parse_segments(raw).map_err(|msg| Error::expression(resource, path, msg))?;
        let class = classify(&segments);
        let expressions: Vec<String> = segments
            .into_iter()
            .filter_map(|seg| match seg {
                Segment::Expression(e) => Some(e),
                Segment::Literal(_) => None,
            })
            .collect();

        let mut variables = BTreeSet::new();
        let mut paths = BTreeSet::new();
        for source in &expressions {
            let expr = self
                .env
                .compile_expression(source)
                .map_err(|e| Error::expression(resource, path, e.to_string()))?;
            variables.extend(expr.undeclared_variables(false));
            paths.extend(expr.undeclared_variables(true));
        }
        for builtin in BUILTIN_GLOBALS {
            variables.remove(builtin);
        }

        Ok(CompiledExpression {
            raw: raw.to_string(),
            class,
            expressions,
            variables,
            paths,
        })
    }

    /// Evaluate a single expression source to a value
    pub fn eval(
        &self,
        resource: &str,
        path: &str,
        source: &str,
        ctx: &Value,
    ) -> Result<Value> {
        let expr = self
            .env
            .compile_expression(source)
            .map_err(|e| Error::expression(resource, path, e.to_string()))?;
        expr.eval(ctx.clone())
            .map_err(|e| Error::evaluation(resource, path, e.to_string()))
    }

    /// Evaluate a typed binding to JSON.
    ///
    /// An absent result (the expression resolved through a missing variable
    /// without `orValue`) is an evaluation error: typed bindings must produce
    /// a value.
    pub fn eval_typed(
        &self,
        resource: &str,
        path: &str,
        source: &str,
        ctx: &Value,
    ) -> Result<serde_json::Value> {
        let value = self.eval(resource, path, source, ctx)?;
        if value.is_undefined() {
            return Err(Error::evaluation(
                resource,
                path,
                format!("expression '{source}' produced no value"),
            ));
        }
        serde_json::to_value(&value).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Render an interpolated field to a string.
    ///
    /// Inner expressions resolving to absent values are an error: silent
    /// empty interpolation hides missing upstream data.
    pub fn render(&self, resource: &str, path: &str, raw: &str, ctx: &Value) -> Result<String> {
        let segments =
            parse_segments(raw).map_err(|msg| Error::expression(resource, path, msg))?;
        let mut out = String::with_capacity(raw.len());
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(&text),
                Segment::Expression(source) => {
                    let value = self.eval(resource, path, &source, ctx)?;
                    if value.is_undefined() || value.is_none() {
                        return Err(Error::evaluation(
                            resource,
                            path,
                            format!("expression '{source}' produced no value"),
                        ));
                    }
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Evaluate a boolean guard expression (includeWhen / readyWhen).
    ///
    /// Absent values are false, matching optional access over unobserved
    /// resources.
    pub fn eval_bool(&self, resource: &str, path: &str, source: &str, ctx: &Value) -> Result<bool> {
        let value = self.eval(resource, path, source, ctx)?;
        Ok(value.is_true())
    }

    /// Build an evaluation context from JSON bindings
    pub fn context(bindings: &serde_json::Map<String, serde_json::Value>) -> Value {
        Value::from_serialize(bindings)
    }
}
