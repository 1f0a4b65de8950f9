//! Expression extraction, typed environment, and the expression engine
//!
//! Resource templates interleave plain values with `${...}` expressions. This
//! module finds those expressions ([`extract`]), embeds the host expression
//! language behind a small compile/free-variables/eval seam ([`engine`]), and
//! models the typed variable scope an expression compiles against
//! ([`environment`]).

pub mod engine;
pub mod environment;
pub mod extract;
mod functions;

pub use engine::{CompiledExpression, ExpressionEngine};
pub use environment::{
    element_type, instance_variable_schema, list_of, metadata_schema, PathType, TypedEnvironment,
};
pub use extract::{extract_fields, parse_segments, BindingClass, ExtractedField, Segment};
