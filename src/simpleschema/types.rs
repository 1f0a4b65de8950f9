//! Compact type grammar
//!
//! A field spec is `type [| marker=value ...]`. Types are the primitives
//! `string`, `integer`, `boolean`, `number`, `float` (an alias of number),
//! the containers `[]T` and `map[string]T`, inline objects `{k: v, ...}`,
//! and named custom types resolved against the definition's `types:` map.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool,
};

use super::markers::{parse_markers, Marker};
use crate::error::Error;
use crate::Result;

/// Resolver for named custom types, implemented by the transformer
pub(crate) trait ResolveCustomType {
    /// Resolved schema for a custom type name
    fn resolve(&self, path: &str, name: &str) -> Result<JSONSchemaProps>;
}

/// A parsed compact type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimpleType {
    /// `string`
    String,
    /// `integer`
    Integer,
    /// `boolean`
    Boolean,
    /// `number` or `float`
    Number,
    /// `[]T`
    List(Box<SimpleType>),
    /// `map[string]T`
    Map(Box<SimpleType>),
    /// `{k: v, ...}` with field specs as values
    Object(Vec<(String, SimpleType)>),
    /// A named custom type from the `types:` map
    Custom(String),
}

impl SimpleType {
    /// Custom type names this type refers to, transitively through containers
    pub fn deps(&self) -> Vec<String> {
        match self {
            SimpleType::Custom(name) => vec![name.clone()],
            SimpleType::List(inner) | SimpleType::Map(inner) => inner.deps(),
            SimpleType::Object(fields) => {
                fields.iter().flat_map(|(_, t)| t.deps()).collect()
            }
            _ => vec![],
        }
    }

    /// Build the structural schema for this type
    pub(crate) fn schema(&self, path: &str, resolver: &dyn ResolveCustomType) -> Result<JSONSchemaProps> {
        Ok(match self {
            SimpleType::String => atomic("string"),
            SimpleType::Integer => atomic("integer"),
            SimpleType::Boolean => atomic("boolean"),
            SimpleType::Number => atomic("number"),
            SimpleType::List(inner) => JSONSchemaProps {
                type_: Some("array".to_string()),
                items: Some(JSONSchemaPropsOrArray::Schema(Box::new(
                    inner.schema(path, resolver)?,
                ))),
                ..Default::default()
            },
            SimpleType::Map(inner) => JSONSchemaProps {
                type_: Some("object".to_string()),
                additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(
                    inner.schema(path, resolver)?,
                ))),
                ..Default::default()
            },
            SimpleType::Object(fields) => {
                let mut properties = std::collections::BTreeMap::new();
                for (name, typ) in fields {
                    let child_path = format!("{path}.{name}");
                    properties.insert(name.clone(), typ.schema(&child_path, resolver)?);
                }
                JSONSchemaProps {
                    type_: Some("object".to_string()),
                    properties: Some(properties),
                    ..Default::default()
                }
            }
            SimpleType::Custom(name) => resolver.resolve(path, name)?,
        })
    }
}

fn atomic(type_: &str) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some(type_.to_string()),
        ..Default::default()
    }
}

/// Parse a full field spec into its type and markers.
///
/// The `|` separator is found at top level only: pipes inside quotes,
/// braces, or brackets belong to the type or marker value.
pub fn parse_field(path: &str, input: &str) -> Result<(SimpleType, Vec<Marker>)> {
    let (type_part, marker_part) = split_top_level_pipe(input);
    let typ = parse_type(path, type_part.trim())?;
    let markers = match marker_part {
        Some(tail) => parse_markers(path, tail.trim())?,
        None => vec![],
    };
    Ok((typ, markers))
}

fn split_top_level_pipe(input: &str) -> (&str, Option<&str>) {
    let mut in_quotes = false;
    let mut depth = 0i32;
    for (i, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '{' | '[' if !in_quotes => depth += 1,
            '}' | ']' if !in_quotes => depth -= 1,
            '|' if !in_quotes && depth == 0 => {
                return (&input[..i], Some(&input[i + 1..]));
            }
            _ => {}
        }
    }
    (input, None)
}

/// Parse a compact type expression
pub(crate) fn parse_type(path: &str, input: &str) -> Result<SimpleType> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::schema(path, "empty type"));
    }

    if let Some(rest) = input.strip_prefix("[]") {
        return Ok(SimpleType::List(Box::new(parse_type(path, rest)?)));
    }
    if let Some(rest) = input.strip_prefix("map[string]") {
        return Ok(SimpleType::Map(Box::new(parse_type(path, rest)?)));
    }
    if input.starts_with('{') {
        if !input.ends_with('}') {
            return Err(Error::schema(path, format!("unterminated inline object: {input}")));
        }
        return parse_inline_object(path, &input[1..input.len() - 1]);
    }

    Ok(match input {
        "string" => SimpleType::String,
        "integer" => SimpleType::Integer,
        "boolean" => SimpleType::Boolean,
        "number" | "float" => SimpleType::Number,
        name if is_custom_type_name(name) => SimpleType::Custom(name.to_string()),
        other => {
            return Err(Error::schema(path, format!("unknown type: {other}")));
        }
    })
}

/// Custom types are PascalCase identifiers
fn is_custom_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

fn parse_inline_object(path: &str, body: &str) -> Result<SimpleType> {
    let mut fields = Vec::new();
    for part in split_top_level_commas(body) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, typ) = part.split_once(':').ok_or_else(|| {
            Error::schema(path, format!("inline object field '{part}' is missing ':'"))
        })?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::schema(path, "inline object field with empty name"));
        }
        let child_path = format!("{path}.{name}");
        fields.push((name, parse_type(&child_path, typ)?));
    }
    if fields.is_empty() {
        return Err(Error::schema(path, "inline object with no fields"));
    }
    Ok(SimpleType::Object(fields))
}

fn split_top_level_commas(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '{' | '[' if !in_quotes => depth += 1,
            '}' | ']' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}
