//! Marker parsing and application
//!
//! Markers are the `| marker=value ...` tail of a compact field spec. Each
//! maps onto an OpenAPI schema attribute: `required` feeds the parent's
//! required list, `default` becomes a structural default, `validation`
//! becomes an x-kubernetes validation rule, and so on. Marker values may be
//! quoted (with backslash escapes) or bracketed JSON literals.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, ValidationRule, JSON,
};
use regex::Regex;

use crate::error::Error;
use crate::Result;

/// The kind of a schema marker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerKind {
    /// `required=true` - parent's required set includes this field
    Required,
    /// `default=<v>` - structural default
    Default,
    /// `description="..."` - passthrough
    Description,
    /// `minimum=<float>` - numeric lower bound
    Minimum,
    /// `maximum=<float>` - numeric upper bound
    Maximum,
    /// `validation="<expr>"` - rule evaluated by the API server
    Validation,
    /// `enum=v1,v2,...` - literal list for strings and integers
    Enum,
    /// `immutable=true` - adds the rule `self == oldSelf`
    Immutable,
    /// `pattern="<regex>"` - string pattern, compiled at build time
    Pattern,
    /// `uniqueItems=true` - marks a list as a set
    UniqueItems,
    /// `minLength=<int>` - string lower length bound
    MinLength,
    /// `maxLength=<int>` - string upper length bound
    MaxLength,
    /// `minItems=<int>` - array lower size bound
    MinItems,
    /// `maxItems=<int>` - array upper size bound
    MaxItems,
}

impl MarkerKind {
    fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "required" => Self::Required,
            "default" => Self::Default,
            "description" => Self::Description,
            "minimum" => Self::Minimum,
            "maximum" => Self::Maximum,
            "validation" => Self::Validation,
            "enum" => Self::Enum,
            "immutable" => Self::Immutable,
            "pattern" => Self::Pattern,
            "uniqueItems" => Self::UniqueItems,
            "minLength" => Self::MinLength,
            "maxLength" => Self::MaxLength,
            "minItems" => Self::MinItems,
            "maxItems" => Self::MaxItems,
            _ => return None,
        })
    }
}

/// A single parsed marker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    /// What the marker means
    pub kind: MarkerKind,
    /// Its raw (unquoted, unescaped) value
    pub value: String,
}

/// Parse a marker tail like `required=true description="the name"`.
///
/// The scanner tracks quoted substrings and bracket depth so values may
/// contain spaces, `=`, and JSON literals.
pub fn parse_markers(path: &str, input: &str) -> Result<Vec<Marker>> {
    let mut result = Vec::new();
    let mut current: Option<MarkerKind> = None;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut bracket_depth = 0i32;
    let mut buffer = String::new();

    for ch in input.chars() {
        match ch {
            '=' if current.is_none() && !in_quotes && bracket_depth == 0 => {
                let key = buffer.trim().to_string();
                if key.is_empty() {
                    return Err(Error::schema(path, "empty marker key"));
                }
                let kind = MarkerKind::from_key(&key)
                    .ok_or_else(|| Error::schema(path, format!("unknown marker '{key}'")))?;
                current = Some(kind);
                buffer.clear();
            }
            '"' if !escaped => {
                in_quotes = !in_quotes;
                buffer.push(ch);
            }
            '\\' if in_quotes && !escaped => {
                escaped = true;
                buffer.push(ch);
            }
            '{' | '[' if !in_quotes => {
                bracket_depth += 1;
                buffer.push(ch);
            }
            '}' | ']' if !in_quotes => {
                bracket_depth -= 1;
                if bracket_depth < 0 {
                    return Err(Error::schema(path, "unmatched closing bracket in marker"));
                }
                buffer.push(ch);
            }
            c if c.is_whitespace() && !in_quotes && bracket_depth == 0 => {
                if let Some(kind) = current.take() {
                    result.push(Marker {
                        kind,
                        value: process_value(&buffer),
                    });
                    buffer.clear();
                }
            }
            c => {
                if escaped {
                    escaped = false;
                }
                buffer.push(c);
            }
        }
    }

    if let Some(kind) = current.take() {
        result.push(Marker {
            kind,
            value: process_value(&buffer),
        });
    }

    if in_quotes {
        return Err(Error::schema(path, "unclosed quote in marker"));
    }
    if bracket_depth > 0 {
        return Err(Error::schema(path, "unclosed bracket in marker"));
    }

    Ok(result)
}

/// Strip surrounding quotes and resolve escapes; trim bare values.
fn process_value(value: &str) -> String {
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        unescape(&value[1..value.len() - 1])
    } else {
        value.trim().to_string()
    }
}

fn unescape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            if ch != '"' && ch != '\\' {
                result.push('\\');
            }
            result.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            result.push(ch);
        }
    }
    result
}

fn schema_type(schema: &JSONSchemaProps) -> &str {
    schema.type_.as_deref().unwrap_or("")
}

fn parse_i64(path: &str, kind: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| Error::schema(path, format!("invalid {kind} value '{value}': {e}")))
}

fn parse_f64(path: &str, kind: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|e| Error::schema(path, format!("invalid {kind} value '{value}': {e}")))
}

fn parse_bool(path: &str, kind: &str, value: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .map_err(|e| Error::schema(path, format!("invalid {kind} value '{value}': {e}")))
}

/// Apply markers to a field schema.
///
/// Markers are strictly type-checked against the field's type; a mismatch
/// (e.g. `minLength` on an integer) is a hard error. `required=true` never
/// touches the field schema itself: it appends the field name to `parent`'s
/// required list.
pub fn apply_markers(
    path: &str,
    schema: &mut JSONSchemaProps,
    markers: &[Marker],
    key: &str,
    parent: &mut JSONSchemaProps,
) -> Result<()> {
    for marker in markers {
        match marker.kind {
            MarkerKind::Required => {
                if parse_bool(path, "required", &marker.value)? {
                    parent
                        .required
                        .get_or_insert_with(Vec::new)
                        .push(key.to_string());
                }
            }
            MarkerKind::Default => {
                schema.default = Some(JSON(default_value(path, schema, &marker.value)?));
            }
            MarkerKind::Description => {
                schema.description = Some(marker.value.clone());
            }
            MarkerKind::Minimum => {
                if !matches!(schema_type(schema), "integer" | "number") {
                    return Err(Error::schema(
                        path,
                        format!(
                            "minimum marker is only valid for numeric types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                schema.minimum = Some(parse_f64(path, "minimum", &marker.value)?);
            }
            MarkerKind::Maximum => {
                if !matches!(schema_type(schema), "integer" | "number") {
                    return Err(Error::schema(
                        path,
                        format!(
                            "maximum marker is only valid for numeric types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                schema.maximum = Some(parse_f64(path, "maximum", &marker.value)?);
            }
            MarkerKind::Validation => {
                if marker.value.trim().is_empty() {
                    return Err(Error::schema(path, "validation marker value cannot be empty"));
                }
                schema
                    .x_kubernetes_validations
                    .get_or_insert_with(Vec::new)
                    .push(ValidationRule {
                        rule: marker.value.clone(),
                        message: Some("validation failed".to_string()),
                        ..Default::default()
                    });
            }
            MarkerKind::Immutable => {
                if parse_bool(path, "immutable", &marker.value)? {
                    schema
                        .x_kubernetes_validations
                        .get_or_insert_with(Vec::new)
                        .push(ValidationRule {
                            rule: "self == oldSelf".to_string(),
                            message: Some("field is immutable".to_string()),
                            ..Default::default()
                        });
                }
            }
            MarkerKind::Enum => {
                let mut values = Vec::new();
                for raw in marker.value.split(',') {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        return Err(Error::schema(path, "empty enum values are not allowed"));
                    }
                    let json = match schema_type(schema) {
                        "string" => serde_json::Value::String(raw.to_string()),
                        "integer" => serde_json::Value::from(parse_i64(path, "enum", raw)?),
                        other => {
                            return Err(Error::schema(
                                path,
                                format!(
                                    "enum values only supported for string and integer types, got type: {other}"
                                ),
                            ))
                        }
                    };
                    values.push(JSON(json));
                }
                if !values.is_empty() {
                    schema.enum_ = Some(values);
                }
            }
            MarkerKind::Pattern => {
                if marker.value.is_empty() {
                    return Err(Error::schema(path, "pattern marker value cannot be empty"));
                }
                if schema_type(schema) != "string" {
                    return Err(Error::schema(
                        path,
                        format!(
                            "pattern marker is only valid for string types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                Regex::new(&marker.value)
                    .map_err(|e| Error::schema(path, format!("invalid pattern regex: {e}")))?;
                schema.pattern = Some(marker.value.clone());
            }
            MarkerKind::UniqueItems => {
                if schema_type(schema) != "array" {
                    return Err(Error::schema(
                        path,
                        format!(
                            "uniqueItems marker is only valid for array types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                if parse_bool(path, "uniqueItems", &marker.value)? {
                    // uniqueItems itself is forbidden on CRDs; list-type set is
                    // the supported way to declare a set
                    schema.x_kubernetes_list_type = Some("set".to_string());
                }
            }
            MarkerKind::MinLength => {
                if schema_type(schema) != "string" {
                    return Err(Error::schema(
                        path,
                        format!(
                            "minLength marker is only valid for string types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                schema.min_length = Some(parse_i64(path, "minLength", &marker.value)?);
            }
            MarkerKind::MaxLength => {
                if schema_type(schema) != "string" {
                    return Err(Error::schema(
                        path,
                        format!(
                            "maxLength marker is only valid for string types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                schema.max_length = Some(parse_i64(path, "maxLength", &marker.value)?);
            }
            MarkerKind::MinItems => {
                if schema_type(schema) != "array" {
                    return Err(Error::schema(
                        path,
                        format!(
                            "minItems marker is only valid for array types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                schema.min_items = Some(parse_i64(path, "minItems", &marker.value)?);
            }
            MarkerKind::MaxItems => {
                if schema_type(schema) != "array" {
                    return Err(Error::schema(
                        path,
                        format!(
                            "maxItems marker is only valid for array types, got type: {}",
                            schema_type(schema)
                        ),
                    ));
                }
                schema.max_items = Some(parse_i64(path, "maxItems", &marker.value)?);
            }
        }
    }
    Ok(())
}

/// Interpret a default marker value according to the field type
fn default_value(path: &str, schema: &JSONSchemaProps, value: &str) -> Result<serde_json::Value> {
    Ok(match schema_type(schema) {
        "string" => serde_json::Value::String(value.to_string()),
        "integer" => serde_json::Value::from(parse_i64(path, "default", value)?),
        "number" => serde_json::Value::from(parse_f64(path, "default", value)?),
        "boolean" => serde_json::Value::Bool(parse_bool(path, "default", value)?),
        _ => serde_json::from_str(value)
            .map_err(|e| Error::schema(path, format!("invalid default value '{value}': {e}")))?,
    })
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

    fn integer_schema() -> JSONSchemaProps {
        JSONSchemaProps {
            type_: Some("integer".to_string()),
            ..Default::default()
        }
    }

    fn array_schema() -> JSONSchemaProps {
        JSONSchemaProps {
            type_: Some("array".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_simple_markers() {
        let markers = parse_markers("spec.name", "required=true default=foo").unwrap();
        assert_eq!(
            markers,
            vec![
                Marker {
                    kind: MarkerKind::Required,
                    value: "true".to_string()
                },
                Marker {
                    kind: MarkerKind::Default,
                    value: "foo".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_quoted_value_with_spaces() {
        let markers =
            parse_markers("spec.name", r#"description="The name of the resource""#).unwrap();
        assert_eq!(markers[0].value, "The name of the resource");
    }

    #[test]
    fn test_parse_quoted_value_with_escapes() {
        let markers = parse_markers("spec.name", r#"description="say \"hi\"""#).unwrap();
        assert_eq!(markers[0].value, r#"say "hi""#);
    }

    #[test]
    fn test_parse_bracketed_default() {
        let markers = parse_markers("spec.tags", r#"default=["a","b"]"#).unwrap();
        assert_eq!(markers[0].value, r#"["a","b"]"#);
    }

    #[test]
    fn test_parse_unknown_marker_rejected() {
        let err = parse_markers("spec.name", "shiny=true").unwrap_err();
        assert!(err.to_string().contains("unknown marker"));
    }

    #[test]
    fn test_parse_unclosed_quote_rejected() {
        let err = parse_markers("spec.name", r#"description="oops"#).unwrap_err();
        assert!(err.to_string().contains("unclosed quote"));
    }

    #[test]
    fn test_required_feeds_parent() {
        let mut schema = string_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.name", "required=true").unwrap();
        apply_markers("spec.name", &mut schema, &markers, "name", &mut parent).unwrap();
        assert_eq!(parent.required, Some(vec!["name".to_string()]));
        assert!(schema.required.is_none());
    }

    #[test]
    fn test_string_default_stays_string() {
        let mut schema = string_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.name", "default=web").unwrap();
        apply_markers("spec.name", &mut schema, &markers, "name", &mut parent).unwrap();
        assert_eq!(schema.default, Some(JSON(serde_json::json!("web"))));
    }

    #[test]
    fn test_integer_default_parses() {
        let mut schema = integer_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.replicas", "default=3").unwrap();
        apply_markers("spec.replicas", &mut schema, &markers, "replicas", &mut parent).unwrap();
        assert_eq!(schema.default, Some(JSON(serde_json::json!(3))));
    }

    #[test]
    fn test_min_length_on_integer_rejected() {
        let mut schema = integer_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.replicas", "minLength=3").unwrap();
        let err = apply_markers("spec.replicas", &mut schema, &markers, "replicas", &mut parent)
            .unwrap_err();
        assert!(err.to_string().contains("only valid for string"));
    }

    #[test]
    fn test_unique_items_sets_list_type() {
        let mut schema = array_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.tags", "uniqueItems=true").unwrap();
        apply_markers("spec.tags", &mut schema, &markers, "tags", &mut parent).unwrap();
        assert_eq!(schema.x_kubernetes_list_type, Some("set".to_string()));
    }

    #[test]
    fn test_unique_items_on_string_rejected() {
        let mut schema = string_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.name", "uniqueItems=true").unwrap();
        let err =
            apply_markers("spec.name", &mut schema, &markers, "name", &mut parent).unwrap_err();
        assert!(err.to_string().contains("only valid for array"));
    }

    #[test]
    fn test_immutable_adds_validation_rule() {
        let mut schema = string_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.region", "immutable=true").unwrap();
        apply_markers("spec.region", &mut schema, &markers, "region", &mut parent).unwrap();
        let rules = schema.x_kubernetes_validations.unwrap();
        assert_eq!(rules[0].rule, "self == oldSelf");
    }

    #[test]
    fn test_enum_string_values() {
        let mut schema = string_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.tier", "enum=web,api,worker").unwrap();
        apply_markers("spec.tier", &mut schema, &markers, "tier", &mut parent).unwrap();
        let values = schema.enum_.unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], JSON(serde_json::json!("web")));
    }

    #[test]
    fn test_enum_integer_values_validated() {
        let mut schema = integer_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.port", "enum=80,443,notanint").unwrap();
        let err =
            apply_markers("spec.port", &mut schema, &markers, "port", &mut parent).unwrap_err();
        assert!(err.to_string().contains("invalid enum value"));
    }

    #[test]
    fn test_pattern_validated_at_build_time() {
        let mut schema = string_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.name", r#"pattern="[a-z""#);
        // unclosed bracket caught by scanner
        assert!(markers.is_err() || {
            let markers = markers.unwrap();
            apply_markers("spec.name", &mut schema, &markers, "name", &mut parent).is_err()
        });
    }

    #[test]
    fn test_pattern_stored_verbatim() {
        let mut schema = string_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.name", r#"pattern="^[a-z]+$""#).unwrap();
        apply_markers("spec.name", &mut schema, &markers, "name", &mut parent).unwrap();
        assert_eq!(schema.pattern, Some("^[a-z]+$".to_string()));
    }

    #[test]
    fn test_numeric_bounds() {
        let mut schema = integer_schema();
        let mut parent = JSONSchemaProps::default();
        let markers = parse_markers("spec.replicas", "minimum=1 maximum=10").unwrap();
        apply_markers("spec.replicas", &mut schema, &markers, "replicas", &mut parent).unwrap();
        assert_eq!(schema.minimum, Some(1.0));
        assert_eq!(schema.maximum, Some(10.0));
    }
}
