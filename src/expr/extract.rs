//! `${...}` extraction
//!
//! Scans arbitrary JSON-like values for expression segments. The scanner
//! respects balanced braces and quoted substrings, so an expression body may
//! contain its own `{`/`}` and string literals. `$${...}` escapes to a
//! literal `${...}`.

use serde_json::Value;

use crate::error::Error;
use crate::Result;

/// One piece of a scanned string
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Literal text, kept as-is
    Literal(String),
    /// The body of one `${...}` occurrence
    Expression(String),
}

/// How a field's value is produced at runtime
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingClass {
    /// No expressions; the value is used verbatim
    Literal,
    /// Exactly one `${...}` spanning the whole string; the expression's
    /// result type becomes the field's runtime type
    Typed,
    /// Expressions mixed with text (or several expressions); every result is
    /// stringified into the surrounding text
    Interpolated,
}

/// A string field containing at least one expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedField {
    /// JSON pointer of the field within the scanned value
    pub pointer: String,
    /// The raw string, `${...}` included
    pub raw: String,
    /// Binding class derived from the raw string
    pub class: BindingClass,
    /// Inner expression sources, in order of appearance
    pub expressions: Vec<String>,
}

/// Split a raw string into literal and expression segments.
///
/// Returns an error message for unterminated expressions; callers attach
/// resource and path context.
pub fn parse_segments(input: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        // `$${` escapes to a literal `${`
        if chars[i] == '$' && i + 2 < chars.len() && chars[i + 1] == '$' && chars[i + 2] == '{' {
            literal.push_str("${");
            i += 3;
            // copy the escaped body verbatim up to its closing brace
            let mut depth = 1;
            while i < chars.len() && depth > 0 {
                match chars[i] {
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    _ => {}
                }
                if depth > 0 {
                    literal.push(chars[i]);
                } else {
                    literal.push('}');
                }
                i += 1;
            }
            continue;
        }

        if chars[i] == '$' && i + 1 < chars.len() && chars[i + 1] == '{' {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            i += 2;
            let mut body = String::new();
            let mut depth = 1;
            let mut quote: Option<char> = None;
            let mut escaped = false;
            while i < chars.len() {
                let c = chars[i];
                match quote {
                    Some(q) => {
                        if escaped {
                            escaped = false;
                        } else if c == '\\' {
                            escaped = true;
                        } else if c == q {
                            quote = None;
                        }
                    }
                    None => match c {
                        '\'' | '"' => quote = Some(c),
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    },
                }
                body.push(c);
                i += 1;
            }
            if depth != 0 {
                return Err(format!("unterminated expression in '{input}'"));
            }
            i += 1; // consume the closing brace
            let body = body.trim().to_string();
            if body.is_empty() {
                return Err(format!("empty expression in '{input}'"));
            }
            segments.push(Segment::Expression(body));
            continue;
        }

        literal.push(chars[i]);
        i += 1;
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

/// Derive the binding class from scanned segments
pub fn classify(segments: &[Segment]) -> BindingClass {
    let expressions = segments
        .iter()
        .filter(|s| matches!(s, Segment::Expression(_)))
        .count();
    match expressions {
        0 => BindingClass::Literal,
        1 if segments.len() == 1 => BindingClass::Typed,
        _ => BindingClass::Interpolated,
    }
}

/// Walk a JSON-like value and collect every string field carrying expressions.
///
/// Pointers follow RFC 6901 (`/spec/containers/0/image`). `resource` is used
/// for error context only.
pub fn extract_fields(resource: &str, value: &Value) -> Result<Vec<ExtractedField>> {
    let mut fields = Vec::new();
    walk(resource, value, String::new(), &mut fields)?;
    Ok(fields)
}

fn walk(
    resource: &str,
    value: &Value,
    pointer: String,
    fields: &mut Vec<ExtractedField>,
) -> Result<()> {
    match value {
        Value::String(s) => {
            if !s.contains("${") {
                return Ok(());
            }
            let segments = parse_segments(s)
                .map_err(|msg| Error::expression(resource, &pointer, msg))?;
            let class = classify(&segments);
            if class == BindingClass::Literal {
                // only escaped `$${...}` occurrences; nothing to bind
                return Ok(());
            }
            let expressions = segments
                .into_iter()
                .filter_map(|seg| match seg {
                    Segment::Expression(e) => Some(e),
                    Segment::Literal(_) => None,
                })
                .collect();
            fields.push(ExtractedField {
                pointer,
                raw: s.clone(),
                class,
                expressions,
            });
        }
        Value::Object(map) => {
            for (key, child) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                walk(resource, child, format!("{pointer}/{escaped}"), fields)?;
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(resource, child, format!("{pointer}/{i}"), fields)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_string_is_literal() {
        let segments = parse_segments("plain text").unwrap();
        assert_eq!(segments, vec![Segment::Literal("plain text".to_string())]);
        assert_eq!(classify(&segments), BindingClass::Literal);
    }

    #[test]
    fn test_single_expression_is_typed() {
        let segments = parse_segments("${schema.spec.name}").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Expression("schema.spec.name".to_string())]
        );
        assert_eq!(classify(&segments), BindingClass::Typed);
    }

    #[test]
    fn test_mixed_is_interpolated() {
        let segments = parse_segments("${name}-${value}").unwrap();
        assert_eq!(classify(&segments), BindingClass::Interpolated);

        let segments = parse_segments("prefix-${name}").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("prefix-".to_string()),
                Segment::Expression("name".to_string()),
            ]
        );
        assert_eq!(classify(&segments), BindingClass::Interpolated);
    }

    #[test]
    fn test_nested_braces_in_expression() {
        let segments = parse_segments(r#"${items | map(attribute="x") | list}"#).unwrap();
        assert_eq!(segments.len(), 1);

        let segments = parse_segments("${ {'a': 1}['a'] }").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Expression("{'a': 1}['a']".to_string())]
        );
    }

    #[test]
    fn test_quoted_brace_in_expression() {
        let segments = parse_segments(r#"${name ~ "}"}"#).unwrap();
        assert_eq!(segments, vec![Segment::Expression(r#"name ~ "}""#.to_string())]);
    }

    #[test]
    fn test_escape_produces_literal() {
        let segments = parse_segments("$${HOME}").unwrap();
        assert_eq!(segments, vec![Segment::Literal("${HOME}".to_string())]);
        assert_eq!(classify(&segments), BindingClass::Literal);
    }

    #[test]
    fn test_escape_mixed_with_expression() {
        let segments = parse_segments("echo $${VAR}; app=${name}").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("echo ${VAR}; app=".to_string()),
                Segment::Expression("name".to_string()),
            ]
        );
    }

    #[test]
    fn test_unterminated_expression_rejected() {
        assert!(parse_segments("${oops").is_err());
        assert!(parse_segments("${a + {b}").is_err());
    }

    #[test]
    fn test_empty_expression_rejected() {
        assert!(parse_segments("${}").is_err());
        assert!(parse_segments("${  }").is_err());
    }

    #[test]
    fn test_extract_fields_from_template() {
        let template = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "${schema.spec.name}-cm"},
            "data": {
                "version": "${db.data.version}",
                "static": "unchanged",
            },
        });

        let fields = extract_fields("app", &template).unwrap();
        assert_eq!(fields.len(), 2);

        let by_pointer = |p: &str| fields.iter().find(|f| f.pointer == p).unwrap();
        let name = by_pointer("/metadata/name");
        assert_eq!(name.class, BindingClass::Interpolated);
        assert_eq!(name.expressions, vec!["schema.spec.name".to_string()]);

        let version = by_pointer("/data/version");
        assert_eq!(version.class, BindingClass::Typed);
    }

    #[test]
    fn test_extract_fields_in_arrays() {
        let template = json!({
            "spec": {"containers": [{"image": "${schema.spec.image}"}]},
        });
        let fields = extract_fields("app", &template).unwrap();
        assert_eq!(fields[0].pointer, "/spec/containers/0/image");
        assert_eq!(fields[0].class, BindingClass::Typed);
    }

    #[test]
    fn test_extract_skips_non_strings() {
        let template = json!({"spec": {"replicas": 3, "enabled": true, "tags": null}});
        assert!(extract_fields("app", &template).unwrap().is_empty());
    }

    #[test]
    fn test_extract_error_carries_pointer() {
        let template = json!({"metadata": {"name": "${oops"}});
        let err = extract_fields("app", &template).unwrap_err();
        assert!(err.to_string().contains("/metadata/name"));
        assert!(err.to_string().contains("app"));
    }

    #[test]
    fn test_pointer_escaping_for_odd_keys() {
        let template = json!({"a/b": "${x}"});
        let fields = extract_fields("r", &template).unwrap();
        assert_eq!(fields[0].pointer, "/a~1b");
    }
}
