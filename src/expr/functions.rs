//! Custom expression library
//!
//! The structural helpers graph expressions rely on: `has` for presence
//! checks over possibly-unobserved resources, `size` for lists, maps, and
//! strings, and `orValue` as the fallback filter for optional values.

use minijinja::{Error, ErrorKind, Value};

/// `has(x)` - true when the value is present (neither undefined nor null)
pub fn has(value: Value) -> bool {
    !(value.is_undefined() || value.is_none())
}

/// `size(x)` - element count of a list or map, byte length of a string
pub fn size(value: Value) -> Result<Value, Error> {
    match value.len() {
        Some(len) => Ok(Value::from(len)),
        None => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("size() expects a list, map, or string, got {}", value.kind()),
        )),
    }
}

/// `x | orValue(fallback)` - fallback for undefined or null values
pub fn or_value(value: Value, fallback: Value) -> Value {
    if value.is_undefined() || value.is_none() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_with_value() {
        assert!(has(Value::from("x")));
        assert!(has(Value::from(0)));
        assert!(has(Value::from(false)));
    }

    #[test]
    fn test_has_with_absent() {
        assert!(!has(Value::UNDEFINED));
        assert!(!has(Value::from(())));
    }

    #[test]
    fn test_size_of_list() {
        let value = Value::from(vec![1, 2, 3]);
        assert_eq!(size(value).unwrap(), Value::from(3));
    }

    #[test]
    fn test_size_of_string() {
        assert_eq!(size(Value::from("abc")).unwrap(), Value::from(3));
    }

    #[test]
    fn test_size_of_number_is_error() {
        assert!(size(Value::from(42)).is_err());
    }

    #[test]
    fn test_or_value_keeps_present() {
        assert_eq!(
            or_value(Value::from("x"), Value::from("y")),
            Value::from("x")
        );
        // empty string is a present value
        assert_eq!(or_value(Value::from(""), Value::from("y")), Value::from(""));
    }

    #[test]
    fn test_or_value_replaces_absent() {
        assert_eq!(
            or_value(Value::UNDEFINED, Value::from("y")),
            Value::from("y")
        );
        assert_eq!(
            or_value(Value::from(()), Value::from("y")),
            Value::from("y")
        );
    }
}
