//! Conversion of SQLite values into driver rows.

use rusqlite::types::ValueRef;
use serde_json::Value as JsonValue;
use strata_migrate::Row;

/// Convert a SQLite value to JSON.
///
/// Text is passed through unchanged, so JSON stored in a text column stays a
/// string. Blobs that are not UTF-8 are hex-encoded.
pub fn from_sqlite_value(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => JsonValue::String(hex::encode(bytes)),
        },
    }
}

/// Get a JSON value from a row at the given column index.
pub fn get_value_at_index(row: &rusqlite::Row<'_>, index: usize) -> JsonValue {
    row.get_ref(index)
        .map(from_sqlite_value)
        .unwrap_or(JsonValue::Null)
}

/// Convert a result row, keeping column order.
pub fn to_row(row: &rusqlite::Row<'_>, columns: &[String]) -> Row {
    let values = (0..columns.len())
        .map(|i| get_value_at_index(row, i))
        .collect();
    Row::new(columns.to_vec(), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scalars() {
        assert_eq!(from_sqlite_value(ValueRef::Null), JsonValue::Null);
        assert_eq!(from_sqlite_value(ValueRef::Integer(42)), JsonValue::Number(42.into()));
        assert_eq!(from_sqlite_value(ValueRef::Real(f64::NAN)), JsonValue::Null);
        assert_eq!(
            from_sqlite_value(ValueRef::Text(b"hello")),
            JsonValue::String("hello".to_string())
        );
    }

    #[test]
    fn test_json_text_stays_text() {
        let value = from_sqlite_value(ValueRef::Text(b"[{\"dropTable\":{}}]"));
        assert_eq!(value, JsonValue::String("[{\"dropTable\":{}}]".to_string()));
    }

    #[test]
    fn test_binary_blob_is_hex() {
        let value = from_sqlite_value(ValueRef::Blob(&[0xff, 0x00, 0x10]));
        assert_eq!(value, JsonValue::String("ff0010".to_string()));
    }
}
