//! Column values and custom column codecs.
//!
//! Most fields marshal through plain scalar binding. Value types that cannot
//! round-trip that way (a geospatial point, for instance) implement
//! [`CustomColumn`], which hands the descriptor a [`ColumnCodec`] at
//! registration time. The codec rewrites the column in read queries and
//! produces the SQL expression and parameters used on write.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CodecError;

/// A scalar bound to, or read back from, a relational column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// SQL expression for one column in an INSERT or UPDATE, with its bound parameters.
///
/// Plain columns are `?` with a single parameter; codecs may wrap the
/// placeholder in a function call.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedColumn {
    pub expr: String,
    pub params: Vec<ColumnValue>,
}

impl EncodedColumn {
    /// A bare `?` placeholder bound to `value`.
    pub fn bound(value: ColumnValue) -> Self {
        Self {
            expr: "?".to_string(),
            params: vec![value],
        }
    }
}

/// Quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Capability for columns that need custom read/write SQL.
pub trait ColumnCodec: Send + Sync {
    /// Short name used in error messages.
    fn name(&self) -> &'static str;

    /// Select-list entry for `column`; must keep `column` as the result alias.
    fn select_clause(&self, column: &str) -> String;

    /// Write expression for the JSON form of the field.
    fn encode(&self, value: &JsonValue) -> Result<EncodedColumn, CodecError>;

    /// JSON form of the stored column. Unreadable values decode to null.
    fn decode(&self, stored: &ColumnValue) -> JsonValue;
}

/// Implemented by field value types that carry their own codec.
pub trait CustomColumn {
    fn codec() -> Arc<dyn ColumnCodec>;
}

// ============================================================================
// POINT
// ============================================================================

/// A geographic point stored as well-known text `POINT(lat lon)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn to_wkt(&self) -> String {
        format!("POINT({} {})", self.lat, self.lon)
    }

    /// Parse `POINT(lat lon)`; anything else yields `None`.
    pub fn from_wkt(text: &str) -> Option<Self> {
        let caps = POINT_WKT.as_ref()?.captures(text.trim())?;
        let lat = caps.get(1)?.as_str().parse().ok()?;
        let lon = caps.get(2)?.as_str().parse().ok()?;
        Some(Self { lat, lon })
    }
}

static POINT_WKT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^POINT\s*\(\s*([-+0-9.eE]+)\s+([-+0-9.eE]+)\s*\)$").ok());

impl CustomColumn for Point {
    fn codec() -> Arc<dyn ColumnCodec> {
        Arc::new(PointCodec)
    }
}

/// Codec for [`Point`] columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointCodec;

impl ColumnCodec for PointCodec {
    fn name(&self) -> &'static str {
        "point"
    }

    fn select_clause(&self, column: &str) -> String {
        let quoted = quote_ident(column);
        format!("ST_AsText({}) AS {}", quoted, quoted)
    }

    fn encode(&self, value: &JsonValue) -> Result<EncodedColumn, CodecError> {
        if value.is_null() {
            return Ok(EncodedColumn::bound(ColumnValue::Null));
        }
        let point: Point =
            serde_json::from_value(value.clone()).map_err(|e| CodecError::WrongShape {
                codec: self.name(),
                reason: e.to_string(),
            })?;
        Ok(EncodedColumn {
            expr: "ST_GeomFromText(?)".to_string(),
            params: vec![ColumnValue::Text(point.to_wkt())],
        })
    }

    fn decode(&self, stored: &ColumnValue) -> JsonValue {
        stored
            .as_text()
            .and_then(Point::from_wkt)
            .and_then(|p| serde_json::to_value(p).ok())
            .unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_point_select_clause_keeps_alias() {
        assert_eq!(
            PointCodec.select_clause("location"),
            r#"ST_AsText("location") AS "location""#
        );
    }

    #[test]
    fn test_point_encode() {
        let encoded = PointCodec.encode(&json!({"lat": 35.5, "lon": 139.25})).unwrap();
        assert_eq!(encoded.expr, "ST_GeomFromText(?)");
        assert_eq!(
            encoded.params,
            vec![ColumnValue::Text("POINT(35.5 139.25)".to_string())]
        );
    }

    #[test]
    fn test_point_encode_null_binds_null() {
        let encoded = PointCodec.encode(&JsonValue::Null).unwrap();
        assert_eq!(encoded, EncodedColumn::bound(ColumnValue::Null));
    }

    #[test]
    fn test_point_encode_rejects_wrong_shape() {
        let err = PointCodec.encode(&json!("north")).unwrap_err();
        assert!(matches!(err, CodecError::WrongShape { codec: "point", .. }));
    }

    #[test]
    fn test_point_decode() {
        let decoded = PointCodec.decode(&ColumnValue::Text("POINT(1.5 -2)".to_string()));
        assert_eq!(decoded, json!({"lat": 1.5, "lon": -2.0}));
    }

    #[test]
    fn test_point_decode_garbage_is_null() {
        assert_eq!(
            PointCodec.decode(&ColumnValue::Text("LINESTRING(0 0, 1 1)".to_string())),
            JsonValue::Null
        );
        assert_eq!(PointCodec.decode(&ColumnValue::Null), JsonValue::Null);
        assert_eq!(PointCodec.decode(&ColumnValue::Integer(4)), JsonValue::Null);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("hoge"), "\"hoge\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_point_wkt_roundtrip(lat in -90.0f64..90.0, lon in -180.0f64..180.0) {
            let point = Point::new(lat, lon);
            prop_assert_eq!(Point::from_wkt(&point.to_wkt()), Some(point));
        }
    }
}
