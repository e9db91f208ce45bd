//! Composite primary keys.
//!
//! A key is an ordered tuple of segments. Order is significant and never
//! rearranged: the rendered form joins each segment's text with
//! [`KEY_SEPARATOR`], and that exact string is used by every cache tier.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::ColumnValue;

/// Separator placed between rendered key segments.
pub const KEY_SEPARATOR: &str = "#&#";

/// One segment of a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Text(String),
}

impl KeyPart {
    /// Zero-valued segments mark a row whose key the store has not assigned yet.
    pub fn is_zero(&self) -> bool {
        match self {
            KeyPart::Int(v) => *v == 0,
            KeyPart::Text(s) => s.is_empty(),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::Text(s) => f.write_str(s),
        }
    }
}

macro_rules! key_part_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for KeyPart {
                fn from(v: $t) -> Self {
                    KeyPart::Int(i64::from(v))
                }
            }
        )*
    };
}

key_part_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Text(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Text(v)
    }
}

impl From<&String> for KeyPart {
    fn from(v: &String) -> Self {
        KeyPart::Text(v.clone())
    }
}

impl From<KeyPart> for ColumnValue {
    fn from(part: KeyPart) -> Self {
        match part {
            KeyPart::Int(v) => ColumnValue::Integer(v),
            KeyPart::Text(s) => ColumnValue::Text(s),
        }
    }
}

impl From<&KeyPart> for ColumnValue {
    fn from(part: &KeyPart) -> Self {
        part.clone().into()
    }
}

/// An ordered, possibly partial, composite primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Vec<KeyPart>);

impl Key {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every segment is zero or empty text.
    pub fn is_zero(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(KeyPart::is_zero)
    }

    /// Rendered segments, in key order.
    pub fn segments(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    /// Leading `length` segments. A length outside `1..=len()` keeps the whole key.
    pub fn prefix(&self, length: usize) -> Key {
        if length < 1 || length > self.0.len() {
            return self.clone();
        }
        Key(self.0[..length].to_vec())
    }

    /// Join the segments with [`KEY_SEPARATOR`].
    pub fn render(&self) -> String {
        self.segments().join(KEY_SEPARATOR)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

macro_rules! key_from_single {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Key {
                fn from(v: $t) -> Self {
                    Key(vec![KeyPart::from(v)])
                }
            }
        )*
    };
}

key_from_single!(i8, i16, i32, i64, u8, u16, u32, &str, String, &String);

impl From<KeyPart> for Key {
    fn from(part: KeyPart) -> Self {
        Key(vec![part])
    }
}

impl<A: Into<KeyPart>, B: Into<KeyPart>> From<(A, B)> for Key {
    fn from((a, b): (A, B)) -> Self {
        Key(vec![a.into(), b.into()])
    }
}

impl<A: Into<KeyPart>, B: Into<KeyPart>, C: Into<KeyPart>> From<(A, B, C)> for Key {
    fn from((a, b, c): (A, B, C)) -> Self {
        Key(vec![a.into(), b.into(), c.into()])
    }
}

impl From<Vec<KeyPart>> for Key {
    fn from(parts: Vec<KeyPart>) -> Self {
        Key(parts)
    }
}

impl FromIterator<KeyPart> for Key {
    fn from_iter<I: IntoIterator<Item = KeyPart>>(iter: I) -> Self {
        Key(iter.into_iter().collect())
    }
}

/// Build a [`Key`] from heterogeneous segments: `key![1000, "abc"]`.
#[macro_export]
macro_rules! key {
    ($($part:expr),+ $(,)?) => {
        $crate::key::Key::new(vec![$($crate::key::KeyPart::from($part)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_single_and_composite() {
        assert_eq!(Key::from(12345u32).render(), "12345");
        assert_eq!(Key::from((1000u32, 1000u32)).render(), "1000#&#1000");
        assert_eq!(key![1, "wallet", 3].render(), "1#&#wallet#&#3");
    }

    #[test]
    fn test_prefix_clamps_out_of_range_lengths() {
        let key = key![1, 2, 3];
        assert_eq!(key.prefix(1).render(), "1");
        assert_eq!(key.prefix(2).render(), "1#&#2");
        assert_eq!(key.prefix(0), key);
        assert_eq!(key.prefix(9), key);
    }

    #[test]
    fn test_is_zero() {
        assert!(Key::from(0u32).is_zero());
        assert!(key![0, ""].is_zero());
        assert!(!key![0, 1].is_zero());
        assert!(!Key::new(vec![]).is_zero());
    }

    #[test]
    fn test_serializes_as_json_array() {
        let key = key![7, "x"];
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"[7,"x"]"#);
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_key_part_into_column_value() {
        assert_eq!(ColumnValue::from(KeyPart::Int(3)), ColumnValue::Integer(3));
        assert_eq!(
            ColumnValue::from(KeyPart::from("a")),
            ColumnValue::Text("a".to_string())
        );
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn part_strategy() -> impl Strategy<Value = KeyPart> {
        prop_oneof![
            any::<i64>().prop_map(KeyPart::Int),
            "[a-zA-Z0-9_]{1,12}".prop_map(KeyPart::Text),
        ]
    }

    proptest! {
        /// Rendering never reorders: the i-th segment of the rendered key is
        /// the i-th part, and a prefix renders as a prefix of the whole.
        #[test]
        fn prop_render_preserves_order(parts in prop::collection::vec(part_strategy(), 1..5)) {
            let key = Key::new(parts.clone());
            let rendered = key.render();
            let split: Vec<&str> = rendered.split(KEY_SEPARATOR).collect();
            prop_assert_eq!(split.len(), parts.len());
            for (segment, part) in split.iter().zip(parts.iter()) {
                prop_assert_eq!(segment.to_string(), part.to_string());
            }
            for n in 1..=parts.len() {
                prop_assert!(rendered.starts_with(&key.prefix(n).render()));
            }
        }
    }
}
