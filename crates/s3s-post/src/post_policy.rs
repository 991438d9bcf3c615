//! POST Object Policy
//!
//! See <https://docs.aws.amazon.com/AmazonS3/latest/API/sigv4-HTTPPOSTConstructPolicy.html>
//!
//! This module only decodes and encodes the document. Whether the document is
//! acceptable (expiry, range sanity) is decided by [`crate::condition`].

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::de::{Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::UtcOffset;
use time::format_description::well_known::Rfc3339;

/// A decoded POST policy document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPolicy {
    pub expiration: OffsetDateTime,
    pub conditions: Vec<PostPolicyCondition>,
}

/// One condition of a policy document.
///
/// Field names are stored without the `$` prefix and lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostPolicyCondition {
    /// The field value must equal `value`.
    Eq { field: String, value: String },
    /// The field value must start with `prefix`. An empty prefix accepts any
    /// value, but the field must still be present.
    StartsWith { field: String, prefix: String },
    /// The file size must lie in `min..=max`.
    ContentLengthRange { min: u64, max: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum PostPolicyError {
    #[error("invalid base64 encoding: {0}")]
    Base64(#[from] base64_simd::Error),
    #[error("invalid UTF-8 encoding: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid expiration: {0}")]
    InvalidExpiration(String),
    #[error("invalid condition at index {0}")]
    InvalidCondition(usize),
}

const EXPIRATION_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

impl PostPolicy {
    /// Creates an empty policy expiring at `expiration`.
    #[must_use]
    pub fn new(expiration: OffsetDateTime) -> Self {
        Self {
            expiration,
            conditions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_eq(mut self, field: &str, value: impl Into<String>) -> Self {
        self.conditions.push(PostPolicyCondition::Eq {
            field: normalize_field_name(field),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn with_starts_with(mut self, field: &str, prefix: impl Into<String>) -> Self {
        self.conditions.push(PostPolicyCondition::StartsWith {
            field: normalize_field_name(field),
            prefix: prefix.into(),
        });
        self
    }

    #[must_use]
    pub fn with_content_length_range(mut self, min: u64, max: u64) -> Self {
        self.conditions.push(PostPolicyCondition::ContentLengthRange { min, max });
        self
    }

    /// Decodes the value of the `policy` form field.
    ///
    /// # Errors
    /// Returns an error if the input is not base64, not UTF-8, or not a policy document.
    pub fn from_base64(encoded: &str) -> Result<Self, PostPolicyError> {
        let decoded = base64_simd::STANDARD.decode_to_vec(encoded)?;
        Self::from_json(&decoded)
    }

    /// Decodes a policy document from its JSON text.
    ///
    /// # Errors
    /// Returns an error if the text is not a policy document.
    pub fn from_json(json: &[u8]) -> Result<Self, PostPolicyError> {
        let text = std::str::from_utf8(json)?;
        let raw: RawPostPolicy = serde_json::from_str(text)?;

        let expiration =
            OffsetDateTime::parse(&raw.expiration, &Rfc3339).map_err(|_| PostPolicyError::InvalidExpiration(raw.expiration.clone()))?;

        let conditions = raw
            .conditions
            .into_iter()
            .enumerate()
            .map(|(idx, c)| c.into_condition().ok_or(PostPolicyError::InvalidCondition(idx)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { expiration, conditions })
    }

    /// Encodes the document as JSON, array form for every condition.
    ///
    /// # Errors
    /// Returns an error if the expiration cannot be formatted.
    pub fn to_json(&self) -> Result<String, PostPolicyError> {
        let expiration = self
            .expiration
            .to_offset(UtcOffset::UTC)
            .format(EXPIRATION_FORMAT)
            .map_err(|e| PostPolicyError::InvalidExpiration(e.to_string()))?;
        let conditions: Vec<Value> = self.conditions.iter().map(PostPolicyCondition::to_json_value).collect();
        let doc = json!({
            "expiration": expiration,
            "conditions": conditions,
        });
        Ok(doc.to_string())
    }

    /// Encodes the document as the value of a `policy` form field.
    ///
    /// # Errors
    /// Returns an error if the expiration cannot be formatted.
    pub fn to_base64(&self) -> Result<String, PostPolicyError> {
        let json = self.to_json()?;
        Ok(base64_simd::STANDARD.encode_to_string(json))
    }

    /// The first content-length-range condition, if any.
    #[must_use]
    pub fn content_length_range(&self) -> Option<(u64, u64)> {
        self.conditions.iter().find_map(|c| match *c {
            PostPolicyCondition::ContentLengthRange { min, max } => Some((min, max)),
            _ => None,
        })
    }
}

impl PostPolicyCondition {
    fn to_json_value(&self) -> Value {
        match self {
            Self::Eq { field, value } => json!(["eq", format!("${field}"), value]),
            Self::StartsWith { field, prefix } => json!(["starts-with", format!("${field}"), prefix]),
            Self::ContentLengthRange { min, max } => json!(["content-length-range", min, max]),
        }
    }

    /// The form field this condition inspects, if any.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Eq { field, .. } | Self::StartsWith { field, .. } => Some(field),
            Self::ContentLengthRange { .. } => None,
        }
    }
}

impl fmt::Display for PostPolicyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json_value())
    }
}

#[derive(Debug, Deserialize)]
struct RawPostPolicy {
    expiration: String,
    conditions: Vec<RawCondition>,
}

#[derive(Debug)]
enum RawCondition {
    /// `["eq", "$key", "value"]`, `["starts-with", "$key", "prefix"]`, `["content-length-range", min, max]`
    Array(Vec<Value>),
    /// `{"bucket": "mybucket"}`
    Object(HashMap<String, String>),
}

impl<'de> Deserialize<'de> for RawCondition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RawConditionVisitor;

        impl<'de> Visitor<'de> for RawConditionVisitor {
            type Value = RawCondition;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an array or object")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(RawCondition::Array(items))
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut items = HashMap::new();
                while let Some((key, value)) = map.next_entry::<String, String>()? {
                    items.insert(key, value);
                }
                Ok(RawCondition::Object(items))
            }
        }

        deserializer.deserialize_any(RawConditionVisitor)
    }
}

impl RawCondition {
    fn into_condition(self) -> Option<PostPolicyCondition> {
        match self {
            RawCondition::Array(items) => parse_array_condition(&items),
            RawCondition::Object(map) => parse_object_condition(map),
        }
    }
}

fn parse_array_condition(items: &[Value]) -> Option<PostPolicyCondition> {
    let [op, a, b] = items else { return None };
    match op.as_str()?.to_ascii_lowercase().as_str() {
        "eq" => Some(PostPolicyCondition::Eq {
            field: variable_name(a)?,
            value: b.as_str()?.to_owned(),
        }),
        "starts-with" => Some(PostPolicyCondition::StartsWith {
            field: variable_name(a)?,
            prefix: b.as_str()?.to_owned(),
        }),
        "content-length-range" => Some(PostPolicyCondition::ContentLengthRange {
            min: length_bound(a)?,
            max: length_bound(b)?,
        }),
        _ => None,
    }
}

fn parse_object_condition(map: HashMap<String, String>) -> Option<PostPolicyCondition> {
    if map.len() != 1 {
        return None;
    }
    let (field, value) = map.into_iter().next()?;
    Some(PostPolicyCondition::Eq {
        field: normalize_field_name(&field),
        value,
    })
}

/// Array conditions name their field as `$field`.
fn variable_name(v: &Value) -> Option<String> {
    let name = v.as_str()?.strip_prefix('$')?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

/// A non-negative integer, or a string holding one.
fn length_bound(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn normalize_field_name(field: &str) -> String {
    let field = field.strip_prefix('$').unwrap_or(field);
    field.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    use time::macros::datetime;

    fn assert_invalid_condition(json: &str, index: usize) {
        match PostPolicy::from_json(json.as_bytes()) {
            Err(PostPolicyError::InvalidCondition(i)) => assert_eq!(i, index, "{json}"),
            other => panic!("expected InvalidCondition({index}) for {json}, got {other:?}"),
        }
    }

    #[test]
    fn parse_policy_json() {
        let json = r#"{
            "expiration": "2030-01-01T00:00:00.000Z",
            "conditions": [
                ["eq", "$bucket", "mybucket"],
                ["starts-with", "$Key", "user/"],
                ["content-length-range", 0, 10485760],
                {"acl": "public-read"},
                ["EQ", "$x-amz-meta-tag", ""]
            ]
        }"#;

        let policy = PostPolicy::from_json(json.as_bytes()).unwrap();

        assert_eq!(policy.expiration, datetime!(2030-01-01 00:00:00 UTC));
        assert_eq!(
            policy.conditions,
            [
                PostPolicyCondition::Eq {
                    field: "bucket".to_owned(),
                    value: "mybucket".to_owned()
                },
                PostPolicyCondition::StartsWith {
                    field: "key".to_owned(),
                    prefix: "user/".to_owned()
                },
                PostPolicyCondition::ContentLengthRange { min: 0, max: 10_485_760 },
                PostPolicyCondition::Eq {
                    field: "acl".to_owned(),
                    value: "public-read".to_owned()
                },
                PostPolicyCondition::Eq {
                    field: "x-amz-meta-tag".to_owned(),
                    value: String::new()
                },
            ]
        );
        assert_eq!(policy.content_length_range(), Some((0, 10_485_760)));
    }

    #[test]
    fn decode_is_deterministic() {
        let json = r#"{"expiration":"2030-01-01T00:00:00Z","conditions":[["eq","$bucket","test"],["content-length-range","1","2"]]}"#;
        let encoded = base64_simd::STANDARD.encode_to_string(json);

        let a = PostPolicy::from_base64(&encoded).unwrap();
        let b = PostPolicy::from_base64(&encoded).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.content_length_range(), Some((1, 2)));
    }

    #[test]
    fn codec_keeps_semantically_invalid_documents() {
        let json = r#"{"expiration":"2000-01-01T00:00:00Z","conditions":[["content-length-range",10,1],["content-length-range",0,5]]}"#;
        let policy = PostPolicy::from_json(json.as_bytes()).unwrap();
        assert_eq!(policy.conditions.len(), 2);
    }

    #[test]
    fn invalid_encoding() {
        assert!(matches!(PostPolicy::from_base64("not-valid-base64!!!"), Err(PostPolicyError::Base64(_))));

        let encoded = base64_simd::STANDARD.encode_to_string([0xff, 0xfe]);
        assert!(matches!(PostPolicy::from_base64(&encoded), Err(PostPolicyError::Utf8(_))));

        let encoded = base64_simd::STANDARD.encode_to_string("{invalid json}");
        assert!(matches!(PostPolicy::from_base64(&encoded), Err(PostPolicyError::Json(_))));
    }

    #[test]
    fn missing_members() {
        assert!(matches!(PostPolicy::from_json(br#"{"conditions":[]}"#), Err(PostPolicyError::Json(_))));
        assert!(matches!(
            PostPolicy::from_json(br#"{"expiration":"2030-01-01T00:00:00Z"}"#),
            Err(PostPolicyError::Json(_))
        ));
    }

    #[test]
    fn invalid_expiration() {
        let json = br#"{"expiration":"tomorrow","conditions":[]}"#;
        assert!(matches!(PostPolicy::from_json(json), Err(PostPolicyError::InvalidExpiration(s)) if s == "tomorrow"));
    }

    #[test]
    fn invalid_conditions() {
        let cases = [
            r#"["eq", "$key"]"#,
            r#"["eq", "$key", "a", "b"]"#,
            r#"["eq", "key", "a"]"#,
            r#"["eq", "$", "a"]"#,
            r#"["eq", "$key", 1]"#,
            r#"["ne", "$key", "a"]"#,
            r#"[1, "$key", "a"]"#,
            r#"["starts-with", "$key", null]"#,
            r#"["content-length-range", -1, 10]"#,
            r#"["content-length-range", 0, "ten"]"#,
            r#"["content-length-range", 0.5, 10]"#,
            "[]",
            "{}",
            r#"{"a": "1", "b": "2"}"#,
        ];
        for case in cases {
            let json = format!(r#"{{"expiration":"2030-01-01T00:00:00Z","conditions":[{{"bucket":"b"}}, {case}]}}"#);
            assert_invalid_condition(&json, 1);
        }
    }

    #[test]
    fn non_string_object_value() {
        let json = br#"{"expiration":"2030-01-01T00:00:00Z","conditions":[{"bucket": 1}]}"#;
        assert!(matches!(PostPolicy::from_json(json), Err(PostPolicyError::Json(_))));
    }

    #[test]
    fn encode() {
        let policy = PostPolicy::new(datetime!(2030-06-01 12:30:00 UTC))
            .with_eq("$bucket", "b")
            .with_starts_with("key", "uploads/")
            .with_content_length_range(1, 1024);

        let json = policy.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"conditions":[["eq","$bucket","b"],["starts-with","$key","uploads/"],["content-length-range",1,1024]],"expiration":"2030-06-01T12:30:00.000Z"}"#
        );

        let decoded = PostPolicy::from_base64(&policy.to_base64().unwrap()).unwrap();
        assert_eq!(decoded, policy);
    }

    #[test]
    fn display_condition() {
        let c = PostPolicyCondition::StartsWith {
            field: "key".to_owned(),
            prefix: "a/".to_owned(),
        };
        assert_eq!(c.to_string(), r#"["starts-with","$key","a/"]"#);
        assert_eq!(c.field(), Some("key"));
        assert_eq!(PostPolicyCondition::ContentLengthRange { min: 0, max: 1 }.field(), None);
    }
}
