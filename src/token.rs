//! Defines deferred values: references to attributes that are only
//! known once the orchestrator has provisioned the stack, and the
//! logical ids they point at.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fmt;

/// Matches `${Name}` and `${Name.Attribute}` placeholders inside a
/// `Fn::Sub` template. Pseudo parameters (`${AWS::Region}`) don't
/// match.
static SUB_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9]+)(?:\.[A-Za-z0-9.]+)?\}").unwrap());

/// The identifier of a resource within a synthesized template.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalId(String);

impl LogicalId {
    /// Derive a logical id from a construct path. The trailing
    /// `Resource` component is dropped from the readable part, and
    /// paths deeper than one component get a hash suffix so that
    /// sibling constructs can't collide.
    pub fn from_path(components: &[&str]) -> Self {
        let readable: String = components
            .iter()
            .filter(|component| **component != "Resource")
            .copied()
            .collect();
        if components.len() < 2 {
            return LogicalId(readable);
        }
        let mut hasher = Sha1::new();
        hasher.update(components.join("/").as_bytes());
        let digest = format!("{:X}", hasher.finalize());
        LogicalId(format!("{}{}", readable, &digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for LogicalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// A value that is either known at declaration time, or resolved by
/// the orchestrator while the stack is being deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A plain value.
    Literal(String),

    /// The primary identifier of a resource (its generated name, for
    /// buckets and tables).
    Ref(LogicalId),

    /// A named attribute of a resource, such as its ARN.
    GetAtt(LogicalId, String),

    /// A template parameter or pseudo parameter (`AWS::AccountId`).
    Param(String),

    /// A string with `${...}` placeholders.
    Sub(String),
}

impl Token {
    /// Whether the value is unknown until deployment.
    pub fn is_deferred(&self) -> bool {
        !matches!(self, Token::Literal(_))
    }

    /// The names this token needs resolved. Pseudo parameters are
    /// provided by the orchestrator and never listed.
    pub fn references(&self) -> Vec<String> {
        match self {
            Token::Literal(_) => Vec::new(),
            Token::Ref(id) | Token::GetAtt(id, _) => vec![id.to_string()],
            Token::Param(name) if name.starts_with("AWS::") => Vec::new(),
            Token::Param(name) => vec![name.clone()],
            Token::Sub(template) => SUB_PLACEHOLDER
                .captures_iter(template)
                .map(|captures| captures[1].to_string())
                .collect(),
        }
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token::Literal(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token::Literal(value)
    }
}

/// Two-element `[logical id, attribute]` pair for `Fn::GetAtt`.
struct AttributePath<'a>(&'a LogicalId, &'a str);

impl Serialize for AttributePath<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(self.0)?;
        seq.serialize_element(self.1)?;
        seq.end()
    }
}

/// Tokens serialize to the intrinsic functions understood by the
/// orchestrator.
impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Token::Literal(value) => serializer.serialize_str(value),
            Token::Ref(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Ref", id)?;
                map.end()
            }
            Token::GetAtt(id, attribute) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Fn::GetAtt", &AttributePath(id, attribute))?;
                map.end()
            }
            Token::Param(name) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Ref", name)?;
                map.end()
            }
            Token::Sub(template) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Fn::Sub", template)?;
                map.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_component_paths_keep_their_name() {
        assert_eq!(LogicalId::from_path(&["BucketName"]).as_str(), "BucketName");
    }

    #[test]
    fn nested_paths_get_a_stable_hash_suffix() {
        let first = LogicalId::from_path(&["Bucket", "Resource"]);
        let second = LogicalId::from_path(&["Bucket", "Resource"]);
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("Bucket"));
        assert_eq!(first.as_str().len(), "Bucket".len() + 8);
        assert!(first.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, LogicalId::from_path(&["Bucket", "Other"]));
    }

    #[test]
    fn deferred_tokens_serialize_to_intrinsics() {
        let id = LogicalId::from_path(&["Table"]);
        assert_eq!(
            serde_json::to_value(Token::Ref(id.clone())).unwrap(),
            json!({"Ref": "Table"})
        );
        assert_eq!(
            serde_json::to_value(Token::GetAtt(id, "Arn".into())).unwrap(),
            json!({"Fn::GetAtt": ["Table", "Arn"]})
        );
        assert_eq!(
            serde_json::to_value(Token::Param("AWS::AccountId".into())).unwrap(),
            json!({"Ref": "AWS::AccountId"})
        );
        assert_eq!(serde_json::to_value(Token::from("x")).unwrap(), json!("x"));
    }

    #[test]
    fn references_skip_pseudo_parameters() {
        let sub = Token::Sub("arn:${AWS::Partition}:s3:::${Bucket}/${Table.Arn}".into());
        assert_eq!(sub.references(), vec!["Bucket", "Table"]);
        assert!(Token::Param("AWS::Region".into()).references().is_empty());
        assert!(!Token::from("plain").is_deferred());
        assert!(sub.is_deferred());
    }
}
