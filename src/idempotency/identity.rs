use crate::error::{IdempotencyError, Result};
use crate::events::consumer::ConsumedMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const COMPONENT_DELIMITER: &str = "-";

/// Declared type of an identity component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Int,
    Long,
    Bytes,
    Float,
    Bool,
}

impl ValueKind {
    /// Only text and integer-like kinds may contribute to a record identity.
    pub fn is_supported(&self) -> bool {
        matches!(self, ValueKind::Text | ValueKind::Int | ValueKind::Long)
    }

    /// Whether a value of kind `value` may stand in for a parameter of this kind.
    /// An int widens to long.
    pub fn accepts(&self, value: ValueKind) -> bool {
        *self == value || (*self == ValueKind::Long && value == ValueKind::Int)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Text => "text",
            ValueKind::Int => "int",
            ValueKind::Long => "long",
            ValueKind::Bytes => "bytes",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single argument value handed to a listener.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityValue {
    Text(String),
    Int(i32),
    Long(i64),
    Bytes(Vec<u8>),
    Float(f64),
    Bool(bool),
}

impl IdentityValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            IdentityValue::Text(_) => ValueKind::Text,
            IdentityValue::Int(_) => ValueKind::Int,
            IdentityValue::Long(_) => ValueKind::Long,
            IdentityValue::Bytes(_) => ValueKind::Bytes,
            IdentityValue::Float(_) => ValueKind::Float,
            IdentityValue::Bool(_) => ValueKind::Bool,
        }
    }

    /// Canonical text form; numbers are plain base-10.
    pub fn render(&self) -> String {
        match self {
            IdentityValue::Text(s) => s.clone(),
            IdentityValue::Int(v) => v.to_string(),
            IdentityValue::Long(v) => v.to_string(),
            IdentityValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            IdentityValue::Float(v) => v.to_string(),
            IdentityValue::Bool(v) => v.to_string(),
        }
    }
}

impl From<String> for IdentityValue {
    fn from(value: String) -> Self {
        IdentityValue::Text(value)
    }
}

impl From<&str> for IdentityValue {
    fn from(value: &str) -> Self {
        IdentityValue::Text(value.to_string())
    }
}

impl From<i32> for IdentityValue {
    fn from(value: i32) -> Self {
        IdentityValue::Int(value)
    }
}

impl From<i64> for IdentityValue {
    fn from(value: i64) -> Self {
        IdentityValue::Long(value)
    }
}

/// Parameter metadata running parallel to a listener's argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityParameter {
    pub name: String,
    pub kind: ValueKind,
    pub identity: bool,
}

impl IdentityParameter {
    /// A parameter that contributes to the record identity.
    pub fn identity(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            identity: true,
        }
    }

    /// A parameter that is passed to the listener but ignored for identity.
    pub fn plain(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            identity: false,
        }
    }
}

/// Deterministic identity of a consumed record: the identity components joined with `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordIdentity {
    id: String,
}

impl RecordIdentity {
    pub fn new<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let components: Vec<S> = components.into_iter().collect();
        if components.is_empty() {
            return Err(IdempotencyError::EmptyIdentity);
        }

        let id = components
            .iter()
            .map(|c| c.as_ref())
            .collect::<Vec<&str>>()
            .join(COMPONENT_DELIMITER);
        if id.is_empty() {
            return Err(IdempotencyError::EmptyIdentity);
        }

        Ok(Self { id })
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn with_prefix(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.id)
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Derives a record identity from a listener's argument list and its parameter metadata.
///
/// Only parameters flagged as identity-contributing are used, in declaration order.
/// A flagged parameter with an unsupported declared kind fails eagerly, and a
/// value that does not match its declared kind is rejected.
pub fn extract_identity(
    arguments: &[IdentityValue],
    parameters: &[IdentityParameter],
) -> Result<RecordIdentity> {
    if arguments.len() != parameters.len() {
        return Err(IdempotencyError::Validation(format!(
            "listener received {} arguments but declares {} parameters",
            arguments.len(),
            parameters.len()
        )));
    }

    let mut components = Vec::new();
    for (argument, parameter) in arguments.iter().zip(parameters) {
        if !parameter.identity {
            continue;
        }
        if !parameter.kind.is_supported() {
            return Err(IdempotencyError::UnsupportedIdentityType {
                parameter: parameter.name.clone(),
                kind: parameter.kind,
            });
        }
        if !parameter.kind.accepts(argument.kind()) {
            return Err(IdempotencyError::Validation(format!(
                "identity parameter '{}' is declared {} but received a {} value",
                parameter.name,
                parameter.kind,
                argument.kind()
            )));
        }
        components.push(argument.render());
    }

    RecordIdentity::new(components)
}

type Accessor<M> = Arc<dyn Fn(&M) -> IdentityValue + Send + Sync>;

struct Component<M> {
    parameter: IdentityParameter,
    accessor: Accessor<M>,
}

impl<M> Clone for Component<M> {
    fn clone(&self) -> Self {
        Self {
            parameter: self.parameter.clone(),
            accessor: Arc::clone(&self.accessor),
        }
    }
}

/// Statically declared, ordered list of identity accessors over an input type.
///
/// Component order is part of the identity contract: reordering components
/// changes every derived identity and invalidates stored markers.
pub struct IdentityExtractor<M> {
    components: Vec<Component<M>>,
}

impl<M> Clone for IdentityExtractor<M> {
    fn clone(&self) -> Self {
        Self {
            components: self.components.clone(),
        }
    }
}

impl<M> fmt::Debug for IdentityExtractor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityExtractor")
            .field(
                "components",
                &self
                    .components
                    .iter()
                    .map(|c| c.parameter.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<M> Default for IdentityExtractor<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> IdentityExtractor<M> {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Appends a component with an explicitly declared kind.
    pub fn component<F>(mut self, name: impl Into<String>, kind: ValueKind, accessor: F) -> Self
    where
        F: Fn(&M) -> IdentityValue + Send + Sync + 'static,
    {
        self.components.push(Component {
            parameter: IdentityParameter::identity(name, kind),
            accessor: Arc::new(accessor),
        });
        self
    }

    pub fn text<F, S>(self, name: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&M) -> S + Send + Sync + 'static,
        S: Into<String>,
    {
        self.component(name, ValueKind::Text, move |m| {
            IdentityValue::Text(accessor(m).into())
        })
    }

    pub fn int<F>(self, name: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&M) -> i32 + Send + Sync + 'static,
    {
        self.component(name, ValueKind::Int, move |m| IdentityValue::Int(accessor(m)))
    }

    pub fn long<F>(self, name: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&M) -> i64 + Send + Sync + 'static,
    {
        self.component(name, ValueKind::Long, move |m| IdentityValue::Long(accessor(m)))
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Derives the identity of `input`. Pure and deterministic.
    pub fn extract(&self, input: &M) -> Result<RecordIdentity> {
        let (arguments, parameters): (Vec<IdentityValue>, Vec<IdentityParameter>) = self
            .components
            .iter()
            .map(|c| ((c.accessor)(input), c.parameter.clone()))
            .unzip();

        extract_identity(&arguments, &parameters)
    }
}

impl IdentityExtractor<ConsumedMessage> {
    pub fn for_messages() -> Self {
        Self::new()
    }

    /// Header value as UTF-8 text; a missing header contributes an empty component.
    pub fn header(self, name: impl Into<String>) -> Self {
        let header = name.into();
        let lookup = header.clone();
        self.text(header, move |m: &ConsumedMessage| {
            m.header_str(&lookup).unwrap_or_default()
        })
    }

    pub fn topic(self) -> Self {
        self.text("topic", |m: &ConsumedMessage| m.topic.clone())
    }

    pub fn partition(self) -> Self {
        self.int("partition", |m: &ConsumedMessage| m.partition)
    }

    pub fn offset(self) -> Self {
        self.long("offset", |m: &ConsumedMessage| m.offset)
    }

    /// Record key as UTF-8 text; a missing key contributes an empty component.
    pub fn key(self) -> Self {
        self.text("key", |m: &ConsumedMessage| m.key_str().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_joins_components_with_dash() {
        let id = RecordIdentity::new(["topicA", "7", "42"]).unwrap();
        assert_eq!(id.as_str(), "topicA-7-42");
        assert_eq!(id.with_prefix("p_"), "p_topicA-7-42");
    }

    #[test]
    fn test_identity_requires_components() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            RecordIdentity::new(empty),
            Err(IdempotencyError::EmptyIdentity)
        ));
        assert!(matches!(
            RecordIdentity::new([""]),
            Err(IdempotencyError::EmptyIdentity)
        ));
    }

    #[test]
    fn test_two_empty_components_are_not_empty() {
        // joined with the delimiter, two empty components render as "-"
        let id = RecordIdentity::new(["", ""]).unwrap();
        assert_eq!(id.as_str(), "-");
    }

    #[test]
    fn test_extract_identity_skips_plain_parameters() {
        let args = vec![
            IdentityValue::from("payload"),
            IdentityValue::from("msg-1"),
            IdentityValue::Long(1_000_000),
        ];
        let params = vec![
            IdentityParameter::plain("payload", ValueKind::Text),
            IdentityParameter::identity("record-id", ValueKind::Text),
            IdentityParameter::identity("offset", ValueKind::Long),
        ];

        let id = extract_identity(&args, &params).unwrap();
        assert_eq!(id.as_str(), "msg-1-1000000");
    }

    #[test]
    fn test_extract_identity_rejects_unsupported_kind() {
        let args = vec![IdentityValue::from("a"), IdentityValue::Bytes(vec![1, 2])];
        let params = vec![
            IdentityParameter::identity("id", ValueKind::Text),
            IdentityParameter::identity("payload", ValueKind::Bytes),
        ];

        let err = extract_identity(&args, &params).unwrap_err();
        assert!(matches!(
            err,
            IdempotencyError::UnsupportedIdentityType { ref parameter, kind: ValueKind::Bytes }
                if parameter == "payload"
        ));
    }

    #[test]
    fn test_extract_identity_rejects_mismatched_values() {
        let args = vec![IdentityValue::Float(1.5), IdentityValue::Bytes(vec![0xff, 0xfe])];
        let params = vec![
            IdentityParameter::identity("offset", ValueKind::Long),
            IdentityParameter::identity("id", ValueKind::Text),
        ];
        assert!(matches!(
            extract_identity(&args, &params),
            Err(IdempotencyError::Validation(ref msg)) if msg.contains("'offset'")
        ));

        let args = vec![IdentityValue::from("7")];
        let params = vec![IdentityParameter::identity("partition", ValueKind::Int)];
        assert!(extract_identity(&args, &params).is_err());
    }

    #[test]
    fn test_int_value_widens_to_long() {
        let args = vec![IdentityValue::Int(7)];
        let params = vec![IdentityParameter::identity("offset", ValueKind::Long)];
        assert_eq!(extract_identity(&args, &params).unwrap().as_str(), "7");
        assert!(!ValueKind::Int.accepts(ValueKind::Long));
    }

    #[test]
    fn test_unsupported_kind_on_plain_parameter_is_ignored() {
        let args = vec![IdentityValue::Float(1.5), IdentityValue::Int(3)];
        let params = vec![
            IdentityParameter::plain("score", ValueKind::Float),
            IdentityParameter::identity("partition", ValueKind::Int),
        ];

        assert_eq!(extract_identity(&args, &params).unwrap().as_str(), "3");
    }

    #[test]
    fn test_extract_identity_argument_count_mismatch() {
        let args = vec![IdentityValue::from("a")];
        let params: Vec<IdentityParameter> = vec![];
        assert!(matches!(
            extract_identity(&args, &params),
            Err(IdempotencyError::Validation(_))
        ));
    }

    #[test]
    fn test_no_identity_parameters_is_empty_identity() {
        let args = vec![IdentityValue::from("a")];
        let params = vec![IdentityParameter::plain("a", ValueKind::Text)];
        assert!(matches!(
            extract_identity(&args, &params),
            Err(IdempotencyError::EmptyIdentity)
        ));
    }

    #[test]
    fn test_negative_numbers_render_base10() {
        assert_eq!(IdentityValue::Int(-12).render(), "-12");
        assert_eq!(IdentityValue::Long(1234567890123).render(), "1234567890123");
    }

    #[test]
    fn test_value_kind_support() {
        assert!(ValueKind::Text.is_supported());
        assert!(ValueKind::Int.is_supported());
        assert!(ValueKind::Long.is_supported());
        assert!(!ValueKind::Bytes.is_supported());
        assert!(!ValueKind::Float.is_supported());
        assert!(!ValueKind::Bool.is_supported());
    }
}
