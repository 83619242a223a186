//! Request body types

use bytes::Bytes;

/// Request body variants the dispatcher knows how to encode
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Empty body
    Empty,

    /// Raw text body
    Text(String),

    /// JSON-encoded body (objects and arrays)
    Json(serde_json::Value),

    /// Raw bytes with content type
    Bytes {
        /// The content
        content: Bytes,
        /// Content type
        content_type: String,
    },
}

impl Body {
    /// Create an empty body
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Create a text body
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Create a JSON body
    pub fn json(value: impl serde::Serialize) -> Result<Self, crate::Error> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Create a body from bytes
    pub fn bytes(content: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self::Bytes {
            content: content.into(),
            content_type: content_type.into(),
        }
    }

    /// Encode a loosely-typed options `body` value.
    ///
    /// Objects and arrays become JSON bodies, strings raw text, booleans and
    /// numbers their stringified form, and `null` an explicit empty body.
    pub fn from_options_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                Self::Json(value.clone())
            }
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Bool(b) => Self::Text(b.to_string()),
            serde_json::Value::Number(n) => Self::Text(n.to_string()),
            serde_json::Value::Null => Self::Empty,
        }
    }

    /// Content type to declare for this body, if any
    pub fn content_type(&self) -> Option<&str> {
        match self {
            Body::Empty | Body::Text(_) => None,
            Body::Json(_) => Some("application/json"),
            Body::Bytes { content_type, .. } => Some(content_type),
        }
    }

    /// Encode into the bytes sent over the wire
    pub fn to_bytes(&self) -> Result<Bytes, crate::Error> {
        Ok(match self {
            Body::Empty => Bytes::new(),
            Body::Text(text) => Bytes::from(text.clone()),
            Body::Json(value) => Bytes::from(serde_json::to_vec(value)?),
            Body::Bytes { content, .. } => content.clone(),
        })
    }
}

impl From<String> for Body {
    fn from(content: String) -> Self {
        Self::Text(content)
    }
}

impl From<&str> for Body {
    fn from(content: &str) -> Self {
        Self::Text(content.to_string())
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::from_options_value(&value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(content: Vec<u8>) -> Self {
        Self::bytes(content, "application/octet-stream")
    }
}
