use serde::{Deserialize, Serialize};

/// Kind of a single design value. Unknown kinds fail deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Color,
    Spacing,
    Typography,
    Shadow,
    Border,
    Opacity,
    Size,
    Other,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Spacing => "spacing",
            Self::Typography => "typography",
            Self::Shadow => "shadow",
            Self::Border => "border",
            Self::Opacity => "opacity",
            Self::Size => "size",
            Self::Other => "other",
        }
    }

    pub const ALL: &[TokenKind] = &[
        Self::Color,
        Self::Spacing,
        Self::Typography,
        Self::Shadow,
        Self::Border,
        Self::Opacity,
        Self::Size,
        Self::Other,
    ];
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single design value, e.g. `{"value": "#fff", "type": "color", "category": "surface"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValue {
    pub value: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A token entry as submitted by a caller, before the worker step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenComponentInput {
    /// Component type bucket, e.g. "button" or "table".
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

impl TokenComponentInput {
    pub fn new(kind: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }
}

/// A named, typed token entry as tracked by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenComponent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
    pub processed: bool,
    /// Epoch millis of the worker step; 0 until processed.
    pub timestamp: i64,
}

impl TokenComponent {
    /// An entry awaiting the worker step.
    pub fn pending(id: impl Into<String>, input: TokenComponentInput) -> Self {
        Self {
            id: id.into(),
            kind: input.kind,
            value: input.value,
            processed: false,
            timestamp: 0,
        }
    }

    /// Same id/type/value, ignoring the processing stamp.
    pub fn same_payload(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.value == other.value
    }
}
