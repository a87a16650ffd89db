use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured result of analyzing one free-form user request.
///
/// Ephemeral: produced per request, never persisted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAnalysis {
    pub intent: Intent,

    /// Clamped to [0.3, 0.95]
    pub intent_confidence: f64,

    pub entities: Entities,

    pub keywords: Vec<String>,

    pub requires_multi_agent: bool,

    pub complexity: Complexity,

    pub ambiguity: Ambiguity,

    pub follow_up: FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    TaskCreation,
    Search,
    Report,
    Approval,
    Update,
    GeneralQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// One extracted entity with where and how confidently it was found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntity {
    pub value: String,
    pub confidence: f64,
    /// Byte offset of the match in the original text
    pub position: usize,
}

impl ExtractedEntity {
    pub fn new(value: impl Into<String>, confidence: f64, position: usize) -> Self {
        Self {
            value: value.into(),
            confidence,
            position,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ExtractedEntity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ExtractedEntity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ExtractedEntity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<ExtractedEntity>,

    /// ISO-8601 date resolved against the analysis reference time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<ExtractedEntity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<ExtractedEntity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ExtractedEntity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambiguity {
    pub is_ambiguous: bool,
    pub clarifying_questions: Vec<String>,
    pub ambiguous_terms: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUp {
    pub is_follow_up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_to: Option<String>,
}

/// Prior conversation handed to the analyzer by the ingress
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub messages: Vec<ChatMessage>,

    /// Anchor for relative-date resolution. Defaults to now; tests pin it
    /// so identical input yields identical output.
    pub reference_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

impl ConversationContext {
    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            reference_time: None,
        }
    }

    pub fn last_assistant_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content.as_str())
    }
}
