use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marketplace {
    Wildberries,
    Ozon,
}

impl Marketplace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Wildberries => "wb",
            Marketplace::Ozon => "ozon",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "wb" => Some(Marketplace::Wildberries),
            "ozon" => Some(Marketplace::Ozon),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Review,
    Question,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Review => "review",
            EventType::Question => "question",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "review" => Some(EventType::Review),
            "question" => Some(EventType::Question),
            _ => None,
        }
    }
}

/// Event lifecycle. Transitions are strictly forward; the only backwards
/// move is the explicit operator "regenerate" override to `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    New,
    Drafted,
    Approved,
    Escalated,
    Sent,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "new",
            EventStatus::Drafted => "drafted",
            EventStatus::Approved => "approved",
            EventStatus::Escalated => "escalated",
            EventStatus::Sent => "sent",
            EventStatus::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "new" => Some(EventStatus::New),
            "drafted" => Some(EventStatus::Drafted),
            "approved" => Some(EventStatus::Approved),
            "escalated" => Some(EventStatus::Escalated),
            "sent" => Some(EventStatus::Sent),
            "error" => Some(EventStatus::Error),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        match (self, next) {
            (New, Drafted) | (New, Error) => true,
            (Drafted, Approved) | (Drafted, Escalated) | (Drafted, Sent) | (Drafted, Error) => true,
            (Approved, Sent) | (Approved, Error) => true,
            (Escalated, Sent) | (Escalated, Error) => true,
            // Operator regenerate override back to the pre-draft state.
            (Drafted, New) | (Approved, New) | (Escalated, New) | (Error, New) => true,
            _ => false,
        }
    }
}

/// One inbound marketplace review or question, keyed by
/// `(cabinet_id, marketplace_event_id)`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub project_id: i64,
    pub cabinet_id: i64,
    pub marketplace_event_id: String,
    pub marketplace: Marketplace,
    pub event_type: EventType,
    pub text: String,
    pub rating: Option<i32>,
    pub sentiment: Option<String>,
    pub status: EventStatus,
    pub suggested_reply: Option<String>,
    pub confidence: Option<i32>,
    pub kb_rule_ids: Vec<i64>,
    pub conflict: bool,
    pub raw_payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for the ingest stage; the store assigns id and timestamps
/// and every row starts in `New`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub project_id: i64,
    pub cabinet_id: i64,
    pub marketplace_event_id: String,
    pub marketplace: Marketplace,
    pub event_type: EventType,
    pub text: String,
    pub rating: Option<i32>,
    pub sentiment: Option<String>,
    pub raw_payload: Value,
}

/// Fields written onto an event when a draft reply is produced.
#[derive(Debug, Clone)]
pub struct ReplyDraft {
    pub suggested_reply: String,
    pub confidence: i32,
    pub kb_rule_ids: Vec<i64>,
    pub conflict: bool,
}

/// One seller cabinet on a marketplace, the unit the poll stage iterates.
#[derive(Debug, Clone)]
pub struct Cabinet {
    pub id: i64,
    pub project_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub marketplace: Marketplace,
    pub api_token: String,
}
