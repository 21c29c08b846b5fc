pub mod clients;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{Cabinet, EventType, Marketplace};

pub use clients::{OzonClient, WBClient};

/// Normalized review as fetched from a marketplace, raw payload included.
#[derive(Debug, Clone)]
pub struct MarketplaceReview {
    pub external_id: String,
    pub text: String,
    pub rating: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    pub sku: Option<String>,
    pub raw_payload: Value,
}

/// Normalized buyer question, raw payload included.
#[derive(Debug, Clone)]
pub struct MarketplaceQuestion {
    pub external_id: String,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub sku: Option<String>,
    pub raw_payload: Value,
}

/// Outcome of a send operation; raw request/response are kept for the
/// audit trail.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub success: bool,
    pub external_id: Option<String>,
    pub raw_request: Value,
    pub raw_response: Value,
}

/// Queue-safe event payload handed from the poll stage to the ingest stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub marketplace_event_id: String,
    pub event_type: EventType,
    pub text: String,
    pub rating: Option<i32>,
    pub raw_payload: Value,
}

impl From<MarketplaceReview> for RawEvent {
    fn from(review: MarketplaceReview) -> Self {
        Self {
            marketplace_event_id: review.external_id,
            event_type: EventType::Review,
            text: review.text,
            rating: review.rating,
            raw_payload: review.raw_payload,
        }
    }
}

impl From<MarketplaceQuestion> for RawEvent {
    fn from(question: MarketplaceQuestion) -> Self {
        Self {
            marketplace_event_id: question.external_id,
            event_type: EventType::Question,
            text: question.text,
            rating: None,
            raw_payload: question.raw_payload,
        }
    }
}

/// Four-operation marketplace contract. I/O failures surface as errors the
/// pipeline treats as transient and retries at the task level.
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    async fn fetch_reviews(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceReview>>;

    async fn fetch_questions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceQuestion>>;

    async fn send_review_answer(&self, review_id: &str, text: &str)
        -> anyhow::Result<ActionResult>;

    async fn send_question_answer(
        &self,
        question_id: &str,
        text: &str,
    ) -> anyhow::Result<ActionResult>;
}

/// Picks the concrete client for a cabinet; injected into the pipeline so
/// tests can substitute fakes.
pub trait ClientRegistry: Send + Sync {
    fn client_for(&self, cabinet: &Cabinet) -> Arc<dyn MarketplaceClient>;
}

/// Production registry: WB or Ozon client over a shared reqwest pool,
/// selected by the cabinet's marketplace tag.
pub struct HttpClientRegistry {
    http: reqwest::Client,
}

impl HttpClientRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ClientRegistry for HttpClientRegistry {
    fn client_for(&self, cabinet: &Cabinet) -> Arc<dyn MarketplaceClient> {
        match cabinet.marketplace {
            Marketplace::Wildberries => Arc::new(WBClient::new(
                self.http.clone(),
                crate::config::WB_API_BASE.clone(),
                cabinet.api_token.clone(),
            )),
            Marketplace::Ozon => Arc::new(OzonClient::new(
                self.http.clone(),
                crate::config::OZON_API_BASE.clone(),
                cabinet.api_token.clone(),
            )),
        }
    }
}
