use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{ActionResult, MarketplaceClient, MarketplaceQuestion, MarketplaceReview};

/// Wildberries seller client (feedbacks API).
pub struct WBClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl WBClient {
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    async fn fetch_list(
        &self,
        path: &str,
        list_key: &str,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<Value>> {
        let mut request = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header("Authorization", &self.token)
            .query(&[("isAnswered", "false"), ("take", "100"), ("skip", "0")]);
        if let Some(since) = since {
            request = request.query(&[("dateFrom", since.timestamp().to_string())]);
        }

        let body: Value = request.send().await?.error_for_status()?.json().await?;
        let items = body
            .pointer(&format!("/data/{list_key}"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items)
    }

    async fn send_answer(&self, path: &str, external_id: &str, text: &str) -> anyhow::Result<ActionResult> {
        let payload = json!({ "id": external_id, "text": text });
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("Authorization", &self.token)
            .json(&payload)
            .send()
            .await?;

        let success = response.status().is_success();
        let raw_response = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(ActionResult {
            success,
            external_id: Some(external_id.to_string()),
            raw_request: payload,
            raw_response,
        })
    }
}

#[async_trait]
impl MarketplaceClient for WBClient {
    async fn fetch_reviews(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceReview>> {
        let items = self.fetch_list("/api/v1/feedbacks", "feedbacks", since).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| {
                Some(MarketplaceReview {
                    external_id: string_field(&item, "id")?,
                    text: item.get("text")?.as_str().unwrap_or_default().to_string(),
                    rating: item
                        .get("productValuation")
                        .and_then(Value::as_i64)
                        .map(|v| v as i32),
                    created_at: timestamp_field(&item, "createdDate"),
                    sku: item
                        .pointer("/productDetails/supplierArticle")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    raw_payload: item,
                })
            })
            .collect())
    }

    async fn fetch_questions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceQuestion>> {
        let items = self.fetch_list("/api/v1/questions", "questions", since).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| {
                Some(MarketplaceQuestion {
                    external_id: string_field(&item, "id")?,
                    text: item.get("text")?.as_str().unwrap_or_default().to_string(),
                    created_at: timestamp_field(&item, "createdDate"),
                    sku: item
                        .pointer("/productDetails/supplierArticle")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    raw_payload: item,
                })
            })
            .collect())
    }

    async fn send_review_answer(
        &self,
        review_id: &str,
        text: &str,
    ) -> anyhow::Result<ActionResult> {
        self.send_answer("/api/v1/feedbacks/answer", review_id, text)
            .await
    }

    async fn send_question_answer(
        &self,
        question_id: &str,
        text: &str,
    ) -> anyhow::Result<ActionResult> {
        self.send_answer("/api/v1/questions/answer", question_id, text)
            .await
    }
}

/// Ozon seller client.
pub struct OzonClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OzonClient {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }

    async fn post(&self, path: &str, payload: &Value) -> anyhow::Result<reqwest::Response> {
        Ok(self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("Api-Key", &self.api_key)
            .json(payload)
            .send()
            .await?)
    }

    async fn fetch_list(
        &self,
        path: &str,
        list_key: &str,
    ) -> anyhow::Result<Vec<Value>> {
        let payload = json!({ "limit": 100, "status": "UNPROCESSED" });
        let body: Value = self
            .post(path, &payload)
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body
            .get(list_key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn send(&self, path: &str, payload: Value, external_id: &str) -> anyhow::Result<ActionResult> {
        let response = self.post(path, &payload).await?;
        let success = response.status().is_success();
        let raw_response = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(ActionResult {
            success,
            external_id: Some(external_id.to_string()),
            raw_request: payload,
            raw_response,
        })
    }
}

#[async_trait]
impl MarketplaceClient for OzonClient {
    async fn fetch_reviews(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceReview>> {
        let items = self.fetch_list("/v1/review/list", "reviews").await?;
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let created_at = timestamp_field(&item, "published_at");
                Some(MarketplaceReview {
                    external_id: string_field(&item, "id")?,
                    text: item.get("text")?.as_str().unwrap_or_default().to_string(),
                    rating: item.get("rating").and_then(Value::as_i64).map(|v| v as i32),
                    created_at,
                    sku: item.get("sku").and_then(Value::as_str).map(str::to_string),
                    raw_payload: item,
                })
            })
            // The list endpoint has no dateFrom filter; window client-side.
            .filter(|review| match (since, review.created_at) {
                (Some(since), Some(created_at)) => created_at > since,
                _ => true,
            })
            .collect())
    }

    async fn fetch_questions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MarketplaceQuestion>> {
        let items = self.fetch_list("/v1/question/list", "questions").await?;
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let created_at = timestamp_field(&item, "published_at");
                Some(MarketplaceQuestion {
                    external_id: string_field(&item, "id")?,
                    text: item.get("text")?.as_str().unwrap_or_default().to_string(),
                    created_at,
                    sku: item.get("sku").and_then(Value::as_str).map(str::to_string),
                    raw_payload: item,
                })
            })
            .filter(|question| match (since, question.created_at) {
                (Some(since), Some(created_at)) => created_at > since,
                _ => true,
            })
            .collect())
    }

    async fn send_review_answer(
        &self,
        review_id: &str,
        text: &str,
    ) -> anyhow::Result<ActionResult> {
        let payload = json!({ "review_id": review_id, "text": text });
        self.send("/v1/review/comment/create", payload, review_id)
            .await
    }

    async fn send_question_answer(
        &self,
        question_id: &str,
        text: &str,
    ) -> anyhow::Result<ActionResult> {
        let payload = json!({ "question_id": question_id, "text": text });
        self.send("/v1/question/answer/create", payload, question_id)
            .await
    }
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn timestamp_field(item: &Value, key: &str) -> Option<DateTime<Utc>> {
    item.get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}
