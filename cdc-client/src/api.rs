//! REST change feed
//!
//! Two endpoints back the pull side of a CDC subscription:
//!
//! - `GET {api}/subscriptions/{id}/changes?limit=&nextToken=` returns a
//!   [`ChangesPage`]
//! - `POST {api}/subscriptions/{id}/ack` with `{"eventIds": [...]}` returns a
//!   `{success, data?, error?}` envelope
//!
//! Acknowledgment is idempotent on the server, so re-acknowledging an id
//! after a lost response is safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use realtime_stream::{ChangeEvent, TokenProvider};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::{CdcError, CdcResult};

/// One page of polled change events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesPage {
    #[serde(default)]
    pub events: Vec<ChangeEvent>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    /// Number of events the server returned
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest<'a> {
    event_ids: &'a [Uuid],
}

/// Server side of the pull/acknowledge protocol.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangesApi: Send + Sync {
    /// Fetch up to `limit` events, continuing from `next_token`.
    async fn get_changes(
        &self,
        subscription_id: Uuid,
        limit: usize,
        next_token: Option<String>,
    ) -> CdcResult<ChangesPage>;

    /// Mark events as processed.
    async fn acknowledge_changes(&self, subscription_id: Uuid, event_ids: &[Uuid]) -> CdcResult<()>;
}

/// [`ChangesApi`] over HTTP.
#[derive(Clone)]
pub struct HttpChangesApi {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpChangesApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChangesApi")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpChangesApi {
    /// `base_url` is the CDC API root, e.g. `http://localhost:8080/api/v1/cdc`.
    pub fn new(
        base_url: impl Into<String>,
        tokens: impl TokenProvider,
        timeout: Duration,
    ) -> CdcResult<Self> {
        let base_url = base_url.into();
        Url::parse(&base_url)?;

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens: Arc::new(tokens),
        })
    }

    fn endpoint(&self, subscription_id: Uuid, action: &str) -> CdcResult<Url> {
        let raw = format!(
            "{}/subscriptions/{}/{}",
            self.base_url, subscription_id, action
        );
        Ok(Url::parse(&raw)?)
    }

    fn authorize(&self, request: RequestBuilder) -> CdcResult<RequestBuilder> {
        Ok(match self.tokens.token()? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> CdcResult<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CdcError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ChangesApi for HttpChangesApi {
    async fn get_changes(
        &self,
        subscription_id: Uuid,
        limit: usize,
        next_token: Option<String>,
    ) -> CdcResult<ChangesPage> {
        let mut url = self.endpoint(subscription_id, "changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(token) = &next_token {
                query.append_pair("nextToken", token);
            }
        }

        debug!(%subscription_id, limit, "Polling changes");
        let response = self.authorize(self.http.get(url))?.send().await?;
        Self::read_json(response).await
    }

    async fn acknowledge_changes(
        &self,
        subscription_id: Uuid,
        event_ids: &[Uuid],
    ) -> CdcResult<()> {
        let url = self.endpoint(subscription_id, "ack")?;

        debug!(%subscription_id, count = event_ids.len(), "Acknowledging changes");
        let response = self
            .authorize(self.http.post(url))?
            .json(&AckRequest { event_ids })
            .send()
            .await?;

        let envelope: Envelope<Value> = Self::read_json(response).await?;
        if envelope.success {
            if let Some(data) = envelope.data {
                debug!(%subscription_id, ?data, "Acknowledgment accepted");
            }
            Ok(())
        } else {
            Err(CdcError::Rejected(
                envelope
                    .error
                    .unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use realtime_stream::StaticToken;
    use serde_json::json;

    const SUB: &str = "0f2b1a9e-7c44-4e0e-9d5a-1c3b6a2f9e77";

    fn api(server: &Server) -> HttpChangesApi {
        HttpChangesApi::new(
            format!("{}/api/v1/cdc/", server.url()),
            StaticToken::new("secret"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn event_json(id: &str) -> Value {
        json!({
            "id": id,
            "subscriptionId": SUB,
            "tableName": "orders",
            "changeType": "insert",
            "after": {"id": 1},
            "timestamp": "2024-05-01T12:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_get_changes_sends_query_and_bearer() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", format!("/api/v1/cdc/subscriptions/{}/changes", SUB).as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "50".into()),
                Matcher::UrlEncoded("nextToken".into(), "page-2".into()),
            ]))
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "events": [event_json("7b0c7f6a-1f8e-4b55-9f0e-0d7e2f1f5a10")],
                    "hasMore": true,
                    "nextToken": "page-3",
                    "count": 1
                })
                .to_string(),
            )
            .create_async()
            .await;

        let page = api(&server)
            .get_changes(Uuid::parse_str(SUB).unwrap(), 50, Some("page-2".to_string()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].table_name, "orders");
        assert!(page.has_more);
        assert_eq!(page.next_token.as_deref(), Some("page-3"));
        assert_eq!(page.count, 1);
    }

    #[tokio::test]
    async fn test_get_changes_error_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = api(&server)
            .get_changes(Uuid::parse_str(SUB).unwrap(), 10, None)
            .await
            .unwrap_err();

        assert!(matches!(err, CdcError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_acknowledge_posts_event_ids() {
        let mut server = Server::new_async().await;
        let id = Uuid::parse_str("7b0c7f6a-1f8e-4b55-9f0e-0d7e2f1f5a10").unwrap();
        let mock = server
            .mock("POST", format!("/api/v1/cdc/subscriptions/{}/ack", SUB).as_str())
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::Json(json!({"eventIds": [id.to_string()]})))
            .with_status(200)
            .with_body(json!({"success": true, "data": {"acknowledged": 1}}).to_string())
            .create_async()
            .await;

        api(&server)
            .acknowledge_changes(Uuid::parse_str(SUB).unwrap(), &[id])
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_acknowledge_rejected_envelope() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", Matcher::Any)
            .with_status(200)
            .with_body(json!({"success": false, "error": "subscription paused"}).to_string())
            .create_async()
            .await;

        let err = api(&server)
            .acknowledge_changes(Uuid::parse_str(SUB).unwrap(), &[Uuid::new_v4()])
            .await
            .unwrap_err();

        match err {
            CdcError::Rejected(reason) => assert_eq!(reason, "subscription paused"),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpChangesApi::new("not a url", StaticToken::none(), Duration::from_secs(1));
        assert!(matches!(result, Err(CdcError::InvalidUrl(_))));
    }
}
