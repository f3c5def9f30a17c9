//! HTTP data layer used for refetches and confirming calls.
//!
//! The engine only decides *when* to fetch and how to reconcile the result;
//! transport of the request is behind the `DataSource` trait.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheKey, Page};
use crate::transport::Credentials;

/// Errors that can occur while fetching server state
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status} for {key}")]
    Status { status: u16, key: String },

    #[error("Missing credential")]
    Unauthorized,

    #[error("Data source unavailable: {0}")]
    Unavailable(String),
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Source of truth for cached query results
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch one page of a paginated resource, starting at `cursor`
    async fn fetch_page(&self, key: &CacheKey, cursor: Option<&str>) -> FetchResult<Page>;

    /// Fetch a scalar resource such as an unread counter
    async fn fetch_scalar(&self, key: &CacheKey) -> FetchResult<i64>;
}

#[derive(Debug, Deserialize)]
struct ScalarBody {
    value: i64,
}

/// `reqwest`-backed data source.
///
/// Resources map to `GET {base}/{resource}?{params}`; paged responses are
/// `{"items": [...], "nextCursor": "..."}` and scalars are `{"value": n}`.
#[derive(Clone)]
pub struct HttpDataSource {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpDataSource {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Full URL for a cache key (without query string)
    pub fn url_for(&self, key: &CacheKey) -> String {
        format!("{}/{}", self.base_url, key.resource)
    }

    async fn get(&self, key: &CacheKey, cursor: Option<&str>) -> FetchResult<reqwest::Response> {
        let token = self.credentials.token().ok_or(FetchError::Unauthorized)?;

        let mut query: Vec<(&str, &str)> = key
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        debug!("GET {} {:?}", self.url_for(key), query);

        let response = self
            .client
            .get(self.url_for(key))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(FetchError::Unauthorized);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                key: key.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch_page(&self, key: &CacheKey, cursor: Option<&str>) -> FetchResult<Page> {
        let page = self.get(key, cursor).await?.json::<Page>().await?;
        Ok(page)
    }

    async fn fetch_scalar(&self, key: &CacheKey) -> FetchResult<i64> {
        let body = self.get(key, None).await?.json::<ScalarBody>().await?;
        Ok(body.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_strips_trailing_slash() {
        let source = HttpDataSource::new("http://localhost:5000/api/", Credentials::anonymous());
        let key = CacheKey::new("notifications").with_param("filter", "unread");
        assert_eq!(source.url_for(&key), "http://localhost:5000/api/notifications");
    }

    #[tokio::test]
    async fn test_fetch_without_credential_is_unauthorized() {
        let source = HttpDataSource::new("http://127.0.0.1:9", Credentials::anonymous());
        let result = source.fetch_scalar(&CacheKey::new("notifications/unread-count")).await;
        assert!(matches!(result, Err(FetchError::Unauthorized)));
    }

    #[test]
    fn test_page_body_shape() {
        let page: Page = serde_json::from_str(
            r#"{"items": [{"id": 1, "isRead": false}], "nextCursor": "abc"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }
}
