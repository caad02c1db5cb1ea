//! HTTP remote store
//!
//! Speaks the PostgREST dialect: tables under `/rest/v1/<table>`, query
//! parameters for ordering and limits, `id=eq.<key>` row filters, and a
//! `{code, message}` error body where `PGRST116` means "no rows".

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::traits::{EntityKind, RemoteStore, Select};
use crate::error::{Error, Result};

/// Error code returned when a single-object read matches no rows
const NO_ROWS_CODE: &str = "PGRST116";

/// Media type that makes the server return one object instead of an array
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Remote store reached over HTTP
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn table_url(&self, kind: EntityKind) -> String {
        format!("{}/rest/v1/{}", self.base_url, kind.table())
    }

    fn select_url(&self, query: &Select) -> String {
        let mut url = format!("{}?select=*", self.table_url(query.kind));
        if let Some(column) = query.order_by {
            let direction = if query.descending { "desc" } else { "asc" };
            url.push_str(&format!("&order={}.{}", column, direction));
        }
        if let Some(limit) = query.limit {
            url.push_str(&format!("&limit={}", limit));
        }
        url
    }

    fn row_url(&self, kind: EntityKind, key: &str) -> String {
        format!("{}?id=eq.{}", self.table_url(kind), key)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(error_from_response(status, &body))
    }
}

impl RemoteStore for RestStore {
    #[instrument(skip(self), fields(table = %query.kind))]
    async fn select(&self, query: Select) -> Result<Vec<Value>> {
        let response = self.send(self.client.get(self.select_url(&query))).await?;
        let rows: Vec<Value> = response.json().await?;
        debug!(count = rows.len(), "Rows selected");
        Ok(rows)
    }

    #[instrument(skip(self), fields(table = %kind))]
    async fn select_single(&self, kind: EntityKind) -> Result<Value> {
        let url = format!("{}?select=*", self.table_url(kind));
        let request = self.client.get(url).header(ACCEPT, SINGLE_OBJECT);
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    async fn insert(&self, kind: EntityKind, row: Value) -> Result<()> {
        let request = self.client.post(self.table_url(kind)).json(&row);
        self.send(request).await?;
        Ok(())
    }

    async fn update(&self, kind: EntityKind, key: &str, patch: Value) -> Result<()> {
        let request = self.client.patch(self.row_url(kind, key)).json(&patch);
        self.send(request).await?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, key: &str) -> Result<()> {
        self.send(self.client.delete(self.row_url(kind, key))).await?;
        Ok(())
    }
}

/// Map a non-success response to a store error
fn error_from_response(status: StatusCode, body: &str) -> Error {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let (code, message) = match parsed {
        Some(ErrorBody { code, message }) => (code, message),
        None => (None, None),
    };

    if code.as_deref() == Some(NO_ROWS_CODE) {
        return Error::NotFound(message.unwrap_or_else(|| "no rows".to_string()));
    }

    Error::Remote {
        code: code.or_else(|| Some(status.as_str().to_string())),
        message: message.unwrap_or_else(|| format!("HTTP {}", status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_url() {
        let store = RestStore::new("https://example.test/", "key");
        let query = Select::from(EntityKind::Message)
            .order_by("timestamp")
            .descending()
            .limit(100);
        assert_eq!(
            store.select_url(&query),
            "https://example.test/rest/v1/game_messages?select=*&order=timestamp.desc&limit=100"
        );
    }

    #[test]
    fn test_row_url() {
        let store = RestStore::new("https://example.test", "key");
        assert_eq!(
            store.row_url(EntityKind::Participant, "abc"),
            "https://example.test/rest/v1/game_players?id=eq.abc"
        );
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let body = r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#;
        let err = error_from_response(StatusCode::NOT_ACCEPTABLE, body);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_errors_keep_code() {
        let body = r#"{"code":"42501","message":"permission denied"}"#;
        match error_from_response(StatusCode::FORBIDDEN, body) {
            Error::Remote { code, message } => {
                assert_eq!(code.as_deref(), Some("42501"));
                assert_eq!(message, "permission denied");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unparseable_body_uses_status() {
        match error_from_response(StatusCode::BAD_GATEWAY, "<html>") {
            Error::Remote { code, .. } => assert_eq!(code.as_deref(), Some("502")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
