//! Remote store backed by a hosted PostgREST endpoint.
//!
//! Rows are read and written under `{url}/rest/v1/{table}`. Change
//! notifications come from the realtime service (see [`crate::realtime`]).

use async_trait::async_trait;
use catalog_core::field_map;
use catalog_core::store::Result;
use catalog_core::{ChangeFeed, CollectionKind, Record, RemoteStore, StoreError};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::realtime::{self, ReconnectConfig, RealtimeOptions};

/// REST adapter for the catalog tables.
pub struct PostgrestStore {
    client: Client,
    rest_url: String,
    api_key: String,
    bearer: String,
    schema: String,
    realtime: Option<RealtimeOptions>,
}

impl PostgrestStore {
    /// Build a store from configuration. Returns `None` when the URL or the
    /// anon key is missing.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        let store = &config.store;
        let (Some(base), Some(key)) = (store.base_url(), store.key()) else {
            return Ok(None);
        };

        let mut builder = Client::builder();
        if let Some(timeout) = store.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let realtime = match (config.realtime.enabled, config.realtime_url()) {
            (true, Some(url)) => Some(RealtimeOptions {
                url,
                api_key: key.to_string(),
                access_token: store.access_token.clone().filter(|t| !t.is_empty()),
                schema: store.schema.clone(),
                heartbeat: config.realtime.heartbeat(),
                reconnect: ReconnectConfig {
                    initial_delay: std::time::Duration::from_millis(
                        config.realtime.reconnect_initial_ms,
                    ),
                    max_delay: std::time::Duration::from_millis(config.realtime.reconnect_max_ms),
                    max_attempts: config.realtime.max_reconnect_attempts,
                    ..Default::default()
                },
            }),
            _ => None,
        };

        Ok(Some(Self {
            client,
            rest_url: format!("{base}/rest/v1"),
            api_key: key.to_string(),
            bearer: store.bearer().unwrap_or(key).to_string(),
            schema: store.schema.clone(),
            realtime,
        }))
    }

    pub fn realtime_enabled(&self) -> bool {
        self.realtime.is_some()
    }

    fn table_url(&self, kind: CollectionKind) -> String {
        format!("{}/{}", self.rest_url, kind.table())
    }

    fn request(&self, method: Method, kind: CollectionKind) -> RequestBuilder {
        self.client
            .request(method, self.table_url(kind))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.bearer)
            .header("Accept-Profile", &self.schema)
            .header("Content-Profile", &self.schema)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn rows(&self, request: RequestBuilder) -> Result<Vec<Value>> {
        let response = self.send(request).await?;
        let body = response.text().await.map_err(transport_error)?;
        serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Map a transport failure to a store error.
fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else if e.is_decode() {
        StoreError::Decode(e.to_string())
    } else {
        StoreError::Network(e.to_string())
    }
}

/// Map a non-success HTTP status to a store error.
pub fn status_error(status: StatusCode, body: &str) -> StoreError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            }
        });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StoreError::Timeout(message),
        s if s.is_client_error() => StoreError::Rejected(message),
        _ => StoreError::Network(message),
    }
}

/// Decode one returned row. Numeric ids become strings and null columns fall
/// back to field defaults.
pub fn decode_row(kind: CollectionKind, row: Value) -> Result<Record> {
    let row = match row {
        Value::Object(mut map) => {
            map.retain(|_, v| !v.is_null());
            if let Some(Value::Number(n)) = map.get("id") {
                let id = n.to_string();
                map.insert("id".to_string(), Value::String(id));
            }
            Value::Object(map)
        }
        other => other,
    };
    Ok(field_map::from_row(kind, row)?)
}

fn id_filter(id: &str) -> (&'static str, String) {
    ("id", format!("eq.{id}"))
}

#[async_trait]
impl RemoteStore for PostgrestStore {
    async fn fetch_all(&self, kind: CollectionKind) -> Result<Vec<Record>> {
        let order = format!("{}.desc", kind.order_column());
        let request = self
            .request(Method::GET, kind)
            .query(&[("select", "*"), ("order", order.as_str())]);

        let rows = self.rows(request).await?;
        debug!("Fetched {} {} rows", rows.len(), kind);
        rows.into_iter().map(|row| decode_row(kind, row)).collect()
    }

    async fn insert(&self, record: &Record) -> Result<Record> {
        let kind = record.kind();
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let row = field_map::insert_row(record, &now)?;

        let request = self
            .request(Method::POST, kind)
            .header("Prefer", "return=representation")
            .json(&row);

        let row = self
            .rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode(format!("insert into {kind} returned no row")))?;
        decode_row(kind, row)
    }

    async fn update(&self, id: &str, record: &Record) -> Result<()> {
        let kind = record.kind();
        let row = field_map::update_row(record)?;

        let request = self
            .request(Method::PATCH, kind)
            .query(&[id_filter(id)])
            .header("Prefer", "return=representation")
            .json(&row);

        if self.rows(request).await?.is_empty() {
            return Err(StoreError::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    async fn remove(&self, kind: CollectionKind, id: &str) -> Result<()> {
        let request = self.request(Method::DELETE, kind).query(&[id_filter(id)]);
        self.send(request).await?;
        Ok(())
    }

    async fn watch(&self, kind: CollectionKind) -> Result<ChangeFeed> {
        match &self.realtime {
            Some(options) => realtime::subscribe(options.clone(), kind).await,
            None => Ok(ChangeFeed::idle(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        let body = r#"{"code":"42501","message":"permission denied for table tools"}"#;
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, body),
            StoreError::PermissionDenied("permission denied for table tools".into())
        );
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            StoreError::PermissionDenied(_)
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "{}"),
            StoreError::NotFound(_)
        ));
        assert_eq!(
            status_error(StatusCode::BAD_REQUEST, r#"{"message":"bad column"}"#),
            StoreError::Rejected("bad column".into())
        );
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY, "upstream down"),
            StoreError::Network("upstream down".into())
        );
        assert!(matches!(
            status_error(StatusCode::GATEWAY_TIMEOUT, ""),
            StoreError::Timeout(_)
        ));
    }

    #[test]
    fn test_decode_row_normalizes_server_values() {
        let row = json!({
            "id": 42,
            "name": "Scribe",
            "tags": null,
            "image_url": "https://img/s.png",
            "created_at": "2025-01-01T00:00:00Z"
        });
        let record = decode_row(CollectionKind::Tools, row).unwrap();
        let tool = record.as_tool().unwrap();
        assert_eq!(tool.id, "42");
        assert!(tool.tags.is_empty());
        assert_eq!(tool.image_url, "https://img/s.png");
    }

    #[test]
    fn test_unconfigured_config_builds_nothing() {
        let config = Config::default();
        assert!(PostgrestStore::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_realtime_disabled_by_config() {
        let mut config = Config::default();
        config.store.url = Some("https://abc.supabase.co".into());
        config.store.anon_key = Some("anon".into());
        assert!(PostgrestStore::from_config(&config)
            .unwrap()
            .unwrap()
            .realtime_enabled());

        config.realtime.enabled = false;
        let store = PostgrestStore::from_config(&config).unwrap().unwrap();
        assert!(!store.realtime_enabled());
        assert_eq!(store.rest_url, "https://abc.supabase.co/rest/v1");
    }
}
