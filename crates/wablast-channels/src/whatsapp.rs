//! WhatsApp gateway over an Evolution-style HTTP API.
//!
//! One client serves both roles the engine needs: the Messaging Gateway
//! (`/message/sendText`, `/message/sendMedia`) and the Connection Directory
//! (`/instance/connectionState`, `/instance/fetchInstances`).
//! Every request carries the `apikey` header.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Value, json};
use wablast_core::config::GatewayConfig;
use wablast_core::error::{Result, WablastError};
use wablast_core::traits::{ConnectionDirectory, MessagingGateway};
use wablast_core::types::{
    ConnectionInstance, ConnectionStatus, MediaPayload, MediaType, SendError, SendErrorKind,
};

const UNKNOWN_MESSAGE_ID: &str = "unknown";

/// HTTP client for one Evolution server.
pub struct EvolutionGateway {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl EvolutionGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    fn url(&self, path: &str, instance: &str) -> String {
        format!("{}/{}/{}", self.base_url, path, instance)
    }

    async fn post_message(
        &self,
        path: &str,
        instance: &str,
        body: &Value,
    ) -> std::result::Result<String, SendError> {
        let response = self
            .client
            .post(self.url(path, instance))
            .header("apikey", &self.api_key)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SendError {
                kind: classify_status(status),
                message: format!("gateway returned {status}: {}", truncate(&text, 300)),
            });
        }

        // Accepted: an unreadable body must not turn into a resend.
        match response.text().await {
            Ok(text) => Ok(accepted_message_id(&text)),
            Err(e) => {
                tracing::warn!("⚠️ Gateway accepted message via {instance} but body was unreadable: {e}");
                Ok(UNKNOWN_MESSAGE_ID.to_string())
            }
        }
    }

    async fn get_json(&self, request: RequestBuilder) -> Result<Value> {
        let response = request
            .header("apikey", &self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| WablastError::Gateway(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WablastError::Gateway(format!(
                "gateway returned {status}: {}",
                truncate(&text, 300)
            )));
        }

        response
            .json()
            .await
            .map_err(|e| WablastError::Gateway(format!("invalid gateway response: {e}")))
    }

    /// Encode the media source for the request body: URLs pass through,
    /// local files are inlined as base64.
    async fn media_source(media: &MediaPayload) -> std::result::Result<String, SendError> {
        if media.is_remote() {
            return Ok(media.source.clone());
        }
        let bytes = tokio::fs::read(&media.source)
            .await
            .map_err(|e| SendError::permanent(format!("cannot read media '{}': {e}", media.source)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

#[async_trait]
impl MessagingGateway for EvolutionGateway {
    async fn send_text(
        &self,
        instance: &str,
        destination: &str,
        text: &str,
    ) -> std::result::Result<String, SendError> {
        let body = json!({ "number": destination, "text": text });
        let id = self.post_message("message/sendText", instance, &body).await?;
        tracing::debug!("WhatsApp text sent via {instance}: {id} → {destination}");
        Ok(id)
    }

    async fn send_media(
        &self,
        instance: &str,
        destination: &str,
        media: &MediaPayload,
        caption: &str,
    ) -> std::result::Result<String, SendError> {
        let source = Self::media_source(media).await?;
        let body = media_body(destination, media, &source, caption);
        let id = self.post_message("message/sendMedia", instance, &body).await?;
        tracing::debug!(
            "WhatsApp {} sent via {instance}: {id} → {destination}",
            media.media_type.as_str()
        );
        Ok(id)
    }
}

#[async_trait]
impl ConnectionDirectory for EvolutionGateway {
    async fn get_status(&self, instance: &str) -> Result<ConnectionStatus> {
        let value = self
            .get_json(self.client.get(self.url("instance/connectionState", instance)))
            .await?;
        parse_connection_state(&value)
    }

    async fn fetch_instance(&self, instance: &str) -> Result<ConnectionInstance> {
        let request = self
            .client
            .get(format!("{}/instance/fetchInstances", self.base_url))
            .query(&[("instanceName", instance)]);
        let value = self.get_json(request).await?;
        let entry = match &value {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        parse_instance(instance, &entry)
    }
}

/// 408, 429 and 5xx are worth retrying; other 4xx mean the request itself is bad.
pub fn classify_status(status: StatusCode) -> SendErrorKind {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        SendErrorKind::Transient
    } else {
        SendErrorKind::Permanent
    }
}

fn classify_request_error(e: reqwest::Error) -> SendError {
    if e.is_builder() {
        SendError::permanent(format!("invalid request: {e}"))
    } else if e.is_timeout() {
        SendError::transient(format!("request timed out: {e}"))
    } else {
        SendError::transient(format!("request failed: {e}"))
    }
}

fn media_body(destination: &str, media: &MediaPayload, source: &str, caption: &str) -> Value {
    let mediatype = match media.media_type {
        MediaType::Image | MediaType::Text => "image",
        MediaType::Video => "video",
        MediaType::Audio => "audio",
        MediaType::Document => "document",
    };
    let mut body = json!({
        "number": destination,
        "mediatype": mediatype,
        "media": source,
        "caption": caption,
    });
    if let Some(mime) = &media.mime_type {
        body["mimetype"] = json!(mime);
    }
    if let Some(name) = &media.file_name {
        body["fileName"] = json!(name);
    }
    body
}

fn message_id(result: &Value) -> String {
    result["key"]["id"]
        .as_str()
        .or_else(|| result["messages"][0]["id"].as_str())
        .unwrap_or(UNKNOWN_MESSAGE_ID)
        .to_string()
}

/// Message id from the body of a 2xx send. Non-JSON bodies still count as
/// accepted.
fn accepted_message_id(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(result) => message_id(&result),
        Err(_) => UNKNOWN_MESSAGE_ID.to_string(),
    }
}

fn parse_connection_state(value: &Value) -> Result<ConnectionStatus> {
    let state = value["instance"]["state"]
        .as_str()
        .or_else(|| value["state"].as_str())
        .ok_or_else(|| WablastError::Gateway(format!("missing connection state in {value}")))?;
    state.parse().map_err(WablastError::Gateway)
}

fn parse_instance(name: &str, entry: &Value) -> Result<ConnectionInstance> {
    let status = entry["connectionStatus"]
        .as_str()
        .ok_or_else(|| WablastError::Gateway(format!("instance '{name}' not found")))?;
    let last_activity = entry["updatedAt"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    Ok(ConnectionInstance {
        name: entry["name"].as_str().unwrap_or(name).to_string(),
        connection_status: status.parse().map_err(WablastError::Gateway)?,
        messages: entry["_count"]["Message"].as_u64().unwrap_or(0),
        contacts: entry["_count"]["Contact"].as_u64().unwrap_or(0),
        chats: entry["_count"]["Chat"].as_u64().unwrap_or(0),
        last_activity,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
