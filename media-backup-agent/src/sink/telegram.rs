//! Bot HTTP API client used as the document sink and command source.

use super::{
    CommandSource, Delivery, DeliveryError, DocumentSink, IncomingMessage, RemoteTarget,
};
use crate::config::RemoteConfig;
use crate::fs::FileRecord;
use crate::transfer::progress::format_bytes;
use crate::transfer::{ProgressCallback, ProgressStream};
use crate::utils::device_name;
use crate::Result;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Captions longer than this are rejected by the remote.
const MAX_CAPTION_CHARS: usize = 1024;

/// Seconds a `getUpdates` call waits for new messages
const LONG_POLL_SECS: u64 = 25;

/// Used when a 429 arrives without a hint
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Clone)]
pub struct TelegramSink {
    client: Client,
    api_base: String,
    max_payload_bytes: u64,
    device: String,
}

impl TelegramSink {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            max_payload_bytes: config.max_payload_bytes,
            device: device_name(),
        })
    }

    fn method_url(&self, target: &RemoteTarget, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, target.token, method)
    }

    fn caption(&self, file: &FileRecord) -> String {
        let origin = file
            .path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let caption = format!(
            "<b>{}</b>\nSize: {}\nModified: {}\nDevice: {}\nFolder: <code>{}</code>",
            escape_html(&file.file_name()),
            format_bytes(file.size),
            file.last_modified.format("%Y-%m-%d %H:%M"),
            escape_html(&self.device),
            escape_html(&origin),
        );

        if caption.chars().count() <= MAX_CAPTION_CHARS {
            caption
        } else {
            format!(
                "<b>{}</b>\nSize: {}",
                escape_html(&file.file_name()),
                format_bytes(file.size)
            )
        }
    }
}

#[async_trait]
impl DocumentSink for TelegramSink {
    async fn send_document(
        &self,
        target: &RemoteTarget,
        file: &FileRecord,
        progress: ProgressCallback,
    ) -> std::result::Result<Delivery, DeliveryError> {
        let handle = tokio::fs::File::open(&file.path).await?;
        let length = handle.metadata().await?.len();

        let stream = ProgressStream::new(ReaderStream::new(handle), progress);
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), length)
            .file_name(file.file_name())
            .mime_str(mime_for(&file.path))?;

        let form = Form::new()
            .text("chat_id", target.target_id.clone())
            .text("caption", self.caption(file))
            .text("parse_mode", "HTML")
            .part("document", part);

        debug!(file = %file.path.display(), "sendDocument ({} bytes)", length);
        let resp = self
            .client
            .post(self.method_url(target, "sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let result = classify_response(status, &body)?;
        Ok(Delivery {
            remote_ref: message_id(&result),
        })
    }

    async fn send_message(
        &self,
        target: &RemoteTarget,
        text: &str,
    ) -> std::result::Result<Delivery, DeliveryError> {
        let body = serde_json::json!({
            "chat_id": target.target_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        let resp = self
            .client
            .post(self.method_url(target, "sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let result = classify_response(status, &text)?;
        Ok(Delivery {
            remote_ref: message_id(&result),
        })
    }

    fn max_payload_bytes(&self) -> u64 {
        self.max_payload_bytes
    }
}

#[async_trait]
impl CommandSource for TelegramSink {
    async fn fetch_updates(
        &self,
        target: &RemoteTarget,
        offset: i64,
    ) -> std::result::Result<Vec<IncomingMessage>, DeliveryError> {
        let resp = self
            .client
            .get(self.method_url(target, "getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", LONG_POLL_SECS.to_string()),
            ])
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let messages = parse_updates(classify_response(status, &body)?);
        if !messages.is_empty() {
            info!("Received {} command message(s)", messages.len());
        }
        Ok(messages)
    }
}

/// Map an API response onto `result` or a classified [`DeliveryError`].
pub fn classify_response(status: u16, body: &str) -> std::result::Result<Value, DeliveryError> {
    let parsed: Option<ApiResponse> = serde_json::from_str(body).ok();

    let retry_hint = parsed
        .as_ref()
        .and_then(|r| r.parameters.as_ref())
        .and_then(|p| p.retry_after);

    if status == 429 || (retry_hint.is_some() && !parsed.as_ref().is_some_and(|r| r.ok)) {
        return Err(DeliveryError::RateLimited {
            retry_after: Duration::from_secs(retry_hint.unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
        });
    }

    match parsed {
        Some(resp) if resp.ok && (200..300).contains(&status) => {
            Ok(resp.result.unwrap_or(Value::Null))
        }
        Some(resp) => Err(DeliveryError::Rejected {
            status,
            message: resp
                .description
                .unwrap_or_else(|| "request not accepted".to_string()),
        }),
        None => Err(DeliveryError::Rejected {
            status,
            message: body.chars().take(200).collect(),
        }),
    }
}

fn message_id(result: &Value) -> Option<String> {
    result
        .get("message_id")
        .and_then(|id| id.as_i64())
        .map(|id| id.to_string())
}

fn parse_updates(result: Value) -> Vec<IncomingMessage> {
    let updates: Vec<Update> = serde_json::from_value(result).unwrap_or_default();
    updates
        .into_iter()
        .filter_map(|u| {
            let message = u.message?;
            Some(IncomingMessage {
                update_id: u.update_id,
                chat_id: message.chat.id.to_string(),
                text: message.text?,
            })
        })
        .collect()
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        _ => "application/octet-stream",
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
