//! Support backend adapter
//!
//! Assistant replies, gate refusals, and hand-off notification all live
//! behind one HTTP endpoint that dispatches on an `action` field in the
//! POST body. This module speaks that wire contract and translates the
//! response envelope into typed outcomes; the session never sees raw JSON.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use frontdesk_core::TranscriptEntry;

use crate::gate::{GateDecision, QuotaWindow};

/// Status strings in the backend response envelope.
mod status {
    pub const SUCCESS: &str = "success";
    pub const BANNED: &str = "banned";
    pub const RATE_LIMITED_DAILY: &str = "rate_limited_daily";
    pub const RATE_LIMITED_SHORT_WINDOW: &str = "rate_limited_short_window";
}

const DEFAULT_BAN_MESSAGE: &str = "You have been banned from using this service.";

/// Result of `initChat`: a ready session or an immediate ban.
#[derive(Debug)]
pub enum InitChatOutcome {
    Ready(ChatBootstrap),
    Banned { message: String },
}

/// Everything the widget needs to start serving a returning visitor.
#[derive(Debug, Clone)]
pub struct ChatBootstrap {
    pub device_id: String,
    pub history: Vec<TranscriptEntry>,
    /// Absent when the backend does not track quota for this visitor.
    pub remaining_quota: Option<u32>,
}

/// Result of `sendMessage`: an assistant reply or a gate refusal.
#[derive(Debug)]
pub enum SendOutcome {
    Reply(AssistantReply),
    Refused(GateDecision),
}

#[derive(Debug, Clone)]
pub struct AssistantReply {
    pub text: String,
    /// The assistant judged the question beyond its scope.
    pub needs_human_support: bool,
    pub remaining_quota: Option<u32>,
}

/// The backend seam the widget session drives. Tests script it; production
/// uses [`HttpSupportBackend`].
#[async_trait]
pub trait SupportBackend: Send + Sync {
    /// Establish or resume the visitor's session from a browser fingerprint.
    async fn init_chat(&self, fingerprint: &Value) -> Result<InitChatOutcome>;

    /// One assistant turn: the visitor's message plus recent context.
    async fn send_message(
        &self,
        device_id: &str,
        message: &str,
        recent_history: &[TranscriptEntry],
    ) -> Result<SendOutcome>;

    /// Tell the backend a visitor is waiting in the given relay room so it
    /// can page an agent.
    async fn request_human_support(
        &self,
        device_id: &str,
        room_id: &str,
        peer_id: &str,
    ) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct InitChatRequest<'a> {
    action: &'static str,
    fingerprint: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    action: &'static str,
    device_id: &'a str,
    message: &'a str,
    recent_history: &'a [TranscriptEntry],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HandoffRequest<'a> {
    action: &'static str,
    device_id: &'a str,
    room_id: &'a str,
    peer_id: &'a str,
}

/// One envelope covers every action; fields missing from a given response
/// just default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendEnvelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    chat_history: Vec<TranscriptEntry>,
    #[serde(default)]
    remaining_quota: Option<u32>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    needs_human_support: bool,
    #[serde(default)]
    retry_after: Option<Value>,
}

impl BackendEnvelope {
    fn ban_message(&self) -> String {
        self.message.clone().unwrap_or_else(|| DEFAULT_BAN_MESSAGE.to_string())
    }

    /// Human-readable wait hint for a rate-limit refusal, preferring the
    /// server's own message over a bare retry-after value.
    fn retry_hint(&self) -> Option<String> {
        if let Some(message) = &self.message {
            return Some(message.clone());
        }
        match &self.retry_after {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(format!("Try again in {n} seconds.")),
            _ => None,
        }
    }
}

fn interpret_init(envelope: BackendEnvelope) -> Result<InitChatOutcome> {
    match envelope.status.as_str() {
        status::SUCCESS => {
            let device_id = envelope
                .device_id
                .ok_or_else(|| anyhow!("initChat response is missing deviceId"))?;
            Ok(InitChatOutcome::Ready(ChatBootstrap {
                device_id,
                history: envelope.chat_history,
                remaining_quota: envelope.remaining_quota,
            }))
        }
        status::BANNED => Ok(InitChatOutcome::Banned { message: envelope.ban_message() }),
        other => Err(anyhow!(
            "initChat failed: {}",
            envelope.message.as_deref().unwrap_or(other)
        )),
    }
}

fn interpret_send(envelope: BackendEnvelope) -> Result<SendOutcome> {
    match envelope.status.as_str() {
        status::SUCCESS => {
            let text = envelope
                .response
                .ok_or_else(|| anyhow!("sendMessage response is missing a reply body"))?;
            Ok(SendOutcome::Reply(AssistantReply {
                text,
                needs_human_support: envelope.needs_human_support,
                remaining_quota: envelope.remaining_quota,
            }))
        }
        status::BANNED => {
            Ok(SendOutcome::Refused(GateDecision::Banned { reason: envelope.ban_message() }))
        }
        status::RATE_LIMITED_DAILY => Ok(SendOutcome::Refused(GateDecision::QuotaExceeded {
            window: QuotaWindow::Daily,
            retry_hint: envelope.retry_hint(),
        })),
        status::RATE_LIMITED_SHORT_WINDOW => {
            Ok(SendOutcome::Refused(GateDecision::QuotaExceeded {
                window: QuotaWindow::ShortWindow,
                retry_hint: envelope.retry_hint(),
            }))
        }
        other => Err(anyhow!(
            "sendMessage failed: {}",
            envelope.message.as_deref().unwrap_or(other)
        )),
    }
}

/// HTTP adapter for the production support backend.
#[derive(Clone)]
pub struct HttpSupportBackend {
    http: Client,
    endpoint: String,
}

impl HttpSupportBackend {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, endpoint: endpoint.into() })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<B: Serialize + Sync>(&self, body: &B) -> Result<BackendEnvelope> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach support backend at {}", self.endpoint))?;

        if !resp.status().is_success() {
            return Err(anyhow!("Support backend returned HTTP {}", resp.status()));
        }

        resp.json::<BackendEnvelope>()
            .await
            .context("Failed to parse support backend response")
    }
}

#[async_trait]
impl SupportBackend for HttpSupportBackend {
    async fn init_chat(&self, fingerprint: &Value) -> Result<InitChatOutcome> {
        debug!("Initializing chat session against {}", self.endpoint);
        let envelope = self.post(&InitChatRequest { action: "initChat", fingerprint }).await?;
        let outcome = interpret_init(envelope)?;
        if let InitChatOutcome::Ready(bootstrap) = &outcome {
            info!(
                "Chat session ready for device {} ({} history entries)",
                bootstrap.device_id,
                bootstrap.history.len()
            );
        }
        Ok(outcome)
    }

    async fn send_message(
        &self,
        device_id: &str,
        message: &str,
        recent_history: &[TranscriptEntry],
    ) -> Result<SendOutcome> {
        debug!("Submitting visitor message for device {}", device_id);
        let envelope = self
            .post(&SendMessageRequest {
                action: "sendMessage",
                device_id,
                message,
                recent_history,
            })
            .await?;
        interpret_send(envelope)
    }

    async fn request_human_support(
        &self,
        device_id: &str,
        room_id: &str,
        peer_id: &str,
    ) -> Result<()> {
        let envelope = self
            .post(&HandoffRequest {
                action: "requestHumanSupport",
                device_id,
                room_id,
                peer_id,
            })
            .await?;
        if envelope.status == status::SUCCESS {
            info!("Hand-off registered for room {}", room_id);
            Ok(())
        } else {
            Err(anyhow!(
                "requestHumanSupport failed: {}",
                envelope.message.as_deref().unwrap_or(&envelope.status)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frontdesk_core::ChatRole;
    use serde_json::json;

    #[test]
    fn test_send_message_request_wire_shape() {
        let history = vec![TranscriptEntry::user("hello")];
        let req = SendMessageRequest {
            action: "sendMessage",
            device_id: "dev-1",
            message: "where is my order?",
            recent_history: &history,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["action"], "sendMessage");
        assert_eq!(value["deviceId"], "dev-1");
        assert_eq!(value["recentHistory"][0]["role"], "user");
    }

    #[test]
    fn test_handoff_request_wire_shape() {
        let req = HandoffRequest {
            action: "requestHumanSupport",
            device_id: "dev-1",
            room_id: "support_dev-1_17",
            peer_id: "visitor_dev-1_17",
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["action"], "requestHumanSupport");
        assert_eq!(value["roomId"], "support_dev-1_17");
        assert_eq!(value["peerId"], "visitor_dev-1_17");
    }

    #[test]
    fn test_interpret_init_success() {
        let envelope: BackendEnvelope = serde_json::from_value(json!({
            "status": "success",
            "deviceId": "dev-42",
            "chatHistory": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello!"}
            ],
            "remainingQuota": 12
        }))
        .unwrap();
        match interpret_init(envelope).unwrap() {
            InitChatOutcome::Ready(bootstrap) => {
                assert_eq!(bootstrap.device_id, "dev-42");
                assert_eq!(bootstrap.history.len(), 2);
                assert_eq!(bootstrap.history[1].role, ChatRole::Assistant);
                assert_eq!(bootstrap.remaining_quota, Some(12));
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_init_banned_uses_server_message() {
        let envelope: BackendEnvelope = serde_json::from_value(json!({
            "status": "banned",
            "message": "Access suspended."
        }))
        .unwrap();
        match interpret_init(envelope).unwrap() {
            InitChatOutcome::Banned { message } => assert_eq!(message, "Access suspended."),
            other => panic!("expected banned, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_init_missing_device_id_is_an_error() {
        let envelope: BackendEnvelope =
            serde_json::from_value(json!({"status": "success"})).unwrap();
        assert!(interpret_init(envelope).is_err());
    }

    #[test]
    fn test_interpret_send_reply_with_handoff_flag() {
        let envelope: BackendEnvelope = serde_json::from_value(json!({
            "status": "success",
            "response": "Let me get a human for that.",
            "needsHumanSupport": true,
            "remainingQuota": 9
        }))
        .unwrap();
        match interpret_send(envelope).unwrap() {
            SendOutcome::Reply(reply) => {
                assert!(reply.needs_human_support);
                assert_eq!(reply.remaining_quota, Some(9));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_send_daily_limit() {
        let envelope: BackendEnvelope = serde_json::from_value(json!({
            "status": "rate_limited_daily",
            "message": "Daily limit reached."
        }))
        .unwrap();
        match interpret_send(envelope).unwrap() {
            SendOutcome::Refused(GateDecision::QuotaExceeded { window, retry_hint }) => {
                assert_eq!(window, QuotaWindow::Daily);
                assert_eq!(retry_hint.as_deref(), Some("Daily limit reached."));
            }
            other => panic!("expected daily refusal, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_send_short_window_with_numeric_retry() {
        let envelope: BackendEnvelope = serde_json::from_value(json!({
            "status": "rate_limited_short_window",
            "retryAfter": 5
        }))
        .unwrap();
        match interpret_send(envelope).unwrap() {
            SendOutcome::Refused(GateDecision::QuotaExceeded { window, retry_hint }) => {
                assert_eq!(window, QuotaWindow::ShortWindow);
                assert_eq!(retry_hint.as_deref(), Some("Try again in 5 seconds."));
            }
            other => panic!("expected short-window refusal, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_send_banned_default_message() {
        let envelope: BackendEnvelope =
            serde_json::from_value(json!({"status": "banned"})).unwrap();
        match interpret_send(envelope).unwrap() {
            SendOutcome::Refused(GateDecision::Banned { reason }) => {
                assert_eq!(reason, DEFAULT_BAN_MESSAGE);
            }
            other => panic!("expected ban, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_send_error_status() {
        let envelope: BackendEnvelope = serde_json::from_value(json!({
            "status": "error",
            "message": "model overloaded"
        }))
        .unwrap();
        let err = interpret_send(envelope).unwrap_err();
        assert!(err.to_string().contains("model overloaded"));
    }

    #[tokio::test]
    async fn test_init_chat_unreachable_backend() {
        let backend = HttpSupportBackend::new("http://127.0.0.1:1/api/chat").unwrap();
        let result = backend.init_chat(&json!({"ua": "test"})).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to reach support backend"));
    }

    #[tokio::test]
    async fn test_send_message_unreachable_backend() {
        let backend = HttpSupportBackend::new("http://127.0.0.1:1/api/chat").unwrap();
        let result = backend.send_message("dev-1", "hello", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_request_human_support_unreachable_backend() {
        let backend = HttpSupportBackend::new("http://127.0.0.1:1/api/chat").unwrap();
        let result = backend.request_human_support("dev-1", "room", "peer").await;
        assert!(result.is_err());
    }
}
