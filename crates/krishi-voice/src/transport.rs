//! Engine channel: bidirectional streaming connection to the conversational engine.
//!
//! Outbound: encoded capture chunks, best-effort, never blocking the capture
//! side (bounded queue, drop on overflow). Inbound: an ordered stream of
//! audio chunks and control events — audio and interruption must never be
//! reordered relative to each other, so everything funnels through one
//! unbounded channel filled by a single receive task.

use crate::codec::EncodedChunk;
use crate::error::{SessionError, SessionResult};
use crate::language;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Outbound queue depth. Capture frames are ~256ms each; a full queue means
/// the link is stalled and stale frames are worthless, so we drop instead.
const OUTBOUND_QUEUE: usize = 32;

/// Inbound traffic, demultiplexed from the engine's server messages.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Decoded-from-base64 PCM16 bytes of synthesized speech.
    Audio(Vec<u8>),
    /// The engine discarded its in-flight turn because the user barged in.
    Interrupted,
    /// The engine finished a response turn.
    TurnComplete,
    /// The channel closed (orderly or not).
    Closed,
    /// The channel failed.
    Error(String),
}

/// Connection configuration. Fixed for the lifetime of one channel:
/// the engine offers no way to change language or voice on an open session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Websocket endpoint of the engine, without credentials.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Prebuilt synthetic voice identifier.
    pub voice: String,
    /// Resolved display name of the target language, e.g. "Marathi".
    pub language_name: String,
    /// Sample rate of the engine's synthesized audio (Hz).
    pub output_sample_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key: String::new(),
            model: "gemini-2.0-flash-live-001".to_string(),
            voice: "Aoede".to_string(),
            language_name: language::DEFAULT_LANGUAGE.to_string(),
            output_sample_rate: 24000,
        }
    }
}

impl TransportConfig {
    /// Build from environment: `KRISHI_LIVE_API_KEY` (required),
    /// `KRISHI_LIVE_ENDPOINT`, `KRISHI_LIVE_MODEL`, `KRISHI_LIVE_VOICE`.
    pub fn from_env() -> SessionResult<Self> {
        let api_key = std::env::var("KRISHI_LIVE_API_KEY")
            .map_err(|_| SessionError::Config("KRISHI_LIVE_API_KEY is not set".to_string()))?;
        let mut config = Self {
            api_key,
            ..Self::default()
        };
        if let Ok(endpoint) = std::env::var("KRISHI_LIVE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("KRISHI_LIVE_MODEL") {
            config.model = model;
        }
        if let Ok(voice) = std::env::var("KRISHI_LIVE_VOICE") {
            config.voice = voice;
        }
        Ok(config)
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    /// The one-time setup payload: audio-only response modality, a fixed
    /// synthetic voice, and the persona brief embedding the language name.
    pub fn setup_message(&self) -> serde_json::Value {
        json!({
            "setup": {
                "model": format!("models/{}", self.model),
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {
                            "prebuiltVoiceConfig": { "voiceName": self.voice }
                        }
                    }
                },
                "systemInstruction": {
                    "parts": [{ "text": language::system_instruction(&self.language_name) }]
                }
            }
        })
    }
}

/// A live channel: outbound chunk sender and ordered inbound event receiver.
///
/// Dropping `chunk_tx` closes the outbound side and initiates channel
/// shutdown. `event_rx` always terminates with `Closed`.
pub struct EngineChannel {
    pub chunk_tx: mpsc::Sender<EncodedChunk>,
    pub event_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Seam for opening channels, so the session controller can be exercised
/// against a fake engine in tests.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, config: &TransportConfig) -> SessionResult<EngineChannel>;
}

/// Production connector over a websocket to the live engine.
#[derive(Debug, Default)]
pub struct LiveConnector;

#[async_trait]
impl EngineConnector for LiveConnector {
    async fn connect(&self, config: &TransportConfig) -> SessionResult<EngineChannel> {
        info!(model = %config.model, language = %config.language_name, "opening engine channel");

        let (ws_stream, _) = connect_async(config.url()).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        ws_tx
            .send(Message::Text(config.setup_message().to_string()))
            .await?;

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<EncodedChunk>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Send task: chunks -> realtime input messages, then an orderly close
        // once the session drops its sender.
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let msg = json!({
                    "realtimeInput": {
                        "mediaChunks": [{ "mimeType": chunk.mime_type, "data": chunk.data }]
                    }
                });
                if ws_tx.send(Message::Text(msg.to_string())).await.is_err() {
                    break;
                }
            }
            debug!("outbound chunk stream ended, closing websocket");
            let _ = ws_tx.close().await;
        });

        // Receive task: the single producer of inbound events, preserving
        // server ordering between audio and control.
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("engine sent non-UTF8 binary frame, skipping");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "engine closed the channel");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                };
                for event in parse_server_message(&text) {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Closed);
        });

        Ok(EngineChannel { chunk_tx, event_rx })
    }
}

/// Parse one server message into zero or more events, in server order.
///
/// Unknown or malformed messages are skipped — a bad audio payload drops
/// that chunk, never the session.
pub fn parse_server_message(text: &str) -> Vec<TransportEvent> {
    let msg: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable engine message, skipping");
            return Vec::new();
        }
    };

    if msg.get("setupComplete").is_some() {
        debug!("engine setup complete");
        return Vec::new();
    }

    let mut events = Vec::new();
    if let Some(content) = msg.get("serverContent") {
        if content
            .get("interrupted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            events.push(TransportEvent::Interrupted);
        }
        if let Some(parts) = content
            .get("modelTurn")
            .and_then(|t| t.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                let Some(data) = part
                    .get("inlineData")
                    .and_then(|d| d.get("data"))
                    .and_then(|d| d.as_str())
                else {
                    continue;
                };
                match BASE64.decode(data) {
                    Ok(bytes) => events.push(TransportEvent::Audio(bytes)),
                    Err(e) => warn!(error = %e, "invalid base64 audio payload, skipping"),
                }
            }
        }
        if content
            .get("turnComplete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            events.push(TransportEvent::TurnComplete);
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_audio_parts() {
        let payload = BASE64.encode([0u8, 1, 2, 3]);
        let msg = json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm", "data": payload } }] }
            }
        });
        let events = parse_server_message(&msg.to_string());
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TransportEvent::Audio(b) if b == &vec![0u8, 1, 2, 3]));
    }

    #[test]
    fn parses_interrupted_before_turn_complete() {
        let msg = json!({
            "serverContent": { "interrupted": true, "turnComplete": true }
        });
        let events = parse_server_message(&msg.to_string());
        assert!(matches!(events[0], TransportEvent::Interrupted));
        assert!(matches!(events[1], TransportEvent::TurnComplete));
    }

    #[test]
    fn setup_complete_yields_nothing() {
        assert!(parse_server_message(r#"{"setupComplete":{}}"#).is_empty());
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(parse_server_message("not json").is_empty());
        assert!(parse_server_message("{}").is_empty());
    }

    #[test]
    fn invalid_base64_audio_is_skipped() {
        let msg = json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "data": "!!not-base64!!" } }] },
                "turnComplete": true
            }
        });
        let events = parse_server_message(&msg.to_string());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransportEvent::TurnComplete));
    }

    #[test]
    fn setup_message_fixes_language_and_voice() {
        let config = TransportConfig {
            language_name: "Marathi".to_string(),
            ..TransportConfig::default()
        };
        let setup = config.setup_message();
        let text = setup.to_string();
        assert!(text.contains("Marathi"));
        assert!(text.contains("Aoede"));
        assert_eq!(
            setup["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
    }

    #[test]
    fn from_env_requires_api_key() {
        std::env::remove_var("KRISHI_LIVE_API_KEY");
        assert!(matches!(
            TransportConfig::from_env(),
            Err(SessionError::Config(_))
        ));

        std::env::set_var("KRISHI_LIVE_API_KEY", "k-test");
        let config = TransportConfig::from_env().unwrap();
        assert_eq!(config.api_key, "k-test");
        assert_eq!(config.output_sample_rate, 24000);
        std::env::remove_var("KRISHI_LIVE_API_KEY");
    }

    #[test]
    fn url_carries_api_key() {
        let config = TransportConfig {
            endpoint: "wss://example.test/live".to_string(),
            api_key: "k123".to_string(),
            ..TransportConfig::default()
        };
        assert_eq!(config.url(), "wss://example.test/live?key=k123");
    }
}
