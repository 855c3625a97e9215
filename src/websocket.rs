//! # WebSocket Relay Endpoint
//!
//! Bridges one client WebSocket at `/ws/{session_id}` to the session's relay.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: server sends `session_ready` with the available modes
//! 2. **Session**: client sends `create_session`; the relay starts right away
//! 3. **Audio Streaming**: binary PCM frames or `audio_data` JSON messages go
//!    upstream; synthesized audio comes back as `audio_chunk` messages
//! 4. **Control**: `text_input`, `user_interruption`, `stop_audio`,
//!    `start_audio`, `end_session`, `ping`
//! 5. **Disconnect**: closing the socket ends the session
//!
//! ## Message Format:
//! Every JSON message is an envelope `{"type": "...", "data": {...}}`.
//!
//! The actor never blocks on the relay: client input goes through a bounded
//! channel with `try_send`, and relay events arrive as an actor stream.

use crate::audio::AudioFormat;
use crate::session::{ClientEvent, ClientInput, ClientLink, RelayExit};
use crate::state::{AppState, RelayCounters};
use crate::transcription::{CompletionReason, Speaker};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw `{type, data}` envelope; `data` is decoded per type.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateSessionData {
    pub mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AudioData {
    /// Base64 audio. Older clients send it as `audio_data`.
    #[serde(alias = "audio_data")]
    pub audio: String,
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TextInputData {
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PingData {
    pub timestamp: Option<u64>,
}

/// Messages a client may send.
#[derive(Debug)]
pub enum ClientMessage {
    CreateSession(CreateSessionData),
    StartAudio,
    StopAudio,
    AudioData(AudioData),
    TextInput(TextInputData),
    UserInterruption,
    EndSession,
    Ping(PingData),
}

fn payload<T: DeserializeOwned + Default>(data: serde_json::Value) -> Result<T, String> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|e| format!("Invalid message data: {}", e))
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, String> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| format!("Invalid JSON: {}", e))?;

        let message = match envelope.kind.as_str() {
            "create_session" => ClientMessage::CreateSession(payload(envelope.data)?),
            "start_audio" => ClientMessage::StartAudio,
            "stop_audio" => ClientMessage::StopAudio,
            "audio_data" => ClientMessage::AudioData(payload(envelope.data)?),
            "text_input" => ClientMessage::TextInput(payload(envelope.data)?),
            "user_interruption" => ClientMessage::UserInterruption,
            "end_session" => ClientMessage::EndSession,
            "ping" => ClientMessage::Ping(payload(envelope.data)?),
            other => return Err(format!("Unknown message type '{}'", other)),
        };
        Ok(message)
    }
}

impl AudioData {
    /// Decode into relay input. Format defaults to raw PCM.
    pub fn into_input(self) -> Result<ClientInput, String> {
        let data = BASE64
            .decode(self.audio.trim())
            .map_err(|e| format!("Invalid base64 audio: {}", e))?;
        if data.is_empty() {
            return Err("Empty audio payload".to_string());
        }
        let format = self
            .format
            .as_deref()
            .map(AudioFormat::from_declared)
            .unwrap_or(AudioFormat::Pcm);
        Ok(ClientInput::Audio {
            data,
            format,
            sample_rate: self.sample_rate,
        })
    }
}

/// Messages the server sends.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionReady {
        session_id: String,
        prompts: serde_json::Value,
    },
    SessionCreated {
        session_id: String,
        mode: String,
    },
    AudioStarted {
        session_id: String,
    },
    AudioStopped {
        session_id: String,
        reason: String,
    },
    SessionEnded {
        session_id: String,
    },
    AudioChunk {
        session_id: String,
        audio: String,
        timestamp: String,
        sample_rate: u32,
        format: String,
    },
    Transcript {
        session_id: String,
        speaker: Speaker,
        text: String,
        reason: CompletionReason,
    },
    TurnComplete {
        session_id: String,
    },
    Interrupted {
        session_id: String,
    },
    Pong {
        timestamp: Option<u64>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn from_event(session_id: &str, event: ClientEvent) -> Self {
        let session_id = session_id.to_string();
        match event {
            ClientEvent::Audio {
                data,
                sample_rate,
                timestamp,
            } => ServerMessage::AudioChunk {
                session_id,
                audio: BASE64.encode(data),
                timestamp: timestamp.to_rfc3339(),
                sample_rate,
                format: AudioFormat::Pcm.mime_type(sample_rate),
            },
            ClientEvent::Transcript(utterance) => ServerMessage::Transcript {
                session_id,
                speaker: utterance.speaker,
                text: utterance.text,
                reason: utterance.reason,
            },
            ClientEvent::Interrupted => ServerMessage::Interrupted { session_id },
            ClientEvent::TurnComplete => ServerMessage::TurnComplete { session_id },
            ClientEvent::Stopped(exit) => ServerMessage::AudioStopped {
                session_id,
                reason: exit.reason().to_string(),
            },
        }
    }
}

/// WebSocket actor for one client connection.
pub struct RelaySocket {
    session_id: String,
    state: AppState,
    /// Sender into the running relay, if any
    inbound: Option<mpsc::Sender<ClientInput>>,
    /// Set once this connection created or started the session
    owns_session: bool,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(session_id: String, state: AppState) -> Self {
        Self {
            session_id,
            state,
            inbound: None,
            owns_session: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!(session_id = %self.session_id, "Failed to serialize message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: impl Into<String>) {
        let message = message.into();
        warn!(session_id = %self.session_id, "WebSocket error: {}", message);
        self.send(ctx, &ServerMessage::Error { message });
    }

    fn prompt_summary(&self) -> serde_json::Value {
        let modes = self
            .state
            .catalog
            .modes()
            .iter()
            .map(|(key, mode)| {
                (
                    key.clone(),
                    serde_json::json!({
                        "name": mode.name,
                        "description": mode.description,
                        "welcome_message": mode.welcome_message,
                    }),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(modes)
    }

    fn handle_create_session(&mut self, data: CreateSessionData, ctx: &mut ws::WebsocketContext<Self>) {
        let mode = data
            .mode
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.state.get_config().sessions.default_mode);

        match self.state.registry.create(&self.session_id, &mode) {
            Ok(session) => {
                self.owns_session = true;
                self.send(
                    ctx,
                    &ServerMessage::SessionCreated {
                        session_id: session.id,
                        mode: session.mode,
                    },
                );
                self.start_relay(ctx);
            }
            Err(e) => self.send_error(ctx, e.to_string()),
        }
    }

    /// Start a relay for this socket's session.
    ///
    /// The event stream is attached before the relay starts; if the start
    /// fails the relay side of the channel is dropped and the stream ends.
    fn start_relay(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let audio = self.state.get_config().audio;
        let (inbound_tx, inbound_rx) = mpsc::channel(audio.inbound_queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(audio.outbound_queue_capacity);
        ctx.add_stream(ReceiverStream::new(events_rx));

        let registry = self.state.registry.clone();
        let session_id = self.session_id.clone();
        let link = ClientLink {
            inbound: inbound_rx,
            outbound: events_tx,
        };

        let start = async move { registry.start_relay(&session_id, link).await };
        ctx.spawn(start.into_actor(self).map(move |result, act, ctx| match result {
            Ok(()) => {
                act.owns_session = true;
                act.inbound = Some(inbound_tx);
                act.send(
                    ctx,
                    &ServerMessage::AudioStarted {
                        session_id: act.session_id.clone(),
                    },
                );
            }
            Err(e) => act.send_error(ctx, e.to_string()),
        }));
    }

    /// The input sender is kept until the relay has stopped; dropping it
    /// earlier would read as a client disconnect and end the session.
    fn handle_stop_audio(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let registry = self.state.registry.clone();
        let session_id = self.session_id.clone();

        let stop = async move { registry.stop_relay(&session_id).await };
        ctx.spawn(stop.into_actor(self).map(|result, act, ctx| match result {
            // A running relay reports its own stop through the event stream
            Ok(Some(_)) => act.inbound = None,
            Ok(None) => act.send(
                ctx,
                &ServerMessage::AudioStopped {
                    session_id: act.session_id.clone(),
                    reason: RelayExit::StopRequested.reason().to_string(),
                },
            ),
            Err(e) => act.send_error(ctx, e.to_string()),
        }));
    }

    fn handle_end_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.owns_session = false;
        let registry = self.state.registry.clone();
        let session_id = self.session_id.clone();

        let end = async move { registry.end(&session_id).await };
        ctx.spawn(end.into_actor(self).map(|_, act, ctx| {
            act.inbound = None;
            act.send(
                ctx,
                &ServerMessage::SessionEnded {
                    session_id: act.session_id.clone(),
                },
            );
        }));
    }

    /// Hand input to the relay without blocking the socket.
    fn forward(&mut self, input: ClientInput, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(tx) = &self.inbound else {
            match input {
                ClientInput::Audio { .. } => {
                    debug!(session_id = %self.session_id, "Audio received with no relay running, dropped");
                }
                _ => self.send_error(ctx, "No active audio relay. Send create_session or start_audio first."),
            }
            return;
        };

        match tx.try_send(input) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                RelayCounters::incr(&self.state.relay_counters.inbound_messages_dropped);
                warn!(session_id = %self.session_id, "Relay input queue full, client message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Relay input closed");
                self.inbound = None;
            }
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.send_error(ctx, e);
                return;
            }
        };

        match message {
            ClientMessage::CreateSession(data) => self.handle_create_session(data, ctx),
            ClientMessage::StartAudio => self.start_relay(ctx),
            ClientMessage::StopAudio => self.handle_stop_audio(ctx),
            ClientMessage::AudioData(data) => match data.into_input() {
                Ok(input) => self.forward(input, ctx),
                Err(e) => self.send_error(ctx, e),
            },
            ClientMessage::TextInput(data) => {
                let text = data.text.trim();
                if text.is_empty() {
                    self.send_error(ctx, "text_input requires non-empty text");
                } else {
                    self.forward(ClientInput::Text(text.to_string()), ctx);
                }
            }
            ClientMessage::UserInterruption => self.forward(ClientInput::Interrupt, ctx),
            ClientMessage::EndSession => self.handle_end_session(ctx),
            ClientMessage::Ping(data) => self.send(
                ctx,
                &ServerMessage::Pong {
                    timestamp: data.timestamp,
                },
            ),
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                info!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let ready = ServerMessage::SessionReady {
            session_id: self.session_id.clone(),
            prompts: self.prompt_summary(),
        };
        self.send(ctx, &ready);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");
        self.inbound = None;
        if !self.owns_session {
            return;
        }

        let registry = self.state.registry.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            registry.end_with(&session_id, RelayExit::ClientDisconnected).await;
        });
    }
}

/// Incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => {
                let input = ClientInput::Audio {
                    data: data.to_vec(),
                    format: AudioFormat::Pcm,
                    sample_rate: None,
                };
                self.forward(input, ctx);
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                info!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Events from the relay.
impl StreamHandler<ClientEvent> for RelaySocket {
    fn handle(&mut self, event: ClientEvent, ctx: &mut Self::Context) {
        if matches!(event, ClientEvent::Stopped(_)) {
            self.inbound = None;
        }
        let message = ServerMessage::from_event(&self.session_id, event);
        self.send(ctx, &message);
    }

    /// The relay ended; the socket stays open for a new session or relay.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Relay event stream finished");
    }
}

/// Session id for clients that connect without choosing one.
pub fn generate_session_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("session_{}", &id[..8])
}

/// WebSocket endpoint handler.
///
/// Upgrades the HTTP request; the [`RelaySocket`] actor takes it from there.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_socket(req, stream, path.into_inner(), app_state)
}

/// Same as [`relay_websocket`] with a server-generated session id, reported
/// to the client in `session_ready`.
pub async fn relay_websocket_new(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_socket(req, stream, generate_session_id(), app_state)
}

fn start_socket(
    req: HttpRequest,
    stream: web::Payload,
    session_id: String,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    ws::start(
        RelaySocket::new(session_id, app_state.get_ref().clone()),
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::Utterance;
    use chrono::Utc;

    #[test]
    fn test_generated_session_ids() {
        let a = generate_session_id();
        assert!(a.starts_with("session_"));
        assert_eq!(a.len(), "session_".len() + 8);
        assert_ne!(a, generate_session_id());
    }

    #[test]
    fn test_parse_messages() {
        let msg = ClientMessage::parse(r#"{"type": "create_session", "data": {"mode": "google_interviewer"}}"#)
            .unwrap();
        assert!(matches!(msg, ClientMessage::CreateSession(d) if d.mode.as_deref() == Some("google_interviewer")));

        // `data` may be omitted
        assert!(matches!(ClientMessage::parse(r#"{"type": "create_session"}"#).unwrap(),
            ClientMessage::CreateSession(d) if d.mode.is_none()));
        assert!(matches!(ClientMessage::parse(r#"{"type": "end_session", "data": {}}"#).unwrap(),
            ClientMessage::EndSession));
        assert!(matches!(ClientMessage::parse(r#"{"type": "ping", "data": {"timestamp": 5}}"#).unwrap(),
            ClientMessage::Ping(PingData { timestamp: Some(5) })));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ClientMessage::parse("not json").unwrap_err().contains("Invalid JSON"));
        assert!(ClientMessage::parse(r#"{"type": "dance"}"#).unwrap_err().contains("dance"));
        assert!(ClientMessage::parse(r#"{"type": "text_input", "data": {"text": 3}}"#).is_err());
    }

    #[test]
    fn test_audio_data_decodes_base64() {
        let encoded = BASE64.encode([1u8, 2, 3, 4]);
        let msg = ClientMessage::parse(&format!(
            r#"{{"type": "audio_data", "data": {{"audio_data": "{}", "format": "audio/wav", "sample_rate": 44100}}}}"#,
            encoded
        ))
        .unwrap();

        let ClientMessage::AudioData(data) = msg else {
            panic!("expected audio_data");
        };
        match data.into_input().unwrap() {
            ClientInput::Audio { data, format, sample_rate } => {
                assert_eq!(data, vec![1, 2, 3, 4]);
                assert_eq!(format, AudioFormat::Wav);
                assert_eq!(sample_rate, Some(44100));
            }
            other => panic!("unexpected input {:?}", other),
        }
    }

    #[test]
    fn test_audio_data_rejects_garbage() {
        let bad = AudioData {
            audio: "%%%".to_string(),
            ..Default::default()
        };
        assert!(bad.into_input().is_err());
        assert!(AudioData::default().into_input().is_err());
    }

    #[test]
    fn test_audio_event_becomes_audio_chunk() {
        let event = ClientEvent::Audio {
            data: vec![0, 1, 2],
            sample_rate: 24000,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(ServerMessage::from_event("s1", event)).unwrap();

        assert_eq!(json["type"], "audio_chunk");
        assert_eq!(json["data"]["session_id"], "s1");
        assert_eq!(json["data"]["audio"], BASE64.encode([0u8, 1, 2]));
        assert_eq!(json["data"]["sample_rate"], 24000);
        assert_eq!(json["data"]["format"], "audio/pcm;rate=24000");
    }

    #[test]
    fn test_transcript_and_stop_events() {
        let utterance = Utterance {
            session_id: "s1".to_string(),
            speaker: Speaker::Assistant,
            text: "Tell me about yourself.".to_string(),
            provider: "gemini".to_string(),
            confidence: None,
            reason: CompletionReason::Punctuation,
            completed_at: Utc::now(),
        };
        let json = serde_json::to_value(ServerMessage::from_event("s1", ClientEvent::Transcript(utterance))).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["data"]["speaker"], "assistant");
        assert_eq!(json["data"]["reason"], "punctuation");

        let json = serde_json::to_value(ServerMessage::from_event(
            "s1",
            ClientEvent::Stopped(RelayExit::UpstreamClosed),
        ))
        .unwrap();
        assert_eq!(json["type"], "audio_stopped");
        assert_eq!(json["data"]["reason"], "upstream_closed");
    }
}
