//! Gemini Live adapter over `tokio-tungstenite`.
//!
//! One WebSocket per relay session. The socket is split: the sink sits behind
//! a mutex inside [`GeminiHandle`], the stream becomes the relay's
//! [`EventStream`].

use super::protocol::{
    AutomaticActivityDetection, ClientContentMessage, Content, EmptyConfig, GenerationConfig,
    Part, RealtimeInputConfig, RealtimeInputMessage, ServerMessage, Setup, SetupMessage,
};
use super::{
    EventStream, ServerEvent, SessionProfile, UpstreamConnection, UpstreamConnector,
    UpstreamError, UpstreamHandle,
};
use crate::audio::AudioFrame;
use crate::config::UpstreamConfig;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connector for Gemini Live. Settings can be replaced at runtime; each
/// `open` works from a snapshot taken when it starts.
pub struct GeminiLiveConnector {
    config: RwLock<UpstreamConfig>,
}

impl GeminiLiveConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    fn current(&self) -> UpstreamConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Full endpoint URL including the API key query parameter.
    pub fn endpoint(&self) -> Result<String, UpstreamError> {
        endpoint_url(&self.current())
    }

    pub fn setup_message(&self, profile: &SessionProfile) -> SetupMessage {
        setup_message(&self.current(), profile)
    }
}

fn endpoint_url(config: &UpstreamConfig) -> Result<String, UpstreamError> {
    if config.api_key.trim().is_empty() {
        return Err(UpstreamError::Connect("no API key configured".to_string()));
    }
    Ok(format!("{}?key={}", config.url, config.api_key))
}

fn setup_message(config: &UpstreamConfig, profile: &SessionProfile) -> SetupMessage {
    let system_instruction = if profile.system_instruction.is_empty() {
        None
    } else {
        Some(Content {
            role: None,
            parts: vec![Part {
                text: Some(profile.system_instruction.clone()),
                inline_data: None,
            }],
        })
    };

    SetupMessage {
        setup: Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality.to_uppercase()],
            },
            system_instruction,
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: AutomaticActivityDetection {
                    disabled: config.vad_disabled,
                    start_of_speech_sensitivity: config.start_of_speech_sensitivity.clone(),
                    end_of_speech_sensitivity: config.end_of_speech_sensitivity.clone(),
                    prefix_padding_ms: config.prefix_padding_ms,
                    silence_duration_ms: config.silence_duration_ms,
                },
            },
            input_audio_transcription: config.input_transcription.then(EmptyConfig::default),
            output_audio_transcription: config.output_transcription.then(EmptyConfig::default),
        },
    }
}

#[async_trait]
impl UpstreamConnector for GeminiLiveConnector {
    async fn open(&self, profile: &SessionProfile) -> Result<UpstreamConnection, UpstreamError> {
        let config = self.current();
        let endpoint = endpoint_url(&config)?;
        let wait_ms = config.turn_timeout_ms;
        let wait = Duration::from_millis(wait_ms);

        info!("Connecting to upstream {} (model {})", config.url, config.model);
        let (socket, _response) = tokio::time::timeout(wait, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| UpstreamError::Timeout(wait_ms))?
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let (mut sink, mut stream) = socket.split();

        let setup = serde_json::to_string(&setup_message(&config, profile))
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        tokio::time::timeout(wait, await_setup_complete(&mut stream))
            .await
            .map_err(|_| UpstreamError::Timeout(wait_ms))??;
        info!("Upstream setup complete");

        let handle = GeminiHandle {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            send_timeout: wait,
        };
        let events: EventStream =
            Box::pin(stream.flat_map(|message| futures_util::stream::iter(decode_frame(message))));

        Ok(UpstreamConnection {
            handle: Arc::new(handle),
            events,
        })
    }

    fn reconfigure(&self, config: &UpstreamConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        info!("Upstream settings updated (model {})", config.model);
    }

    fn name(&self) -> &'static str {
        "gemini-live"
    }
}

async fn await_setup_complete(stream: &mut SplitStream<WsStream>) -> Result<(), UpstreamError> {
    while let Some(message) = stream.next().await {
        let payload = match message.map_err(|e| UpstreamError::Connect(e.to_string()))? {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Close(frame) => {
                return Err(UpstreamError::Connect(format!(
                    "upstream closed during setup: {:?}",
                    frame
                )))
            }
            _ => continue,
        };

        if ServerMessage::parse(&payload)?.is_setup_complete() {
            return Ok(());
        }
        debug!("Ignoring pre-setup upstream message");
    }
    Err(UpstreamError::Closed)
}

/// Turn one WebSocket frame into zero or more relay events.
fn decode_frame(
    message: Result<Message, tungstenite::Error>,
) -> Vec<Result<ServerEvent, UpstreamError>> {
    let payload = match message {
        Ok(Message::Text(text)) => text.as_bytes().to_vec(),
        Ok(Message::Binary(bytes)) => bytes.to_vec(),
        Ok(Message::Close(frame)) => {
            info!("Upstream closed the connection: {:?}", frame);
            return vec![Err(UpstreamError::Closed)];
        }
        Ok(_) => return Vec::new(),
        Err(e) => return vec![Err(UpstreamError::Receive(e.to_string()))],
    };

    match ServerMessage::parse(&payload) {
        Ok(message) => message.into_events().into_iter().map(Ok).collect(),
        Err(e) => {
            warn!("Skipping malformed upstream message: {}", e);
            Vec::new()
        }
    }
}

/// Send half of a Gemini Live session.
pub struct GeminiHandle {
    sink: Mutex<WsSink>,
    closed: AtomicBool,
    send_timeout: Duration,
}

impl GeminiHandle {
    async fn send_json(&self, payload: String) -> Result<(), UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed);
        }

        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.send_timeout, sink.send(Message::Text(payload.into()))).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(UpstreamError::Send(e.to_string())),
            Err(_) => Err(UpstreamError::Timeout(self.send_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl UpstreamHandle for GeminiHandle {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), UpstreamError> {
        let message = RealtimeInputMessage::audio(&frame.data, frame.mime_type());
        let payload =
            serde_json::to_string(&message).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        self.send_json(payload).await
    }

    async fn send_text(&self, text: &str) -> Result<(), UpstreamError> {
        let payload = serde_json::to_string(&ClientContentMessage::user_text(text))
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        self.send_json(payload).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.send_timeout, sink.close()).await {
            Ok(Ok(())) => debug!("Upstream connection closed"),
            Ok(Err(e)) => debug!("Upstream close returned error: {}", e),
            Err(_) => warn!("Timed out closing upstream connection"),
        }
    }
}
