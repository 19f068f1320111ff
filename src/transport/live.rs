//! # Live Transport
//!
//! Connector for the vendor's bidirectional streaming API, spoken as JSON
//! over a WebSocket.
//!
//! ## Protocol Flow:
//! 1. Client sends `{"setup": {model, generationConfig, systemInstruction}}`
//! 2. Server answers `{"setupComplete": {}}`
//! 3. Client streams `{"realtimeInput": {"audio": {data, mimeType}}}` and
//!    text turns as `{"clientContent": {turns, turnComplete}}`
//! 4. Server streams `{"serverContent": {...}}` carrying inline audio,
//!    transcriptions, `turnComplete` and `interrupted` flags
//!
//! Server frames may arrive as text or binary; both hold the same JSON.

use super::{OutboundMessage, TransportConnector, TransportEvent, TransportLink, TransportSetup};
use crate::audio::codec::EncodedAudioChunk;
use crate::config::TransportConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
    output_audio_transcription: EmptyObject,
}

#[derive(Debug, Serialize)]
struct EmptyObject {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SpeechConfig<'a> {
    pub voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VoiceConfig<'a> {
    pub prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PrebuiltVoiceConfig<'a> {
    pub voice_name: &'a str,
}

impl<'a> SpeechConfig<'a> {
    pub(crate) fn prebuilt(voice_name: &'a str) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig { voice_name },
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage<'a> {
    RealtimeInput { audio: &'a EncodedAudioChunk },
    #[serde(rename_all = "camelCase")]
    ClientContent { turns: Vec<Content<'a>>, turn_complete: bool },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    text: Option<String>,
    inline_data: Option<EncodedAudioChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

/// Model names are addressed as `models/<name>`.
fn qualified_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

/// JSON for the opening `setup` message.
pub(crate) fn encode_setup(setup: &TransportSetup) -> Result<String, PipelineError> {
    let message = SetupMessage {
        setup: Setup {
            model: qualified_model(&setup.model),
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig::prebuilt(&setup.voice),
            },
            system_instruction: Content {
                role: None,
                parts: vec![TextPart {
                    text: &setup.system_instruction,
                }],
            },
            output_audio_transcription: EmptyObject {},
        },
    };
    serde_json::to_string(&message).map_err(|e| PipelineError::Transport(format!("cannot encode setup: {}", e)))
}

/// JSON for one outbound message.
pub(crate) fn encode_outbound(message: &OutboundMessage) -> Result<String, PipelineError> {
    let wire = match message {
        OutboundMessage::Audio(chunk) => ClientMessage::RealtimeInput { audio: chunk },
        OutboundMessage::Text { text, turn_complete } => ClientMessage::ClientContent {
            turns: vec![Content {
                role: Some("user"),
                parts: vec![TextPart { text }],
            }],
            turn_complete: *turn_complete,
        },
    };
    serde_json::to_string(&wire).map_err(|e| PipelineError::Transport(format!("cannot encode message: {}", e)))
}

/// What one server frame means to the pipeline.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ParsedFrame {
    pub setup_complete: bool,
    pub events: Vec<TransportEvent>,
}

pub(crate) fn parse_server_frame(bytes: &[u8]) -> Result<ParsedFrame, PipelineError> {
    let message: ServerMessage = serde_json::from_slice(bytes)
        .map_err(|e| PipelineError::Transport(format!("unreadable server frame: {}", e)))?;

    let mut frame = ParsedFrame {
        setup_complete: message.setup_complete.is_some(),
        events: Vec::new(),
    };

    if let Some(content) = message.server_content {
        // barge-in first so stale audio is dropped before anything new queues
        if content.interrupted {
            frame.events.push(TransportEvent::Interrupted);
        }
        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            if let Some(chunk) = part.inline_data {
                frame.events.push(TransportEvent::Audio(chunk));
            }
            if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                frame.events.push(TransportEvent::Text(text));
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text).filter(|t| !t.is_empty()) {
            frame.events.push(TransportEvent::Text(text));
        }
        if content.turn_complete {
            frame.events.push(TransportEvent::TurnComplete);
        }
    }

    if message.go_away.is_some() {
        frame.events.push(TransportEvent::Closed {
            reason: "server is going away".to_string(),
        });
    }

    Ok(frame)
}

/// Connector for the live streaming endpoint.
pub struct LiveTransportConnector {
    endpoint: String,
    api_key: Option<String>,
}

impl LiveTransportConnector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.endpoint.clone(), config.api_key())
    }
}

#[async_trait]
impl TransportConnector for LiveTransportConnector {
    async fn connect(&self, setup: &TransportSetup) -> Result<TransportLink, PipelineError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| PipelineError::Transport("no API key configured for the live endpoint".to_string()))?;

        let url = format!("{}?key={}", self.endpoint, api_key);
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        socket.send(Message::Text(encode_setup(setup)?)).await?;

        loop {
            let bytes = match socket.next().await {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(PipelineError::Transport(format!("closed during setup: {}", reason)));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(PipelineError::Transport("closed during setup".to_string())),
            };
            if parse_server_frame(&bytes)?.setup_complete {
                break;
            }
        }
        info!(model = %setup.model, voice = %setup.voice, "Live transport session established");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(message) => {
                            let text = match encode_outbound(&message) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!(error = %e, "Dropping outbound message");
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            debug!("Live transport closed by the session");
                            break;
                        }
                    },
                    incoming = stream.next() => {
                        let bytes = match incoming {
                            Some(Ok(Message::Text(text))) => text.into_bytes(),
                            Some(Ok(Message::Binary(bytes))) => bytes,
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                                let _ = inbound_tx.send(TransportEvent::Closed { reason });
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                            None => {
                                let _ = inbound_tx.send(TransportEvent::Closed {
                                    reason: "stream ended".to_string(),
                                });
                                break;
                            }
                        };

                        match parse_server_frame(&bytes) {
                            Ok(frame) => {
                                for event in frame.events {
                                    if inbound_tx.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "Skipping server frame"),
                        }
                    }
                }
            }
        });

        Ok(TransportLink::new(outbound_tx, inbound_rx, Some(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_setup_message_shape() {
        let setup = TransportSetup {
            model: "gemini-live".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "You are Grandma.".to_string(),
        };
        let json: Value = serde_json::from_str(&encode_setup(&setup).unwrap()).unwrap();

        assert_eq!(json["setup"]["model"], "models/gemini-live");
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "You are Grandma.");
        assert!(json["setup"]["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn test_outbound_audio_and_text_shapes() {
        let audio = OutboundMessage::Audio(EncodedAudioChunk::new(
            "AAE=".to_string(),
            "audio/pcm;rate=16000".to_string(),
        ));
        let json: Value = serde_json::from_str(&encode_outbound(&audio).unwrap()).unwrap();
        assert_eq!(json["realtimeInput"]["audio"]["data"], "AAE=");
        assert_eq!(json["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");

        let text = OutboundMessage::Text {
            text: "Say hello".to_string(),
            turn_complete: true,
        };
        let json: Value = serde_json::from_str(&encode_outbound(&text).unwrap()).unwrap();
        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(json["clientContent"]["turns"][0]["parts"][0]["text"], "Say hello");
        assert_eq!(json["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn test_parse_setup_complete() {
        let frame = parse_server_frame(br#"{"setupComplete": {}}"#).unwrap();
        assert!(frame.setup_complete);
        assert!(frame.events.is_empty());
    }

    #[test]
    fn test_parse_server_content() {
        let raw = br#"{
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "hi there"}
                ]},
                "outputTranscription": {"text": "hi there"},
                "turnComplete": true
            }
        }"#;
        let frame = parse_server_frame(raw).unwrap();
        assert_eq!(
            frame.events,
            vec![
                TransportEvent::Interrupted,
                TransportEvent::Audio(EncodedAudioChunk::new(
                    "AAA=".to_string(),
                    "audio/pcm;rate=24000".to_string()
                )),
                TransportEvent::Text("hi there".to_string()),
                TransportEvent::Text("hi there".to_string()),
                TransportEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_parse_go_away_and_garbage() {
        let frame = parse_server_frame(br#"{"goAway": {"timeLeft": "5s"}}"#).unwrap();
        assert!(matches!(frame.events[0], TransportEvent::Closed { .. }));

        assert!(parse_server_frame(b"not json").is_err());
        assert_eq!(parse_server_frame(b"{}").unwrap(), ParsedFrame::default());
    }

    #[tokio::test]
    async fn test_connect_without_key_fails_before_dialing() {
        let connector = LiveTransportConnector::new("wss://127.0.0.1:1/live", None);
        let setup = TransportSetup {
            model: "m".to_string(),
            voice: "v".to_string(),
            system_instruction: String::new(),
        };
        let err = connector.connect(&setup).await.err().unwrap();
        assert_eq!(err.kind(), "transport_error");
    }
}
