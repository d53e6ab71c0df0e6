use crate::audio::AudioFormat;
use crate::error::AppError;
use crate::realtime_types::{ClientEvent, ConversationItem, ServerEvent, SessionConfig};
use crate::utils::{b64_decode, b64_encode};

use async_trait::async_trait;
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
};
use tracing::{debug, error, info, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speaker {
    Caller,
    Assistant,
}

/// Something the voice model produced.
#[derive(Debug)]
pub enum ModelEvent {
    Audio(Vec<u8>),
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Transcript {
        speaker: Speaker,
        text: String,
    },
    /// The caller started talking over the assistant.
    CallerSpeechStarted,
    Closed,
}

/// Something we send to the voice model.
#[derive(Debug)]
pub enum ModelCommand {
    Audio(Vec<u8>),
    ToolResult {
        call_id: String,
        output: serde_json::Value,
    },
    Close,
}

/// One open conversation with the voice model.
pub struct VoiceModelChannel {
    pub commands: mpsc::Sender<ModelCommand>,
    pub events: mpsc::Receiver<ModelEvent>,
    /// Format of audio in both directions on this channel.
    pub audio_format: AudioFormat,
}

#[derive(Clone, Debug)]
pub struct ModelSessionParams {
    pub call_id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub from_number: String,
}

#[async_trait]
pub trait VoiceModelConnector: Send + Sync {
    async fn connect(&self, params: &ModelSessionParams) -> Result<VoiceModelChannel, AppError>;
}

/// Connector for a realtime speech-to-speech model spoken to over a websocket.
pub struct RealtimeConnector {
    url: String,
    api_key: String,
    audio_format: AudioFormat,
}

impl RealtimeConnector {
    pub fn new(url: String, api_key: String, audio_format: AudioFormat) -> Self {
        Self {
            url,
            api_key,
            audio_format,
        }
    }
}

/// Model endpoint with the call's agent and tenant appended as query parameters.
fn model_url(base: &str, params: &ModelSessionParams) -> Result<reqwest::Url, AppError> {
    let mut url = reqwest::Url::parse(base).map_err(|e| {
        error!(error=%e, "invalid voice model url");
        AppError::VoiceModel("invalid voice model url")
    })?;
    url.query_pairs_mut()
        .append_pair("agent_id", &params.agent_id)
        .append_pair("tenant_id", &params.tenant_id);
    Ok(url)
}

#[async_trait]
impl VoiceModelConnector for RealtimeConnector {
    async fn connect(&self, params: &ModelSessionParams) -> Result<VoiceModelChannel, AppError> {
        trace!("Connecting to voice model");
        let uri = model_url(&self.url, params)?;
        let mut rq = uri.as_str().into_client_request().map_err(|e| {
            error!(error=%e, "invalid voice model url");
            AppError::VoiceModel("invalid voice model url")
        })?;
        let auth = http::header::HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| AppError::VoiceModel("invalid voice model api key"))?;
        rq.headers_mut().insert(http::header::AUTHORIZATION, auth);

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(rq))
            .await
            .map_err(|_| {
                error!("timed out connecting to voice model");
                AppError::VoiceModel("connect timeout")
            })?
            .map_err(|e| {
                error!(error=%e, "failed to connect to voice model");
                AppError::VoiceModel("connect failed")
            })?;
        let (mut model_sink, mut model_stream) = ws_stream.split();
        info!(call_sid=%params.call_id, "opened connection to voice model");

        let session_update = ClientEvent::SessionUpdate {
            session: SessionConfig {
                input_audio_format: self.audio_format.wire_name().to_string(),
                output_audio_format: self.audio_format.wire_name().to_string(),
            },
        };
        let json = serde_json::to_string(&session_update)
            .map_err(|_| AppError::VoiceModel("session update serialization"))?;
        model_sink
            .send(tungstenite::Message::Text(json))
            .await
            .map_err(|e| {
                error!(error=%e, "failed to configure voice model session");
                AppError::VoiceModel("session update failed")
            })?;

        let (command_tx, mut command_rx) = mpsc::channel::<ModelCommand>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ModelEvent>(CHANNEL_CAPACITY);

        let call_id = params.call_id.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let events = match command {
                    ModelCommand::Audio(frame) => vec![ClientEvent::InputAudioBufferAppend {
                        audio: b64_encode(&frame),
                    }],
                    ModelCommand::ToolResult { call_id, output } => vec![
                        ClientEvent::ConversationItemCreate {
                            item: ConversationItem::FunctionCallOutput {
                                call_id,
                                output: output.to_string(),
                            },
                        },
                        ClientEvent::ResponseCreate {},
                    ],
                    ModelCommand::Close => break,
                };
                for event in events {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(error=%e, "failed to serialize voice model event");
                            continue;
                        }
                    };
                    if let Err(e) = model_sink.send(tungstenite::Message::Text(json)).await {
                        error!(error=%e, call_sid=%call_id, "failed to send to voice model");
                        return;
                    }
                }
            }
            let _ = model_sink.close().await;
            debug!(call_sid=%call_id, "voice model writer finished");
        });

        let call_id = params.call_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = model_stream.next().await {
                let text = match msg {
                    Ok(tungstenite::Message::Text(text)) => text,
                    Ok(tungstenite::Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        error!(error=%e, call_sid=%call_id, "voice model stream error");
                        break;
                    }
                };
                let event = match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error=%e, "failed to deserialize voice model event");
                        continue;
                    }
                };
                let forwarded = match event {
                    ServerEvent::AudioDelta { delta } => match b64_decode(&delta) {
                        Ok(frame) => Some(ModelEvent::Audio(frame)),
                        Err(e) => {
                            warn!(error=%e, "undecodable audio delta");
                            None
                        }
                    },
                    ServerEvent::FunctionCallArgumentsDone {
                        call_id,
                        name,
                        arguments,
                    } => Some(ModelEvent::ToolCall {
                        call_id,
                        name,
                        arguments: serde_json::Value::String(arguments),
                    }),
                    ServerEvent::AudioTranscriptDone { transcript } => Some(ModelEvent::Transcript {
                        speaker: Speaker::Assistant,
                        text: transcript,
                    }),
                    ServerEvent::InputTranscriptionCompleted { transcript } => {
                        Some(ModelEvent::Transcript {
                            speaker: Speaker::Caller,
                            text: transcript,
                        })
                    }
                    ServerEvent::SpeechStarted => Some(ModelEvent::CallerSpeechStarted),
                    ServerEvent::Error { error } => {
                        warn!(message=%error.message, call_sid=%call_id, "voice model error event");
                        None
                    }
                    ServerEvent::Other => None,
                };
                if let Some(event) = forwarded {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            let _ = event_tx.send(ModelEvent::Closed).await;
            debug!(call_sid=%call_id, "voice model reader finished");
        });

        Ok(VoiceModelChannel {
            commands: command_tx,
            events: event_rx,
            audio_format: self.audio_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(agent_id: &str, tenant_id: &str) -> ModelSessionParams {
        ModelSessionParams {
            call_id: "CA1".into(),
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            from_number: "+15550001111".into(),
        }
    }

    #[test]
    fn session_params_are_appended_to_the_query() {
        let url = model_url("wss://model.example.test/v1/realtime?model=rt", &params("a1", "t1"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://model.example.test/v1/realtime?model=rt&agent_id=a1&tenant_id=t1"
        );
    }

    #[test]
    fn session_params_are_percent_encoded() {
        let url = model_url("wss://model.example.test/realtime", &params("x y", "a&b=c"))
            .unwrap();
        assert_eq!(url.query(), Some("agent_id=x+y&tenant_id=a%26b%3Dc"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("agent_id".to_string(), "x y".to_string()),
                ("tenant_id".to_string(), "a&b=c".to_string()),
            ]
        );
    }

    #[test]
    fn unparseable_base_is_rejected() {
        assert!(matches!(
            model_url("not a url", &params("a1", "t1")),
            Err(AppError::VoiceModel(_))
        ));
    }
}
