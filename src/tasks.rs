use crate::error::AppError;
use crate::session::SessionHandle;
use crate::session_manager::CallSessionManager;
use crate::tools::ToolCallRequest;
use crate::twilio_types::{TwilioMessage, TwilioOutbound};
use crate::types::SessionState;
use crate::utils::b64_decode;
use crate::voice_model::{ModelCommand, ModelEvent};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Task that funnels every outbound message for one Twilio stream into its websocket. Ends when
/// all senders are dropped.
pub async fn send_twilio_ws_messages(
    mut twilio_outbound_stream: mpsc::Receiver<TwilioOutbound>,
    mut twilio_ws_sink: SplitSink<WebSocket, Message>,
) -> Result<(), AppError> {
    while let Some(twilio_outbound) = twilio_outbound_stream.recv().await {
        let json = serde_json::to_string(&twilio_outbound).map_err(|e| {
            error!(error=%e, "failed to serialize Twilio outbound");
            AppError::Telephony("Twilio message serialization error")
        })?;
        twilio_ws_sink.send(Message::Text(json)).await.map_err(|e| {
            error!(error=%e, "failed to send message to Twilio");
            AppError::Telephony("Failed to send message to Twilio")
        })?;
    }
    let _ = twilio_ws_sink.close().await;
    Ok(())
}

/// Task that relays caller audio from the Twilio stream to the voice model until Twilio sends
/// `stop` or the socket closes.
pub async fn stream_twilio_audio_to_model(
    mut twilio_stream: SplitStream<WebSocket>,
    manager: Arc<CallSessionManager>,
    call_sid: String,
) -> Result<(), AppError> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Media { media, .. } => match b64_decode(&media.payload) {
                            Ok(chunk) => manager.relay_caller_audio(&call_sid, &chunk).await,
                            Err(e) => warn!(error=%e, "undecodable media payload"),
                        },
                        TwilioMessage::Stop {
                            sequence_number, ..
                        } => {
                            debug!(call_sid=%call_sid, "Got stop message {sequence_number}");
                            break Ok(());
                        }
                        TwilioMessage::Mark { mark, .. } => {
                            trace!(name=%mark.name, "mark played");
                        }
                        _ => {
                            break Err(AppError::Telephony(
                                "We should not be getting Connected or Start messages now!",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to parse Twilio text message");
                        break Err(AppError::Telephony("Failed to parse incoming text message"));
                    }
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => (),
                Ok(Message::Close(_)) => {
                    info!(call_sid=%call_sid, "twilio closed the stream");
                    break Ok(());
                }
                Ok(m) => {
                    warn!(message=?m, "unsupported message type from Twilio");
                    continue;
                }
                Err(e) => {
                    error!(error=%e, "failed to receive message from Twilio");
                    break Err(AppError::Telephony(
                        "Failed to receive message from Twilio stream",
                    ));
                }
            },
            None => {
                info!(call_sid=%call_sid, "end of twilio stream");
                break Ok(());
            }
        }
    }
}

/// Task that consumes everything the voice model emits for one session. Audio is relayed
/// immediately, tool calls are queued for the session's worker. The session ends when the
/// model channel closes; a stop from teardown exits without ending it again.
pub async fn pump_model_events(
    manager: Arc<CallSessionManager>,
    call_sid: String,
    handle: SessionHandle,
    mut events: mpsc::Receiver<ModelEvent>,
    tool_calls: mpsc::UnboundedSender<ToolCallRequest>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.changed() => {
                debug!(call_sid=%call_sid, "model event pump stopped");
                return;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            ModelEvent::Audio(frame) => manager.relay_model_audio(&handle, frame).await,
            ModelEvent::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                debug!(call_sid=%call_sid, tool=%name, "tool call from voice model");
                if tool_calls
                    .send(ToolCallRequest::new(call_id, name, arguments))
                    .is_err()
                {
                    warn!(call_sid=%call_sid, "tool worker gone; dropping tool call");
                }
            }
            ModelEvent::CallerSpeechStarted => manager.clear_caller_audio(&handle).await,
            ModelEvent::Transcript { speaker, text } => {
                handle.lock().await.push_transcript(speaker, &text);
            }
            ModelEvent::Closed => break,
        }
    }
    debug!(call_sid=%call_sid, "voice model channel closed");
    manager.end_session(&call_sid, "completed").await;
}

/// Task that executes one session's tool calls one at a time, in the order the model issued
/// them. Results for a session that has started ending are discarded, and a stop abandons the
/// call in flight.
pub async fn run_tool_worker(
    manager: Arc<CallSessionManager>,
    call_sid: String,
    mut requests: mpsc::UnboundedReceiver<ToolCallRequest>,
    model: mpsc::Sender<ModelCommand>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = stop.changed() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let tool_call_id = request.call_id.clone();
        let output = tokio::select! {
            biased;
            _ = stop.changed() => {
                debug!(call_sid=%call_sid, tool_call_id=%tool_call_id, "abandoning tool call");
                break;
            }
            output = manager.handle_tool_call(&call_sid, request) => output,
        };

        let still_active = match manager.session(&call_sid) {
            Some(handle) => handle.lock().await.state() == SessionState::Active,
            None => false,
        };
        if !still_active {
            debug!(call_sid=%call_sid, tool_call_id=%tool_call_id, "discarding tool result");
            continue;
        }
        let result = ModelCommand::ToolResult {
            call_id: tool_call_id,
            output,
        };
        let sent = tokio::select! {
            biased;
            _ = stop.changed() => break,
            sent = model.send(result) => sent,
        };
        if sent.is_err() {
            warn!(call_sid=%call_sid, "voice model gone; dropping tool result");
            break;
        }
    }
    debug!(call_sid=%call_sid, "tool worker finished");
}
