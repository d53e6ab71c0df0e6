use crate::dispatch::DispatchRequest;
use crate::error::{handle_error, AppError};
use crate::session_manager::NewSession;
use crate::tasks::{send_twilio_ws_messages, stream_twilio_audio_to_model};
use crate::twilio_types::{
    render_twiml, ConnectAction, Connection, ResponseAction, SayAction, StartMeta, StartQuery,
    StreamAction, StreamTrack, TwilioConnectPayload, TwilioMessage, TwilioStatusPayload,
};
use crate::types::AppState;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Host, Path, Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use futures_util::stream::{SplitStream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const OUTBOUND_CAPACITY: usize = 512;
const TWILIO_MEDIA_ENCODING: &str = "audio/x-mulaw";

fn twiml_response(twiml: String) -> impl IntoResponse {
    trace!("twiml: '{}'", twiml);
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/xml")], twiml)
}

/// Capture the Twilio Start media message from the beginning of a Twilio websocket stream for the
/// call and stream ids.
async fn get_twilio_start_meta(
    twilio_stream: &mut SplitStream<WebSocket>,
) -> Result<StartMeta, AppError> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Connected { protocol, version } => {
                            trace!("Got connected message with {protocol} and {version}");
                        }
                        TwilioMessage::Start {
                            start: start_meta, ..
                        } => {
                            break Ok(start_meta);
                        }
                        _ => {
                            break Err(AppError::Telephony(
                                "expected a Connected or Start message at the head of the stream",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to deserialize Twilio text message");
                        break Err(AppError::Telephony("Error deserializing twilio text message"));
                    }
                },
                Ok(Message::Ping(_)) => (),
                _ => {
                    break Err(AppError::Telephony(
                        "Got unexpected websocket message type from Twilio!",
                    ));
                }
            },
            None => break Err(AppError::Telephony("End of stream")),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_handler(socket, app_state))
}

async fn socket_handler(socket: WebSocket, app_state: Arc<AppState>) {
    let (twilio_sink, mut twilio_stream) = socket.split();
    let start_meta = match get_twilio_start_meta(&mut twilio_stream).await {
        Ok(start_meta) => start_meta,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(meta = ?start_meta, "got start meta from twilio stream");
    if start_meta.media_format.encoding != TWILIO_MEDIA_ENCODING {
        warn!(encoding=%start_meta.media_format.encoding, "unexpected media encoding");
    }
    let call_sid = start_meta.call_sid;
    let manager = app_state.manager.clone();

    let (twilio_outbound, twilio_outbound_stream) = mpsc::channel(OUTBOUND_CAPACITY);
    tokio::spawn(async move {
        if let Err(e) = send_twilio_ws_messages(twilio_outbound_stream, twilio_sink).await {
            handle_error(e).await;
        }
    });

    if let Err(e) = manager
        .attach_telephony_channel(&call_sid, twilio_outbound, start_meta.stream_sid)
        .await
    {
        handle_error(e).await;
        return;
    }
    if let Err(e) = manager.initialize_voice_model(&call_sid).await {
        handle_error(e).await;
        manager.end_session(&call_sid, "failed").await;
        return;
    }

    if let Err(e) =
        stream_twilio_audio_to_model(twilio_stream, manager.clone(), call_sid.clone()).await
    {
        handle_error(e).await;
    }
    manager.end_session(&call_sid, "completed").await;
}

/// Voice webhook: register the call and answer with TwiML that streams it to `/connect`.
pub async fn twiml_start_connect(
    Host(host): Host,
    Query(query): Query<StartQuery>,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "start request body");
    let payload = match serde_urlencoded::from_str::<TwilioConnectPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio connect payload");
            return (StatusCode::BAD_REQUEST, "Bad request").into_response();
        }
    };
    debug!(
        call_sid=%payload.call_sid,
        status=%payload.call_status.as_str(),
        city=?payload.from_city,
        state=?payload.from_state,
        "incoming call"
    );

    app_state
        .manager
        .create_session(NewSession {
            call_id: payload.call_sid,
            tenant_id: query.tenant_id,
            agent_id: query.agent_id,
            from_number: payload.from,
            to_number: payload.to,
        })
        .await;

    twiml_response(connect_twiml(&host)).into_response()
}

fn connect_twiml(host: &str) -> String {
    let stream_action = StreamAction {
        url: format!("wss://{}/connect", host),
        track: Some(StreamTrack::Inbound),
        ..Default::default()
    };
    render_twiml(vec![ResponseAction::Connect(ConnectAction {
        connection: Connection::Stream(stream_action),
    })])
}

/// Status callback for the caller's leg. A terminal status tears the session down.
pub async fn twilio_status(State(app_state): State<Arc<AppState>>, body: String) -> StatusCode {
    let payload = match serde_urlencoded::from_str::<TwilioStatusPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio status payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    debug!(call_sid=%payload.call_sid, status=%payload.call_status.as_str(), "call status");
    if payload.call_status.is_terminal() {
        app_state
            .manager
            .end_session(&payload.call_sid, payload.call_status.as_str())
            .await;
    }
    StatusCode::NO_CONTENT
}

pub async fn emergency_dispatch(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = app_state.scheduler.dispatch(request).await?;
    Ok(Json(outcome.to_json()))
}

/// TwiML for the outbound call placed to the dispatched technician.
pub async fn dispatch_twiml(Path(booking_id): Path<Uuid>) -> impl IntoResponse {
    let reference = booking_id.simple().to_string();
    let text = format!(
        "You have a new emergency dispatch. The details have been sent to you by text message. \
         Booking reference {}.",
        &reference[..8]
    );
    twiml_response(render_twiml(vec![ResponseAction::Say(SayAction {
        text,
        lp: Some(2),
        ..Default::default()
    })]))
}

/// Status callback for the technician call.
pub async fn dispatch_status(body: String) -> StatusCode {
    match serde_urlencoded::from_str::<TwilioStatusPayload>(&body) {
        Ok(payload) if payload.call_status.is_terminal() => info!(
            call_sid=%payload.call_sid,
            status=%payload.call_status.as_str(),
            duration=?payload.call_duration,
            "technician call finished"
        ),
        Ok(payload) => {
            debug!(call_sid=%payload.call_sid, status=%payload.call_status.as_str(), "technician call status")
        }
        Err(e) => {
            error!(error=%e, "failed to deserialize dispatch status payload");
            return StatusCode::BAD_REQUEST;
        }
    }
    StatusCode::NO_CONTENT
}
