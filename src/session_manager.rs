use crate::audio::{transcode, AudioFormat};
use crate::db_types::{CallRecordUpdate, Event, EventKind, NewCallRecord};
use crate::error::{AppError, ToolError};
use crate::retry::{total_budget, with_retry, RetryFailure, BASE_BACKOFF, MAX_ATTEMPTS};
use crate::session::{CallSession, SessionHandle, SessionRegistry, TelephonySink};
use crate::store::CallLog;
use crate::tasks::{pump_model_events, run_tool_worker};
use crate::tools::{parse_arguments, ToolBackend, ToolCallRequest, ToolContext, ToolName};
use crate::twilio_types::TwilioOutbound;
use crate::types::SessionState;
use crate::utils::frame2twilio;
use crate::voice_model::{ModelCommand, ModelSessionParams, VoiceModelConnector};

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Identity of a call as announced by the telephony webhook.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub call_id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub from_number: String,
    pub to_number: String,
}

/// Owns every live call: its state machine, its two audio directions and the tool calls the
/// voice model makes during it.
pub struct CallSessionManager {
    registry: SessionRegistry,
    connector: Arc<dyn VoiceModelConnector>,
    tools: Arc<dyn ToolBackend>,
    call_log: Arc<dyn CallLog>,
    fallback_booking_url: String,
    backoff: Duration,
}

impl CallSessionManager {
    pub fn new(
        connector: Arc<dyn VoiceModelConnector>,
        tools: Arc<dyn ToolBackend>,
        call_log: Arc<dyn CallLog>,
        fallback_booking_url: String,
    ) -> Self {
        Self {
            registry: SessionRegistry::default(),
            connector,
            tools,
            call_log,
            fallback_booking_url,
            backoff: BASE_BACKOFF,
        }
    }

    pub fn session(&self, call_id: &str) -> Option<SessionHandle> {
        self.registry.get(call_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Register a call in `connecting`. Writing the call record is best-effort.
    pub async fn create_session(&self, new: NewSession) -> SessionHandle {
        let session = CallSession::new(
            new.call_id.clone(),
            new.tenant_id.clone(),
            new.agent_id.clone(),
            new.from_number.clone(),
            new.to_number.clone(),
        );
        let started_at = session.started_at;
        let (handle, inserted) = self.registry.insert(session);
        if !inserted {
            warn!(call_sid=%new.call_id, "session already registered");
            return handle;
        }
        info!(call_sid=%new.call_id, tenant=%new.tenant_id, agent=%new.agent_id, "session created");

        let record = NewCallRecord {
            call_id: new.call_id,
            tenant_id: new.tenant_id,
            agent_id: new.agent_id,
            from_number: new.from_number,
            to_number: new.to_number,
            started_at,
        };
        if let Err(e) = self.call_log.create_call_record(&record).await {
            error!(error=%e, call_sid=%record.call_id, "failed to create call record");
        }
        handle
    }

    pub async fn attach_telephony_channel(
        &self,
        call_id: &str,
        sink: mpsc::Sender<TwilioOutbound>,
        stream_id: String,
    ) -> Result<(), AppError> {
        let handle = self
            .registry
            .get(call_id)
            .ok_or_else(|| AppError::SessionNotFound(call_id.to_string()))?;
        let mut session = handle.lock().await;
        if session.state() == SessionState::Ended {
            return Err(AppError::SessionNotFound(call_id.to_string()));
        }
        debug!(call_sid=%call_id, stream_sid=%stream_id, "telephony channel attached");
        session.telephony = Some(TelephonySink { sink, stream_id });
        Ok(())
    }

    /// Connect the voice model for a call and start relaying its events.
    pub async fn initialize_voice_model(self: &Arc<Self>, call_id: &str) -> Result<(), AppError> {
        let handle = self
            .registry
            .get(call_id)
            .ok_or_else(|| AppError::SessionNotFound(call_id.to_string()))?;
        let params = {
            let session = handle.lock().await;
            ModelSessionParams {
                call_id: session.call_id.clone(),
                tenant_id: session.tenant_id.clone(),
                agent_id: session.agent_id.clone(),
                from_number: session.from_number.clone(),
            }
        };

        let channel = self.connector.connect(&params).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut session = handle.lock().await;
            if let Err(e) = session.transition(SessionState::Active) {
                close_model(call_id, &channel.commands);
                return Err(e);
            }
            session.model = Some(channel.commands.clone());
            session.model_format = channel.audio_format;
            session.stop = Some(stop_tx);
        }
        info!(call_sid=%call_id, format=%channel.audio_format.wire_name(), "session active");

        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_tool_worker(
            self.clone(),
            call_id.to_string(),
            tool_rx,
            channel.commands,
            stop_rx.clone(),
        ));
        tokio::spawn(pump_model_events(
            self.clone(),
            call_id.to_string(),
            handle,
            channel.events,
            tool_tx,
            stop_rx,
        ));
        Ok(())
    }

    /// Forward one caller frame (µ-law, as Twilio sends it) to the voice model. Never waits:
    /// frames are dropped while the model is not connected or is backed up.
    pub async fn relay_caller_audio(&self, call_id: &str, frame: &[u8]) {
        let Some(handle) = self.registry.get(call_id) else {
            return;
        };
        let mut session = handle.lock().await;
        session.metrics.frames_received += 1;
        session.metrics.bytes_received += frame.len() as u64;
        if session.state() != SessionState::Active {
            return;
        }
        let Some(model) = session.model.as_ref() else {
            return;
        };
        let payload = transcode(frame, AudioFormat::G711Ulaw, session.model_format).into_owned();
        if let Err(e) = model.try_send(ModelCommand::Audio(payload)) {
            log_dropped_frame(call_id, &e);
        }
    }

    /// Play one model frame to the caller if the telephony leg is attached and open.
    pub async fn relay_model_audio(&self, handle: &SessionHandle, frame: Vec<u8>) {
        let mut session = handle.lock().await;
        let Some(telephony) = session.telephony.as_ref() else {
            session.metrics.frames_dropped += 1;
            return;
        };
        let payload = transcode(&frame, session.model_format, AudioFormat::G711Ulaw);
        let len = payload.len() as u64;
        let message = frame2twilio(&payload, &telephony.stream_id);
        match telephony.sink.try_send(message) {
            Ok(()) => {
                session.metrics.frames_sent += 1;
                session.metrics.bytes_sent += len;
            }
            Err(TrySendError::Full(_)) => {
                session.metrics.frames_dropped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(call_sid=%session.call_id, "telephony sink closed");
                session.telephony = None;
                session.metrics.frames_dropped += 1;
            }
        }
    }

    /// Barge-in: flush whatever Twilio has buffered but the caller has not heard yet.
    pub async fn clear_caller_audio(&self, handle: &SessionHandle) {
        let session = handle.lock().await;
        if let Some(telephony) = session.telephony.as_ref() {
            let clear = TwilioOutbound::Clear {
                stream_sid: telephony.stream_id.clone(),
            };
            if telephony.sink.try_send(clear).is_err() {
                debug!(call_sid=%session.call_id, "could not clear caller audio");
            }
        }
    }

    /// Run one tool call for the voice model. Always produces a result the model can speak:
    /// failures are logged and replaced by a safe message.
    pub async fn handle_tool_call(&self, call_id: &str, mut request: ToolCallRequest) -> Value {
        let Some(handle) = self.registry.get(call_id) else {
            return session_ending_result();
        };
        let ctx = {
            let mut session = handle.lock().await;
            if session.state() != SessionState::Active {
                debug!(
                    call_sid=%call_id,
                    tool=%request.name,
                    state=%session.state().as_str(),
                    "tool call while session not active"
                );
                return session_ending_result();
            }
            session.metrics.tool_calls += 1;
            session.tool_context()
        };

        let Some(tool) = ToolName::parse(&request.name) else {
            let e = ToolError::UnknownTool(request.name);
            warn!(error=%e, call_sid=%call_id, "unknown tool requested");
            return json!({ "error": e.to_string() });
        };
        let args = match parse_arguments(&request.arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(error=%e, call_sid=%call_id, tool=%tool.as_str(), "bad tool arguments");
                return invalid_arguments_result(tool);
            }
        };

        let started = Instant::now();
        let deadline = *request
            .deadline
            .get_or_insert(started + total_budget(tool.timeout(), self.backoff));
        let (backend, ctx_ref, args_ref) = (&*self.tools, &ctx, &args);
        let result = with_retry(MAX_ATTEMPTS, self.backoff, |attempt| async move {
            if Instant::now() >= deadline {
                return Err(ToolError::Timeout);
            }
            debug!(call_sid=%ctx_ref.call_id, tool=%tool.as_str(), attempt, "executing tool call");
            match tokio::time::timeout(tool.timeout(), backend.execute(ctx_ref, tool, args_ref))
                .await
            {
                Ok(result) => result,
                // A dispatch that ran out of time may still have committed a booking.
                Err(_) if tool == ToolName::DispatchEmergency => Err(ToolError::Request(
                    "emergency dispatch timed out".into(),
                )),
                Err(_) => Err(ToolError::Timeout),
            }
        })
        .await;

        match result {
            Ok(value) => {
                handle.lock().await.metrics.record_tool_latency(started.elapsed());
                value
            }
            Err(RetryFailure {
                error: ToolError::InvalidArguments(detail),
                ..
            }) => {
                warn!(error=%detail, call_sid=%call_id, tool=%tool.as_str(), "bad tool arguments");
                invalid_arguments_result(tool)
            }
            Err(failure) => {
                request.attempt = failure.attempts;
                error!(
                    alert = true,
                    error=%failure.error,
                    call_sid=%call_id,
                    tool=%tool.as_str(),
                    attempts=request.attempt,
                    "tool call failed"
                );
                self.report_tool_failure(&ctx, tool, &request, &failure.error)
                    .await;
                json!({ "error": true, "result": self.fallback_message() })
            }
        }
    }

    async fn report_tool_failure(
        &self,
        ctx: &ToolContext,
        tool: ToolName,
        request: &ToolCallRequest,
        error: &ToolError,
    ) {
        let payload = json!({
            "tool": tool.as_str(),
            "toolCallId": request.call_id,
            "attempts": request.attempt,
            "error": error.to_string(),
        });
        for kind in [EventKind::ToolCallFailed, EventKind::Alert] {
            let event = Event {
                tenant_id: ctx.tenant_id.clone(),
                call_id: Some(ctx.call_id.clone()),
                kind,
                payload: payload.clone(),
            };
            if let Err(e) = self.call_log.record_event(&event).await {
                error!(error=%e, kind=%kind.as_str(), "failed to record event");
            }
        }
    }

    fn fallback_message(&self) -> String {
        format!(
            "I'm having trouble reaching our scheduling system right now. \
             Please try again in a moment, or you can book online at {}.",
            self.fallback_booking_url
        )
    }

    /// Tear a call down. Safe to call repeatedly and concurrently; only the first call does
    /// anything.
    pub async fn end_session(&self, call_id: &str, final_status: &str) {
        let Some(handle) = self.registry.get(call_id) else {
            debug!(call_sid=%call_id, "end for unknown session");
            return;
        };
        let (update, model, telephony, stop) = {
            let mut session = handle.lock().await;
            if session.transition(SessionState::Ending).is_err() {
                return;
            }
            let update = CallRecordUpdate {
                call_id: session.call_id.clone(),
                status: final_status.to_string(),
                duration_secs: session.duration_secs(),
                transcript: session.transcript(),
            };
            (
                update,
                session.model.take(),
                session.telephony.take(),
                session.stop.take(),
            )
        };

        // The worker holds the last other command sender; once it stops the model
        // connection closes even if Close could not be queued.
        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        if let Some(model) = model {
            close_model(call_id, &model);
        }
        if let Err(e) = self.call_log.finalize_call_record(&update).await {
            error!(error=%e, call_sid=%call_id, "failed to finalize call record");
        }
        drop(telephony);

        {
            let mut session = handle.lock().await;
            if let Err(e) = session.transition(SessionState::Ended) {
                warn!(error=%e, call_sid=%call_id, "unexpected state at teardown");
            }
            info!(
                call_sid=%call_id,
                status=%final_status,
                duration_secs=update.duration_secs,
                frames_received=session.metrics.frames_received,
                frames_sent=session.metrics.frames_sent,
                frames_dropped=session.metrics.frames_dropped,
                tool_calls=session.metrics.tool_calls,
                avg_tool_latency_ms=session.metrics.average_tool_latency().map(|d| d.as_millis() as u64),
                "session ended"
            );
        }
        self.registry.remove(call_id);
    }

    /// End every live session.
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        info!(sessions = ids.len(), "ending live sessions");
        for call_id in ids {
            self.end_session(&call_id, "interrupted").await;
        }
    }
}

fn session_ending_result() -> Value {
    json!({ "error": "session ending", "result": "This call is ending." })
}

fn close_model(call_id: &str, model: &mpsc::Sender<ModelCommand>) {
    match model.try_send(ModelCommand::Close) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!(call_sid=%call_id, "voice model backed up; closing on channel drop")
        }
        Err(TrySendError::Closed(_)) => debug!(call_sid=%call_id, "voice model already closed"),
    }
}

/// Tells the model to re-collect details without repeating parser output to the caller.
fn invalid_arguments_result(tool: ToolName) -> Value {
    json!({
        "error": format!("Invalid arguments for {}", tool.as_str()),
        "result": "Some details were missing or unclear. Confirm them with the caller and try again.",
    })
}

fn log_dropped_frame<T>(call_id: &str, e: &TrySendError<T>) {
    match e {
        TrySendError::Full(_) => debug!(call_sid=%call_id, "voice model backed up; dropped frame"),
        TrySendError::Closed(_) => debug!(call_sid=%call_id, "voice model closed; dropped frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::utils::b64_decode;
    use crate::voice_model::{ModelEvent, VoiceModelChannel};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    type ModelEnds = (mpsc::Receiver<ModelCommand>, mpsc::Sender<ModelEvent>);

    /// Hands the test the far ends of every channel it opens.
    #[derive(Default)]
    struct FakeConnector {
        opened: Mutex<Vec<ModelEnds>>,
    }

    impl FakeConnector {
        fn take(&self) -> ModelEnds {
            self.opened.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl VoiceModelConnector for FakeConnector {
        async fn connect(&self, _: &ModelSessionParams) -> Result<VoiceModelChannel, AppError> {
            let (command_tx, command_rx) = mpsc::channel(64);
            let (event_tx, event_rx) = mpsc::channel(64);
            self.opened.lock().unwrap().push((command_rx, event_tx));
            Ok(VoiceModelChannel {
                commands: command_tx,
                events: event_rx,
                audio_format: AudioFormat::G711Ulaw,
            })
        }
    }

    enum Behavior {
        Succeed(Value),
        Delay(Duration),
        Hang,
        Status(u16),
        MissingField,
    }

    struct FakeBackend {
        calls: AtomicU32,
        behavior: Behavior,
    }

    impl FakeBackend {
        fn new(behavior: Behavior) -> Self {
            Self {
                calls: AtomicU32::new(0),
                behavior,
            }
        }
    }

    #[async_trait]
    impl ToolBackend for FakeBackend {
        async fn execute(
            &self,
            _: &ToolContext,
            _: ToolName,
            _: &Map<String, Value>,
        ) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed(v) => Ok(v.clone()),
                Behavior::Delay(latency) => {
                    tokio::time::sleep(*latency).await;
                    Ok(json!({"ok": true}))
                }
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
                Behavior::Status(status) => Err(ToolError::Status {
                    status: *status,
                    body: String::new(),
                }),
                Behavior::MissingField => Err(ToolError::InvalidArguments(
                    "missing field `customerName`".into(),
                )),
            }
        }
    }

    struct Harness {
        manager: Arc<CallSessionManager>,
        connector: Arc<FakeConnector>,
        backend: Arc<FakeBackend>,
        store: Arc<MemoryStore>,
    }

    fn harness_with(store: MemoryStore, behavior: Behavior) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let backend = Arc::new(FakeBackend::new(behavior));
        let store = Arc::new(store);
        let manager = Arc::new(CallSessionManager::new(
            connector.clone(),
            backend.clone(),
            store.clone(),
            "https://book.example.test".into(),
        ));
        Harness {
            manager,
            connector,
            backend,
            store,
        }
    }

    fn harness(behavior: Behavior) -> Harness {
        harness_with(MemoryStore::default(), behavior)
    }

    fn new_session(call_id: &str) -> NewSession {
        NewSession {
            call_id: call_id.into(),
            tenant_id: "t1".into(),
            agent_id: "a1".into(),
            from_number: "+15550001111".into(),
            to_number: "+15550002222".into(),
        }
    }

    fn request(name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest::new("tc_1".into(), name.into(), arguments)
    }

    async fn active(h: &Harness, call_id: &str) -> ModelEnds {
        h.manager.create_session(new_session(call_id)).await;
        h.manager.initialize_voice_model(call_id).await.unwrap();
        h.connector.take()
    }

    async fn state_of(h: &Harness, call_id: &str) -> Option<SessionState> {
        match h.manager.session(call_id) {
            Some(handle) => Some(handle.lock().await.state()),
            None => None,
        }
    }

    fn media_payload(msg: TwilioOutbound) -> Vec<u8> {
        match msg {
            TwilioOutbound::Media { media, .. } => b64_decode(&media.payload).unwrap(),
            _ => panic!("expected media"),
        }
    }

    #[tokio::test]
    async fn lifecycle_is_monotonic() {
        let h = harness(Behavior::Succeed(json!({})));
        h.manager.create_session(new_session("CA1")).await;
        assert_eq!(state_of(&h, "CA1").await, Some(SessionState::Connecting));
        assert!(h.store.calls.lock().unwrap().contains_key("CA1"));

        h.manager.initialize_voice_model("CA1").await.unwrap();
        assert_eq!(state_of(&h, "CA1").await, Some(SessionState::Active));

        // a second initialize would move active -> active
        let err = h.manager.initialize_voice_model("CA1").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(state_of(&h, "CA1").await, Some(SessionState::Active));

        h.manager.end_session("CA1", "completed").await;
        assert_eq!(state_of(&h, "CA1").await, None);
    }

    #[tokio::test]
    async fn unknown_session_errors() {
        let h = harness(Behavior::Succeed(json!({})));
        assert!(matches!(
            h.manager.initialize_voice_model("nope").await,
            Err(AppError::SessionNotFound(_))
        ));
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            h.manager.attach_telephony_channel("nope", tx, "MZ1".into()).await,
            Err(AppError::SessionNotFound(_))
        ));
        h.manager.end_session("nope", "completed").await;
    }

    #[tokio::test]
    async fn call_log_failure_does_not_block_the_call() {
        let store = MemoryStore {
            fail_call_log: true,
            ..Default::default()
        };
        let h = harness_with(store, Behavior::Succeed(json!({})));
        h.manager.create_session(new_session("CA1")).await;
        h.manager.initialize_voice_model("CA1").await.unwrap();
        h.manager.end_session("CA1", "completed").await;
        assert!(h.store.finalized.lock().unwrap().is_empty());
        assert_eq!(h.manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let h = harness(Behavior::Succeed(json!({})));
        let (mut commands, _events) = active(&h, "CA1").await;
        {
            let handle = h.manager.session("CA1").unwrap();
            let mut session = handle.lock().await;
            session.push_transcript(crate::voice_model::Speaker::Caller, "no heat");
        }

        tokio::join!(
            h.manager.end_session("CA1", "completed"),
            h.manager.end_session("CA1", "completed"),
        );
        h.manager.end_session("CA1", "completed").await;

        let finalized = h.store.finalized.lock().unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].status, "completed");
        assert_eq!(finalized[0].transcript, "Caller: no heat");
        drop(finalized);
        assert!(matches!(commands.recv().await, Some(ModelCommand::Close)));
        assert_eq!(h.manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn tool_call_while_ending_is_rejected() {
        let h = harness(Behavior::Succeed(json!({"slots": []})));
        let _ends = active(&h, "CA1").await;
        let handle = h.manager.session("CA1").unwrap();
        handle
            .lock()
            .await
            .transition(SessionState::Ending)
            .unwrap();

        let result = h
            .manager
            .handle_tool_call("CA1", request("fetch-availability", json!({})))
            .await;
        assert_eq!(result["error"], "session ending");
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.lock().await.metrics.tool_calls, 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_described() {
        let h = harness(Behavior::Succeed(json!({})));
        let _ends = active(&h, "CA1").await;
        let result = h
            .manager
            .handle_tool_call("CA1", request("order-pizza", json!({})))
            .await;
        assert_eq!(result["error"], "Unknown function: order-pizza");
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_backend_is_tried_three_times_then_falls_back() {
        let h = harness(Behavior::Hang);
        let _ends = active(&h, "CA1").await;

        let started = Instant::now();
        let result = h
            .manager
            .handle_tool_call("CA1", request("lookup-booking", json!({})))
            .await;

        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 3);
        // three 10s attempts with 500ms and 1s between them
        assert_eq!(started.elapsed(), Duration::from_millis(31_500));
        assert_eq!(result["error"], true);
        let message = result["result"].as_str().unwrap();
        assert!(message.contains("https://book.example.test"));
        assert!(!message.contains("timed out"));

        assert_eq!(h.store.events_of(EventKind::ToolCallFailed).len(), 1);
        let alerts = h.store.events_of(EventKind::Alert);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].payload["attempts"], 3);
        assert_eq!(alerts[0].call_id.as_deref(), Some("CA1"));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_call_still_gets_full_attempts() {
        let h = harness(Behavior::Delay(Duration::from_millis(200)));
        let _ends = active(&h, "CA1").await;

        let queued = request("lookup-booking", json!({}));
        // waited behind a slow create-booking
        tokio::time::advance(Duration::from_secs(41)).await;
        let result = h.manager.handle_tool_call("CA1", queued).await;

        assert_eq!(result["ok"], true);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert!(h.store.events_of(EventKind::Alert).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dispatch_is_not_retried() {
        let h = harness(Behavior::Hang);
        let _ends = active(&h, "CA1").await;

        let started = Instant::now();
        let result = h
            .manager
            .handle_tool_call("CA1", request("dispatch-emergency", json!({})))
            .await;

        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(result["error"], true);
        let alerts = h.store.events_of(EventKind::Alert);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].payload["attempts"], 1);
    }

    #[tokio::test]
    async fn malformed_arguments_are_not_read_to_the_caller() {
        let h = harness(Behavior::Succeed(json!({})));
        let _ends = active(&h, "CA1").await;
        let result = h
            .manager
            .handle_tool_call(
                "CA1",
                request("create-booking", Value::String("{\"customerName\": ".into())),
            )
            .await;

        assert_eq!(result["error"], "Invalid arguments for create-booking");
        let text = result.to_string();
        assert!(!text.contains("EOF") && !text.contains("line 1"), "{text}");
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_fields_are_not_read_to_the_caller() {
        let h = harness(Behavior::MissingField);
        let _ends = active(&h, "CA1").await;
        let result = h
            .manager
            .handle_tool_call("CA1", request("create-booking", json!({"slot": "9am"})))
            .await;

        assert_eq!(result["error"], "Invalid arguments for create-booking");
        assert!(!result.to_string().contains("missing field"), "{result}");
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert!(h.store.events_of(EventKind::Alert).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_fail_without_retry() {
        let h = harness(Behavior::Status(422));
        let _ends = active(&h, "CA1").await;
        let result = h
            .manager
            .handle_tool_call("CA1", request("cancel", json!({"customerPhone": "+1555"})))
            .await;
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result["error"], true);
    }

    #[tokio::test]
    async fn model_tool_calls_are_answered_in_order() {
        let h = harness(Behavior::Succeed(json!({"ok": true})));
        let (mut commands, events) = active(&h, "CA1").await;
        for id in ["tc_1", "tc_2"] {
            events
                .send(ModelEvent::ToolCall {
                    call_id: id.into(),
                    name: "fetch_pricing".into(),
                    arguments: Value::String("{}".into()),
                })
                .await
                .unwrap();
        }
        for expected in ["tc_1", "tc_2"] {
            match commands.recv().await {
                Some(ModelCommand::ToolResult { call_id, output }) => {
                    assert_eq!(call_id, expected);
                    assert_eq!(output["ok"], true);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let handle = h.manager.session("CA1").unwrap();
        let session = handle.lock().await;
        assert_eq!(session.metrics.tool_calls, 2);
        assert!(session.metrics.average_tool_latency().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn tool_result_discarded_when_session_ends_mid_call() {
        let h = harness(Behavior::Hang);
        let (mut commands, events) = active(&h, "CA1").await;
        events
            .send(ModelEvent::ToolCall {
                call_id: "tc_1".into(),
                name: "lookup-booking".into(),
                arguments: Value::String("{}".into()),
            })
            .await
            .unwrap();
        while h.backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        h.manager.end_session("CA1", "completed").await;

        let seen = tokio::time::timeout(Duration::from_secs(60), async {
            let mut seen = vec![];
            while let Some(command) = commands.recv().await {
                seen.push(command);
            }
            seen
        })
        .await
        .expect("model channel left open after teardown");
        assert!(
            matches!(seen.as_slice(), [ModelCommand::Close]),
            "unexpected {seen:?}"
        );
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert!(h.store.events_of(EventKind::Alert).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_closes_a_backed_up_model_channel() {
        let h = harness(Behavior::Succeed(json!({})));
        let (mut commands, events) = active(&h, "CA1").await;
        // fills the 64-slot command channel, leaving no room for Close
        for _ in 0..64 {
            h.manager.relay_caller_audio("CA1", &[0xff]).await;
        }

        h.manager.end_session("CA1", "completed").await;
        assert_eq!(h.manager.active_sessions(), 0);

        let mut frames = 0;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(command) = commands.recv().await {
                match command {
                    ModelCommand::Audio(_) => frames += 1,
                    other => panic!("unexpected {other:?}"),
                }
            }
        })
        .await
        .expect("model command channel left open after teardown");
        assert_eq!(frames, 64);
        tokio::time::timeout(Duration::from_secs(5), events.closed())
            .await
            .expect("model event pump still running after teardown");
    }

    #[tokio::test]
    async fn model_audio_reaches_caller_in_order() {
        let h = harness(Behavior::Succeed(json!({})));
        h.manager.create_session(new_session("CA1")).await;
        let (tx, mut rx) = mpsc::channel(16);
        h.manager
            .attach_telephony_channel("CA1", tx, "MZ1".into())
            .await
            .unwrap();
        h.manager.initialize_voice_model("CA1").await.unwrap();
        let (_commands, events) = h.connector.take();

        for frame in [vec![1u8], vec![2], vec![3]] {
            events.send(ModelEvent::Audio(frame)).await.unwrap();
        }
        for expected in [vec![1u8], vec![2], vec![3]] {
            assert_eq!(media_payload(rx.recv().await.unwrap()), expected);
        }
    }

    #[tokio::test]
    async fn audio_without_a_sink_is_dropped_not_queued() {
        let h = harness(Behavior::Succeed(json!({})));
        let (_commands, events) = active(&h, "CA1").await;
        let handle = h.manager.session("CA1").unwrap();

        events.send(ModelEvent::Audio(vec![1])).await.unwrap();
        events.send(ModelEvent::Audio(vec![2])).await.unwrap();
        while handle.lock().await.metrics.frames_dropped < 2 {
            tokio::task::yield_now().await;
        }

        let (tx, mut rx) = mpsc::channel(16);
        h.manager
            .attach_telephony_channel("CA1", tx, "MZ1".into())
            .await
            .unwrap();
        events.send(ModelEvent::Audio(vec![9])).await.unwrap();
        assert_eq!(media_payload(rx.recv().await.unwrap()), vec![9]);
    }

    #[tokio::test]
    async fn barge_in_clears_twilio_buffer() {
        let h = harness(Behavior::Succeed(json!({})));
        h.manager.create_session(new_session("CA1")).await;
        let (tx, mut rx) = mpsc::channel(16);
        h.manager
            .attach_telephony_channel("CA1", tx, "MZ1".into())
            .await
            .unwrap();
        h.manager.initialize_voice_model("CA1").await.unwrap();
        let (_commands, events) = h.connector.take();

        events.send(ModelEvent::Audio(vec![1])).await.unwrap();
        events.send(ModelEvent::CallerSpeechStarted).await.unwrap();
        assert_eq!(media_payload(rx.recv().await.unwrap()), vec![1]);
        match rx.recv().await.unwrap() {
            TwilioOutbound::Clear { stream_sid } => assert_eq!(stream_sid, "MZ1"),
            _ => panic!("expected clear"),
        }
    }

    #[tokio::test]
    async fn closed_sink_is_detached() {
        let h = harness(Behavior::Succeed(json!({})));
        let _ends = active(&h, "CA1").await;
        let (tx, rx) = mpsc::channel(16);
        h.manager
            .attach_telephony_channel("CA1", tx, "MZ1".into())
            .await
            .unwrap();
        drop(rx);

        let handle = h.manager.session("CA1").unwrap();
        h.manager.relay_model_audio(&handle, vec![1]).await;
        let session = handle.lock().await;
        assert!(session.telephony.is_none());
        assert_eq!(session.metrics.frames_dropped, 1);
    }

    #[tokio::test]
    async fn caller_audio_goes_to_model() {
        let h = harness(Behavior::Succeed(json!({})));
        let (mut commands, _events) = active(&h, "CA1").await;
        h.manager.relay_caller_audio("CA1", &[0xff, 0x7f]).await;
        match commands.recv().await {
            Some(ModelCommand::Audio(frame)) => assert_eq!(frame, vec![0xff, 0x7f]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn model_hangup_ends_the_session() {
        let h = harness(Behavior::Succeed(json!({})));
        let (_commands, events) = active(&h, "CA1").await;
        events.send(ModelEvent::Closed).await.unwrap();
        while h.manager.session("CA1").is_some() {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store.finalized.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_ends_everything() {
        let h = harness(Behavior::Succeed(json!({})));
        let _a = active(&h, "CA1").await;
        h.manager.create_session(new_session("CA2")).await;
        h.manager.shutdown().await;
        assert_eq!(h.manager.active_sessions(), 0);
        let finalized = h.store.finalized.lock().unwrap();
        assert_eq!(finalized.len(), 2);
        assert!(finalized.iter().all(|u| u.status == "interrupted"));
    }
}
