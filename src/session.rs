use crate::audio::AudioFormat;
use crate::error::AppError;
use crate::tools::ToolContext;
use crate::twilio_types::TwilioOutbound;
use crate::types::SessionState;
use crate::voice_model::{ModelCommand, Speaker};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Outbound half of the Twilio media stream.
pub struct TelephonySink {
    pub sink: mpsc::Sender<TwilioOutbound>,
    pub stream_id: String,
}

/// Counters kept over the life of a call. "Received" is audio from the caller, "sent" is audio
/// played to the caller.
#[derive(Debug, Default, Clone)]
pub struct SessionMetrics {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_dropped: u64,
    pub tool_calls: u64,
    completed_tool_calls: u64,
    total_tool_latency: Duration,
}

impl SessionMetrics {
    pub fn record_tool_latency(&mut self, latency: Duration) {
        self.completed_tool_calls += 1;
        self.total_tool_latency += latency;
    }

    pub fn average_tool_latency(&self) -> Option<Duration> {
        if self.completed_tool_calls == 0 {
            return None;
        }
        Some(self.total_tool_latency / self.completed_tool_calls as u32)
    }
}

pub struct CallSession {
    pub call_id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub from_number: String,
    pub to_number: String,
    state: SessionState,
    pub telephony: Option<TelephonySink>,
    pub model: Option<mpsc::Sender<ModelCommand>>,
    /// Wire format the voice model speaks; meaningful once `model` is set.
    pub model_format: AudioFormat,
    /// Stops the session's model event pump and tool worker.
    pub stop: Option<watch::Sender<bool>>,
    pub started_at: OffsetDateTime,
    started: Instant,
    pub metrics: SessionMetrics,
    transcript: Vec<String>,
}

impl CallSession {
    pub fn new(
        call_id: String,
        tenant_id: String,
        agent_id: String,
        from_number: String,
        to_number: String,
    ) -> Self {
        Self {
            call_id,
            tenant_id,
            agent_id,
            from_number,
            to_number,
            state: SessionState::Connecting,
            telephony: None,
            model: None,
            model_format: AudioFormat::G711Ulaw,
            stop: None,
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
            metrics: SessionMetrics::default(),
            transcript: vec![],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, to: SessionState) -> Result<(), AppError> {
        if !self.state.can_advance_to(to) {
            return Err(AppError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn push_transcript(&mut self, speaker: Speaker, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let who = match speaker {
            Speaker::Caller => "Caller",
            Speaker::Assistant => "Assistant",
        };
        self.transcript.push(format!("{who}: {text}"));
    }

    pub fn transcript(&self) -> String {
        self.transcript.join("\n")
    }

    pub fn duration_secs(&self) -> i64 {
        self.started.elapsed().as_secs() as i64
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            call_id: self.call_id.clone(),
            tenant_id: self.tenant_id.clone(),
            agent_id: self.agent_id.clone(),
            from_number: self.from_number.clone(),
        }
    }
}

pub type SessionHandle = Arc<tokio::sync::Mutex<CallSession>>;

/// Live sessions keyed by call sid. The map lock is only held for lookups; all mutation of a
/// session goes through that session's own lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    /// Registers `session` unless its call is already known, and returns the registered handle
    /// along with whether it was newly inserted.
    pub fn insert(&self, session: CallSession) -> (SessionHandle, bool) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(&session.call_id) {
            return (existing.clone(), false);
        }
        let call_id = session.call_id.clone();
        let handle = Arc::new(tokio::sync::Mutex::new(session));
        sessions.insert(call_id, handle.clone());
        (handle, true)
    }

    pub fn get(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(call_id)
            .cloned()
    }

    pub fn remove(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(call_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
