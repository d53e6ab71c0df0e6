use crate::dispatch::DispatchScheduler;
use crate::session_manager::CallSessionManager;

use std::sync::Arc;

/// Lifecycle of one call. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Active,
    Ending,
    Ended,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        next > self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
        }
    }
}

pub struct AppState {
    pub manager: Arc<CallSessionManager>,
    pub scheduler: Arc<DispatchScheduler>,
}
