use serde::{Deserialize, Serialize};
use sqlx::types::time::OffsetDateTime;
use uuid::Uuid;

#[derive(sqlx::FromRow, Serialize, Clone, Debug, PartialEq)]
pub struct Technician {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub phone: String,
    pub home_address: Option<String>,
    pub is_on_call: bool,
    pub priority: i32,
    pub active: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Booked,
    Completed,
    Canceled,
    Failed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Booked => "booked",
            BookingStatus::Completed => "completed",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Failed => "failed",
        }
    }

    /// Statuses that hold a technician's time.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Booked
        )
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub tenant_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub address: String,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub slot_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub slot_end: OffsetDateTime,
    pub status: BookingStatus,
    pub is_emergency: bool,
    pub technician_id: Option<Uuid>,
}

/// Final state of a call as written to the call record on teardown.
#[derive(Debug)]
pub struct CallRecordUpdate {
    pub call_id: String,
    pub status: String,
    pub duration_secs: i64,
    pub transcript: String,
}

#[derive(Debug)]
pub struct NewCallRecord {
    pub call_id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub from_number: String,
    pub to_number: String,
    pub started_at: OffsetDateTime,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EmergencyDispatch,
    CallTransfer,
    ToolCallFailed,
    Alert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EmergencyDispatch => "emergency_dispatch",
            EventKind::CallTransfer => "call_transfer",
            EventKind::ToolCallFailed => "tool_call_failed",
            EventKind::Alert => "alert",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub tenant_id: String,
    pub call_id: Option<String>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}
