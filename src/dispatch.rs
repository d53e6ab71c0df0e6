//! Emergency technician selection, booking commit and notification.
//!
//! Candidates are ranked by `priority * 10` plus a proximity bonus, then walked in order until
//! one has no conflicting booking in its arrival window. When no candidate is clean, or distance
//! scoring could not run at all, the highest-priority technician is assigned anyway and the
//! result is marked as a [`Assignment::Fallback`].

use crate::db_types::{Booking, Event, EventKind, Technician};
use crate::error::DispatchError;
use crate::geo::{haversine_miles, Coordinates, GeocodeCache, Geocoder};
use crate::notify::Notifier;
use crate::store::{
    BookingCommit, BookingStore, CallLog, CommitOutcome, NewBooking, SlotWindow,
    TechnicianDirectory,
};

use serde::Deserialize;
use serde_json::json;
use std::cmp::Ordering;
use std::sync::Arc;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const PREP_BUFFER_MINUTES: i64 = 30;
pub const SERVICE_WINDOW_MINUTES: i64 = 90;
const SLOT_GRANULARITY_SECS: i64 = 30 * 60;

pub const NO_COVERAGE_MESSAGE: &str = "I'm sorry, we don't have a technician on call right now. \
    I can get someone out to you first thing tomorrow morning. Would you like me to book that?";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Live call to transfer to the technician.
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub booking_id: Option<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub suggested_start: Option<OffsetDateTime>,
}

impl DispatchRequest {
    fn validate(&self) -> Result<(), DispatchError> {
        if self.tenant_id.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("tenantId is required".into()));
        }
        if self.customer_phone.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("customerPhone is required".into()));
        }
        if self.booking_id.is_none() && self.address.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "address is required without an existing booking".into(),
            ));
        }
        Ok(())
    }
}

/// Scoring record for one technician in one evaluation.
#[derive(Clone, Debug)]
pub struct DispatchCandidate {
    pub technician: Technician,
    pub score: i64,
    pub distance_miles: Option<f64>,
    pub drive_minutes: Option<i64>,
    pub arrival: Option<OffsetDateTime>,
    pub justification: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    /// Every scored candidate had a conflicting booking.
    AllCandidatesConflicted,
    /// No geocoder, no address, or the incident address did not resolve.
    DistanceScoringUnavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    Clean,
    Fallback(FallbackReason),
}

impl Assignment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Assignment::Clean => "clean",
            Assignment::Fallback(_) => "fallback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationOutcome {
    Sent(String),
    Failed(String),
    Skipped,
}

impl NotificationOutcome {
    fn to_json(&self) -> serde_json::Value {
        match self {
            NotificationOutcome::Sent(id) => json!({"status": "sent", "id": id}),
            NotificationOutcome::Failed(e) => json!({"status": "failed", "error": e}),
            NotificationOutcome::Skipped => json!({"status": "skipped"}),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NotificationReport {
    pub sms: NotificationOutcome,
    pub voice_call: NotificationOutcome,
    pub transfer: NotificationOutcome,
}

#[derive(Clone, Debug)]
pub struct DispatchConfirmation {
    pub booking: Booking,
    pub technician: Technician,
    pub assignment: Assignment,
    pub arrival: Option<OffsetDateTime>,
    pub rationale: String,
    pub notifications: NotificationReport,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum DispatchOutcome {
    Dispatched(Box<DispatchConfirmation>),
    NoTechnicianOnCall { message: String },
}

impl DispatchOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DispatchOutcome::Dispatched(c) => json!({
                "dispatched": true,
                "result": c.message,
                "bookingId": c.booking.id,
                "assignment": c.assignment.as_str(),
                "arrival": c
                    .arrival
                    .and_then(|a| a.format(&time::format_description::well_known::Rfc3339).ok()),
                "rationale": c.rationale,
                "technician": {
                    "id": c.technician.id,
                    "name": c.technician.name,
                },
                "notifications": {
                    "sms": c.notifications.sms.to_json(),
                    "voiceCall": c.notifications.voice_call.to_json(),
                    "transfer": c.notifications.transfer.to_json(),
                },
            }),
            DispatchOutcome::NoTechnicianOnCall { message } => json!({
                "dispatched": false,
                "result": message,
            }),
        }
    }
}

pub fn proximity_bonus(miles: f64) -> i64 {
    if miles < 2.0 {
        30
    } else if miles < 5.0 {
        25
    } else if miles < 10.0 {
        20
    } else if miles < 15.0 {
        15
    } else {
        10
    }
}

pub fn score(priority: i32, distance_miles: Option<f64>) -> i64 {
    i64::from(priority) * 10 + distance_miles.map(proximity_bonus).unwrap_or(0)
}

fn cmp_distance(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Score desc, then priority desc, then distance asc with unknown distances last.
pub fn rank_candidates(candidates: &mut [DispatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.technician.priority.cmp(&a.technician.priority))
            .then_with(|| cmp_distance(a.distance_miles, b.distance_miles))
    });
}

/// Round up to the next :00 or :30; times already on a boundary are unchanged.
pub fn round_up_to_half_hour(t: OffsetDateTime) -> OffsetDateTime {
    let secs = t.unix_timestamp();
    let rem = secs.rem_euclid(SLOT_GRANULARITY_SECS);
    if rem == 0 && t.nanosecond() == 0 {
        return t;
    }
    OffsetDateTime::from_unix_timestamp(secs - rem + SLOT_GRANULARITY_SECS)
        .map(|r| r.to_offset(t.offset()))
        .unwrap_or(t)
}

pub fn arrival_for(now: OffsetDateTime, drive_minutes: Option<i64>) -> OffsetDateTime {
    let raw = now + Duration::minutes(PREP_BUFFER_MINUTES + drive_minutes.unwrap_or(0));
    round_up_to_half_hour(raw)
}

pub fn service_window(arrival: OffsetDateTime) -> SlotWindow {
    SlotWindow::new(arrival, Duration::minutes(SERVICE_WINDOW_MINUTES))
}

pub struct DispatchSettings {
    /// Base for the technician call's TwiML and status callbacks.
    pub public_base_url: String,
    /// Offset used to speak arrival times to the caller.
    pub local_offset: UtcOffset,
}

pub struct DispatchScheduler {
    directory: Arc<dyn TechnicianDirectory>,
    bookings: Arc<dyn BookingStore>,
    call_log: Arc<dyn CallLog>,
    geocoder: Option<Arc<dyn Geocoder>>,
    notifier: Arc<dyn Notifier>,
    settings: DispatchSettings,
}

/// The technician picked by the walk along with the committed booking.
struct Selection {
    candidate: DispatchCandidate,
    booking: Booking,
    assignment: Assignment,
}

impl DispatchScheduler {
    pub fn new(
        directory: Arc<dyn TechnicianDirectory>,
        bookings: Arc<dyn BookingStore>,
        call_log: Arc<dyn CallLog>,
        geocoder: Option<Arc<dyn Geocoder>>,
        notifier: Arc<dyn Notifier>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            directory,
            bookings,
            call_log,
            geocoder,
            notifier,
            settings,
        }
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_at(req, OffsetDateTime::now_utc()).await
    }

    pub async fn dispatch_at(
        &self,
        req: DispatchRequest,
        now: OffsetDateTime,
    ) -> Result<DispatchOutcome, DispatchError> {
        req.validate()?;

        let technicians = self.directory.on_call_technicians(&req.tenant_id).await?;
        if technicians.is_empty() {
            info!(tenant=%req.tenant_id, "no technician on call");
            return Ok(DispatchOutcome::NoTechnicianOnCall {
                message: NO_COVERAGE_MESSAGE.to_string(),
            });
        }

        let mut rationale: Vec<String> = vec![];
        let selection = match self.score_candidates(&req, &technicians).await {
            Some(mut candidates) => {
                rank_candidates(&mut candidates);
                match self.walk(&req, candidates.clone(), now, &mut rationale).await? {
                    Some(selection) => selection,
                    None => {
                        self.fallback(
                            &req,
                            &technicians,
                            Some(candidates.as_slice()),
                            FallbackReason::AllCandidatesConflicted,
                            now,
                            &mut rationale,
                        )
                        .await?
                    }
                }
            }
            None => {
                self.fallback(
                    &req,
                    &technicians,
                    None,
                    FallbackReason::DistanceScoringUnavailable,
                    now,
                    &mut rationale,
                )
                .await?
            }
        };

        let rationale = rationale.join("; ");
        info!(
            tenant=%req.tenant_id,
            technician=%selection.candidate.technician.id,
            booking=%selection.booking.id,
            assignment=selection.assignment.as_str(),
            "emergency dispatch committed"
        );
        let notifications = self.notify(&req, &selection, &rationale).await;
        let message = self.confirmation_message(
            &selection.candidate.technician,
            selection.candidate.arrival,
        );

        Ok(DispatchOutcome::Dispatched(Box::new(DispatchConfirmation {
            arrival: selection.candidate.arrival,
            technician: selection.candidate.technician,
            booking: selection.booking,
            assignment: selection.assignment,
            rationale,
            notifications,
            message,
        })))
    }

    /// Distance-scored candidates, or `None` when the incident cannot be located.
    async fn score_candidates(
        &self,
        req: &DispatchRequest,
        technicians: &[Technician],
    ) -> Option<Vec<DispatchCandidate>> {
        let geocoder = self.geocoder.as_deref()?;
        if req.address.trim().is_empty() {
            return None;
        }
        let mut cache = GeocodeCache::new(geocoder);
        let Some(incident) = cache.geocode(&req.address).await else {
            warn!(address=%req.address, "incident address did not geocode; priority-only dispatch");
            return None;
        };

        let mut candidates = Vec::with_capacity(technicians.len());
        for tech in technicians {
            let home = match &tech.home_address {
                Some(addr) if !addr.trim().is_empty() => cache.geocode(addr).await,
                _ => None,
            };
            candidates.push(self.candidate(&cache, tech, home, incident).await);
        }
        Some(candidates)
    }

    async fn candidate(
        &self,
        cache: &GeocodeCache<'_>,
        tech: &Technician,
        home: Option<Coordinates>,
        incident: Coordinates,
    ) -> DispatchCandidate {
        let (distance_miles, drive_minutes) = match home {
            Some(home) => (
                Some(haversine_miles(home, incident)),
                cache.drive_minutes(home, incident).await,
            ),
            None => (None, None),
        };
        let score = score(tech.priority, distance_miles);
        let justification = match distance_miles {
            Some(miles) => format!(
                "{}: priority {} ({}) + {:.1} mi (+{}) = {}",
                tech.name,
                tech.priority,
                i64::from(tech.priority) * 10,
                miles,
                proximity_bonus(miles),
                score
            ),
            None => format!(
                "{}: priority {} ({}), no home location = {}",
                tech.name,
                tech.priority,
                i64::from(tech.priority) * 10,
                score
            ),
        };
        DispatchCandidate {
            technician: tech.clone(),
            score,
            distance_miles,
            drive_minutes,
            arrival: None,
            justification,
        }
    }

    /// First candidate whose arrival window is free, committed to the store.
    async fn walk(
        &self,
        req: &DispatchRequest,
        candidates: Vec<DispatchCandidate>,
        now: OffsetDateTime,
        rationale: &mut Vec<String>,
    ) -> Result<Option<Selection>, DispatchError> {
        for mut candidate in candidates {
            let arrival = arrival_for(now, candidate.drive_minutes);
            candidate.arrival = Some(arrival);
            let window = service_window(arrival);
            let tech_id = candidate.technician.id;

            if self
                .bookings
                .has_conflict(tech_id, &window, req.booking_id)
                .await?
            {
                debug!(technician=%tech_id, arrival=%arrival, "candidate has conflicting booking");
                rationale.push(format!("{}, rejected: conflict", candidate.justification));
                continue;
            }

            match self.commit(req, tech_id, Some(window), true).await? {
                CommitOutcome::Committed(booking) => {
                    rationale.push(format!("{}, selected", candidate.justification));
                    return Ok(Some(Selection {
                        candidate,
                        booking,
                        assignment: Assignment::Clean,
                    }));
                }
                CommitOutcome::Conflicted => {
                    warn!(technician=%tech_id, "conflict appeared at commit time");
                    rationale.push(format!(
                        "{}, rejected: conflict at commit",
                        candidate.justification
                    ));
                }
            }
        }
        Ok(None)
    }

    async fn fallback(
        &self,
        req: &DispatchRequest,
        technicians: &[Technician],
        scored: Option<&[DispatchCandidate]>,
        reason: FallbackReason,
        now: OffsetDateTime,
        rationale: &mut Vec<String>,
    ) -> Result<Selection, DispatchError> {
        // `technicians` is non-empty here; the first of the highest priority wins ties.
        let mut tech = &technicians[0];
        for t in technicians {
            if t.priority > tech.priority {
                tech = t;
            }
        }

        let mut candidate = scored
            .and_then(|c| c.iter().find(|c| c.technician.id == tech.id).cloned())
            .unwrap_or_else(|| DispatchCandidate {
                technician: tech.clone(),
                score: score(tech.priority, None),
                distance_miles: None,
                drive_minutes: None,
                arrival: None,
                justification: format!("{}: priority {}", tech.name, tech.priority),
            });
        let arrival = match reason {
            FallbackReason::AllCandidatesConflicted => {
                Some(arrival_for(now, candidate.drive_minutes))
            }
            FallbackReason::DistanceScoringUnavailable => None,
        };
        candidate.arrival = arrival;

        let window = match (arrival, req.suggested_start) {
            (Some(arrival), _) => Some(service_window(arrival)),
            (None, Some(suggested)) => Some(service_window(suggested)),
            (None, None) if req.booking_id.is_none() => Some(service_window(now)),
            (None, None) => None,
        };

        let reason_text = match reason {
            FallbackReason::AllCandidatesConflicted => "all candidates had conflicting bookings",
            FallbackReason::DistanceScoringUnavailable => "distance scoring unavailable",
        };
        warn!(technician=%tech.id, reason=reason_text, "fallback assignment");
        rationale.push(format!(
            "conflict check bypassed ({reason_text}); assigned highest priority {}",
            candidate.justification
        ));

        let booking = match self.commit(req, tech.id, window, false).await? {
            CommitOutcome::Committed(booking) => booking,
            // An unchecked commit never reports a conflict.
            CommitOutcome::Conflicted => {
                return Err(DispatchError::InvalidRequest(
                    "unexpected conflict on unchecked commit".into(),
                ))
            }
        };
        Ok(Selection {
            candidate,
            booking,
            assignment: Assignment::Fallback(reason),
        })
    }

    async fn commit(
        &self,
        req: &DispatchRequest,
        technician_id: Uuid,
        window: Option<SlotWindow>,
        recheck: bool,
    ) -> Result<CommitOutcome, DispatchError> {
        let commit = match (req.booking_id, window) {
            (Some(booking_id), slot) => BookingCommit::Assign {
                booking_id,
                technician_id,
                slot,
            },
            (None, Some(slot)) => BookingCommit::Create(NewBooking {
                tenant_id: req.tenant_id.clone(),
                customer_name: req.customer_name.clone(),
                customer_phone: req.customer_phone.clone(),
                address: req.address.clone(),
                notes: req.notes.clone(),
                slot,
                is_emergency: true,
                technician_id,
            }),
            (None, None) => {
                return Err(DispatchError::InvalidRequest(
                    "no slot for a new booking".into(),
                ))
            }
        };
        self.bookings
            .commit(commit, recheck)
            .await
            .map_err(|e| match (e, req.booking_id) {
                (crate::error::StoreError::NotFound(_), Some(id)) => {
                    DispatchError::BookingNotFound(id.to_string())
                }
                (e, _) => DispatchError::Store(e),
            })
    }

    /// SMS, voice call, event log and live transfer; each failure is logged and skipped.
    async fn notify(
        &self,
        req: &DispatchRequest,
        selection: &Selection,
        rationale: &str,
    ) -> NotificationReport {
        let tech = &selection.candidate.technician;
        let arrival_text = selection
            .candidate
            .arrival
            .map(|a| self.local_time(a))
            .unwrap_or_else(|| "ASAP".to_string());

        let sms_body = format!(
            "EMERGENCY: {} at {}. Callback {}. Notes: {}. Target arrival {}.",
            if req.customer_name.is_empty() { "Customer" } else { req.customer_name.as_str() },
            if req.address.is_empty() { "address on booking" } else { req.address.as_str() },
            req.customer_phone,
            req.notes.as_deref().unwrap_or("none"),
            arrival_text,
        );
        let sms = match self.notifier.send_sms(&tech.phone, &sms_body).await {
            Ok(sid) => NotificationOutcome::Sent(sid),
            Err(e) => {
                error!(error=%e, technician=%tech.id, "failed to text technician");
                NotificationOutcome::Failed(e.to_string())
            }
        };

        let base = self.settings.public_base_url.trim_end_matches('/');
        let callback_url = format!("{base}/twilio/dispatch/{}/twiml", selection.booking.id);
        let status_url = format!("{base}/twilio/dispatch/status");
        let voice_call = match self
            .notifier
            .place_call(&tech.phone, &callback_url, &status_url)
            .await
        {
            Ok(sid) => NotificationOutcome::Sent(sid),
            Err(e) => {
                error!(error=%e, technician=%tech.id, "failed to call technician");
                NotificationOutcome::Failed(e.to_string())
            }
        };

        let event = Event {
            tenant_id: req.tenant_id.clone(),
            call_id: req.call_id.clone(),
            kind: EventKind::EmergencyDispatch,
            payload: json!({
                "bookingId": selection.booking.id,
                "technicianId": tech.id,
                "technicianName": tech.name,
                "assignment": selection.assignment.as_str(),
                "score": selection.candidate.score,
                "distanceMiles": selection.candidate.distance_miles,
                "arrival": selection.candidate.arrival.map(|a| a.unix_timestamp()),
                "rationale": rationale,
                "sms": sms.to_json(),
                "voiceCall": voice_call.to_json(),
            }),
        };
        if let Err(e) = self.call_log.record_event(&event).await {
            error!(error=%e, "failed to record dispatch event");
        }

        let transfer = match &req.call_id {
            Some(call_id) => {
                let outcome = match self.notifier.transfer_call(call_id, &tech.phone).await {
                    Ok(()) => NotificationOutcome::Sent(call_id.clone()),
                    Err(e) => {
                        error!(error=%e, call_sid=%call_id, "failed to transfer live call");
                        NotificationOutcome::Failed(e.to_string())
                    }
                };
                let event = Event {
                    tenant_id: req.tenant_id.clone(),
                    call_id: Some(call_id.clone()),
                    kind: EventKind::CallTransfer,
                    payload: json!({
                        "technicianId": tech.id,
                        "to": tech.phone,
                        "success": matches!(outcome, NotificationOutcome::Sent(_)),
                        "outcome": outcome.to_json(),
                    }),
                };
                if let Err(e) = self.call_log.record_event(&event).await {
                    error!(error=%e, "failed to record transfer event");
                }
                outcome
            }
            None => NotificationOutcome::Skipped,
        };

        NotificationReport {
            sms,
            voice_call,
            transfer,
        }
    }

    fn local_time(&self, t: OffsetDateTime) -> String {
        t.to_offset(self.settings.local_offset)
            .format(format_description!(
                "[hour repr:12 padding:none]:[minute] [period]"
            ))
            .unwrap_or_else(|_| "soon".to_string())
    }

    fn confirmation_message(&self, tech: &Technician, arrival: Option<OffsetDateTime>) -> String {
        match arrival {
            Some(arrival) => format!(
                "I've dispatched {}, and they should arrive around {}. \
                 They'll have your number in case they need to reach you.",
                tech.name,
                self.local_time(arrival)
            ),
            None => format!(
                "I've dispatched {}, and they should be there within 30 to 60 minutes. \
                 They'll have your number in case they need to reach you.",
                tech.name
            ),
        }
    }
}
