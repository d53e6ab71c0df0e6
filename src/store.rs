use crate::db_types::{
    Booking, BookingStatus, CallRecordUpdate, Event, NewCallRecord, Technician,
};
use crate::error::StoreError;

use async_trait::async_trait;
use sqlx::types::time::OffsetDateTime;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Statuses that count against a technician during the dispatch conflict check.
pub const CONFLICT_STATUSES: &[BookingStatus] = &[BookingStatus::Pending, BookingStatus::Confirmed];

/// A half-open `[start, end)` interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl SlotWindow {
    pub fn new(start: OffsetDateTime, length: time::Duration) -> Self {
        Self {
            start,
            end: start + length,
        }
    }

    /// True when an existing `[start, end)` starts inside, ends inside, or contains this window.
    pub fn overlaps(&self, start: OffsetDateTime, end: OffsetDateTime) -> bool {
        let starts_inside = start >= self.start && start < self.end;
        let ends_inside = end > self.start && end <= self.end;
        let contains = start <= self.start && end >= self.end;
        starts_inside || ends_inside || contains
    }
}

#[derive(Clone, Debug)]
pub struct NewBooking {
    pub tenant_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub address: String,
    pub notes: Option<String>,
    pub slot: SlotWindow,
    pub is_emergency: bool,
    pub technician_id: Uuid,
}

#[derive(Clone, Debug)]
pub enum BookingCommit {
    Create(NewBooking),
    Assign {
        booking_id: Uuid,
        technician_id: Uuid,
        slot: Option<SlotWindow>,
    },
}

impl BookingCommit {
    fn technician_id(&self) -> Uuid {
        match self {
            BookingCommit::Create(new) => new.technician_id,
            BookingCommit::Assign { technician_id, .. } => *technician_id,
        }
    }

    /// The window to re-check at commit time, if the commit sets one.
    fn window(&self) -> Option<SlotWindow> {
        match self {
            BookingCommit::Create(new) => Some(new.slot),
            BookingCommit::Assign { slot, .. } => *slot,
        }
    }

    fn excluded_booking(&self) -> Option<Uuid> {
        match self {
            BookingCommit::Create(_) => None,
            BookingCommit::Assign { booking_id, .. } => Some(*booking_id),
        }
    }
}

#[derive(Debug)]
pub enum CommitOutcome {
    Committed(Booking),
    /// The re-check inside the commit found an overlapping booking.
    Conflicted,
}

#[async_trait]
pub trait TechnicianDirectory: Send + Sync {
    /// Active, on-call technicians for a tenant, highest priority first.
    async fn on_call_technicians(&self, tenant_id: &str) -> Result<Vec<Technician>, StoreError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Whether the technician has a pending or confirmed booking overlapping `window`, other
    /// than `excluded`.
    async fn has_conflict(
        &self,
        technician_id: Uuid,
        window: &SlotWindow,
        excluded: Option<Uuid>,
    ) -> Result<bool, StoreError>;

    /// Write a booking. With `recheck` the conflict check is repeated atomically with the write.
    async fn commit(
        &self,
        commit: BookingCommit,
        recheck: bool,
    ) -> Result<CommitOutcome, StoreError>;
}

#[async_trait]
pub trait CallLog: Send + Sync {
    async fn create_call_record(&self, record: &NewCallRecord) -> Result<(), StoreError>;
    async fn finalize_call_record(&self, update: &CallRecordUpdate) -> Result<(), StoreError>;
    async fn record_event(&self, event: &Event) -> Result<(), StoreError>;
}

async fn bounded<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(STORE_TIMEOUT, fut).await {
        Ok(res) => res.map_err(|e| {
            error!(error=%e, "database query failed");
            StoreError::Database(e)
        }),
        Err(_) => {
            error!("database query timed out");
            Err(StoreError::Timeout)
        }
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    tenant_id: String,
    customer_name: String,
    customer_phone: String,
    customer_email: Option<String>,
    address: String,
    notes: Option<String>,
    slot_start: OffsetDateTime,
    slot_end: OffsetDateTime,
    status: String,
    is_emergency: bool,
    technician_id: Option<Uuid>,
}

impl BookingRow {
    fn into_booking(self) -> Booking {
        let status = match self.status.as_str() {
            "confirmed" => BookingStatus::Confirmed,
            "booked" => BookingStatus::Booked,
            "completed" => BookingStatus::Completed,
            "canceled" => BookingStatus::Canceled,
            "failed" => BookingStatus::Failed,
            _ => BookingStatus::Pending,
        };
        Booking {
            id: self.id,
            tenant_id: self.tenant_id,
            customer_name: self.customer_name,
            customer_phone: self.customer_phone,
            customer_email: self.customer_email,
            address: self.address,
            notes: self.notes,
            slot_start: self.slot_start,
            slot_end: self.slot_end,
            status,
            is_emergency: self.is_emergency,
            technician_id: self.technician_id,
        }
    }
}

const BOOKING_COLUMNS: &str = "id, tenant_id, customer_name, customer_phone, customer_email, \
                               address, notes, slot_start, slot_end, status, is_emergency, \
                               technician_id";

/// Postgres-backed directory, booking store and call log.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conflict_statuses() -> Vec<String> {
        CONFLICT_STATUSES
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }

    async fn conflict_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        technician_id: Uuid,
        window: &SlotWindow,
        excluded: Option<Uuid>,
    ) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "
            select count(*)
            from bookings
            where technician_id = $1
              and status = any($2)
              and slot_start < $4
              and slot_end > $3
              and ($5::uuid is null or id <> $5)
            ",
        )
        .bind(technician_id)
        .bind(Self::conflict_statuses())
        .bind(window.start)
        .bind(window.end)
        .bind(excluded)
        .fetch_one(&mut **tx)
        .await?;
        Ok(count > 0)
    }

    async fn commit_in_tx(
        &self,
        commit: BookingCommit,
        recheck: bool,
    ) -> Result<CommitOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        // Serialize concurrent dispatches that target the same technician.
        sqlx::query("select id from technicians where id = $1 for update")
            .bind(commit.technician_id())
            .execute(&mut *tx)
            .await?;

        if recheck {
            if let Some(window) = commit.window() {
                let conflicted = Self::conflict_in_tx(
                    &mut tx,
                    commit.technician_id(),
                    &window,
                    commit.excluded_booking(),
                )
                .await?;
                if conflicted {
                    tx.rollback().await?;
                    return Ok(CommitOutcome::Conflicted);
                }
            }
        }

        let row: Option<BookingRow> = match commit {
            BookingCommit::Create(new) => Some(
                sqlx::query_as(&format!(
                    "
                    insert into bookings (
                      id, tenant_id, customer_name, customer_phone, address, notes,
                      slot_start, slot_end, status, is_emergency, technician_id
                    ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    returning {BOOKING_COLUMNS}
                    "
                ))
                .bind(Uuid::new_v4())
                .bind(&new.tenant_id)
                .bind(&new.customer_name)
                .bind(&new.customer_phone)
                .bind(&new.address)
                .bind(&new.notes)
                .bind(new.slot.start)
                .bind(new.slot.end)
                .bind(BookingStatus::Pending.as_str())
                .bind(new.is_emergency)
                .bind(new.technician_id)
                .fetch_one(&mut *tx)
                .await?,
            ),
            BookingCommit::Assign {
                booking_id,
                technician_id,
                slot,
            } => {
                sqlx::query_as(&format!(
                    "
                    update bookings
                    set technician_id = $2,
                        slot_start = coalesce($3, slot_start),
                        slot_end = coalesce($4, slot_end)
                    where id = $1
                    returning {BOOKING_COLUMNS}
                    "
                ))
                .bind(booking_id)
                .bind(technician_id)
                .bind(slot.map(|s| s.start))
                .bind(slot.map(|s| s.end))
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        match row {
            Some(row) => {
                tx.commit().await?;
                Ok(CommitOutcome::Committed(row.into_booking()))
            }
            None => {
                tx.rollback().await?;
                Err(sqlx::Error::RowNotFound)
            }
        }
    }
}

#[async_trait]
impl TechnicianDirectory for PgStore {
    async fn on_call_technicians(&self, tenant_id: &str) -> Result<Vec<Technician>, StoreError> {
        bounded(
            sqlx::query_as::<_, Technician>(
                "
                select id, tenant_id, name, phone, home_address, is_on_call, priority, active
                from technicians
                where tenant_id = $1
                  and active = true
                  and is_on_call = true
                order by priority desc
                ",
            )
            .bind(tenant_id)
            .fetch_all(&self.pool),
        )
        .await
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn has_conflict(
        &self,
        technician_id: Uuid,
        window: &SlotWindow,
        excluded: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let count: i64 = bounded(
            sqlx::query_scalar(
                "
                select count(*)
                from bookings
                where technician_id = $1
                  and status = any($2)
                  and slot_start < $4
                  and slot_end > $3
                  and ($5::uuid is null or id <> $5)
                ",
            )
            .bind(technician_id)
            .bind(Self::conflict_statuses())
            .bind(window.start)
            .bind(window.end)
            .bind(excluded)
            .fetch_one(&self.pool),
        )
        .await?;
        debug!(technician=%technician_id, count, "conflicting bookings");
        Ok(count > 0)
    }

    async fn commit(
        &self,
        commit: BookingCommit,
        recheck: bool,
    ) -> Result<CommitOutcome, StoreError> {
        let booking_id = commit.excluded_booking();
        match bounded(self.commit_in_tx(commit, recheck)).await {
            Err(StoreError::Database(sqlx::Error::RowNotFound)) => Err(StoreError::NotFound(
                booking_id.map(|id| id.to_string()).unwrap_or_default(),
            )),
            res => res,
        }
    }
}

#[async_trait]
impl CallLog for PgStore {
    async fn create_call_record(&self, record: &NewCallRecord) -> Result<(), StoreError> {
        bounded(
            sqlx::query(
                "
                insert into calls (
                  call_sid, tenant_id, agent_id, from_number, to_number, status, started_at
                ) values ($1, $2, $3, $4, $5, 'in-progress', $6)
                on conflict (call_sid) do nothing
                ",
            )
            .bind(&record.call_id)
            .bind(&record.tenant_id)
            .bind(&record.agent_id)
            .bind(&record.from_number)
            .bind(&record.to_number)
            .bind(record.started_at)
            .execute(&self.pool),
        )
        .await
        .map(|_| ())
    }

    async fn finalize_call_record(&self, update: &CallRecordUpdate) -> Result<(), StoreError> {
        bounded(
            sqlx::query(
                "
                update calls
                set status = $2, duration_secs = $3, transcript = $4, ended_at = now()
                where call_sid = $1
                ",
            )
            .bind(&update.call_id)
            .bind(&update.status)
            .bind(update.duration_secs)
            .bind(&update.transcript)
            .execute(&self.pool),
        )
        .await
        .map(|_| ())
    }

    async fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        bounded(
            sqlx::query(
                "
                insert into events (tenant_id, call_sid, kind, payload)
                values ($1, $2, $3, $4)
                ",
            )
            .bind(&event.tenant_id)
            .bind(&event.call_id)
            .bind(event.kind.as_str())
            .bind(sqlx::types::Json(&event.payload))
            .execute(&self.pool),
        )
        .await
        .map(|_| ())
    }
}
