//! SQLite implementation of the EventStore trait.
//!
//! This is the primary storage backend for the retry queue. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! Every mutation runs in an IMMEDIATE transaction: the row is loaded,
//! the transition is applied by [`FailedEvent`] itself, and the result is
//! written back. The partial unique index on `(event_type, dedup_key)` backs
//! the one-unresolved-event-per-subject rule.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use elis_sync_core::{
    Admission, DedupKey, ErrorKind, EventId, EventParts, EventState, EventType, FailedEvent,
    LinearBackoff, SubjectRef, TransitionError,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, FAILED_EVENT_SEQUENCE};
use crate::traits::{
    AdmitOutcome, ClaimOutcome, Completion, DueQuery, EventFilter, EventStore, FailureRecord,
};

const EVENT_COLUMNS: &str = "id, sequence_number, subject, payload, error_message, error_kind,
    http_status, retry_count, state, last_retry_at, next_retry_at, created_at, updated_at,
    revision, refreshed_in_flight";

const UNRESOLVED: &str = "state IN ('pending', 'retrying', 'failed')";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection inside `spawn_blocking`.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Task(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }
}

/// Row as read from `failed_events`, before validation.
struct RawEvent {
    id: i64,
    sequence_number: i64,
    subject: String,
    payload: String,
    error_message: String,
    error_kind: String,
    http_status: Option<i64>,
    retry_count: i64,
    state: String,
    last_retry_at: Option<i64>,
    next_retry_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    revision: i64,
    refreshed_in_flight: bool,
}

// Helper to read a row selected with EVENT_COLUMNS
fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get("id")?,
        sequence_number: row.get("sequence_number")?,
        subject: row.get("subject")?,
        payload: row.get("payload")?,
        error_message: row.get("error_message")?,
        error_kind: row.get("error_kind")?,
        http_status: row.get("http_status")?,
        retry_count: row.get("retry_count")?,
        state: row.get("state")?,
        last_retry_at: row.get("last_retry_at")?,
        next_retry_at: row.get("next_retry_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        revision: row.get("revision")?,
        refreshed_in_flight: row.get("refreshed_in_flight")?,
    })
}

impl RawEvent {
    fn into_event(self) -> Result<FailedEvent> {
        let http_status = self
            .http_status
            .map(u16::try_from)
            .transpose()
            .map_err(|_| invalid("http_status", self.http_status))?;

        Ok(FailedEvent::restore(EventParts {
            id: EventId(to_u64("id", self.id)?),
            sequence_number: to_u64("sequence_number", self.sequence_number)?,
            subject: serde_json::from_str::<SubjectRef>(&self.subject)?,
            payload: serde_json::from_str(&self.payload)?,
            error_message: self.error_message,
            error_kind: ErrorKind::from_code(&self.error_kind, http_status)?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| invalid("retry_count", self.retry_count))?,
            state: self.state.parse::<EventState>()?,
            last_retry_at: self.last_retry_at,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            revision: to_u64("revision", self.revision)?,
            refreshed_in_flight: self.refreshed_in_flight,
        }))
    }
}

fn invalid(column: &str, value: impl std::fmt::Debug) -> StoreError {
    StoreError::Serialization(format!("invalid {}: {:?}", column, value))
}

fn to_u64(column: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| invalid(column, value))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| invalid("integer", value))
}

fn collect_events(rows: Vec<RawEvent>) -> Result<Vec<FailedEvent>> {
    rows.into_iter().map(RawEvent::into_event).collect()
}

fn load_event(conn: &Connection, id: EventId) -> Result<Option<FailedEvent>> {
    let sql = format!("SELECT {} FROM failed_events WHERE id = ?1", EVENT_COLUMNS);
    conn.query_row(&sql, params![to_i64(id.get())?], row_to_raw)
        .optional()?
        .map(RawEvent::into_event)
        .transpose()
}

fn load_unresolved(
    conn: &Connection,
    event_type: EventType,
    dedup_key: &DedupKey,
) -> Result<Option<FailedEvent>> {
    let sql = format!(
        "SELECT {} FROM failed_events
         WHERE event_type = ?1 AND dedup_key = ?2 AND {}",
        EVENT_COLUMNS, UNRESOLVED
    );
    conn.query_row(
        &sql,
        params![event_type.as_str(), dedup_key.as_str()],
        row_to_raw,
    )
    .optional()?
    .map(RawEvent::into_event)
    .transpose()
}

/// Write every mutable column of `event` back to its row.
fn write_back(conn: &Connection, event: &FailedEvent) -> Result<()> {
    let subject = serde_json::to_string(event.subject())?;
    let payload = serde_json::to_string(event.payload())?;
    let kind = event.error_kind();

    let updated = conn.execute(
        "UPDATE failed_events SET
            dedup_key = ?2, subject = ?3, owner_id = ?4, payload = ?5,
            error_message = ?6, error_kind = ?7, http_status = ?8, retry_count = ?9,
            state = ?10, last_retry_at = ?11, next_retry_at = ?12, updated_at = ?13,
            revision = ?14, refreshed_in_flight = ?15
         WHERE id = ?1",
        params![
            to_i64(event.id().get())?,
            event.dedup_key().as_str(),
            subject,
            event.subject().owner_id(),
            payload,
            event.error_message(),
            kind.code(),
            kind.http_status(),
            event.retry_count(),
            event.state().as_str(),
            event.last_retry_at(),
            event.next_retry_at(),
            event.updated_at(),
            to_i64(event.revision())?,
            event.is_refreshed_in_flight(),
        ],
    )?;

    if updated == 0 {
        return Err(StoreError::NotFound(event.id()));
    }
    Ok(())
}

/// Completion for a claim whose revision no longer matches.
fn stale_completion(conn: &Connection, mut event: FailedEvent, now: i64) -> Result<Completion> {
    if !event.is_refreshed_in_flight() {
        return Ok(Completion::Superseded);
    }
    event.requeue_refreshed(now)?;
    write_back(conn, &event)?;
    Ok(Completion::Requeued(event))
}

fn delete_event(conn: &Connection, id: EventId) -> Result<()> {
    conn.execute(
        "DELETE FROM failed_events WHERE id = ?1",
        params![to_i64(id.get())?],
    )?;
    Ok(())
}

fn bump_sequence(conn: &Connection) -> Result<u64> {
    conn.execute(
        "UPDATE sequence_counter SET value = value + 1 WHERE name = ?1",
        params![FAILED_EVENT_SEQUENCE],
    )?;
    let value: i64 = conn.query_row(
        "SELECT value FROM sequence_counter WHERE name = ?1",
        params![FAILED_EVENT_SEQUENCE],
        |row| row.get(0),
    )?;
    to_u64("sequence_counter", value)
}

fn insert_new(conn: &Connection, admission: Admission, now: i64) -> Result<FailedEvent> {
    let sequence_number = bump_sequence(conn)?;
    let subject = serde_json::to_string(&admission.subject)?;
    let payload = serde_json::to_string(&admission.payload)?;
    let kind = admission.error_kind;

    conn.execute(
        "INSERT INTO failed_events (
            sequence_number, event_type, dedup_key, subject, owner_id, payload,
            error_message, error_kind, http_status, retry_count, state,
            last_retry_at, next_retry_at, created_at, updated_at, revision
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, NULL, NULL, ?11, ?11, 1)",
        params![
            to_i64(sequence_number)?,
            admission.event_type().as_str(),
            admission.dedup_key().as_str(),
            subject,
            admission.subject.owner_id(),
            payload,
            admission.error_message,
            kind.code(),
            kind.http_status(),
            EventState::Pending.as_str(),
            now,
        ],
    )?;
    let id = to_u64("id", conn.last_insert_rowid())?;

    Ok(FailedEvent::admit(EventId(id), sequence_number, admission, now))
}

impl SqliteStore {
    async fn take_claim(&self, id: EventId, now: i64, due_only: bool) -> Result<ClaimOutcome> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut event) = load_event(&tx, id)? else {
                return Ok(ClaimOutcome::NotFound);
            };
            let claimed = if due_only {
                event.begin_due_retry(now)
            } else {
                event.begin_retry(now)
            };
            match claimed {
                Ok(()) => {}
                Err(TransitionError::AlreadyRetrying(_)) => return Ok(ClaimOutcome::Busy),
                Err(TransitionError::NotDue(_)) => return Ok(ClaimOutcome::NotDue),
                Err(e) => return Err(e.into()),
            }
            write_back(&tx, &event)?;

            tx.commit()?;
            Ok(ClaimOutcome::Claimed(event))
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn next_sequence(&self) -> Result<u64> {
        self.blocking(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = bump_sequence(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    async fn admit(&self, admission: Admission, now: i64) -> Result<AdmitOutcome> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing = load_unresolved(&tx, admission.event_type(), &admission.dedup_key())?;
            let outcome = match existing {
                Some(mut event) => {
                    event.readmit(admission, now)?;
                    write_back(&tx, &event)?;
                    AdmitOutcome::Refreshed(event)
                }
                None => AdmitOutcome::Created(insert_new(&tx, admission, now)?),
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<FailedEvent>> {
        self.blocking(move |conn| load_event(conn, id)).await
    }

    async fn find_unresolved(
        &self,
        event_type: EventType,
        dedup_key: &DedupKey,
    ) -> Result<Option<FailedEvent>> {
        let dedup_key = dedup_key.clone();
        self.blocking(move |conn| load_unresolved(conn, event_type, &dedup_key))
            .await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<FailedEvent>> {
        let filter = filter.clone();

        self.blocking(move |conn| {
            let mut sql = format!("SELECT {} FROM failed_events WHERE 1 = 1", EVENT_COLUMNS);
            let mut args: Vec<SqlValue> = Vec::new();

            if let Some(state) = filter.state {
                args.push(SqlValue::Text(state.as_str().to_string()));
                sql.push_str(&format!(" AND state = ?{}", args.len()));
            }
            if let Some(event_type) = filter.event_type {
                args.push(SqlValue::Text(event_type.as_str().to_string()));
                sql.push_str(&format!(" AND event_type = ?{}", args.len()));
            }
            sql.push_str(" ORDER BY sequence_number, created_at");
            if let Some(limit) = filter.limit {
                args.push(SqlValue::Integer(limit as i64));
                sql.push_str(&format!(" LIMIT ?{}", args.len()));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args), row_to_raw)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            collect_events(rows)
        })
        .await
    }

    async fn select_due(&self, query: &DueQuery) -> Result<Vec<FailedEvent>> {
        if query.event_types.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }
        let query = query.clone();

        self.blocking(move |conn| {
            let mut args: Vec<SqlValue> = vec![SqlValue::Integer(query.now)];
            let mut type_slots = Vec::with_capacity(query.event_types.len());
            for event_type in &query.event_types {
                args.push(SqlValue::Text(event_type.as_str().to_string()));
                type_slots.push(format!("?{}", args.len()));
            }
            args.push(SqlValue::Integer(query.limit as i64));

            let sql = format!(
                "SELECT {} FROM failed_events
                 WHERE state IN ('pending', 'failed')
                   AND NOT (state = 'failed' AND error_kind = 'subject_missing')
                   AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                   AND event_type IN ({})
                 ORDER BY sequence_number, created_at
                 LIMIT ?{}",
                EVENT_COLUMNS,
                type_slots.join(", "),
                args.len()
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args), row_to_raw)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            collect_events(rows)
        })
        .await
    }

    async fn claim(&self, id: EventId, now: i64) -> Result<ClaimOutcome> {
        self.take_claim(id, now, false).await
    }

    async fn claim_due(&self, id: EventId, now: i64) -> Result<ClaimOutcome> {
        self.take_claim(id, now, true).await
    }

    async fn release_claim(
        &self,
        id: EventId,
        revision: u64,
        now: i64,
    ) -> Result<Option<FailedEvent>> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut event) = load_event(&tx, id)? else {
                return Ok(None);
            };
            let held = event.revision() == revision || event.is_refreshed_in_flight();
            if event.state() != EventState::Retrying || !held {
                return Ok(None);
            }
            event.interrupt(now)?;
            write_back(&tx, &event)?;

            tx.commit()?;
            Ok(Some(event))
        })
        .await
    }

    async fn complete_success(&self, id: EventId, revision: u64, now: i64) -> Result<Completion> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut event) = load_event(&tx, id)? else {
                return Ok(Completion::Superseded);
            };
            if event.revision() != revision {
                let completion = stale_completion(&tx, event, now)?;
                tx.commit()?;
                return Ok(completion);
            }
            event.mark_delivered(now)?;
            delete_event(&tx, id)?;

            tx.commit()?;
            Ok(Completion::Deleted)
        })
        .await
    }

    async fn complete_failure(
        &self,
        id: EventId,
        revision: u64,
        failure: FailureRecord,
        backoff: LinearBackoff,
        now: i64,
    ) -> Result<Completion> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut event) = load_event(&tx, id)? else {
                return Ok(Completion::Superseded);
            };
            if event.revision() != revision {
                let completion = stale_completion(&tx, event, now)?;
                tx.commit()?;
                return Ok(completion);
            }
            if let Some(payload) = failure.sent_payload {
                event.replace_payload(payload, now)?;
            }
            event.record_failure(failure.message, failure.kind, now, &backoff)?;
            write_back(&tx, &event)?;

            tx.commit()?;
            Ok(Completion::Updated(event))
        })
        .await
    }

    async fn resolve_externally(&self, id: EventId, now: i64) -> Result<Option<FailedEvent>> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut event) = load_event(&tx, id)? else {
                return Ok(None);
            };
            event.resolve_externally(now)?;
            delete_event(&tx, id)?;

            tx.commit()?;
            Ok(Some(event))
        })
        .await
    }

    async fn discard(&self, id: EventId) -> Result<Option<FailedEvent>> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing = load_event(&tx, id)?;
            if existing.is_some() {
                delete_event(&tx, id)?;
            }

            tx.commit()?;
            Ok(existing)
        })
        .await
    }

    async fn purge_subject(&self, subject: &SubjectRef) -> Result<usize> {
        let event_type = subject.event_type();
        let owner_id = subject.owner_id();

        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM failed_events WHERE event_type = ?1 AND owner_id = ?2",
                params![event_type.as_str(), owner_id],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn recover_interrupted(&self, now: i64) -> Result<Vec<EventId>> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let rows = {
                let sql = format!(
                    "SELECT {} FROM failed_events WHERE state = 'retrying'
                     ORDER BY sequence_number",
                    EVENT_COLUMNS
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_raw)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut recovered = Vec::with_capacity(rows.len());
            for mut event in collect_events(rows)? {
                event.interrupt(now)?;
                write_back(&tx, &event)?;
                recovered.push(event.id());
            }

            tx.commit()?;
            Ok(recovered)
        })
        .await
    }
}
