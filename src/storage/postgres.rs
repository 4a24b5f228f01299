//! PostgreSQL implementation of the storage gateway.
//!
//! Pooled connections serve the typed gateway operations; two kinds of dedicated
//! sessions are opened on demand: one `PgConnection` per node for session-scoped
//! advisory locks, and one `PgListener` for the append-notification channel.
//! Appends are serialized per stream by locking the stream row inside the append
//! transaction, and the notification is emitted with `pg_notify` in that same
//! transaction so it becomes visible exactly when the commit does.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool, Row};

use crate::error::{Error, Result};
use crate::notifications::{AppendNotification, NOTIFICATION_CHANNEL, NotificationSource};
use crate::storage::{LockSession, Storage, SubscriptionRow, validate_events};
use crate::types::{ALL_STREAM, ExpectedVersion, ProposedEvent, RecordedEvent, StartFrom};

/// Schema statements, applied in order by [`PostgresStorage::initialize`].
///
/// Every statement is idempotent (`IF NOT EXISTS`), so re-running initialization
/// against a live database is safe.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS streams (
        id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        stream_id text NOT NULL UNIQUE,
        created_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS events (
        event_id uuid PRIMARY KEY,
        event_number bigint GENERATED ALWAYS AS IDENTITY UNIQUE,
        stream_id bigint NOT NULL REFERENCES streams (id),
        stream_version bigint NOT NULL,
        event_type text NOT NULL,
        data bytea NOT NULL,
        metadata bytea,
        created_at timestamptz NOT NULL DEFAULT now(),
        UNIQUE (stream_id, stream_version)
    )",
    "CREATE TABLE IF NOT EXISTS subscriptions (
        id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        stream_uuid text NOT NULL,
        subscription_name text NOT NULL,
        last_seen bigint,
        created_at timestamptz NOT NULL DEFAULT now(),
        UNIQUE (stream_uuid, subscription_name)
    )",
    "CREATE TABLE IF NOT EXISTS snapshots (
        source_uuid text PRIMARY KEY,
        source_version bigint NOT NULL,
        source_type text NOT NULL,
        data bytea NOT NULL,
        metadata bytea,
        created_at timestamptz NOT NULL DEFAULT now()
    )",
];

/// Columns selected for every event read, joined with the owning stream's
/// identifier.
const EVENT_COLUMNS: &str = "e.event_id, e.event_number, s.stream_id AS stream_id, \
     e.stream_version, e.event_type, e.data, e.metadata, e.created_at";

/// Format the notification payload for an append covering the contiguous version
/// range `from..=to` of `stream_id`.
fn notification_payload(stream_id: &str, from: i64, to: i64) -> String {
    format!("{stream_id},{from},{to}")
}

/// PostgreSQL-backed [`Storage`].
///
/// Cloning shares the underlying pool. The connection URL is retained so that the
/// dedicated sessions can be opened outside the pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    url: String,
}

impl PostgresStorage {
    /// Connect a pool to the given database URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the pool cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    /// Wrap an existing pool. The URL is still required for the dedicated
    /// sessions.
    pub fn from_pool(pool: PgPool, url: &str) -> Self {
        Self {
            pool,
            url: url.to_string(),
        }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Resolve the position a new subscription starts behind, i.e. the value
    /// stored as its initial checkpoint.
    async fn resolve_start(&self, stream_id: &str, start_from: StartFrom) -> Result<i64> {
        match start_from {
            StartFrom::Origin => Ok(0),
            StartFrom::Exact(position) => Ok((position - 1).max(0)),
            StartFrom::Current if stream_id == ALL_STREAM => {
                let head: i64 =
                    sqlx::query_scalar("SELECT COALESCE(MAX(event_number), 0) FROM events")
                        .fetch_one(&self.pool)
                        .await?;
                Ok(head)
            }
            StartFrom::Current => {
                let head: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(e.stream_version), 0) FROM events e \
                     JOIN streams s ON s.id = e.stream_id WHERE s.stream_id = $1",
                )
                .bind(stream_id)
                .fetch_one(&self.pool)
                .await?;
                Ok(head)
            }
        }
    }
}

/// Map a database row to a [`RecordedEvent`].
fn row_to_event(row: &sqlx::postgres::PgRow) -> RecordedEvent {
    let data: Vec<u8> = row.get("data");
    let metadata: Option<Vec<u8>> = row.get("metadata");
    RecordedEvent {
        event_id: row.get("event_id"),
        event_number: row.get("event_number"),
        stream_id: row.get("stream_id"),
        stream_version: row.get("stream_version"),
        event_type: row.get("event_type"),
        metadata: metadata.map(bytes::Bytes::from).unwrap_or_default(),
        payload: bytes::Bytes::from(data),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn initialize(&self) -> Result<bool> {
        let existed: bool =
            sqlx::query_scalar("SELECT to_regclass('public.events') IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(!existed)
    }

    async fn create_stream(&self, stream_id: &str) -> Result<i64> {
        if stream_id.is_empty() || stream_id == ALL_STREAM {
            return Err(Error::InvalidArgument(format!(
                "cannot create stream {stream_id:?}"
            )));
        }

        let result = sqlx::query_scalar::<_, i64>(
            "INSERT INTO streams (stream_id) VALUES ($1) RETURNING id",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(Error::StreamExists {
                    stream_id: stream_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append_events(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>> {
        if stream_id.is_empty() || stream_id == ALL_STREAM {
            return Err(Error::InvalidArgument(format!(
                "cannot append to stream {stream_id:?}"
            )));
        }
        if events.is_empty() {
            return Err(Error::InvalidArgument("no events to append".into()));
        }
        validate_events(&events)?;

        let mut tx = self.pool.begin().await?;

        // Lock the stream row so concurrent appends to the same stream serialize
        // and version assignment stays contiguous.
        let stream_row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM streams WHERE stream_id = $1 FOR UPDATE")
                .bind(stream_id)
                .fetch_optional(&mut *tx)
                .await?;

        let current: i64 = match stream_row {
            Some((id,)) => {
                sqlx::query_scalar(
                    "SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_id = $1",
                )
                .bind(id)
                .fetch_one(&mut *tx)
                .await?
            }
            None => 0,
        };

        match expected_version {
            ExpectedVersion::Any => {}
            ExpectedVersion::NoStream if stream_row.is_some() => {
                return Err(Error::WrongExpectedVersion {
                    stream_id: stream_id.to_string(),
                    expected: "no stream".into(),
                    actual: current.to_string(),
                });
            }
            ExpectedVersion::NoStream => {}
            ExpectedVersion::Exact(_) if stream_row.is_none() => {
                return Err(Error::StreamNotFound {
                    stream_id: stream_id.to_string(),
                });
            }
            ExpectedVersion::Exact(expected) if expected != current => {
                return Err(Error::WrongExpectedVersion {
                    stream_id: stream_id.to_string(),
                    expected: expected.to_string(),
                    actual: current.to_string(),
                });
            }
            ExpectedVersion::Exact(_) => {}
        }

        let internal_id: i64 = match stream_row {
            Some((id,)) => id,
            None => {
                sqlx::query_scalar("INSERT INTO streams (stream_id) VALUES ($1) RETURNING id")
                    .bind(stream_id)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };

        let mut recorded = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let version = current + 1 + offset as i64;
            let row = sqlx::query(
                "INSERT INTO events (event_id, stream_id, stream_version, event_type, data, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING event_number, created_at",
            )
            .bind(event.event_id)
            .bind(internal_id)
            .bind(version)
            .bind(&event.event_type)
            .bind(&event.payload[..])
            .bind(&event.metadata[..])
            .fetch_one(&mut *tx)
            .await?;

            recorded.push(RecordedEvent {
                event_id: event.event_id,
                event_number: row.get("event_number"),
                stream_id: stream_id.to_string(),
                stream_version: version,
                event_type: event.event_type.clone(),
                metadata: event.metadata.clone(),
                payload: event.payload.clone(),
                created_at: row.get("created_at"),
            });
        }

        // The notification fires when the transaction commits, carrying the
        // contiguous version range this append covers.
        let payload =
            notification_payload(stream_id, current + 1, current + recorded.len() as i64);
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFICATION_CHANNEL)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(recorded)
    }

    async fn read_stream_forward(
        &self,
        stream_id: &str,
        from: i64,
        max_count: i64,
    ) -> Result<Vec<RecordedEvent>> {
        let rows = if stream_id == ALL_STREAM {
            sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events e JOIN streams s ON s.id = e.stream_id \
                 WHERE e.event_number >= $1 ORDER BY e.event_number ASC LIMIT $2"
            ))
            .bind(from)
            .bind(max_count)
            .fetch_all(&self.pool)
            .await?
        } else {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM streams WHERE stream_id = $1")
                    .bind(stream_id)
                    .fetch_optional(&self.pool)
                    .await?;
            let Some((internal_id,)) = exists else {
                return Err(Error::StreamNotFound {
                    stream_id: stream_id.to_string(),
                });
            };

            sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events e JOIN streams s ON s.id = e.stream_id \
                 WHERE e.stream_id = $1 AND e.stream_version >= $2 \
                 ORDER BY e.stream_version ASC LIMIT $3"
            ))
            .bind(internal_id)
            .bind(from)
            .bind(max_count)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.iter().map(row_to_event).collect())
    }

    async fn subscribe_to_stream(
        &self,
        stream_id: &str,
        subscription_name: &str,
        start_from: StartFrom,
    ) -> Result<SubscriptionRow> {
        let start = self.resolve_start(stream_id, start_from).await?;

        // Concurrent creations collapse onto the same row: the loser of the insert
        // race simply reads what the winner wrote.
        sqlx::query(
            "INSERT INTO subscriptions (stream_uuid, subscription_name, last_seen) \
             VALUES ($1, $2, $3) ON CONFLICT (stream_uuid, subscription_name) DO NOTHING",
        )
        .bind(stream_id)
        .bind(subscription_name)
        .bind(start)
        .execute(&self.pool)
        .await?;

        let (subscription_id, last_seen): (i64, Option<i64>) = sqlx::query_as(
            "SELECT id, last_seen FROM subscriptions \
             WHERE stream_uuid = $1 AND subscription_name = $2",
        )
        .bind(stream_id)
        .bind(subscription_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(SubscriptionRow {
            subscription_id,
            last_seen: last_seen.unwrap_or(0),
        })
    }

    async fn ack_last_seen_event(
        &self,
        stream_id: &str,
        subscription_name: &str,
        last_seen: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET last_seen = $3 \
             WHERE stream_uuid = $1 AND subscription_name = $2 \
             AND COALESCE(last_seen, 0) <= $3",
        )
        .bind(stream_id)
        .bind(subscription_name)
        .bind(last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_subscription(&self, stream_id: &str, subscription_name: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM subscriptions WHERE stream_uuid = $1 AND subscription_name = $2",
        )
        .bind(stream_id)
        .bind(subscription_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lock_session(&self) -> Result<Box<dyn LockSession>> {
        let conn = PgConnection::connect(&self.url).await?;
        Ok(Box::new(PgLockSession { conn }))
    }

    async fn notification_source(&self) -> Result<Box<dyn NotificationSource>> {
        let mut listener = PgListener::connect(&self.url).await?;
        listener.listen(NOTIFICATION_CHANNEL).await?;
        Ok(Box::new(PgNotificationSource { listener }))
    }
}

/// Advisory-lock session over one dedicated `PgConnection`.
struct PgLockSession {
    conn: PgConnection,
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_lock(&mut self, key: i64) -> Result<bool> {
        let taken: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(taken)
    }

    async fn unlock(&mut self, key: i64) -> Result<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(released)
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await?;
        Ok(())
    }
}

/// Append-notification source over one dedicated `PgListener` session.
struct PgNotificationSource {
    listener: PgListener,
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn recv(&mut self) -> Result<AppendNotification> {
        loop {
            let notification = self.listener.recv().await?;
            match notification.payload().parse::<AppendNotification>() {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    // A malformed payload is a bug in the emitter, not a reason to
                    // tear the listener down; subscriptions recover via catch-up.
                    tracing::warn!(error = %e, payload = notification.payload(), "dropping unparseable notification");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use uuid::Uuid;

    #[test]
    fn notification_payload_format() {
        assert_eq!(notification_payload("orders-1", 3, 5), "orders-1,3,5");
        assert_eq!(notification_payload("$all", 1, 1), "$all,1,1");
    }

    #[test]
    fn schema_covers_required_tables() {
        let ddl = SCHEMA.join("\n");
        for table in ["streams", "events", "subscriptions", "snapshots"] {
            assert!(
                ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "schema should create table {table}"
            );
        }
    }

    #[test]
    fn validate_events_rejects_oversized_payload() {
        use crate::types::MAX_EVENT_SIZE;

        let event = ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: "Big".to_string(),
            metadata: Bytes::new(),
            payload: Bytes::from(vec![0u8; MAX_EVENT_SIZE + 1]),
        };
        let result = validate_events(std::slice::from_ref(&event));
        assert!(matches!(result, Err(Error::EventTooLarge { .. })));
    }

    #[test]
    fn validate_events_rejects_long_event_type() {
        use crate::types::MAX_EVENT_TYPE_LEN;

        let event = ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: "x".repeat(MAX_EVENT_TYPE_LEN + 1),
            metadata: Bytes::new(),
            payload: Bytes::new(),
        };
        let result = validate_events(std::slice::from_ref(&event));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn validate_events_accepts_reasonable_event() {
        let event = ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: "OrderPlaced".to_string(),
            metadata: Bytes::from_static(b"{}"),
            payload: Bytes::from_static(b"{\"qty\":1}"),
        };
        assert!(validate_events(std::slice::from_ref(&event)).is_ok());
    }
}
