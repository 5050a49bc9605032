use async_trait::async_trait;
use event_schema::room::WatchRoomEvent;
use idempotent_consumer::{ClaimOutcome, IdempotencyGuard};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tracing::debug;
use transactional_outbox::SqlxOutboxRepository;
use uuid::Uuid;

use super::{outbox_event, Profile, Session, SessionStrategy, Store, StoreError};
use crate::domain::{
    Message, Room, RoomFilter, RoomPredicate, RoomRecord, ViewerRecord, ViewerSettings,
};

const ROOM_COLUMNS: &str =
    "id, film_id, is_serial, owner_id, code, created_at, viewers, banned_ids";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    inbox: IdempotencyGuard,
}

impl PgStore {
    pub fn new(pool: PgPool, dedup_window: Duration) -> Self {
        Self {
            inbox: IdempotencyGuard::new(pool.clone(), dedup_window),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self, strategy: SessionStrategy) -> Result<Box<dyn Session>, StoreError> {
        let conn = match &strategy {
            SessionStrategy::Default => Conn::Plain(self.pool.acquire().await?),
            SessionStrategy::Transaction | SessionStrategy::Outbox => {
                Conn::Tx(self.pool.begin().await?)
            }
            SessionStrategy::Inbox { event_id } => {
                let mut tx = self.pool.begin().await?;
                if IdempotencyGuard::claim(&mut tx, event_id, None).await?
                    == ClaimOutcome::Duplicate
                {
                    return Err(StoreError::AlreadyConsumed(event_id.clone()));
                }
                Conn::Tx(tx)
            }
        };

        Ok(Box::new(PgSession { conn, strategy }))
    }

    async fn purge_expired_claims(&self) -> Result<u64, StoreError> {
        Ok(self.inbox.cleanup_old_events().await?)
    }
}

enum Conn {
    Plain(PoolConnection<Postgres>),
    Tx(Transaction<'static, Postgres>),
}

impl Conn {
    fn executor(&mut self) -> &mut PgConnection {
        match self {
            Conn::Plain(conn) => &mut **conn,
            Conn::Tx(tx) => &mut **tx,
        }
    }
}

struct PgSession {
    conn: Conn,
    strategy: SessionStrategy,
}

fn room_from_row(row: &PgRow) -> Result<Room, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let viewers: serde_json::Value = row.try_get("viewers")?;
    let viewers: Vec<ViewerRecord> = serde_json::from_value(viewers)?;

    let record = RoomRecord {
        id,
        film_id: row.try_get("film_id")?,
        is_serial: row.try_get("is_serial")?,
        owner_id: row.try_get("owner_id")?,
        code: row.try_get("code")?,
        created_at: row.try_get("created_at")?,
        viewers,
        banned_ids: row.try_get("banned_ids")?,
    };
    Room::restore(record).map_err(|e| StoreError::corrupted(id, e))
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        user_id: row.try_get("user_id")?,
        text: row.try_get("text")?,
        sent_at: row.try_get("sent_at")?,
    })
}

/// Compile a filter into a boolean SQL expression over the `rooms` table.
pub(crate) fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RoomFilter) {
    match filter {
        RoomFilter::And(parts) | RoomFilter::Or(parts) if parts.is_empty() => {
            qb.push(if matches!(filter, RoomFilter::And(_)) {
                "TRUE"
            } else {
                "FALSE"
            });
        }
        RoomFilter::And(parts) | RoomFilter::Or(parts) => {
            let joiner = if matches!(filter, RoomFilter::And(_)) {
                " AND "
            } else {
                " OR "
            };
            qb.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_filter(qb, part);
            }
            qb.push(")");
        }
        RoomFilter::Not(inner) => {
            qb.push("NOT (");
            push_filter(qb, inner);
            qb.push(")");
        }
        RoomFilter::Leaf(RoomPredicate::HasViewer(id)) => {
            qb.push_bind(*id).push(" = ANY(viewer_ids)");
        }
        RoomFilter::Leaf(RoomPredicate::OwnedBy(id)) => {
            qb.push("owner_id = ").push_bind(*id);
        }
        RoomFilter::Leaf(RoomPredicate::ForFilm(id)) => {
            qb.push("film_id = ").push_bind(*id);
        }
        RoomFilter::Leaf(RoomPredicate::IsClosed) => {
            qb.push("code IS NOT NULL");
        }
    }
}

#[async_trait]
impl Session for PgSession {
    fn strategy(&self) -> &SessionStrategy {
        &self.strategy
    }

    async fn load_room(&mut self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM rooms WHERE id = $1", ROOM_COLUMNS))
            .bind(room_id)
            .fetch_optional(self.conn.executor())
            .await?;

        row.as_ref().map(room_from_row).transpose()
    }

    async fn find_rooms(&mut self, filter: &RoomFilter) -> Result<Vec<Room>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM rooms WHERE ", ROOM_COLUMNS));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at, id");

        let rows = qb.build().fetch_all(self.conn.executor()).await?;
        rows.iter().map(room_from_row).collect()
    }

    async fn save_room(&mut self, room: &Room) -> Result<(), StoreError> {
        let record = room.to_record();
        let viewer_ids: Vec<Uuid> = record.viewers.iter().map(|v| v.id).collect();
        let viewers = serde_json::to_value(&record.viewers)?;

        sqlx::query(
            r#"
            INSERT INTO rooms (id, film_id, is_serial, owner_id, code, created_at, viewers, viewer_ids, banned_ids, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (id) DO UPDATE SET
                viewers = EXCLUDED.viewers,
                viewer_ids = EXCLUDED.viewer_ids,
                banned_ids = EXCLUDED.banned_ids,
                updated_at = NOW()
            "#,
        )
        .bind(record.id)
        .bind(record.film_id)
        .bind(record.is_serial)
        .bind(record.owner_id)
        .bind(&record.code)
        .bind(record.created_at)
        .bind(viewers)
        .bind(&viewer_ids)
        .bind(&record.banned_ids)
        .execute(self.conn.executor())
        .await?;

        debug!(room_id = %record.id, viewers = viewer_ids.len(), "Room saved");
        Ok(())
    }

    async fn delete_room(&mut self, room_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE room_id = $1")
            .bind(room_id)
            .execute(self.conn.executor())
            .await?;
        sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(self.conn.executor())
            .await?;
        Ok(())
    }

    async fn add_message(&mut self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (id, room_id, user_id, text, sent_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(message.id)
        .bind(message.room_id)
        .bind(message.user_id)
        .bind(&message.text)
        .bind(message.sent_at)
        .execute(self.conn.executor())
        .await?;
        Ok(())
    }

    async fn messages_before(
        &mut self,
        room_id: Uuid,
        from: Option<Uuid>,
        count: usize,
    ) -> Result<Vec<Message>, StoreError> {
        // An unknown cursor makes the row comparison NULL, so nothing matches.
        let rows = sqlx::query(
            r#"
            SELECT id, room_id, user_id, text, sent_at
            FROM messages
            WHERE room_id = $1
              AND (
                $2::uuid IS NULL
                OR (sent_at, id) < (SELECT sent_at, id FROM messages WHERE id = $2 AND room_id = $1)
              )
            ORDER BY sent_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(room_id)
        .bind(from)
        .bind(count as i64)
        .fetch_all(self.conn.executor())
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn load_profile(&mut self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, user_name, photo_key, allow_beep, allow_scream, updated_at FROM profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.conn.executor())
        .await?;

        row.map(|row| {
            Ok(Profile {
                user_id: row.try_get("user_id")?,
                user_name: row.try_get("user_name")?,
                photo_key: row.try_get("photo_key")?,
                settings: ViewerSettings {
                    allow_beep: row.try_get("allow_beep")?,
                    allow_scream: row.try_get("allow_scream")?,
                },
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn save_profile(&mut self, profile: &Profile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, user_name, photo_key, allow_beep, allow_scream, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET
                user_name = EXCLUDED.user_name,
                photo_key = EXCLUDED.photo_key,
                allow_beep = EXCLUDED.allow_beep,
                allow_scream = EXCLUDED.allow_scream,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(profile.user_id)
        .bind(&profile.user_name)
        .bind(&profile.photo_key)
        .bind(profile.settings.allow_beep)
        .bind(profile.settings.allow_scream)
        .bind(profile.updated_at)
        .execute(self.conn.executor())
        .await?;
        Ok(())
    }

    async fn record_event(&mut self, event: WatchRoomEvent) -> Result<(), StoreError> {
        if !self.strategy.accepts_events() {
            return Err(StoreError::EventsNotSupported(self.strategy.name()));
        }
        let row = outbox_event(&event)?;
        SqlxOutboxRepository::insert(self.conn.executor(), &row).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        match self.conn {
            Conn::Tx(tx) => tx.commit().await?,
            Conn::Plain(_) => {}
        }
        Ok(())
    }
}
