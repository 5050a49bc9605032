//! In-process store used when no database is configured, and by the tests.
//!
//! Transactional sessions stage their writes and apply them under one lock at
//! commit time; reads inside the session see the staged writes first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_schema::room::WatchRoomEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use transactional_outbox::{OutboxError, OutboxEvent, OutboxRepository, OutboxResult};
use uuid::Uuid;

use super::{outbox_event, Profile, Session, SessionStrategy, Store, StoreError};
use crate::domain::{Message, Room, RoomFilter, RoomRecord};

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<Uuid, RoomRecord>,
    messages: HashMap<Uuid, Vec<Message>>,
    profiles: HashMap<Uuid, Profile>,
    outbox: Vec<OutboxEvent>,
    inbox: HashMap<String, DateTime<Utc>>,
}

impl MemoryState {
    fn apply(&mut self, op: Op) {
        match op {
            Op::SaveRoom(record) => {
                self.rooms.insert(record.id, record);
            }
            Op::DeleteRoom(room_id) => {
                self.rooms.remove(&room_id);
                self.messages.remove(&room_id);
            }
            Op::AddMessage(message) => {
                self.messages
                    .entry(message.room_id)
                    .or_default()
                    .push(message);
            }
            Op::SaveProfile(profile) => {
                self.profiles.insert(profile.user_id, profile);
            }
            Op::Publish(event) => self.outbox.push(event),
        }
    }
}

enum Op {
    SaveRoom(RoomRecord),
    DeleteRoom(Uuid),
    AddMessage(Message),
    SaveProfile(Profile),
    Publish(OutboxEvent),
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    dedup_window: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(idempotent_consumer::DEFAULT_RETENTION)
    }
}

impl MemoryStore {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            dedup_window,
        }
    }

    /// All outbox rows, published or not.
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    pub async fn is_consumed(&self, event_id: &str) -> bool {
        self.state.lock().await.inbox.contains_key(event_id)
    }

    fn cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(self.dedup_window)
                .unwrap_or_else(|_| chrono::Duration::days(2))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, strategy: SessionStrategy) -> Result<Box<dyn Session>, StoreError> {
        if let SessionStrategy::Inbox { event_id } = &strategy {
            idempotent_consumer::validate_event_id(event_id)?;
            if self.state.lock().await.inbox.contains_key(event_id) {
                return Err(StoreError::AlreadyConsumed(event_id.clone()));
            }
        }

        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            strategy,
            staged: Vec::new(),
        }))
    }

    async fn purge_expired_claims(&self) -> Result<u64, StoreError> {
        let cutoff = self.cutoff();
        let mut state = self.state.lock().await;
        let before = state.inbox.len();
        state.inbox.retain(|_, claimed_at| *claimed_at >= cutoff);
        Ok((before - state.inbox.len()) as u64)
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    strategy: SessionStrategy,
    staged: Vec<Op>,
}

impl MemorySession {
    async fn write(&mut self, op: Op) {
        if self.strategy.is_transactional() {
            self.staged.push(op);
        } else {
            self.state.lock().await.apply(op);
        }
    }

    fn restore(record: RoomRecord) -> Result<Room, StoreError> {
        let room_id = record.id;
        Room::restore(record).map_err(|e| StoreError::corrupted(room_id, e))
    }
}

#[async_trait]
impl Session for MemorySession {
    fn strategy(&self) -> &SessionStrategy {
        &self.strategy
    }

    async fn load_room(&mut self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        for op in self.staged.iter().rev() {
            match op {
                Op::SaveRoom(record) if record.id == room_id => {
                    return Self::restore(record.clone()).map(Some)
                }
                Op::DeleteRoom(id) if *id == room_id => return Ok(None),
                _ => {}
            }
        }

        let record = self.state.lock().await.rooms.get(&room_id).cloned();
        record.map(Self::restore).transpose()
    }

    async fn find_rooms(&mut self, filter: &RoomFilter) -> Result<Vec<Room>, StoreError> {
        let mut records = self.state.lock().await.rooms.clone();
        for op in &self.staged {
            match op {
                Op::SaveRoom(record) => {
                    records.insert(record.id, record.clone());
                }
                Op::DeleteRoom(id) => {
                    records.remove(id);
                }
                _ => {}
            }
        }

        let mut rooms = Vec::new();
        for record in records.into_values() {
            let room = Self::restore(record)?;
            if filter.matches(&room) {
                rooms.push(room);
            }
        }
        rooms.sort_by_key(|r| (r.created_at(), r.id()));
        Ok(rooms)
    }

    async fn save_room(&mut self, room: &Room) -> Result<(), StoreError> {
        self.write(Op::SaveRoom(room.to_record())).await;
        Ok(())
    }

    async fn delete_room(&mut self, room_id: Uuid) -> Result<(), StoreError> {
        self.write(Op::DeleteRoom(room_id)).await;
        Ok(())
    }

    async fn add_message(&mut self, message: &Message) -> Result<(), StoreError> {
        self.write(Op::AddMessage(message.clone())).await;
        Ok(())
    }

    async fn messages_before(
        &mut self,
        room_id: Uuid,
        from: Option<Uuid>,
        count: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut messages = self
            .state
            .lock()
            .await
            .messages
            .get(&room_id)
            .cloned()
            .unwrap_or_default();
        messages.extend(self.staged.iter().filter_map(|op| match op {
            Op::AddMessage(m) if m.room_id == room_id => Some(m.clone()),
            _ => None,
        }));
        messages.sort_by_key(|m| std::cmp::Reverse(m.cursor_key()));

        let anchor = match from {
            Some(id) => match messages.iter().find(|m| m.id == id) {
                Some(m) => Some(m.cursor_key()),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        Ok(messages
            .into_iter()
            .filter(|m| anchor.map_or(true, |a| m.cursor_key() < a))
            .take(count)
            .collect())
    }

    async fn load_profile(&mut self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        for op in self.staged.iter().rev() {
            if let Op::SaveProfile(p) = op {
                if p.user_id == user_id {
                    return Ok(Some(p.clone()));
                }
            }
        }
        Ok(self.state.lock().await.profiles.get(&user_id).cloned())
    }

    async fn save_profile(&mut self, profile: &Profile) -> Result<(), StoreError> {
        self.write(Op::SaveProfile(profile.clone())).await;
        Ok(())
    }

    async fn record_event(&mut self, event: WatchRoomEvent) -> Result<(), StoreError> {
        if !self.strategy.accepts_events() {
            return Err(StoreError::EventsNotSupported(self.strategy.name()));
        }
        let row = outbox_event(&event)?;
        self.staged.push(Op::Publish(row));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemorySession {
            state,
            strategy,
            staged,
        } = *self;

        let mut state = state.lock().await;
        if let SessionStrategy::Inbox { event_id } = &strategy {
            if state.inbox.contains_key(event_id) {
                return Err(StoreError::AlreadyConsumed(event_id.clone()));
            }
            state.inbox.insert(event_id.clone(), Utc::now());
        }

        let count = staged.len();
        for op in staged {
            state.apply(op);
        }
        debug!(strategy = %strategy, ops = count, "Memory session committed");
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for MemoryStore {
    async fn get_unpublished(&self, limit: i32) -> OutboxResult<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.published_at.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
        let mut state = self.state.lock().await;
        let event = state
            .outbox
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or(OutboxError::EventNotFound(event_id))?;
        event.published_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<()> {
        let mut state = self.state.lock().await;
        let event = state
            .outbox
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or(OutboxError::EventNotFound(event_id))?;
        event.retry_count += 1;
        event.last_error = Some(error.to_string());
        event.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let state = self.state.lock().await;
        let pending: Vec<_> = state
            .outbox
            .iter()
            .filter(|e| e.published_at.is_none())
            .collect();
        let age = pending
            .iter()
            .map(|e| e.created_at)
            .min()
            .map(|oldest| (Utc::now() - oldest).num_seconds())
            .unwrap_or(0);
        Ok((pending.len() as i64, age))
    }

    async fn purge_published(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        let mut state = self.state.lock().await;
        let len = state.outbox.len();
        state
            .outbox
            .retain(|e| e.published_at.map_or(true, |at| at >= before));
        Ok((len - state.outbox.len()) as u64)
    }
}
