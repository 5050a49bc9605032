use uuid::Uuid;

use super::{Caller, RoomService};
use crate::domain::{validate_page_size, Message, RoomError, STAT_MESSAGES};
use crate::error::AppResult;
use crate::hub::events::Event;
use crate::store::SessionStrategy;

impl RoomService {
    /// Page of messages strictly older than `from_id`, newest first, pushed to the caller.
    pub async fn get_messages(
        &self,
        caller: &Caller,
        room_id: Uuid,
        from_id: Option<Uuid>,
        count: u32,
    ) -> AppResult<Vec<Message>> {
        let count = validate_page_size(count)?;

        let mut session = self.store.begin(SessionStrategy::Default).await?;
        let room = session
            .load_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound)?;
        if !room.contains(caller.user_id) {
            return Err(RoomError::ViewerNotFound.into());
        }
        let messages = session.messages_before(room_id, from_id, count).await?;
        session.commit().await?;

        self.reply(
            caller,
            &Event::MessagesEvent {
                messages: messages.clone(),
            },
        )
        .await;
        Ok(messages)
    }

    /// Persist a chat message and the sender's counter in one transaction.
    pub async fn send_message(&self, caller: &Caller, room_id: Uuid, text: &str) -> AppResult<Message> {
        let message = Message::new(room_id, caller.user_id, text)?;

        let patch = {
            let _guard = self.locks.lock(room_id).await;
            let mut session = self.store.begin(SessionStrategy::Transaction).await?;
            let mut room = session
                .load_room(room_id)
                .await?
                .ok_or(RoomError::RoomNotFound)?;

            let sender = room.viewer_mut(caller.user_id)?;
            sender.increment_statistic(STAT_MESSAGES);
            let patch = sender.take_patch();

            session.add_message(&message).await?;
            session.save_room(&room).await?;
            session.commit().await?;
            patch
        };

        self.registry
            .broadcast(
                room_id,
                &Event::MessageEvent {
                    message: message.clone(),
                },
                None,
            )
            .await;
        self.registry
            .broadcast(
                room_id,
                &Event::ChangeEvent {
                    viewer_id: caller.user_id,
                    patch,
                },
                None,
            )
            .await;

        tracing::debug!(room_id = %room_id, viewer_id = %caller.user_id, message_id = %message.id, "Message sent");
        Ok(message)
    }

    /// Typing signal. Not persisted.
    pub async fn typing(&self, caller: &Caller, room_id: Uuid) -> AppResult<()> {
        self.registry
            .broadcast(
                room_id,
                &Event::TypeEvent {
                    initiator: caller.user_id,
                },
                caller.connection_id,
            )
            .await;
        Ok(())
    }
}
