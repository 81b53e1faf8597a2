//! The Store: the only component that may issue writes to the relational
//! database (spec §4.1). Methods are plain `async fn`s on [`Store`] rather
//! than trait methods — there is exactly one relational backend, unlike the
//! Delivery Log and Connection Fabric ports which are genuinely pluggable.

use std::time::Duration;

use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    ConversationSummary, DeliveryRecord, EditHistoryEntry, Message, Participant, Reaction,
};

#[derive(Clone)]
pub struct Store {
    write_pool: PgPool,
    read_pool: PgPool,
    has_replica: bool,
}

impl Store {
    pub async fn connect(
        database_url: &str,
        replica_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        let write_pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        let has_replica = replica_url.is_some();
        let read_pool = match replica_url {
            Some(url) => {
                PgPoolOptions::new()
                    .max_connections(20)
                    .min_connections(2)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(url)
                    .await?
            }
            None => write_pool.clone(),
        };

        Ok(Self {
            write_pool,
            read_pool,
            has_replica,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            write_pool: pool.clone(),
            read_pool: pool,
            has_replica: false,
        }
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.write_pool).await.is_ok()
    }

    /// Seconds of replication lag on the read pool, or `None` when no
    /// replica is configured.
    pub async fn replica_lag_secs(&self) -> Option<f64> {
        if !self.has_replica {
            return None;
        }
        sqlx::query_scalar::<_, Option<f64>>(
            "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))",
        )
        .fetch_one(&self.read_pool)
        .await
        .ok()
        .flatten()
    }

    // -------------------------------------------------------------------
    // Conversations & participants
    // -------------------------------------------------------------------

    pub async fn create_direct_conversation(
        &self,
        a: Uuid,
        b: Uuid,
    ) -> CoreResult<crate::models::Conversation> {
        if let Some(existing) = self.find_direct_conversation(a, b).await? {
            return Ok(existing);
        }

        let mut tx = self.write_pool.begin().await.map_err(db_unavailable)?;
        let convo = sqlx::query_as::<_, crate::models::Conversation>(
            r#"
            INSERT INTO conversations (kind, created_at, last_message_at)
            VALUES ('direct', now(), now())
            RETURNING id, kind, name, slug, owner_id, created_at, last_message_at, deleted_at
            "#,
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(db_unavailable)?;

        for user_id in [a, b] {
            sqlx::query(
                "INSERT INTO participants (conversation_id, user_id, role) VALUES ($1, $2, 'member')",
            )
            .bind(convo.id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;
        }

        tx.commit().await.map_err(db_unavailable)?;
        Ok(convo)
    }

    pub async fn create_group_conversation(
        &self,
        owner: Uuid,
        name: String,
        member_ids: &[Uuid],
    ) -> CoreResult<crate::models::Conversation> {
        if member_ids.len() + 1 > crate::models::MAX_GROUP_PARTICIPANTS {
            return Err(CoreError::InvalidInput(format!(
                "group conversations are limited to {} participants",
                crate::models::MAX_GROUP_PARTICIPANTS
            )));
        }

        let mut tx = self.write_pool.begin().await.map_err(db_unavailable)?;
        let convo = sqlx::query_as::<_, crate::models::Conversation>(
            r#"
            INSERT INTO conversations (kind, name, owner_id, created_at, last_message_at)
            VALUES ('group', $1, $2, now(), now())
            RETURNING id, kind, name, slug, owner_id, created_at, last_message_at, deleted_at
            "#,
        )
        .bind(&name)
        .bind(owner)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_unavailable)?;

        sqlx::query("INSERT INTO participants (conversation_id, user_id, role) VALUES ($1, $2, 'owner')")
            .bind(convo.id)
            .bind(owner)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;

        for member_id in member_ids {
            sqlx::query(
                "INSERT INTO participants (conversation_id, user_id, role) VALUES ($1, $2, 'member')",
            )
            .bind(convo.id)
            .bind(member_id)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;
        }

        tx.commit().await.map_err(db_unavailable)?;
        Ok(convo)
    }

    pub async fn find_direct_conversation(
        &self,
        a: Uuid,
        b: Uuid,
    ) -> CoreResult<Option<crate::models::Conversation>> {
        sqlx::query_as::<_, crate::models::Conversation>(
            r#"
            SELECT c.id, c.kind, c.name, c.slug, c.owner_id, c.created_at, c.last_message_at, c.deleted_at
            FROM conversations c
            WHERE c.kind = 'direct' AND c.deleted_at IS NULL
              AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = $1 AND p.left_at IS NULL)
              AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = $2 AND p.left_at IS NULL)
            LIMIT 1
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn get_conversation(
        &self,
        convo_id: Uuid,
    ) -> CoreResult<Option<crate::models::Conversation>> {
        sqlx::query_as::<_, crate::models::Conversation>(
            "SELECT id, kind, name, slug, owner_id, created_at, last_message_at, deleted_at FROM conversations WHERE id = $1",
        )
        .bind(convo_id)
        .fetch_optional(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn is_member(&self, convo_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM participants WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(convo_id)
        .bind(user_id)
        .fetch_optional(&self.read_pool)
        .await
        .map_err(db_unavailable)?;
        Ok(row.is_some())
    }

    pub async fn count_active_participants(&self, convo_id: Uuid) -> CoreResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM participants WHERE conversation_id = $1 AND left_at IS NULL",
        )
        .bind(convo_id)
        .fetch_one(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn list_active_participant_ids(&self, convo_id: Uuid) -> CoreResult<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT user_id FROM participants WHERE conversation_id = $1 AND left_at IS NULL",
        )
        .bind(convo_id)
        .fetch_all(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn get_membership(
        &self,
        convo_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<Option<Participant>> {
        sqlx::query_as::<_, Participant>(
            "SELECT conversation_id, user_id, role, joined_at, left_at, last_read_message_id, unread_count FROM participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(convo_id)
        .bind(user_id)
        .fetch_optional(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn mark_left(&self, convo_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE participants SET left_at = now() WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL")
            .bind(convo_id)
            .bind(user_id)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    pub async fn get_user_conversations(&self, user_id: Uuid) -> CoreResult<Vec<ConversationSummary>> {
        let rows = sqlx::query_as::<_, ConversationSummaryRow>(
            r#"
            SELECT c.id, c.kind, c.name, c.slug, c.owner_id, c.created_at, c.last_message_at, c.deleted_at,
                   p.unread_count,
                   (SELECT m.body FROM messages m WHERE m.conversation_id = c.id ORDER BY m.created_at DESC, m.id DESC LIMIT 1) AS last_message_body
            FROM conversations c
            INNER JOIN participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1 AND p.left_at IS NULL AND c.deleted_at IS NULL
            ORDER BY c.last_message_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.read_pool)
        .await
        .map_err(db_unavailable)?;

        Ok(rows.into_iter().map(ConversationSummaryRow::into_summary).collect())
    }

    pub async fn reset_unread(&self, convo_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE participants SET unread_count = 0 WHERE conversation_id = $1 AND user_id = $2")
            .bind(convo_id)
            .bind(user_id)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------

    /// Atomically inserts the message, bumps `last_message_at`, and for
    /// every other active participant inserts a `sent` DeliveryRecord and
    /// an UnreadIndex row while incrementing their unread-count (spec
    /// §4.1's `createMessage`).
    pub async fn create_message(
        &self,
        convo_id: Uuid,
        sender_id: Uuid,
        body: String,
        kind: &str,
        metadata: serde_json::Value,
        reply_to: Option<Uuid>,
    ) -> CoreResult<Message> {
        if !crate::models::validate_body(&body) {
            return Err(CoreError::InvalidInput("body must be 1..=10000 chars".into()));
        }

        let mut tx = self.write_pool.begin().await.map_err(db_unavailable)?;

        let convo = sqlx::query_as::<_, crate::models::Conversation>(
            "SELECT id, kind, name, slug, owner_id, created_at, last_message_at, deleted_at FROM conversations WHERE id = $1 FOR UPDATE",
        )
        .bind(convo_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_unavailable)?
        .ok_or(CoreError::NotFound)?;

        if convo.is_deleted() {
            return Err(CoreError::ConversationClosed);
        }

        let is_member: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM participants WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(convo_id)
        .bind(sender_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_unavailable)?;
        if is_member.is_none() {
            return Err(CoreError::NotParticipant);
        }

        if let Some(reply_id) = reply_to {
            let reply: Option<(Uuid, bool)> = sqlx::query_as(
                "SELECT conversation_id, is_deleted FROM messages WHERE id = $1",
            )
            .bind(reply_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_unavailable)?
            .map(|(c, d): (Uuid, bool)| (c, d));
            match reply {
                Some((reply_convo, deleted)) if reply_convo == convo_id && !deleted => {}
                _ => return Err(CoreError::InvalidReply),
            }
        }

        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (conversation_id, sender_id, body, kind, metadata, reply_to_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            RETURNING id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at
            "#,
        )
        .bind(convo_id)
        .bind(sender_id)
        .bind(&body)
        .bind(kind)
        .bind(&metadata)
        .bind(reply_to)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_unavailable)?;

        sqlx::query("UPDATE conversations SET last_message_at = $1 WHERE id = $2")
            .bind(message.created_at)
            .bind(convo_id)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;

        let recipients: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM participants WHERE conversation_id = $1 AND left_at IS NULL AND user_id != $2",
        )
        .bind(convo_id)
        .bind(sender_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_unavailable)?;

        for recipient in &recipients {
            sqlx::query(
                "INSERT INTO delivery_records (message_id, recipient_id, status, created_at) VALUES ($1, $2, 'sent', now())",
            )
            .bind(message.id)
            .bind(recipient)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;

            sqlx::query(
                "INSERT INTO unread_index (user_id, conversation_id, message_id) VALUES ($1, $2, $3)",
            )
            .bind(recipient)
            .bind(convo_id)
            .bind(message.id)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;

            sqlx::query(
                "UPDATE participants SET unread_count = unread_count + 1 WHERE conversation_id = $1 AND user_id = $2",
            )
            .bind(convo_id)
            .bind(recipient)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;
        }

        tx.commit().await.map_err(db_unavailable)?;
        Ok(message)
    }

    pub async fn get_message(&self, msg_id: Uuid) -> CoreResult<Option<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at FROM messages WHERE id = $1",
        )
        .bind(msg_id)
        .fetch_optional(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    /// Returns messages in reverse chronological order, bounded by
    /// `created_at < cursor` when a cursor is supplied (spec §4.1's
    /// `listMessages`).
    pub async fn list_messages(
        &self,
        convo_id: Uuid,
        viewer_id: Uuid,
        limit: i64,
        cursor: Option<chrono::DateTime<Utc>>,
    ) -> CoreResult<(Vec<Message>, Option<chrono::DateTime<Utc>>)> {
        if !self.is_member(convo_id, viewer_id).await? {
            return Err(CoreError::NotParticipant);
        }
        let limit = limit.clamp(1, 100);

        let rows = match cursor {
            Some(cursor) => sqlx::query_as::<_, Message>(
                r#"
                SELECT id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at
                FROM messages
                WHERE conversation_id = $1 AND created_at < $2
                ORDER BY created_at DESC, id DESC
                LIMIT $3
                "#,
            )
            .bind(convo_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.read_pool)
            .await,
            None => sqlx::query_as::<_, Message>(
                r#"
                SELECT id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at
                FROM messages
                WHERE conversation_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
                "#,
            )
            .bind(convo_id)
            .bind(limit)
            .fetch_all(&self.read_pool)
            .await,
        }
        .map_err(db_unavailable)?;

        let next_cursor = rows.last().map(|m| m.created_at);
        Ok((rows, next_cursor))
    }

    pub async fn edit_message(
        &self,
        msg_id: Uuid,
        editor_id: Uuid,
        new_body: String,
    ) -> CoreResult<Message> {
        if !crate::models::validate_body(&new_body) {
            return Err(CoreError::InvalidInput("body must be 1..=10000 chars".into()));
        }

        let mut tx = self.write_pool.begin().await.map_err(db_unavailable)?;
        let existing = sqlx::query_as::<_, Message>(
            "SELECT id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at FROM messages WHERE id = $1 FOR UPDATE",
        )
        .bind(msg_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_unavailable)?
        .ok_or(CoreError::NotFound)?;

        if existing.sender_id != Some(editor_id) {
            return Err(CoreError::NotAuthor);
        }
        if existing.is_deleted {
            return Err(CoreError::ConversationClosed);
        }
        if existing.kind == "system" {
            return Err(CoreError::InvalidInput("system messages cannot be edited".into()));
        }

        sqlx::query(
            "INSERT INTO edit_history_entries (message_id, prior_body, prior_metadata, edited_at) VALUES ($1, $2, $3, now())",
        )
        .bind(msg_id)
        .bind(&existing.body)
        .bind(&existing.metadata)
        .execute(&mut *tx)
        .await
        .map_err(db_unavailable)?;

        let updated = sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET body = $1, is_edited = true, edited_at = now()
            WHERE id = $2
            RETURNING id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at
            "#,
        )
        .bind(&new_body)
        .bind(msg_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_unavailable)?;

        tx.commit().await.map_err(db_unavailable)?;
        Ok(updated)
    }

    pub async fn get_edit_history(&self, msg_id: Uuid) -> CoreResult<Vec<EditHistoryEntry>> {
        sqlx::query_as::<_, EditHistoryEntry>(
            "SELECT id, message_id, prior_body, prior_metadata, edited_at FROM edit_history_entries WHERE message_id = $1 ORDER BY edited_at ASC",
        )
        .bind(msg_id)
        .fetch_all(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn soft_delete_message(&self, msg_id: Uuid, actor_id: Uuid) -> CoreResult<()> {
        let mut tx = self.write_pool.begin().await.map_err(db_unavailable)?;
        let message = sqlx::query_as::<_, Message>(
            "SELECT id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at FROM messages WHERE id = $1 FOR UPDATE",
        )
        .bind(msg_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_unavailable)?
        .ok_or(CoreError::NotFound)?;

        let is_sender = message.sender_id == Some(actor_id);
        let is_mod = if is_sender {
            true
        } else {
            let role: Option<String> = sqlx::query_scalar(
                "SELECT role FROM participants WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
            )
            .bind(message.conversation_id)
            .bind(actor_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_unavailable)?;
            matches!(role.as_deref(), Some("owner") | Some("admin"))
        };

        if !is_mod {
            return Err(CoreError::NotAuthor);
        }

        sqlx::query("UPDATE messages SET is_deleted = true, deleted_at = now() WHERE id = $1")
            .bind(msg_id)
            .execute(&mut *tx)
            .await
            .map_err(db_unavailable)?;

        tx.commit().await.map_err(db_unavailable)?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Sessions (Session Service backing store, spec §4.6)
    // -------------------------------------------------------------------

    pub async fn create_session(
        &self,
        user_id: Uuid,
        device_fingerprint: &str,
        ttl: Duration,
    ) -> CoreResult<crate::models::Session> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        sqlx::query_as::<_, crate::models::Session>(
            r#"
            INSERT INTO sessions (user_id, device_fingerprint, created_at, last_activity_at, expires_at, is_active)
            VALUES ($1, $2, now(), now(), $3, true)
            RETURNING id, user_id, device_fingerprint, socket_id, created_at, last_activity_at, expires_at, is_active
            "#,
        )
        .bind(user_id)
        .bind(device_fingerprint)
        .bind(expires_at)
        .fetch_one(&self.write_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn get_session(&self, session_id: Uuid) -> CoreResult<Option<crate::models::Session>> {
        sqlx::query_as::<_, crate::models::Session>(
            "SELECT id, user_id, device_fingerprint, socket_id, created_at, last_activity_at, expires_at, is_active FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn touch_session(&self, session_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE sessions SET last_activity_at = now() WHERE id = $1 AND is_active")
            .bind(session_id)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    pub async fn invalidate_session(&self, session_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE sessions SET is_active = false WHERE id = $1")
            .bind(session_id)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    pub async fn invalidate_all_sessions(&self, user_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE sessions SET is_active = false WHERE user_id = $1 AND is_active")
            .bind(user_id)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    pub async fn active_sessions_for(&self, user_id: Uuid) -> CoreResult<Vec<crate::models::Session>> {
        sqlx::query_as::<_, crate::models::Session>(
            "SELECT id, user_id, device_fingerprint, socket_id, created_at, last_activity_at, expires_at, is_active FROM sessions WHERE user_id = $1 AND is_active AND expires_at > now()",
        )
        .bind(user_id)
        .fetch_all(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn update_socket_id(&self, session_id: Uuid, socket_id: Option<&str>) -> CoreResult<()> {
        sqlx::query("UPDATE sessions SET socket_id = $1 WHERE id = $2")
            .bind(socket_id)
            .bind(session_id)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    /// Marks expired-but-still-`is_active` sessions inactive. Purely a
    /// housekeeping sweep: `Session::is_logged_in` already checks
    /// `expires_at` itself, so this only bounds the size of the
    /// `sessions_user` partial index over time.
    pub async fn deactivate_expired_sessions(&self) -> CoreResult<u64> {
        let result = sqlx::query("UPDATE sessions SET is_active = false WHERE is_active AND expires_at <= now()")
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(result.rows_affected())
    }

    pub async fn get_or_create_user(&self, username: &str) -> CoreResult<crate::models::User> {
        if !crate::models::validate_username(username) {
            return Err(CoreError::InvalidInput("username must match ^[A-Za-z0-9_]{3,50}$".into()));
        }
        sqlx::query_as::<_, crate::models::User>(
            r#"
            INSERT INTO users (username, display_name, created_at, last_seen_at)
            VALUES ($1, $1, now(), now())
            ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
            RETURNING id, username, display_name, avatar_ref, presence, last_seen_at, created_at
            "#,
        )
        .bind(username)
        .fetch_one(&self.write_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn set_presence(&self, user_id: Uuid, presence: &str) -> CoreResult<()> {
        sqlx::query("UPDATE users SET presence = $1, last_seen_at = now() WHERE id = $2")
            .bind(presence)
            .bind(user_id)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Reactions
    // -------------------------------------------------------------------

    pub async fn add_reaction(&self, msg_id: Uuid, user_id: Uuid, emoji: String) -> CoreResult<Reaction> {
        if !crate::models::validate_emoji(&emoji) {
            return Err(CoreError::InvalidInput("emoji must be 1..=10 chars".into()));
        }
        sqlx::query_as::<_, Reaction>(
            r#"
            INSERT INTO reactions (message_id, user_id, emoji, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (message_id, user_id, emoji) DO UPDATE SET emoji = EXCLUDED.emoji
            RETURNING message_id, user_id, emoji, created_at
            "#,
        )
        .bind(msg_id)
        .bind(user_id)
        .bind(&emoji)
        .fetch_one(&self.write_pool)
        .await
        .map_err(db_unavailable)
    }

    pub async fn remove_reaction(&self, msg_id: Uuid, user_id: Uuid, emoji: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3")
            .bind(msg_id)
            .bind(user_id)
            .bind(emoji)
            .execute(&self.write_pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------

    pub async fn get_delivery_record(
        &self,
        msg_id: Uuid,
        recipient_id: Uuid,
    ) -> CoreResult<Option<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(
            "SELECT message_id, recipient_id, status, delivered_at, read_at, created_at FROM delivery_records WHERE message_id = $1 AND recipient_id = $2",
        )
        .bind(msg_id)
        .bind(recipient_id)
        .fetch_optional(&self.read_pool)
        .await
        .map_err(db_unavailable)
    }

    /// Idempotent monotonic status transition (spec §4.1's
    /// `transitionDelivery`): no-op if current status already ≥ target.
    pub async fn transition_delivery(
        &self,
        msg_id: Uuid,
        recipient_id: Uuid,
        target: crate::models::DeliveryStatus,
    ) -> CoreResult<()> {
        let mut tx = self.write_pool.begin().await.map_err(db_unavailable)?;

        let record = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT message_id, recipient_id, status, delivered_at, read_at, created_at FROM delivery_records WHERE message_id = $1 AND recipient_id = $2 FOR UPDATE",
        )
        .bind(msg_id)
        .bind(recipient_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_unavailable)?
        .ok_or(CoreError::NotFound)?;

        let target_rank = match target {
            crate::models::DeliveryStatus::Delivered => 1,
            crate::models::DeliveryStatus::Read => 2,
            crate::models::DeliveryStatus::Sent => 0,
        };
        if record.status_rank() >= target_rank {
            tx.rollback().await.ok();
            return Ok(());
        }

        let status_str = match target {
            crate::models::DeliveryStatus::Delivered => "delivered",
            crate::models::DeliveryStatus::Read => "read",
            crate::models::DeliveryStatus::Sent => "sent",
        };

        match target {
            crate::models::DeliveryStatus::Delivered => {
                sqlx::query(
                    "UPDATE delivery_records SET status = $1, delivered_at = now() WHERE message_id = $2 AND recipient_id = $3",
                )
                .bind(status_str)
                .bind(msg_id)
                .bind(recipient_id)
                .execute(&mut *tx)
                .await
                .map_err(db_unavailable)?;
            }
            crate::models::DeliveryStatus::Read => {
                sqlx::query(
                    "UPDATE delivery_records SET status = $1, read_at = now(), delivered_at = COALESCE(delivered_at, now()) WHERE message_id = $2 AND recipient_id = $3",
                )
                .bind(status_str)
                .bind(msg_id)
                .bind(recipient_id)
                .execute(&mut *tx)
                .await
                .map_err(db_unavailable)?;

                // Only this one message's read advances last-read and
                // decrements unread; marking M read never cascades to
                // earlier unread messages in the same conversation.
                let message: Message = sqlx::query_as(
                    "SELECT id, conversation_id, sender_id, body, kind, metadata, reply_to_id, is_edited, edited_at, is_deleted, deleted_at, created_at FROM messages WHERE id = $1",
                )
                .bind(msg_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_unavailable)?;

                let current_last_read_created_at: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
                    r#"
                    SELECT m.created_at FROM participants p
                    JOIN messages m ON m.id = p.last_read_message_id
                    WHERE p.conversation_id = $1 AND p.user_id = $2
                    "#,
                )
                .bind(message.conversation_id)
                .bind(recipient_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_unavailable)?
                .flatten();

                if current_last_read_created_at.is_none_or(|t| message.created_at >= t) {
                    sqlx::query(
                        "UPDATE participants SET last_read_message_id = $1 WHERE conversation_id = $2 AND user_id = $3",
                    )
                    .bind(msg_id)
                    .bind(message.conversation_id)
                    .bind(recipient_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_unavailable)?;
                }

                sqlx::query(
                    "DELETE FROM unread_index WHERE user_id = $1 AND message_id = $2",
                )
                .bind(recipient_id)
                .bind(msg_id)
                .execute(&mut *tx)
                .await
                .map_err(db_unavailable)?;

                sqlx::query(
                    "UPDATE participants SET unread_count = GREATEST(0, unread_count - 1) WHERE conversation_id = $1 AND user_id = $2",
                )
                .bind(message.conversation_id)
                .bind(recipient_id)
                .execute(&mut *tx)
                .await
                .map_err(db_unavailable)?;
            }
            crate::models::DeliveryStatus::Sent => {}
        }

        tx.commit().await.map_err(db_unavailable)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ConversationSummaryRow {
    id: Uuid,
    kind: String,
    name: Option<String>,
    slug: Option<String>,
    owner_id: Option<Uuid>,
    created_at: chrono::DateTime<Utc>,
    last_message_at: chrono::DateTime<Utc>,
    deleted_at: Option<chrono::DateTime<Utc>>,
    unread_count: i32,
    last_message_body: Option<String>,
}

impl ConversationSummaryRow {
    fn into_summary(self) -> ConversationSummary {
        ConversationSummary {
            conversation: crate::models::Conversation {
                id: self.id,
                kind: self.kind,
                name: self.name,
                slug: self.slug,
                owner_id: self.owner_id,
                created_at: self.created_at,
                last_message_at: self.last_message_at,
                deleted_at: self.deleted_at,
            },
            unread_count: self.unread_count,
            last_message_body: self.last_message_body,
        }
    }
}

fn db_unavailable(err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            CoreError::ConflictUniqueViolation(db_err.message().to_string())
        }
        _ => CoreError::StorageUnavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_test_db() -> PgPool {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/chatcore_test".to_string());
        PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .expect("failed to connect to test database")
    }

    async fn seed_user(pool: &PgPool, username: &str) -> Uuid {
        sqlx::query_scalar(
            "INSERT INTO users (username, display_name) VALUES ($1, $1) RETURNING id",
        )
        .bind(username)
        .fetch_one(pool)
        .await
        .expect("failed to seed user")
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn create_message_fans_out_delivery_records_and_unread() {
        let pool = setup_test_db().await;
        let store = Store::from_pool(pool.clone());

        let a = seed_user(&pool, "alice_store_test").await;
        let b = seed_user(&pool, "bob_store_test").await;
        let convo = store.create_direct_conversation(a, b).await.unwrap();

        let message = store
            .create_message(convo.id, a, "hello".into(), "text", serde_json::json!({}), None)
            .await
            .unwrap();

        let record = store.get_delivery_record(message.id, b).await.unwrap().unwrap();
        assert_eq!(record.status, "sent");

        let membership = store.get_membership(convo.id, b).await.unwrap().unwrap();
        assert_eq!(membership.unread_count, 1);
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn transition_delivery_is_monotonic_and_idempotent() {
        let pool = setup_test_db().await;
        let store = Store::from_pool(pool.clone());

        let a = seed_user(&pool, "alice_monotonic_test").await;
        let b = seed_user(&pool, "bob_monotonic_test").await;
        let convo = store.create_direct_conversation(a, b).await.unwrap();
        let message = store
            .create_message(convo.id, a, "hi".into(), "text", serde_json::json!({}), None)
            .await
            .unwrap();

        store
            .transition_delivery(message.id, b, crate::models::DeliveryStatus::Read)
            .await
            .unwrap();
        store
            .transition_delivery(message.id, b, crate::models::DeliveryStatus::Delivered)
            .await
            .unwrap();

        let record = store.get_delivery_record(message.id, b).await.unwrap().unwrap();
        assert_eq!(record.status, "read");

        let membership = store.get_membership(convo.id, b).await.unwrap().unwrap();
        assert_eq!(membership.unread_count, 0);
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn edit_message_preserves_history() {
        let pool = setup_test_db().await;
        let store = Store::from_pool(pool.clone());

        let a = seed_user(&pool, "alice_edit_test").await;
        let b = seed_user(&pool, "bob_edit_test").await;
        let convo = store.create_direct_conversation(a, b).await.unwrap();
        let message = store
            .create_message(convo.id, a, "hi".into(), "text", serde_json::json!({}), None)
            .await
            .unwrap();

        let edited = store.edit_message(message.id, a, "hello".into()).await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.body, "hello");

        let history = store.get_edit_history(message.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].prior_body, "hi");
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn group_conversation_enforces_300_participant_cap() {
        let pool = setup_test_db().await;
        let store = Store::from_pool(pool.clone());
        let owner = seed_user(&pool, "owner_cap_test").await;

        let mut too_many = Vec::new();
        for i in 0..300 {
            too_many.push(seed_user(&pool, &format!("member_cap_{i}")).await);
        }

        let err = store
            .create_group_conversation(owner, "Big Group".into(), &too_many)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
