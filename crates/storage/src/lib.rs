use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChatId, ChatKind, MediaKind, MessageId, UserId};

/// Durable conversation store. The only writer of chat/message state;
/// everything the presence layer holds is a projection of what lives here.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub display_image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredParticipant {
    pub user_id: UserId,
    pub is_admin: bool,
    pub hidden: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, display_image FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            display_image: r.get::<Option<String>, _>(2),
        }))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Finds the direct chat for an unordered user pair, if one exists.
    /// Direct chats hold exactly two participants, so requiring both rows is
    /// sufficient.
    pub async fn find_direct_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>> {
        let row = sqlx::query("SELECT id FROM chats WHERE direct_pair = ?")
            .bind(direct_pair_key(a, b))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChatId(r.get::<i64, _>(0))))
    }

    /// Insert-or-select on the canonical pair key. At most one direct chat
    /// can ever exist per unordered user pair; when a concurrent creation
    /// wins the race, the loser gets the winner's row and `false`.
    pub async fn create_direct_chat(&self, a: UserId, b: UserId) -> Result<(ChatId, bool)> {
        let pair = direct_pair_key(a, b);
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO chats (kind, direct_pair) VALUES ('direct', ?)
             ON CONFLICT(direct_pair) DO NOTHING
             RETURNING id",
        )
        .bind(&pair)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(rec) = inserted else {
            let rec = sqlx::query("SELECT id FROM chats WHERE direct_pair = ?")
                .bind(&pair)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok((ChatId(rec.get::<i64, _>(0)), false));
        };
        let chat_id = ChatId(rec.get::<i64, _>(0));
        for user in [a, b] {
            sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES (?, ?)")
                .bind(chat_id.0)
                .bind(user.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok((chat_id, true))
    }

    /// Creates a group chat. The creator is inserted first (and therefore is
    /// the earliest-joined participant) and always as admin.
    pub async fn create_group_chat(
        &self,
        creator: UserId,
        others: &[UserId],
        title: &str,
    ) -> Result<ChatId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query("INSERT INTO chats (kind, title) VALUES ('group', ?) RETURNING id")
            .bind(title)
            .fetch_one(&mut *tx)
            .await?;
        let chat_id = ChatId(rec.get::<i64, _>(0));
        sqlx::query("INSERT INTO chat_participants (chat_id, user_id, is_admin) VALUES (?, ?, 1)")
            .bind(chat_id.0)
            .bind(creator.0)
            .execute(&mut *tx)
            .await?;
        for user in others {
            sqlx::query(
                "INSERT OR IGNORE INTO chat_participants (chat_id, user_id) VALUES (?, ?)",
            )
            .bind(chat_id.0)
            .bind(user.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(chat_id)
    }

    pub async fn chat_by_id(&self, chat_id: ChatId) -> Result<Option<StoredChat>> {
        let row = sqlx::query(
            "SELECT id, kind, title, last_message_id, created_at, updated_at
             FROM chats WHERE id = ?",
        )
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(map_chat_row))
    }

    /// Participants in deterministic earliest-joined order.
    pub async fn participants_of(&self, chat_id: ChatId) -> Result<Vec<StoredParticipant>> {
        let rows = sqlx::query(
            "SELECT user_id, is_admin, hidden, joined_at
             FROM chat_participants
             WHERE chat_id = ?
             ORDER BY joined_at ASC, rowid ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(map_participant_row).collect())
    }

    pub async fn participant_status(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<StoredParticipant>> {
        let row = sqlx::query(
            "SELECT user_id, is_admin, hidden, joined_at
             FROM chat_participants
             WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(map_participant_row))
    }

    /// Conversations visible to a user, most recently active first. Chats the
    /// user has hidden (one-sided direct leave) are excluded.
    pub async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<StoredChat>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.title, c.last_message_id, c.created_at, c.updated_at
             FROM chats c
             INNER JOIN chat_participants p ON p.chat_id = c.id
             WHERE p.user_id = ? AND p.hidden = 0
             ORDER BY c.updated_at DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(map_chat_row).collect())
    }

    /// Persists a message and the sender's own read marker in one
    /// transaction. The chat summary write is a separate step so a failed
    /// summary can be repaired without re-inserting the message.
    pub async fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        body: Option<&str>,
        media: Option<(&str, MediaKind)>,
        is_system: bool,
    ) -> Result<StoredMessage> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (chat_id, sender_user_id, body, media_url, media_kind, is_system)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id, created_at",
        )
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(body)
        .bind(media.map(|(url, _)| url))
        .bind(media.map(|(_, kind)| kind.as_str()))
        .bind(is_system)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));
        let created_at = rec.get::<DateTime<Utc>, _>(1);

        sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?, ?)")
            .bind(message_id.0)
            .bind(sender_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(StoredMessage {
            message_id,
            chat_id,
            sender_id,
            body: body.map(str::to_string),
            media_url: media.map(|(url, _)| url.to_string()),
            media_kind: media.map(|(_, kind)| kind),
            is_system,
            created_at,
        })
    }

    pub async fn update_chat_summary(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        sqlx::query(
            "UPDATE chats SET last_message_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(message_id.0)
        .bind(chat_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-derives the chat summary from the message table. Idempotent; safe
    /// to call after a failed or doubtful summary write.
    pub async fn repair_chat_summary(&self, chat_id: ChatId) -> Result<()> {
        sqlx::query(
            "UPDATE chats
             SET last_message_id = (SELECT MAX(id) FROM messages WHERE chat_id = ?),
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(chat_id.0)
        .bind(chat_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn message_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, chat_id, sender_user_id, body, media_url, media_kind, is_system, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(map_message_row))
    }

    /// Full history for a chat, ascending by creation order.
    pub async fn list_chat_messages(&self, chat_id: ChatId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, sender_user_id, body, media_url, media_kind, is_system, created_at
             FROM messages
             WHERE chat_id = ?
             ORDER BY id ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(map_message_row).collect())
    }

    /// All read markers for a chat, for merging into message payloads.
    pub async fn reads_for_chat(&self, chat_id: ChatId) -> Result<Vec<(MessageId, UserId)>> {
        let rows = sqlx::query(
            "SELECT r.message_id, r.user_id
             FROM message_reads r
             INNER JOIN messages m ON m.id = r.message_id
             WHERE m.chat_id = ?
             ORDER BY r.message_id ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (MessageId(r.get::<i64, _>(0)), UserId(r.get::<i64, _>(1))))
            .collect())
    }

    pub async fn read_by_for_message(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        let rows =
            sqlx::query("SELECT user_id FROM message_reads WHERE message_id = ? ORDER BY user_id")
                .bind(message_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn is_message_read(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM message_reads WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Exact unread count: messages from other senders the user has not read.
    pub async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM messages m
             WHERE m.chat_id = ?
               AND m.sender_user_id != ?
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?
               )",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Set-union read marking for every unread message from another sender.
    /// Idempotent under repeats and races (INSERT OR IGNORE on the composite
    /// primary key). Returns how many messages became read.
    pub async fn mark_read(&self, chat_id: ChatId, user_id: UserId) -> Result<u64> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id)
             SELECT m.id, ?
             FROM messages m
             WHERE m.chat_id = ? AND m.sender_user_id != ?",
        )
        .bind(user_id.0)
        .bind(chat_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Returns true if the user was newly added.
    pub async fn add_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        is_admin: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO chat_participants (chat_id, user_id, is_admin) VALUES (?, ?, ?)",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(is_admin)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removing the participant row removes the admin flag with it, keeping
    /// admins a subset of participants by construction.
    pub async fn remove_participant(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_participants WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_admin(&self, chat_id: ChatId, user_id: UserId, is_admin: bool) -> Result<()> {
        sqlx::query("UPDATE chat_participants SET is_admin = ? WHERE chat_id = ? AND user_id = ?")
            .bind(is_admin)
            .bind(chat_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_hidden(&self, chat_id: ChatId, user_id: UserId, hidden: bool) -> Result<()> {
        sqlx::query("UPDATE chat_participants SET hidden = ? WHERE chat_id = ? AND user_id = ?")
            .bind(hidden)
            .bind(chat_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears every participant's hidden flag. A new message resurfaces a
    /// conversation in each participant's list view.
    pub async fn unhide_all(&self, chat_id: ChatId) -> Result<()> {
        sqlx::query("UPDATE chat_participants SET hidden = 0 WHERE chat_id = ?")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn admin_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM chat_participants
             WHERE chat_id = ? AND is_admin = 1
             ORDER BY joined_at ASC, rowid ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    /// Earliest-joined participant, used for deterministic admin promotion.
    pub async fn earliest_joined_participant(
        &self,
        chat_id: ChatId,
        excluding: Option<UserId>,
    ) -> Result<Option<UserId>> {
        let row = sqlx::query(
            "SELECT user_id FROM chat_participants
             WHERE chat_id = ? AND user_id != ?
             ORDER BY joined_at ASC, rowid ASC
             LIMIT 1",
        )
        .bind(chat_id.0)
        .bind(excluding.map(|u| u.0).unwrap_or(-1))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    /// Cascade delete once a chat has zero participants. Invoked after every
    /// membership removal. Returns true if the chat was deleted.
    pub async fn delete_chat_if_empty(&self, chat_id: ChatId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_participants WHERE chat_id = ?")
                .bind(chat_id.0)
                .fetch_one(&mut *tx)
                .await?;
        if remaining > 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        delete_chat_rows(&mut tx, chat_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// A direct chat is deleted only once no participant still references it
    /// (every side has hidden it). Returns true if the chat was deleted.
    pub async fn delete_direct_if_abandoned(&self, chat_id: ChatId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let visible: Option<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_participants p
             INNER JOIN chats c ON c.id = p.chat_id
             WHERE p.chat_id = ? AND c.kind = 'direct' AND p.hidden = 0",
        )
        .bind(chat_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        match visible {
            Some(0) => {
                delete_chat_rows(&mut tx, chat_id).await?;
                tx.commit().await?;
                Ok(true)
            }
            _ => {
                tx.rollback().await?;
                Ok(false)
            }
        }
    }
}

async fn delete_chat_rows(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    chat_id: ChatId,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM message_reads
         WHERE message_id IN (SELECT id FROM messages WHERE chat_id = ?)",
    )
    .bind(chat_id.0)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM messages WHERE chat_id = ?")
        .bind(chat_id.0)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chat_participants WHERE chat_id = ?")
        .bind(chat_id.0)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chats WHERE id = ?")
        .bind(chat_id.0)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn direct_pair_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
    format!("{lo}:{hi}")
}

fn map_chat_row(r: sqlx::sqlite::SqliteRow) -> StoredChat {
    let kind = match r.get::<String, _>(1).as_str() {
        "group" => ChatKind::Group,
        _ => ChatKind::Direct,
    };
    StoredChat {
        chat_id: ChatId(r.get::<i64, _>(0)),
        kind,
        title: r.get::<Option<String>, _>(2),
        last_message_id: r.get::<Option<i64>, _>(3).map(MessageId),
        created_at: r.get::<DateTime<Utc>, _>(4),
        updated_at: r.get::<DateTime<Utc>, _>(5),
    }
}

fn map_participant_row(r: sqlx::sqlite::SqliteRow) -> StoredParticipant {
    StoredParticipant {
        user_id: UserId(r.get::<i64, _>(0)),
        is_admin: r.get::<bool, _>(1),
        hidden: r.get::<bool, _>(2),
        joined_at: r.get::<DateTime<Utc>, _>(3),
    }
}

fn map_message_row(r: sqlx::sqlite::SqliteRow) -> StoredMessage {
    let media_kind = r.get::<Option<String>, _>(5).map(|kind| match kind.as_str() {
        "video" => MediaKind::Video,
        "gif" => MediaKind::Gif,
        _ => MediaKind::Image,
    });
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        chat_id: ChatId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        body: r.get::<Option<String>, _>(3),
        media_url: r.get::<Option<String>, _>(4),
        media_kind,
        is_system: r.get::<bool, _>(6),
        created_at: r.get::<DateTime<Utc>, _>(7),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
