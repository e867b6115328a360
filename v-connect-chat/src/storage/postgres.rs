use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use v::{HealthCheck, HealthStatus};

use super::{
    ConversationStore, MessageStore, ReadStateStore, StoreError, StoreResult, UserStore,
};
use crate::domain::{
    Conversation, ConversationKind, CursorUpdate, Message, MessagePosition, MessageQuery,
    MessageType, ReadState, User,
};

/// 内嵌建表脚本 / Embedded schema
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// PostgreSQL 存储 / PostgreSQL backend over a `v` pool
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// 使用 `database.<group>` 配置建池并应用模式 / Open the configured pool and apply the schema
    pub async fn connect(group: &str) -> StoreResult<Self> {
        let pool = v::get_pool(group).await?;
        v::apply_schema(&pool, SCHEMA).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

fn decode_error(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Protocol(format!("unexpected {} value: {}", column, value))
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let participants: Vec<String> = row.try_get("participant_ids")?;
    let admins: Vec<String> = row.try_get("admin_ids")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        kind: ConversationKind::parse(&kind).ok_or_else(|| decode_error("kind", &kind))?,
        participant_ids: participants.into_iter().collect(),
        dm_key: row.try_get("dm_key")?,
        admin_ids: admins.into_iter().collect(),
        title: row.try_get("title")?,
        last_message_id: row.try_get("last_message_id")?,
        last_message_at: row.try_get("last_message_at")?,
        last_message_preview: row.try_get("last_message_preview")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, sqlx::Error> {
    let kind: String = row.try_get("type")?;
    let hidden: Vec<String> = row.try_get("deleted_for_user_ids")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        message_type: MessageType::parse(&kind).ok_or_else(|| decode_error("type", &kind))?,
        text: row.try_get("text")?,
        media_ref: row.try_get("media_ref")?,
        reply_to_message_id: row.try_get("reply_to_message_id")?,
        client_message_id: row.try_get("client_message_id")?,
        created_at: row.try_get("created_at")?,
        edited_at: row.try_get("edited_at")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_for_user_ids: hidden.into_iter().collect(),
        seq: row.try_get("seq")?,
    })
}

fn read_state_from_row(row: &PgRow) -> Result<ReadState, sqlx::Error> {
    Ok(ReadState {
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        last_read_message_id: row.try_get("last_read_message_id")?,
        last_read_at: row.try_get("last_read_at")?,
        last_read_seq: row.try_get("last_read_seq")?,
        last_delivered_message_id: row.try_get("last_delivered_message_id")?,
        last_delivered_at: row.try_get("last_delivered_at")?,
        last_delivered_seq: row.try_get("last_delivered_seq")?,
        unread_count: row.try_get("unread_count")?,
        is_muted: row.try_get("is_muted")?,
        muted_until: row.try_get("muted_until")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    let friends: Vec<String> = row.try_get("friend_ids")?;
    Ok(User {
        id: row.try_get("id")?,
        phone_number: row.try_get("phone_number")?,
        username: row.try_get("username")?,
        passcode_hash: row.try_get("passcode_hash")?,
        avatar_media_id: row.try_get("avatar_media_id")?,
        friend_ids: friends.into_iter().collect(),
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn to_vec(set: &std::collections::BTreeSet<String>) -> Vec<String> {
    set.iter().cloned().collect()
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn insert_conversation(&self, conv: &Conversation) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chat_conversations \
             (id, kind, participant_ids, dm_key, admin_ids, title, version, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&conv.id)
        .bind(conv.kind.as_str())
        .bind(to_vec(&conv.participant_ids))
        .bind(&conv.dm_key)
        .bind(to_vec(&conv.admin_ids))
        .bind(&conv.title)
        .bind(conv.version)
        .bind(conv.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM chat_conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversation_from_row).transpose()?)
    }

    async fn find_by_dm_key(&self, dm_key: &str) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM chat_conversations WHERE dm_key = $1")
            .bind(dm_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversation_from_row).transpose()?)
    }

    async fn update_conversation(
        &self,
        conv: &Conversation,
        expected_version: i64,
    ) -> StoreResult<Conversation> {
        let row = sqlx::query(
            "UPDATE chat_conversations \
             SET participant_ids = $2, admin_ids = $3, title = $4, version = $5 + 1 \
             WHERE id = $1 AND version = $5 RETURNING *",
        )
        .bind(&conv.id)
        .bind(to_vec(&conv.participant_ids))
        .bind(to_vec(&conv.admin_ids))
        .bind(&conv.title)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(conversation_from_row(&row)?),
            None => match self.get_conversation(&conv.id).await? {
                Some(_) => Err(StoreError::StaleVersion),
                None => Err(StoreError::NotFound(format!("conversation {}", conv.id))),
            },
        }
    }

    async fn touch_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
        preview: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE chat_conversations \
             SET last_message_id = $2, last_message_at = $3, last_message_preview = $4, \
                 version = version + 1 \
             WHERE id = $1 AND (last_message_at IS NULL OR last_message_at <= $3)",
        )
        .bind(conversation_id)
        .bind(message_id)
        .bind(at)
        .bind(preview)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_conversations \
             WHERE $1 = ANY(participant_ids) \
               AND ($2::timestamptz IS NULL OR COALESCE(last_message_at, created_at) < $2) \
             ORDER BY COALESCE(last_message_at, created_at) DESC \
             LIMIT $3",
        )
        .bind(user_id)
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(conversation_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl MessageStore for PgStore {
    /// 时间戳以数据库存储精度（微秒）为准 / createdAt is echoed back at column precision
    async fn insert_message(&self, mut msg: Message) -> StoreResult<Message> {
        let row = sqlx::query(
            "INSERT INTO chat_messages \
             (id, conversation_id, sender_id, type, text, media_ref, reply_to_message_id, \
              client_message_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING seq, created_at",
        )
        .bind(&msg.id)
        .bind(&msg.conversation_id)
        .bind(&msg.sender_id)
        .bind(msg.message_type.as_str())
        .bind(&msg.text)
        .bind(&msg.media_ref)
        .bind(&msg.reply_to_message_id)
        .bind(&msg.client_message_id)
        .bind(msg.created_at)
        .fetch_one(&self.pool)
        .await?;
        msg.seq = row.try_get("seq")?;
        msg.created_at = row.try_get("created_at")?;
        Ok(msg)
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM chat_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(message_from_row).transpose()?)
    }

    async fn find_by_client_id(
        &self,
        conversation_id: &str,
        sender_id: &str,
        client_message_id: &str,
    ) -> StoreResult<Option<Message>> {
        let row = sqlx::query(
            "SELECT * FROM chat_messages \
             WHERE conversation_id = $1 AND sender_id = $2 AND client_message_id = $3",
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(client_message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(message_from_row).transpose()?)
    }

    async fn update_message_text(
        &self,
        id: &str,
        text: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        let row = sqlx::query(
            "UPDATE chat_messages SET text = $2, edited_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(text)
        .bind(edited_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        Ok(message_from_row(&row)?)
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Message> {
        let row = sqlx::query(
            "UPDATE chat_messages SET deleted_at = COALESCE(deleted_at, $2) \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        Ok(message_from_row(&row)?)
    }

    async fn hide_for_user(&self, id: &str, user_id: &str) -> StoreResult<Message> {
        let row = sqlx::query(
            "UPDATE chat_messages \
             SET deleted_for_user_ids = CASE \
                 WHEN $2 = ANY(deleted_for_user_ids) THEN deleted_for_user_ids \
                 ELSE array_append(deleted_for_user_ids, $2) END \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        Ok(message_from_row(&row)?)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        query: &MessageQuery,
    ) -> StoreResult<Vec<Message>> {
        let limit = query.effective_limit() as i64;
        let before_at = query.before.map(|p| p.at);
        let before_seq = query.before.map(|p| p.seq);
        let rows = if let Some(after) = query.after {
            sqlx::query(
                "SELECT * FROM chat_messages \
                 WHERE conversation_id = $1 AND deleted_at IS NULL \
                   AND NOT ($2 = ANY(deleted_for_user_ids)) \
                   AND (created_at, seq) > ($3, $4) \
                   AND ($5::timestamptz IS NULL OR (created_at, seq) < ($5, $6::bigint)) \
                 ORDER BY created_at ASC, seq ASC LIMIT $7",
            )
            .bind(conversation_id)
            .bind(viewer_id)
            .bind(after.at)
            .bind(after.seq)
            .bind(before_at)
            .bind(before_seq)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            let mut rows = sqlx::query(
                "SELECT * FROM chat_messages \
                 WHERE conversation_id = $1 AND deleted_at IS NULL \
                   AND NOT ($2 = ANY(deleted_for_user_ids)) \
                   AND ($3::timestamptz IS NULL OR (created_at, seq) < ($3, $4::bigint)) \
                 ORDER BY created_at DESC, seq DESC LIMIT $5",
            )
            .bind(conversation_id)
            .bind(viewer_id)
            .bind(before_at)
            .bind(before_seq)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.reverse();
            rows
        };
        Ok(rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

impl PgStore {
    async fn cursor(
        &self,
        sql: &str,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        pos: MessagePosition,
    ) -> StoreResult<CursorUpdate> {
        self.ensure(conversation_id, user_id).await?;
        let row = sqlx::query(sql)
            .bind(conversation_id)
            .bind(user_id)
            .bind(message_id)
            .bind(pos.at)
            .bind(pos.seq)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(CursorUpdate {
                state: read_state_from_row(&row)?,
                advanced: true,
            }),
            None => Ok(CursorUpdate {
                state: self.ensure(conversation_id, user_id).await?,
                advanced: false,
            }),
        }
    }
}

#[async_trait]
impl ReadStateStore for PgStore {
    async fn ensure(&self, conversation_id: &str, user_id: &str) -> StoreResult<ReadState> {
        sqlx::query(
            "INSERT INTO chat_read_states (conversation_id, user_id) VALUES ($1, $2) \
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        self.get(conversation_id, user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("read state {}/{}", conversation_id, user_id)))
    }

    async fn get(&self, conversation_id: &str, user_id: &str) -> StoreResult<Option<ReadState>> {
        let row = sqlx::query(
            "SELECT * FROM chat_read_states WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(read_state_from_row).transpose()?)
    }

    async fn increment_unread(
        &self,
        conversation_id: &str,
        sender_id: &str,
        participant_ids: &[String],
    ) -> StoreResult<()> {
        let targets: Vec<String> = participant_ids
            .iter()
            .filter(|p| p.as_str() != sender_id)
            .cloned()
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO chat_read_states (conversation_id, user_id, unread_count) \
             SELECT $1, uid, 1 FROM UNNEST($2::text[]) AS uid \
             ON CONFLICT (conversation_id, user_id) \
             DO UPDATE SET unread_count = chat_read_states.unread_count + 1",
        )
        .bind(conversation_id)
        .bind(targets)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        pos: MessagePosition,
    ) -> StoreResult<CursorUpdate> {
        self.cursor(
            "UPDATE chat_read_states \
             SET last_read_message_id = $3, last_read_at = $4, last_read_seq = $5, \
                 unread_count = 0 \
             WHERE conversation_id = $1 AND user_id = $2 \
               AND (last_read_at IS NULL OR (last_read_at, last_read_seq) < ($4, $5)) \
             RETURNING *",
            conversation_id,
            user_id,
            message_id,
            pos,
        )
        .await
    }

    async fn mark_delivered(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        pos: MessagePosition,
    ) -> StoreResult<CursorUpdate> {
        self.cursor(
            "UPDATE chat_read_states \
             SET last_delivered_message_id = $3, last_delivered_at = $4, \
                 last_delivered_seq = $5 \
             WHERE conversation_id = $1 AND user_id = $2 \
               AND (last_delivered_at IS NULL \
                    OR (last_delivered_at, last_delivered_seq) < ($4, $5)) \
             RETURNING *",
            conversation_id,
            user_id,
            message_id,
            pos,
        )
        .await
    }

    async fn unread_counts(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT conversation_id, unread_count FROM chat_read_states \
             WHERE user_id = $1 AND conversation_id = ANY($2)",
        )
        .bind(user_id)
        .bind(conversation_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        let mut counts: HashMap<String, i64> = HashMap::with_capacity(rows.len());
        for row in rows {
            counts.insert(row.try_get("conversation_id")?, row.try_get("unread_count")?);
        }
        Ok(counts)
    }

    async fn set_muted(
        &self,
        conversation_id: &str,
        user_id: &str,
        muted: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<ReadState> {
        let until = if muted { until } else { None };
        let row = sqlx::query(
            "INSERT INTO chat_read_states (conversation_id, user_id, is_muted, muted_until) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (conversation_id, user_id) \
             DO UPDATE SET is_muted = EXCLUDED.is_muted, muted_until = EXCLUDED.muted_until \
             RETURNING *",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(muted)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;
        Ok(read_state_from_row(&row)?)
    }

    async fn total_unread(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(unread_count), 0)::BIGINT AS total FROM chat_read_states \
             WHERE user_id = $1 \
               AND (NOT is_muted OR (muted_until IS NOT NULL AND muted_until <= $2))",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chat_users \
             (id, phone_number, username, passcode_hash, avatar_media_id, friend_ids, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&user.id)
        .bind(&user.phone_number)
        .bind(&user.username)
        .bind(&user.passcode_hash)
        .bind(&user.avatar_media_id)
        .bind(to_vec(&user.friend_ids))
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM chat_users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn find_by_phone(&self, phone_number: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM chat_users WHERE phone_number = $1")
            .bind(phone_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn get_users(&self, ids: &[String]) -> StoreResult<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM chat_users WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(user_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn update_profile(
        &self,
        id: &str,
        username: Option<&str>,
        avatar_media_id: Option<&str>,
    ) -> StoreResult<User> {
        let row = sqlx::query(
            "UPDATE chat_users \
             SET username = COALESCE($2, username), \
                 avatar_media_id = COALESCE($3, avatar_media_id) \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(username)
        .bind(avatar_media_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))?;
        Ok(user_from_row(&row)?)
    }

    async fn add_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
            let done = sqlx::query(
                "UPDATE chat_users \
                 SET friend_ids = CASE WHEN $2 = ANY(friend_ids) THEN friend_ids \
                                       ELSE array_append(friend_ids, $2) END \
                 WHERE id = $1",
            )
            .bind(a)
            .bind(b)
            .execute(&mut *tx)
            .await?;
            if done.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("user {}", a)));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
            sqlx::query("UPDATE chat_users SET friend_ids = array_remove(friend_ids, $2) WHERE id = $1")
                .bind(a)
                .bind(b)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search_users(&self, query: &str, limit: usize) -> StoreResult<Vec<User>> {
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let rows = sqlx::query(
            "SELECT * FROM chat_users \
             WHERE deleted_at IS NULL \
               AND (username ILIKE $1 OR phone_number ILIKE $1) \
             ORDER BY username ASC, id ASC LIMIT $2",
        )
        .bind(format!("%{}%", escaped))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(user_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl HealthCheck for PgStore {
    async fn check_health(&self) -> HealthStatus {
        self.pool.check_health().await
    }
}
