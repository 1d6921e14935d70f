use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, AnyPool, Row};
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneLinkRecord {
    pub phone_number: String,
    pub account_id: String,
    pub autopilot: bool,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub account_id: String,
    pub channel: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub conversation_id: String,
    pub account_id: String,
    pub channel: String,
    pub role: String,
    pub content: String,
    pub run_id: Option<String>,
    pub turn_index: i64,
    pub created_at: DateTime<Utc>,
}

/// Channel system-of-record row for one SMS in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessageRecord {
    pub id: String,
    pub provider_message_id: String,
    pub direction: String,
    pub account_id: Option<String>,
    pub conversation_id: Option<String>,
    pub from_number: String,
    pub to_number: Option<String>,
    pub body: String,
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    pub channel: String,
    pub address: String,
    pub account_id: Option<String>,
    pub contact_id: Option<String>,
    pub status: String,
    pub is_read: bool,
    pub assigned_to: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub last_message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessageRecord {
    pub id: String,
    pub thread_id: String,
    pub direction: String,
    pub channel: String,
    pub from_address: String,
    pub to_address: Option<String>,
    pub body: String,
    pub provider_message_id: String,
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

pub fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS phone_links (
            phone_number TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            autopilot BIGINT NOT NULL,
            verified_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_phone_links_account ON phone_links(account_id)"#,
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            last_activity_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_conversations_window ON conversations(account_id, channel, last_activity_at)"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_locks (
            account_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            locked_at BIGINT NOT NULL,
            PRIMARY KEY (account_id, channel)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_turns (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            run_id TEXT,
            turn_index BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            UNIQUE (conversation_id, turn_index)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_turns_account ON conversation_turns(account_id, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS sms_messages (
            id TEXT PRIMARY KEY,
            provider_message_id TEXT NOT NULL UNIQUE,
            direction TEXT NOT NULL,
            account_id TEXT,
            conversation_id TEXT,
            from_number TEXT NOT NULL,
            to_number TEXT,
            body TEXT NOT NULL,
            run_id TEXT,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS inbox_threads (
            id TEXT PRIMARY KEY,
            channel TEXT NOT NULL,
            address TEXT NOT NULL,
            account_id TEXT,
            contact_id TEXT,
            status TEXT NOT NULL,
            is_read BIGINT NOT NULL,
            assigned_to TEXT,
            last_message_at BIGINT NOT NULL,
            last_message_preview TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            UNIQUE (channel, address)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_threads_account ON inbox_threads(account_id, last_message_at)"#,
        r#"CREATE TABLE IF NOT EXISTS inbox_messages (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            channel TEXT NOT NULL,
            from_address TEXT NOT NULL,
            to_address TEXT,
            body TEXT NOT NULL,
            provider_message_id TEXT NOT NULL,
            run_id TEXT,
            created_at BIGINT NOT NULL,
            UNIQUE (channel, provider_message_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_inbox_messages_thread ON inbox_messages(thread_id, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS usage_records (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            cost BIGINT NOT NULL,
            run_id TEXT,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_usage_account ON usage_records(account_id, created_at)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

// --- phone links ---

pub async fn upsert_phone_link(pool: &AnyPool, kind: DbKind, record: &PhoneLinkRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO phone_links (phone_number, account_id, autopilot, verified_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(phone_number) DO UPDATE SET
               account_id=excluded.account_id,
               autopilot=excluded.autopilot,
               verified_at=excluded.verified_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.phone_number)
        .bind(&record.account_id)
        .bind(record.autopilot as i64)
        .bind(datetime_to_millis(record.verified_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_phone_link(pool: &AnyPool, kind: DbKind, phone_number: &str) -> Result<Option<PhoneLinkRecord>> {
    let sql = rewrite_sql(
        "SELECT phone_number, account_id, autopilot, verified_at FROM phone_links WHERE phone_number = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(phone_number)
        .fetch_optional(pool)
        .await?;

    if let Some(row) = row {
        let autopilot: i64 = row.try_get("autopilot")?;
        let verified_at: i64 = row.try_get("verified_at")?;
        return Ok(Some(PhoneLinkRecord {
            phone_number: row.try_get("phone_number")?,
            account_id: row.try_get("account_id")?,
            autopilot: autopilot != 0,
            verified_at: millis_to_datetime(verified_at),
        }));
    }
    Ok(None)
}

// --- conversations and turns ---

/// Serializes window lookups for one (account, channel) pair inside a transaction.
pub async fn lock_conversation_slot(
    conn: &mut AnyConnection,
    kind: DbKind,
    account_id: &str,
    channel: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversation_locks (account_id, channel, locked_at) VALUES (?, ?, ?)
           ON CONFLICT(account_id, channel) DO UPDATE SET locked_at=excluded.locked_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(channel)
        .bind(datetime_to_millis(now))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn conversation_from_row(row: &AnyRow) -> Result<ConversationRecord> {
    let created_at: i64 = row.try_get("created_at")?;
    let last_activity_at: i64 = row.try_get("last_activity_at")?;
    Ok(ConversationRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        channel: row.try_get("channel")?,
        created_at: millis_to_datetime(created_at),
        last_activity_at: millis_to_datetime(last_activity_at),
    })
}

pub async fn find_active_conversation(
    conn: &mut AnyConnection,
    kind: DbKind,
    account_id: &str,
    channel: &str,
    active_since: DateTime<Utc>,
) -> Result<Option<ConversationRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, account_id, channel, created_at, last_activity_at
           FROM conversations
           WHERE account_id = ? AND channel = ? AND last_activity_at >= ?
           ORDER BY last_activity_at DESC
           LIMIT 1"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(channel)
        .bind(datetime_to_millis(active_since))
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(conversation_from_row).transpose()
}

pub async fn insert_conversation(conn: &mut AnyConnection, kind: DbKind, record: &ConversationRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversations (id, account_id, channel, created_at, last_activity_at)
           VALUES (?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.channel)
        .bind(datetime_to_millis(record.created_at))
        .bind(datetime_to_millis(record.last_activity_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn touch_conversation(conn: &mut AnyConnection, kind: DbKind, id: &str, now: DateTime<Utc>) -> Result<()> {
    let sql = rewrite_sql("UPDATE conversations SET last_activity_at = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(now))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn next_turn_index(conn: &mut AnyConnection, kind: DbKind, conversation_id: &str) -> Result<i64> {
    let sql = rewrite_sql(
        "SELECT COALESCE(MAX(turn_index), 0) FROM conversation_turns WHERE conversation_id = ?",
        kind,
    );
    let current: i64 = sqlx::query_scalar(sql.as_ref())
        .bind(conversation_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(current + 1)
}

pub async fn insert_turn(conn: &mut AnyConnection, kind: DbKind, record: &TurnRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversation_turns (
            id, conversation_id, account_id, channel, role, content, run_id, turn_index, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(&record.account_id)
        .bind(&record.channel)
        .bind(&record.role)
        .bind(&record.content)
        .bind(record.run_id.as_deref())
        .bind(record.turn_index)
        .bind(datetime_to_millis(record.created_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Nullable TEXT columns are selected as `COALESCE(col, '')` because the Any
/// driver refuses to decode SQL NULL into `Option<String>`.
fn optional_text(row: &AnyRow, column: &str) -> Result<Option<String>> {
    let value: String = row.try_get(column)?;
    Ok(Some(value).filter(|v| !v.is_empty()))
}

fn turn_from_row(row: &AnyRow) -> Result<TurnRecord> {
    let created_at: i64 = row.try_get("created_at")?;
    Ok(TurnRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        account_id: row.try_get("account_id")?,
        channel: row.try_get("channel")?,
        role: row.try_get("role")?,
        content: row.try_get("content")?,
        run_id: optional_text(row, "run_id")?,
        turn_index: row.try_get("turn_index")?,
        created_at: millis_to_datetime(created_at),
    })
}

/// The latest `limit` turns of a conversation, returned oldest-first.
pub async fn list_conversation_turns(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    limit: i64,
) -> Result<Vec<TurnRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, conversation_id, account_id, channel, role, content, COALESCE(run_id, '') AS run_id, turn_index, created_at
           FROM conversation_turns WHERE conversation_id = ?
           ORDER BY turn_index DESC LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    let mut result = rows.iter().map(turn_from_row).collect::<Result<Vec<_>>>()?;
    result.reverse();
    Ok(result)
}

/// Recent turns for an account on every channel except `exclude_channel`, oldest-first.
pub async fn list_other_channel_turns(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    exclude_channel: &str,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<TurnRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, conversation_id, account_id, channel, role, content, COALESCE(run_id, '') AS run_id, turn_index, created_at
           FROM conversation_turns
           WHERE account_id = ? AND channel <> ? AND created_at >= ?
           ORDER BY created_at DESC, turn_index DESC LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(exclude_channel)
        .bind(datetime_to_millis(since))
        .bind(limit)
        .fetch_all(pool)
        .await?;
    let mut result = rows.iter().map(turn_from_row).collect::<Result<Vec<_>>>()?;
    result.reverse();
    Ok(result)
}

/// Most recent turns for an account across all channels, newest-first.
pub async fn list_recent_turns(pool: &AnyPool, kind: DbKind, account_id: &str, limit: i64) -> Result<Vec<TurnRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, conversation_id, account_id, channel, role, content, COALESCE(run_id, '') AS run_id, turn_index, created_at
           FROM conversation_turns WHERE account_id = ?
           ORDER BY created_at DESC, turn_index DESC LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(turn_from_row).collect()
}

pub async fn list_conversations(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    channel: &str,
) -> Result<Vec<ConversationRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, account_id, channel, created_at, last_activity_at
           FROM conversations WHERE account_id = ? AND channel = ?
           ORDER BY created_at ASC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(channel)
        .fetch_all(pool)
        .await?;
    rows.iter().map(conversation_from_row).collect()
}

// --- raw sms log ---

pub async fn sms_message_exists(pool: &AnyPool, kind: DbKind, provider_message_id: &str) -> Result<bool> {
    let sql = rewrite_sql("SELECT 1 FROM sms_messages WHERE provider_message_id = ? LIMIT 1", kind);
    let row = sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Returns false when a row with the same provider message id already exists.
pub async fn insert_sms_message(conn: &mut AnyConnection, kind: DbKind, record: &SmsMessageRecord) -> Result<bool> {
    let sql = rewrite_sql(
        r#"INSERT INTO sms_messages (
            id, provider_message_id, direction, account_id, conversation_id, from_number, to_number, body, run_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(provider_message_id) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.provider_message_id)
        .bind(&record.direction)
        .bind(record.account_id.as_deref())
        .bind(record.conversation_id.as_deref())
        .bind(&record.from_number)
        .bind(record.to_number.as_deref())
        .bind(&record.body)
        .bind(record.run_id.as_deref())
        .bind(datetime_to_millis(record.created_at))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_sms_messages(pool: &AnyPool, kind: DbKind, account_id: &str) -> Result<Vec<SmsMessageRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, provider_message_id, direction, COALESCE(account_id, '') AS account_id,
                  COALESCE(conversation_id, '') AS conversation_id, from_number,
                  COALESCE(to_number, '') AS to_number, body, COALESCE(run_id, '') AS run_id, created_at
           FROM sms_messages WHERE account_id = ? ORDER BY created_at ASC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(account_id).fetch_all(pool).await?;

    let mut result = Vec::new();
    for row in rows {
        let created_at: i64 = row.try_get("created_at")?;
        result.push(SmsMessageRecord {
            id: row.try_get("id")?,
            provider_message_id: row.try_get("provider_message_id")?,
            direction: row.try_get("direction")?,
            account_id: optional_text(&row, "account_id")?,
            conversation_id: optional_text(&row, "conversation_id")?,
            from_number: row.try_get("from_number")?,
            to_number: optional_text(&row, "to_number")?,
            body: row.try_get("body")?,
            run_id: optional_text(&row, "run_id")?,
            created_at: millis_to_datetime(created_at),
        });
    }
    Ok(result)
}

// --- inbox threads ---

const THREAD_COLUMNS: &str = "id, channel, address, COALESCE(account_id, '') AS account_id, \
     COALESCE(contact_id, '') AS contact_id, status, is_read, COALESCE(assigned_to, '') AS assigned_to, \
     last_message_at, COALESCE(last_message_preview, '') AS last_message_preview, created_at, updated_at";

fn thread_from_row(row: &AnyRow) -> Result<ThreadRecord> {
    let is_read: i64 = row.try_get("is_read")?;
    let last_message_at: i64 = row.try_get("last_message_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(ThreadRecord {
        id: row.try_get("id")?,
        channel: row.try_get("channel")?,
        address: row.try_get("address")?,
        account_id: optional_text(row, "account_id")?,
        contact_id: optional_text(row, "contact_id")?,
        status: row.try_get("status")?,
        is_read: is_read != 0,
        assigned_to: optional_text(row, "assigned_to")?,
        last_message_at: millis_to_datetime(last_message_at),
        last_message_preview: optional_text(row, "last_message_preview")?,
        created_at: millis_to_datetime(created_at),
        updated_at: millis_to_datetime(updated_at),
    })
}

/// Inserts the thread unless (channel, address) already has one.
pub async fn insert_thread_if_absent(pool: &AnyPool, kind: DbKind, record: &ThreadRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO inbox_threads (
            id, channel, address, account_id, contact_id, status, is_read, assigned_to,
            last_message_at, last_message_preview, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(channel, address) DO NOTHING"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.channel)
        .bind(&record.address)
        .bind(record.account_id.as_deref())
        .bind(record.contact_id.as_deref())
        .bind(&record.status)
        .bind(record.is_read as i64)
        .bind(record.assigned_to.as_deref())
        .bind(datetime_to_millis(record.last_message_at))
        .bind(record.last_message_preview.as_deref())
        .bind(datetime_to_millis(record.created_at))
        .bind(datetime_to_millis(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_thread(pool: &AnyPool, kind: DbKind, channel: &str, address: &str) -> Result<Option<ThreadRecord>> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM inbox_threads WHERE channel = ? AND address = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(channel)
        .bind(address)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(thread_from_row).transpose()
}

pub async fn get_thread(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<ThreadRecord>> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM inbox_threads WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(thread_from_row).transpose()
}

pub async fn list_threads_for_account(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<ThreadRecord>> {
    let sql = format!(
        "SELECT {THREAD_COLUMNS} FROM inbox_threads WHERE account_id = ? \
         ORDER BY last_message_at DESC LIMIT ? OFFSET ?"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(thread_from_row).collect()
}

/// Writes back the mutable metadata of a thread.
pub async fn update_thread(pool: &AnyPool, kind: DbKind, record: &ThreadRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE inbox_threads SET
            account_id=?, contact_id=?, status=?, is_read=?, assigned_to=?,
            last_message_at=?, last_message_preview=?, updated_at=?
           WHERE id=?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(record.account_id.as_deref())
        .bind(record.contact_id.as_deref())
        .bind(&record.status)
        .bind(record.is_read as i64)
        .bind(record.assigned_to.as_deref())
        .bind(datetime_to_millis(record.last_message_at))
        .bind(record.last_message_preview.as_deref())
        .bind(datetime_to_millis(record.updated_at))
        .bind(&record.id)
        .execute(pool)
        .await?;
    Ok(())
}

// --- inbox messages ---

/// Returns false when (channel, provider_message_id) was already recorded.
pub async fn insert_inbox_message_if_absent(pool: &AnyPool, kind: DbKind, record: &InboxMessageRecord) -> Result<bool> {
    let sql = rewrite_sql(
        r#"INSERT INTO inbox_messages (
            id, thread_id, direction, channel, from_address, to_address, body, provider_message_id, run_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(channel, provider_message_id) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.thread_id)
        .bind(&record.direction)
        .bind(&record.channel)
        .bind(&record.from_address)
        .bind(record.to_address.as_deref())
        .bind(&record.body)
        .bind(&record.provider_message_id)
        .bind(record.run_id.as_deref())
        .bind(datetime_to_millis(record.created_at))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn find_inbox_message_id(
    pool: &AnyPool,
    kind: DbKind,
    channel: &str,
    provider_message_id: &str,
) -> Result<Option<String>> {
    let sql = rewrite_sql(
        "SELECT id FROM inbox_messages WHERE channel = ? AND provider_message_id = ?",
        kind,
    );
    let id = sqlx::query_scalar::<_, String>(sql.as_ref())
        .bind(channel)
        .bind(provider_message_id)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

pub async fn list_thread_messages(
    pool: &AnyPool,
    kind: DbKind,
    thread_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<InboxMessageRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, thread_id, direction, channel, from_address, COALESCE(to_address, '') AS to_address,
                  body, provider_message_id, COALESCE(run_id, '') AS run_id, created_at
           FROM inbox_messages WHERE thread_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(thread_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    let mut result = Vec::new();
    for row in rows {
        let created_at: i64 = row.try_get("created_at")?;
        result.push(InboxMessageRecord {
            id: row.try_get("id")?,
            thread_id: row.try_get("thread_id")?,
            direction: row.try_get("direction")?,
            channel: row.try_get("channel")?,
            from_address: row.try_get("from_address")?,
            to_address: optional_text(&row, "to_address")?,
            body: row.try_get("body")?,
            provider_message_id: row.try_get("provider_message_id")?,
            run_id: optional_text(&row, "run_id")?,
            created_at: millis_to_datetime(created_at),
        });
    }
    Ok(result)
}

// --- usage ledger ---

pub async fn insert_usage(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    cost: i64,
    run_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "INSERT INTO usage_records (id, account_id, cost, run_id, created_at) VALUES (?, ?, ?, ?, ?)",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(cost)
        .bind(run_id)
        .bind(datetime_to_millis(now))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn sum_usage_since(pool: &AnyPool, kind: DbKind, account_id: &str, since: DateTime<Utc>) -> Result<i64> {
    let sql = rewrite_sql(
        "SELECT CAST(COALESCE(SUM(cost), 0) AS BIGINT) FROM usage_records WHERE account_id = ? AND created_at >= ?",
        kind,
    );
    let total: i64 = sqlx::query_scalar(sql.as_ref())
        .bind(account_id)
        .bind(datetime_to_millis(since))
        .fetch_one(pool)
        .await?;
    Ok(total)
}

pub async fn count_rows(pool: &AnyPool, table: &str) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(count)
}
