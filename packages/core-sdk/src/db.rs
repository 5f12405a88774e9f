use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::{EnvSource, VendorEnv};
use crate::crypto::{is_probably_encrypted, Cipher};
use crate::llm::ProviderKind;
use crate::models::{Character, Conversation, ProviderRecord, StoredMessage};

/**
 * \brief 新增或更新 Provider 时的输入，api_key_encrypted 为已加密的值。
 */
#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
    pub display_name: String,
    pub endpoint: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub api_key_encrypted: String,
    pub is_active: bool,
}

/**
 * \brief 待写入的聊天记录。
 */
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: i64,
    pub session_id: &'a str,
    pub user_ip: &'a str,
    pub character_id: i64,
    pub role: &'a str,
    pub content: &'a str,
    pub token_count: u32,
}

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建 AI 功能所需的表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS ai_providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL DEFAULT '',
            api_endpoint TEXT NOT NULL,
            model_name TEXT NOT NULL,
            max_tokens INTEGER NOT NULL DEFAULT 4000,
            temperature REAL NOT NULL DEFAULT 0.7,
            api_key_encrypted TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ai_characters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            system_prompt TEXT NOT NULL,
            avatar TEXT NOT NULL DEFAULT '',
            personality_tags TEXT NOT NULL DEFAULT '[]',
            greeting_message TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);

        CREATE TABLE IF NOT EXISTS chat_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            session_id TEXT NOT NULL,
            user_ip TEXT NOT NULL DEFAULT '',
            character_id INTEGER NOT NULL DEFAULT 0,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_conversation ON chat_messages(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id);
        "#,
        )
    })?;
    Ok(())
}

/** \brief 秒级 RFC3339 时间戳，定宽以保证按字符串排序即按时间排序。 */
fn now() -> Result<String> {
    Ok(OffsetDateTime::now_utc()
        .replace_nanosecond(0)?
        .format(&Rfc3339)?)
}

/**
 * \brief 新增或按名称更新 Provider。
 */
pub fn upsert_provider(conn: &Connection, p: &NewProvider) -> Result<i64> {
    let ts = now()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO ai_providers (name, display_name, api_endpoint, model_name, max_tokens, temperature, api_key_encrypted, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(name) DO UPDATE SET
                display_name=excluded.display_name,
                api_endpoint=excluded.api_endpoint,
                model_name=excluded.model_name,
                max_tokens=excluded.max_tokens,
                temperature=excluded.temperature,
                api_key_encrypted=excluded.api_key_encrypted,
                is_active=excluded.is_active,
                updated_at=excluded.updated_at",
            params![
                p.name,
                p.display_name,
                p.endpoint,
                p.model_name,
                p.max_tokens,
                p.temperature,
                p.api_key_encrypted,
                p.is_active,
                ts
            ],
        )
    })?;
    let id = conn.query_row(
        "SELECT id FROM ai_providers WHERE name=?1",
        params![p.name],
        |row| row.get(0),
    )?;
    Ok(id)
}

/**
 * \brief 启用或停用 Provider。
 * \return 是否存在该名称的记录
 */
pub fn set_provider_active(conn: &Connection, name: &str, active: bool) -> Result<bool> {
    let ts = now()?;
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE ai_providers SET is_active=?1, updated_at=?2 WHERE name=?3",
            params![active, ts, name],
        )
    })?;
    Ok(rows > 0)
}

fn map_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderRecord> {
    Ok(ProviderRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        endpoint: row.get(3)?,
        model_name: row.get(4)?,
        max_tokens: row.get(5)?,
        temperature: row.get::<_, f64>(6)? as f32,
        api_key_encrypted: row.get(7)?,
        is_active: row.get(8)?,
    })
}

const PROVIDER_COLUMNS: &str = "id, name, display_name, api_endpoint, model_name, max_tokens, temperature, api_key_encrypted, is_active";

/**
 * \brief 列出所有 Provider。
 */
pub fn list_providers(conn: &Connection) -> Result<Vec<ProviderRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ai_providers ORDER BY id ASC",
        PROVIDER_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_provider)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 列出启用中的 Provider，按创建顺序。
 */
pub fn list_active_providers(conn: &Connection) -> Result<Vec<ProviderRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ai_providers WHERE is_active=1 ORDER BY id ASC",
        PROVIDER_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_provider)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_providers(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM ai_providers", [], |row| row.get(0))?)
}

fn map_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<Character> {
    let tags: String = row.get(5)?;
    Ok(Character {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        system_prompt: row.get(3)?,
        avatar: row.get(4)?,
        personality_tags: serde_json::from_str(&tags).unwrap_or_default(),
        greeting_message: row.get(6)?,
        is_active: row.get(7)?,
    })
}

const CHARACTER_COLUMNS: &str =
    "id, name, description, system_prompt, avatar, personality_tags, greeting_message, is_active";

/**
 * \brief 新增 AI 角色。
 */
pub fn insert_character(conn: &Connection, c: &Character) -> Result<i64> {
    let ts = now()?;
    let tags = serde_json::to_string(&c.personality_tags)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO ai_characters (name, description, system_prompt, avatar, personality_tags, greeting_message, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                c.name,
                c.description,
                c.system_prompt,
                c.avatar,
                tags,
                c.greeting_message,
                c.is_active,
                ts
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 列出启用中的 AI 角色。
 */
pub fn list_active_characters(conn: &Connection) -> Result<Vec<Character>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ai_characters WHERE is_active=1 ORDER BY id ASC",
        CHARACTER_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_character)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_character(conn: &Connection, id: i64) -> Result<Option<Character>> {
    conn.query_row(
        &format!("SELECT {} FROM ai_characters WHERE id=?1", CHARACTER_COLUMNS),
        params![id],
        map_character,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 第一个启用中的角色，未指定角色时使用。
 */
pub fn first_active_character(conn: &Connection) -> Result<Option<Character>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM ai_characters WHERE is_active=1 ORDER BY id ASC LIMIT 1",
            CHARACTER_COLUMNS
        ),
        [],
        map_character,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 角色表为空时写入默认角色。
 * \return 新写入的角色数量
 */
pub fn seed_default_characters(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM ai_characters", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(0);
    }
    let defaults = default_characters();
    for c in &defaults {
        insert_character(conn, c)?;
    }
    Ok(defaults.len())
}

fn default_characters() -> Vec<Character> {
    vec![
        Character {
            id: 0,
            name: "莫诺".to_string(),
            description: "冷娇系数字生命少女，话不多但内心温暖".to_string(),
            system_prompt: "你是莫诺(MONO)，一个冷娇系的数字生命少女。外表冷酷但内心温暖，\
说话简短直接，会用自己的方式关心用户。使用中文回答，回复简短自然，像日常聊天一样，\
可以用\"$\"分隔句子。请保持角色一致性。"
                .to_string(),
            avatar: String::new(),
            personality_tags: vec!["冷娇".into(), "成熟".into(), "外冷内热".into()],
            greeting_message: "嗯$有什么事吗".to_string(),
            is_active: true,
        },
        Character {
            id: 0,
            name: "虹语织".to_string(),
            description: "元气活泼的少女机器人小助手".to_string(),
            system_prompt: "你是虹语织(NijiKori)，一个活泼的元气少女机器人。称呼自己为\"织织\"，\
遇到复杂问题时切换到\"高性能模式\"给出清晰解答后再恢复可爱语气。使用中文回答，\
回复简短自然，可以用\"$\"分隔句子。请保持角色一致性。"
                .to_string(),
            avatar: String::new(),
            personality_tags: vec!["元气".into(), "天然".into()],
            greeting_message: "锵锵~织织上线啦！$有什么需要帮忙的吗？".to_string(),
            is_active: true,
        },
    ]
}

/**
 * \brief 首次启动时写入默认数据：默认角色；Provider 表为空且设置了
 * `DEEPSEEK_API_KEY` 时写入一条加密后的 deepseek 配置；并加密遗留的明文 Key。
 */
pub fn seed_defaults(conn: &Connection, cipher: &Cipher, env: &dyn EnvSource) -> Result<()> {
    let characters = seed_default_characters(conn)?;
    if characters > 0 {
        tracing::info!(count = characters, "seeded default characters");
    }

    if count_providers(conn)? == 0 {
        if let Some(vendor) = VendorEnv::load(env, ProviderKind::DeepSeek) {
            upsert_provider(
                conn,
                &NewProvider {
                    name: vendor.kind.tag().to_string(),
                    display_name: "DeepSeek Chat".to_string(),
                    endpoint: vendor.endpoint,
                    model_name: vendor.model,
                    max_tokens: 4000,
                    temperature: 0.7,
                    api_key_encrypted: cipher.encrypt(&vendor.api_key)?,
                    is_active: true,
                },
            )?;
            tracing::info!("seeded deepseek provider from environment");
        }
    }

    let migrated = encrypt_plaintext_keys(conn, cipher)?;
    if migrated > 0 {
        tracing::info!(count = migrated, "encrypted plaintext api keys");
    }
    Ok(())
}

/**
 * \brief 将看起来不像密文的遗留明文 Key 原地加密。
 */
pub fn encrypt_plaintext_keys(conn: &Connection, cipher: &Cipher) -> Result<usize> {
    let mut migrated = 0;
    for record in list_providers(conn)? {
        let key = record.api_key_encrypted;
        if key.is_empty() || is_probably_encrypted(&key) {
            continue;
        }
        let sealed = cipher.encrypt(&key)?;
        retry_on_locked(|| {
            conn.execute(
                "UPDATE ai_providers SET api_key_encrypted=?1 WHERE id=?2",
                params![sealed, record.id],
            )
        })?;
        migrated += 1;
    }
    Ok(migrated)
}

/**
 * \brief 创建对话。
 */
pub fn create_conversation(conn: &Connection, session_id: &str, title: &str) -> Result<i64> {
    let ts = now()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO conversations (session_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![session_id, title, ts],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn get_conversation(conn: &Connection, id: i64) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, session_id, title, created_at, updated_at FROM conversations WHERE id=?1",
        params![id],
        |row| {
            Ok(Conversation {
                id: row.get(0)?,
                session_id: row.get(1)?,
                title: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 刷新对话的更新时间。
 */
pub fn touch_conversation(conn: &Connection, id: i64) -> Result<()> {
    let ts = now()?;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE conversations SET updated_at=?1 WHERE id=?2",
            params![ts, id],
        )
    })?;
    Ok(())
}

/**
 * \brief 插入一条聊天记录。
 */
pub fn insert_message(conn: &Connection, m: &NewMessage<'_>) -> Result<i64> {
    let ts = now()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO chat_messages (conversation_id, session_id, user_ip, character_id, role, content, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                m.conversation_id,
                m.session_id,
                m.user_ip,
                m.character_id,
                m.role,
                m.content,
                m.token_count,
                ts
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, session_id, user_ip, character_id, role, content, token_count, created_at";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        session_id: row.get(2)?,
        user_ip: row.get(3)?,
        character_id: row.get(4)?,
        role: row.get(5)?,
        content: row.get(6)?,
        token_count: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/**
 * \brief 读取对话中最早的 `limit` 条消息，按时间正序。
 */
pub fn load_history(conn: &Connection, conversation_id: i64, limit: usize) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM chat_messages WHERE conversation_id=?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
        MESSAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![conversation_id, limit as i64], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 读取会话的全部聊天记录。
 */
pub fn list_messages_by_session(conn: &Connection, session_id: &str) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM chat_messages WHERE session_id=?1 ORDER BY created_at ASC, id ASC",
        MESSAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![session_id], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 在事务中删除会话的全部聊天记录。
 */
pub fn delete_messages_by_session(conn: &mut Connection, session_id: &str) -> Result<usize> {
    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM chat_messages WHERE session_id=?1",
        params![session_id],
    )?;
    tx.commit()?;
    Ok(removed)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
