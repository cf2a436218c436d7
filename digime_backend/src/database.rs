use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::crypto::MessageCipher;
use crate::error::{DecryptionFault, StorageFault};

/// Who wrote a message, relative to the owner of this store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    FromContact,
    FromOwner,
}

impl Direction {
    fn as_db_str(self) -> &'static str {
        match self {
            Direction::FromContact => "from_contact",
            Direction::FromOwner => "from_owner",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "from_owner" => Direction::FromOwner,
            _ => Direction::FromContact,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Human,
    AiGenerated,
}

impl Origin {
    fn as_db_str(self) -> &'static str {
        match self {
            Origin::Human => "human",
            Origin::AiGenerated => "ai_generated",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ai_generated" => Origin::AiGenerated,
            _ => Origin::Human,
        }
    }
}

/// Decrypted message content. A message whose ciphertext cannot be opened is
/// still returned, marked unreadable, so the rest of the batch survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Unreadable(DecryptionFault),
}

impl Serialize for MessageBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(tag = "status", rename_all = "snake_case")]
        enum Repr<'a> {
            Readable { text: &'a str },
            Unreadable { reason: String },
        }

        match self {
            MessageBody::Text(text) => Repr::Readable { text }.serialize(serializer),
            MessageBody::Unreadable(fault) => Repr::Unreadable {
                reason: fault.to_string(),
            }
            .serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub contact: String,
    pub body: MessageBody,
    pub direction: Direction,
    pub origin: Origin,
    pub sender_label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            MessageBody::Unreadable(_) => None,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.direction == Direction::FromOwner
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub phone_number: String,
    pub name: Option<String>,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Row as stored, before decryption.
struct SealedRow {
    id: i64,
    contact: String,
    content: String,
    direction: String,
    origin: String,
    sender_label: Option<String>,
    created_at: DateTime<Utc>,
}

/// Encrypted, append-only conversation log plus the approved-contact registry.
///
/// Every statement runs under one connection mutex, so a dashboard read can
/// never observe a half-written message from the polling loop.
pub struct ConversationStore {
    conn: Mutex<Connection>,
    cipher: MessageCipher,
}

impl ConversationStore {
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StorageFault> {
        self.conn.lock().map_err(|_| StorageFault::LockPoisoned)
    }

    /// Open (or create) the store. Refuses to start without an encryption secret.
    pub fn open<P: AsRef<Path>>(path: P, secret: Option<&str>) -> Result<Self, StorageFault> {
        let secret = secret.ok_or(StorageFault::MissingSecret)?;
        let cipher = MessageCipher::from_secret(secret)?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

        let store = Self {
            conn: Mutex::new(conn),
            cipher,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StorageFault> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact TEXT NOT NULL,
                content TEXT NOT NULL,
                direction TEXT NOT NULL,
                origin TEXT NOT NULL,
                sender_name TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_contact_id ON chat_messages(contact, id DESC)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS approved_contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_number TEXT NOT NULL UNIQUE,
                name TEXT,
                added_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS poll_cursors (
                contact TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Conversation log
    // ========================================================================

    /// Encrypt and append one message; returns its id.
    ///
    /// Timestamps never go backwards within a contact's log, even if the wall
    /// clock does.
    pub fn append(
        &self,
        contact: &str,
        content: &str,
        direction: Direction,
        origin: Origin,
        sender_label: Option<&str>,
    ) -> Result<i64, StorageFault> {
        let sealed = self.cipher.encrypt(content)?;
        let conn = self.lock_conn()?;

        let last: Option<String> = conn
            .query_row(
                "SELECT created_at FROM chat_messages WHERE contact = ?1 ORDER BY id DESC LIMIT 1",
                [contact],
                |row| row.get(0),
            )
            .optional()?;
        let now = Utc::now();
        let created_at = last
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
            .map(|prev| prev.max(now))
            .unwrap_or(now);

        conn.execute(
            "INSERT INTO chat_messages (contact, content, direction, origin, sender_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contact,
                sealed,
                direction.as_db_str(),
                origin.as_db_str(),
                sender_label,
                created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The newest `limit` messages for a contact, oldest first.
    pub fn recent(&self, contact: &str, limit: usize) -> Result<Vec<ChatMessage>, StorageFault> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, contact, content, direction, origin, sender_name, created_at
                 FROM chat_messages
                 WHERE contact = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![contact, limit], sealed_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        // Reverse to get chronological order
        Ok(rows.into_iter().rev().map(|row| self.open_row(row)).collect())
    }

    /// Every contact that has a log, each with its most recent window.
    pub fn all_conversations(
        &self,
        limit_per_contact: usize,
    ) -> Result<BTreeMap<String, Vec<ChatMessage>>, StorageFault> {
        let contacts = {
            let conn = self.lock_conn()?;
            let mut stmt =
                conn.prepare("SELECT DISTINCT contact FROM chat_messages ORDER BY contact ASC")?;
            let contacts = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            contacts
        };

        let mut conversations = BTreeMap::new();
        for contact in contacts {
            let messages = self.recent(&contact, limit_per_contact)?;
            conversations.insert(contact, messages);
        }
        Ok(conversations)
    }

    fn open_row(&self, row: SealedRow) -> ChatMessage {
        let body = match self.cipher.decrypt(&row.content) {
            Ok(text) => MessageBody::Text(text),
            Err(fault) => {
                tracing::warn!(
                    "Message {} for {} is unreadable: {}",
                    row.id,
                    row.contact,
                    fault
                );
                MessageBody::Unreadable(fault)
            }
        };
        ChatMessage {
            id: row.id,
            contact: row.contact,
            body,
            direction: Direction::from_db(&row.direction),
            origin: Origin::from_db(&row.origin),
            sender_label: row.sender_label,
            created_at: row.created_at,
        }
    }

    // ========================================================================
    // Contact registry
    // ========================================================================

    /// Register a contact (idempotent); returns its id.
    pub fn register_contact(&self, phone: &str, name: Option<&str>) -> Result<i64, StorageFault> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO approved_contacts (phone_number, name, added_at, is_active)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(phone_number) DO UPDATE SET
                name = COALESCE(excluded.name, approved_contacts.name)",
            params![phone, name, Utc::now().to_rfc3339()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM approved_contacts WHERE phone_number = ?1",
            [phone],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn is_registered(&self, phone: &str) -> Result<bool, StorageFault> {
        let conn = self.lock_conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM approved_contacts WHERE phone_number = ?1 AND is_active = 1",
                [phone],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Active contacts, in registration order.
    pub fn list_contacts(&self) -> Result<Vec<Contact>, StorageFault> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, phone_number, name, added_at, is_active FROM approved_contacts
             WHERE is_active = 1
             ORDER BY id ASC",
        )?;

        let contacts = stmt
            .query_map([], |row| {
                Ok(Contact {
                    id: row.get(0)?,
                    phone_number: row.get(1)?,
                    name: row.get(2)?,
                    added_at: parse_timestamp(3, row.get::<_, String>(3)?)?,
                    is_active: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(contacts)
    }

    // ========================================================================
    // Poll cursors (only used when cursor persistence is enabled)
    // ========================================================================

    pub fn load_cursor(&self, contact: &str) -> Result<Option<usize>, StorageFault> {
        let conn = self.lock_conn()?;
        let position: Option<i64> = conn
            .query_row(
                "SELECT position FROM poll_cursors WHERE contact = ?1",
                [contact],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.map(|p| p.max(0) as usize))
    }

    pub fn save_cursor(&self, contact: &str, position: usize) -> Result<(), StorageFault> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO poll_cursors (contact, position, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(contact) DO UPDATE SET
                position = excluded.position,
                updated_at = excluded.updated_at",
            params![contact, position as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn sealed_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SealedRow> {
    Ok(SealedRow {
        id: row.get(0)?,
        contact: row.get(1)?,
        content: row.get(2)?,
        direction: row.get(3)?,
        origin: row.get(4)?,
        sender_label: row.get(5)?,
        created_at: parse_timestamp(6, row.get::<_, String>(6)?)?,
    })
}

fn parse_timestamp(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store(secret: &str) -> (TempDir, ConversationStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            ConversationStore::open(dir.path().join("chat_history.db"), Some(secret)).expect("store");
        (dir, store)
    }

    fn texts(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().filter_map(|m| m.text()).collect()
    }

    #[test]
    fn refuses_to_open_without_secret() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = ConversationStore::open(dir.path().join("chat.db"), None);
        assert!(matches!(result, Err(StorageFault::MissingSecret)));
    }

    #[test]
    fn recent_returns_newest_window_oldest_first() {
        let (_dir, store) = temp_store("secret");
        for text in ["one", "two", "three", "four"] {
            store
                .append("+1555", text, Direction::FromContact, Origin::Human, None)
                .expect("append");
        }
        store
            .append("+1666", "elsewhere", Direction::FromContact, Origin::Human, None)
            .expect("append");

        let window = store.recent("+1555", 3).expect("recent");
        assert_eq!(texts(&window), vec!["two", "three", "four"]);
        assert!(window
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at && pair[0].id < pair[1].id));

        let again = store.recent("+1555", 3).expect("recent");
        assert_eq!(texts(&again), texts(&window));

        assert!(store.recent("+1555", 0).expect("recent").is_empty());
        assert_eq!(store.recent("+1555", 50).expect("recent").len(), 4);
    }

    #[test]
    fn append_keeps_direction_origin_and_label() {
        let (_dir, store) = temp_store("secret");
        store
            .append("+1555", "hi", Direction::FromContact, Origin::Human, Some("+1555"))
            .expect("append");
        store
            .append("+1555", "hello!", Direction::FromOwner, Origin::AiGenerated, None)
            .expect("append");

        let log = store.recent("+1555", 10).expect("recent");
        assert_eq!(log[0].direction, Direction::FromContact);
        assert_eq!(log[0].origin, Origin::Human);
        assert_eq!(log[0].sender_label.as_deref(), Some("+1555"));
        assert!(log[1].is_owner());
        assert_eq!(log[1].origin, Origin::AiGenerated);
    }

    #[test]
    fn content_is_ciphertext_on_disk() {
        let (_dir, store) = temp_store("secret");
        store
            .append("+1555", "very private words", Direction::FromContact, Origin::Human, None)
            .expect("append");

        let conn = store.lock_conn().expect("conn");
        let raw: String = conn
            .query_row("SELECT content FROM chat_messages LIMIT 1", [], |row| row.get(0))
            .expect("raw row");
        assert!(!raw.contains("private"));
    }

    #[test]
    fn unreadable_message_does_not_fail_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chat.db");

        {
            let store = ConversationStore::open(&path, Some("old-key")).expect("store");
            store
                .append("+1555", "written with old key", Direction::FromContact, Origin::Human, None)
                .expect("append");
        }

        let store = ConversationStore::open(&path, Some("new-key")).expect("store");
        store
            .append("+1555", "written with new key", Direction::FromContact, Origin::Human, None)
            .expect("append");

        let log = store.recent("+1555", 10).expect("recent");
        assert_eq!(log.len(), 2);
        assert_eq!(
            log[0].body,
            MessageBody::Unreadable(DecryptionFault::Authentication)
        );
        assert_eq!(log[1].text(), Some("written with new key"));

        let json = serde_json::to_value(&log[0]).expect("serialize");
        assert_eq!(json["body"]["status"], "unreadable");
    }

    #[test]
    fn all_conversations_groups_by_contact() {
        let (_dir, store) = temp_store("secret");
        for i in 0..5 {
            store
                .append("+1555", &format!("a{i}"), Direction::FromContact, Origin::Human, None)
                .expect("append");
        }
        store
            .append("+1666", "b0", Direction::FromOwner, Origin::Human, None)
            .expect("append");

        let all = store.all_conversations(2).expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(texts(&all["+1555"]), vec!["a3", "a4"]);
        assert_eq!(texts(&all["+1666"]), vec!["b0"]);
    }

    #[test]
    fn contact_registry_is_idempotent() {
        let (_dir, store) = temp_store("secret");
        assert!(!store.is_registered("+1555").expect("lookup"));

        let first = store.register_contact("+1555", None).expect("register");
        let second = store.register_contact("+1555", Some("Sam")).expect("register");
        assert_eq!(first, second);
        store.register_contact("+1666", None).expect("register");

        assert!(store.is_registered("+1555").expect("lookup"));
        let contacts = store.list_contacts().expect("list");
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].phone_number, "+1555");
        assert_eq!(contacts[0].name.as_deref(), Some("Sam"));
        assert!(contacts.iter().all(|c| c.is_active));
    }

    #[test]
    fn cursor_round_trips() {
        let (_dir, store) = temp_store("secret");
        assert_eq!(store.load_cursor("+1555").expect("load"), None);
        store.save_cursor("+1555", 3).expect("save");
        store.save_cursor("+1555", 5).expect("save");
        assert_eq!(store.load_cursor("+1555").expect("load"), Some(5));
    }
}
