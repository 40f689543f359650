use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SessionError;

pub mod manager;
pub mod naming;
pub mod transfer;

pub use manager::{Created, SessionManager};
pub use naming::NamingLimits;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,

    /// Anything else found in a stored session. Adapters skip these.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown message role {other:?}")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new<T: Into<String>>(role: Role, content: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            timestamp,
        }
    }

    pub fn user<T: Into<String>>(content: T) -> Self {
        Self::new(Role::User, content, Utc::now())
    }

    pub fn assistant<T: Into<String>>(content: T) -> Self {
        Self::new(Role::Assistant, content, Utc::now())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ChatSession {
    pub fn new<N: Into<String>, P: Into<String>>(name: N, system_prompt: P) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            is_active: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Content of the most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub(crate) fn append(&mut self, message: Message) {
        self.updated_at = message.timestamp.max(self.updated_at);
        self.messages.push(message);
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Registry of live sessions plus the name index and active pointer.
///
/// Only [`SessionManager`] mutates a store; everything here is plumbing that
/// keeps the three structures addressable.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, ChatSession>,
    names: HashMap<String, String>,
    active_id: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    sessions: Vec<ChatSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a store saved with [`SessionStore::save`]. A missing file is an
    /// empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SessionError> {
        let path = path.as_ref();
        if !path.is_file() {
            debug!(path=?path, "No session store, starting empty");
            return Ok(Self::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let file: StoreFile = serde_yml::from_reader(reader)?;

        let mut store = Self::new();
        for mut session in file.sessions {
            session.is_active = file.active.as_deref() == Some(session.id.as_str());
            store.insert(session);
        }
        store.active_id = file.active.filter(|id| store.sessions.contains_key(id));

        info!(path=?path, count=store.len(), "Loaded session store");
        Ok(store)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SessionError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let file = StoreFile {
            active: self.active_id.clone(),
            sessions: self.sorted().into_iter().cloned().collect(),
        };

        let mut writer = BufWriter::new(transfer::create_private(path)?);
        serde_yml::to_writer(&mut writer, &file)?;
        writer.flush()?;

        debug!(path=?path, count=self.len(), "Saved session store");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.get(id)
    }

    pub fn id_for_name(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(|s| s.as_str())
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Sessions ordered by creation time, oldest first.
    pub fn sorted(&self) -> Vec<&ChatSession> {
        let ordered: BTreeMap<_, _> = self
            .sessions
            .values()
            .map(|s| ((s.created_at, s.id.as_str()), s))
            .collect();
        ordered.into_values().collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(|s| s.as_str())
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut ChatSession> {
        self.sessions.get_mut(id)
    }

    pub(crate) fn insert(&mut self, session: ChatSession) {
        debug_assert!(
            self.names.get(&session.name).map_or(true, |id| *id == session.id),
            "session name {:?} already taken",
            session.name
        );
        self.names.insert(session.name.clone(), session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<ChatSession> {
        let session = self.sessions.remove(id)?;
        self.names.remove(&session.name);
        if self.active_id.as_deref() == Some(id) {
            self.active_id = None;
        }
        Some(session)
    }

    /// Moves the active flag to `id` (or clears it). Both the flag on the
    /// sessions and the pointer change together.
    pub(crate) fn activate(&mut self, id: Option<&str>) {
        if let Some(previous) = self.active_id.take() {
            if let Some(session) = self.sessions.get_mut(&previous) {
                session.is_active = false;
            }
        }

        if let Some(session) = id.and_then(|id| self.sessions.get_mut(id)) {
            session.is_active = true;
            self.active_id = Some(session.id.clone());
        }
    }
}
