use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use super::{new_id, ChatSession, Message, Role, SessionManager, DEFAULT_SYSTEM_PROMPT};
use crate::error::SessionError;

/// Opens `path` for writing, truncating, readable only by the owner.
pub(crate) fn create_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open(path)
}

/// Permissive view of an exported session. Identity fields are read but
/// replaced on import.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFile {
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    messages: Vec<MessageFile>,
}

#[derive(Deserialize)]
struct MessageFile {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl SessionManager {
    /// Writes the session verbatim as pretty JSON.
    pub fn export_to_json<P: AsRef<Path>>(
        &self,
        name_or_id: &str,
        path: P,
    ) -> Result<(), SessionError> {
        let path = path.as_ref();
        let session = self.get_by_name_or_id(name_or_id)?;
        let json = serde_json::to_string_pretty(session)?;

        let mut writer = BufWriter::new(create_private(path)?);
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        info!(id = %session.id, path = ?path, "Exported session");
        Ok(())
    }

    /// Reads an exported session and adds it under a new id and generated
    /// name, marked active. The system prompt and messages (with their
    /// timestamps) are kept.
    pub fn import_from_json<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<&ChatSession, SessionError> {
        let path = path.as_ref();
        let file: SessionFile = serde_json::from_str(&fs::read_to_string(path)?)?;

        let now = Utc::now();
        let system_prompt = file
            .system_prompt
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        let mut session = ChatSession::new(String::new(), system_prompt);
        session.messages = file
            .messages
            .into_iter()
            .map(|m| Message {
                id: new_id(),
                role: m.role,
                content: m.content,
                timestamp: m.timestamp.unwrap_or(now),
            })
            .collect();

        let imported = self.adopt(session)?;
        info!(id = %imported.id, name = %imported.name, path = ?path, "Imported session");
        Ok(imported)
    }
}
