use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::naming::{self, NamingLimits};
use super::{new_id, ChatSession, Message, Role, SessionStore, DEFAULT_SYSTEM_PROMPT};
use crate::error::SessionError;

/// Outcome of creating or copying a session.
#[derive(Debug, Clone)]
pub struct Created {
    pub session: ChatSession,
    /// Set when the requested name was taken or reserved and the session was
    /// stored under a versioned name instead.
    pub warning: Option<String>,
}

/// Owns the session registry and enforces its invariants: unique names, at
/// most one active session, append-only message lists.
///
/// Mutations take `&mut self`; callers serialize access.
#[derive(Debug, Default)]
pub struct SessionManager {
    store: SessionStore,
    limits: NamingLimits,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            limits: NamingLimits::default(),
        }
    }

    pub fn with_limits(self, limits: NamingLimits) -> Self {
        Self { limits, ..self }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn into_store(self) -> SessionStore {
        self.store
    }

    pub fn validate_name(&self, raw: &str) -> Result<String, SessionError> {
        naming::validate_name(raw)
    }

    pub fn generate_default_name(&self) -> String {
        naming::generate_default(&self.store, &self.limits)
    }

    pub fn list_sessions(&self) -> Vec<&ChatSession> {
        self.store.sorted()
    }

    pub fn active(&self) -> Option<&ChatSession> {
        self.store.active_id().and_then(|id| self.store.get(id))
    }

    #[instrument(skip(self, system_prompt, initial_message))]
    pub fn create_session(
        &mut self,
        name: &str,
        system_prompt: &str,
        initial_message: &str,
    ) -> Result<Created, SessionError> {
        let requested = naming::validate_name(name)?;
        let (name, warning) = self.versioned(&requested);

        let system_prompt = if system_prompt.is_empty() {
            DEFAULT_SYSTEM_PROMPT
        } else {
            system_prompt
        };

        let mut session = ChatSession::new(name, system_prompt);
        if !initial_message.is_empty() {
            let message = Message::new(Role::User, initial_message, session.created_at);
            session.append(message);
        }

        let id = session.id.clone();
        self.store.insert(session);
        self.store.activate(Some(&id));

        info!(id = %id, "Created session");
        Ok(Created {
            session: self.session(&id)?.clone(),
            warning,
        })
    }

    pub fn get_by_id(&self, id: &str) -> Result<&ChatSession, SessionError> {
        self.store.get(id).ok_or_else(|| SessionError::NotFound {
            identifier: id.to_string(),
            attempted: vec!["id".to_string()],
        })
    }

    pub fn get_by_name(&self, name: &str) -> Result<&ChatSession, SessionError> {
        self.store
            .id_for_name(name)
            .and_then(|id| self.store.get(id))
            .ok_or_else(|| SessionError::NotFound {
                identifier: name.to_string(),
                attempted: vec!["name".to_string()],
            })
    }

    /// Exact name first, then exact id.
    pub fn get_by_name_or_id(&self, identifier: &str) -> Result<&ChatSession, SessionError> {
        self.get_by_name(identifier)
            .or_else(|_| self.store.get(identifier).ok_or(()))
            .map_err(|_| SessionError::NotFound {
                identifier: identifier.to_string(),
                attempted: vec!["name".to_string(), "id".to_string()],
            })
    }

    /// Resolves a user-typed identifier: exact name, exact id, then a unique
    /// case-insensitive name prefix. An exact name always wins over a prefix
    /// match on a longer name.
    pub fn find_by_prefix(&self, identifier: &str) -> Result<&ChatSession, SessionError> {
        if let Ok(session) = self.get_by_name_or_id(identifier) {
            return Ok(session);
        }

        let needle = identifier.to_lowercase();
        let mut matches: Vec<&str> = self
            .store
            .names()
            .filter(|name| name.to_lowercase().starts_with(&needle))
            .collect();
        matches.sort_unstable();

        match matches.as_slice() {
            [] => Err(SessionError::NotFound {
                identifier: identifier.to_string(),
                attempted: vec!["name".to_string(), "id".to_string(), "name prefix".to_string()],
            }),
            [name] => self.get_by_name(name),
            _ => Err(SessionError::Ambiguous {
                identifier: identifier.to_string(),
                matches: matches.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    #[instrument(skip(self))]
    pub fn set_active(&mut self, name_or_id: &str) -> Result<&ChatSession, SessionError> {
        let id = self.get_by_name_or_id(name_or_id)?.id.clone();
        self.store.activate(Some(&id));

        debug!(id = %id, "Activated session");
        self.session(&id)
    }

    /// Appends a message and makes the session the active one.
    #[instrument(skip(self, content))]
    pub fn add_message(
        &mut self,
        name_or_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, SessionError> {
        let id = self.get_by_name_or_id(name_or_id)?.id.clone();
        let message = Message::new(role, content, Utc::now());

        if let Some(session) = self.store.get_mut(&id) {
            session.append(message.clone());
        }
        self.store.activate(Some(&id));

        debug!(id = %id, message_id = %message.id, "Appended message");
        Ok(message)
    }

    #[instrument(skip(self))]
    pub fn delete_session(&mut self, name_or_id: &str) -> Result<ChatSession, SessionError> {
        let id = self.get_by_name_or_id(name_or_id)?.id.clone();
        let removed = self.session(&id)?.clone();
        self.store.remove(&id);

        info!(id = %id, name = %removed.name, "Deleted session");
        Ok(removed)
    }

    /// Copies system prompt and messages into a new session. The active
    /// pointer does not move.
    #[instrument(skip(self))]
    pub fn copy_session(
        &mut self,
        source: &str,
        target_name: Option<&str>,
    ) -> Result<Created, SessionError> {
        let source = self.find_by_prefix(source)?.clone();

        let (name, warning) = match target_name.filter(|n| !n.trim().is_empty()) {
            Some(raw) => {
                let requested = naming::validate_name(raw)?;
                self.versioned(&requested)
            }
            None => (self.generate_default_name(), None),
        };

        let mut copy = ChatSession::new(name, source.system_prompt.clone());
        for message in &source.messages {
            copy.append(Message {
                id: new_id(),
                ..message.clone()
            });
        }
        copy.updated_at = copy.created_at;

        let id = copy.id.clone();
        self.store.insert(copy);

        info!(id = %id, source = %source.id, "Copied session");
        Ok(Created {
            session: self.session(&id)?.clone(),
            warning,
        })
    }

    /// Adds an already-built session (e.g. from an import) under a fresh
    /// generated name and identity, and activates it.
    pub(crate) fn adopt(&mut self, mut session: ChatSession) -> Result<&ChatSession, SessionError> {
        let now = Utc::now();
        session.id = new_id();
        session.name = self.generate_default_name();
        session.created_at = now;
        session.updated_at = now;
        session.is_active = false;

        let id = session.id.clone();
        self.store.insert(session);
        self.store.activate(Some(&id));
        self.session(&id)
    }

    fn versioned(&self, requested: &str) -> (String, Option<String>) {
        let name = naming::resolve_versioned(&self.store, requested, &self.limits);
        if name == requested {
            return (name, None);
        }

        let reason = if naming::is_reserved(requested) { "is reserved" } else { "already exists" };
        let warning = format!("session name {requested:?} {reason}, using {name:?}");
        warn!("{warning}");
        (name, Some(warning))
    }

    fn session(&self, id: &str) -> Result<&ChatSession, SessionError> {
        self.get_by_id(id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(SessionStore::new())
    }

    fn active_names(m: &SessionManager) -> Vec<String> {
        m.list_sessions()
            .into_iter()
            .filter(|s| s.is_active)
            .map(|s| s.name.clone())
            .collect()
    }

    #[test]
    fn create_two_sessions_second_active() {
        let mut m = manager();
        let a = m.create_session("alpha", "", "").unwrap().session;
        let b = m.create_session("beta", "", "").unwrap().session;

        assert_ne!(a.id, b.id);
        assert_eq!(m.store().len(), 2);
        assert_eq!(active_names(&m), vec!["beta"]);
        assert_eq!(m.active().unwrap().id, b.id);
    }

    #[test]
    fn duplicate_name_is_versioned_with_warning() {
        let mut m = manager();
        let first = m.create_session("notes", "", "").unwrap();
        let second = m.create_session("notes", "", "").unwrap();

        assert!(first.warning.is_none());
        assert_eq!(second.session.name, "notes:v1");
        assert!(second.warning.unwrap().contains("already exists"));
        assert_eq!(m.get_by_name("notes").unwrap().id, first.session.id);
        assert_eq!(m.get_by_name("notes:v1").unwrap().id, second.session.id);
    }

    #[test]
    fn reserved_name_is_versioned() {
        let mut m = manager();
        let created = m.create_session("Default", "", "").unwrap();

        assert_eq!(created.session.name, "Default:v1");
        assert!(created.warning.unwrap().contains("reserved"));
    }

    #[test]
    fn create_rejects_invalid_name() {
        let mut m = manager();
        assert_matches!(m.create_session("  ", "", ""), Err(SessionError::InvalidName(_)));
        assert!(m.store().is_empty());
    }

    #[test]
    fn create_defaults_prompt_and_records_initial_message() {
        let mut m = manager();
        let s = m.create_session("Demo", "", "hi").unwrap().session;

        assert_eq!(s.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].role, Role::User);
        assert_eq!(s.messages[0].timestamp, s.created_at);
        assert!(s.is_active);
    }

    #[test]
    fn add_message_activates_target_only() {
        let mut m = manager();
        m.create_session("one", "", "").unwrap();
        m.create_session("two", "", "").unwrap();
        m.create_session("three", "", "").unwrap();

        m.add_message("one", Role::User, "back to one").unwrap();

        assert_eq!(active_names(&m), vec!["one"]);
        assert_eq!(m.get_by_name("one").unwrap().messages.len(), 1);
    }

    #[test]
    fn add_message_bumps_updated_at() {
        let mut m = manager();
        let created = m.create_session("Demo", "", "hi").unwrap().session;

        m.add_message("Demo", Role::Assistant, "hello").unwrap();

        let s = m.get_by_name("Demo").unwrap();
        assert_eq!(s.messages.len(), 2);
        assert!(s.updated_at >= created.updated_at);
        assert_eq!(s.updated_at, s.messages[1].timestamp);
    }

    #[test]
    fn add_message_unknown_session() {
        let mut m = manager();
        assert_matches!(
            m.add_message("ghost", Role::User, "boo"),
            Err(SessionError::NotFound { .. })
        );
    }

    #[test]
    fn lookup_by_name_then_id() {
        let mut m = manager();
        let s = m.create_session("lookup", "", "").unwrap().session;

        assert_eq!(m.get_by_name_or_id("lookup").unwrap().id, s.id);
        assert_eq!(m.get_by_name_or_id(&s.id).unwrap().name, "lookup");

        let err = m.get_by_name_or_id("missing").unwrap_err();
        assert_matches!(err, SessionError::NotFound { ref attempted, .. } if attempted.len() == 2);
    }

    #[test]
    fn exact_name_beats_prefix() {
        let mut m = manager();
        m.create_session("ab", "", "").unwrap();
        m.create_session("abc", "", "").unwrap();

        assert_eq!(m.find_by_prefix("ab").unwrap().name, "ab");
    }

    #[test]
    fn prefix_is_case_insensitive_and_unique() {
        let mut m = manager();
        m.create_session("Research notes", "", "").unwrap();
        m.create_session("Recipes", "", "").unwrap();

        assert_eq!(m.find_by_prefix("rese").unwrap().name, "Research notes");
    }

    #[test]
    fn prefix_matches_by_id() {
        let mut m = manager();
        let s = m.create_session("by id", "", "").unwrap().session;

        assert_eq!(m.find_by_prefix(&s.id).unwrap().name, "by id");
    }

    #[test]
    fn prefix_ambiguous_lists_all_matches() {
        let mut m = manager();
        m.create_session("project-a", "", "").unwrap();
        m.create_session("Project-b", "", "").unwrap();
        m.create_session("other", "", "").unwrap();

        let err = m.find_by_prefix("proj").unwrap_err();
        assert_matches!(err, SessionError::Ambiguous { ref matches, .. } => {
            assert_eq!(matches, &vec!["Project-b".to_string(), "project-a".to_string()]);
        });
    }

    #[test]
    fn prefix_not_found_lists_strategies() {
        let m = manager();
        let err = m.find_by_prefix("zzz").unwrap_err();

        assert_matches!(err, SessionError::NotFound { ref attempted, .. } if attempted.len() == 3);
        assert!(err.to_string().contains("name prefix"));
    }

    #[test]
    fn set_active_switches_flag() {
        let mut m = manager();
        m.create_session("first", "", "").unwrap();
        m.create_session("second", "", "").unwrap();

        m.set_active("first").unwrap();
        assert_eq!(active_names(&m), vec!["first"]);

        m.set_active("first").unwrap();
        assert_eq!(active_names(&m), vec!["first"]);
        assert_matches!(m.set_active("nobody"), Err(SessionError::NotFound { .. }));
        assert_eq!(m.active().unwrap().name, "first");
    }

    #[test]
    fn deleting_active_clears_pointer() {
        let mut m = manager();
        m.create_session("keep", "", "").unwrap();
        m.create_session("drop", "", "").unwrap();

        m.delete_session("drop").unwrap();

        assert!(m.active().is_none());
        assert!(active_names(&m).is_empty());
        assert_matches!(m.get_by_name("drop"), Err(SessionError::NotFound { .. }));
    }

    #[test]
    fn deleting_inactive_keeps_pointer() {
        let mut m = manager();
        m.create_session("gone", "", "").unwrap();
        m.create_session("stays", "", "").unwrap();

        m.delete_session("gone").unwrap();

        assert_eq!(m.active().unwrap().name, "stays");
        let recreated = m.create_session("gone", "", "").unwrap();
        assert!(recreated.warning.is_none());
    }

    #[test]
    fn copy_keeps_content_with_new_identity() {
        let mut m = manager();
        m.create_session("source", "pirate voice", "ahoy").unwrap();
        m.add_message("source", Role::Assistant, "arr").unwrap();
        m.create_session("elsewhere", "", "").unwrap();

        let copy = m.copy_session("sou", Some("copy")).unwrap().session;
        let source = m.get_by_name("source").unwrap();

        assert_ne!(copy.id, source.id);
        assert_eq!(copy.system_prompt, "pirate voice");
        assert_eq!(copy.messages.len(), 2);
        for (a, b) in copy.messages.iter().zip(&source.messages) {
            assert_ne!(a.id, b.id);
            assert_eq!(a.role, b.role);
            assert_eq!(a.content, b.content);
            assert_eq!(a.timestamp, b.timestamp);
        }

        assert!(!copy.is_active);
        assert_eq!(m.active().unwrap().name, "elsewhere");
    }

    #[test]
    fn copy_without_target_generates_name() {
        let mut m = manager();
        m.create_session("Session 1", "", "").unwrap();

        let copy = m.copy_session("Session 1", None).unwrap();
        assert_eq!(copy.session.name, "Session 2");
        assert!(copy.warning.is_none());
    }

    #[test]
    fn copy_to_taken_name_is_versioned() {
        let mut m = manager();
        m.create_session("a", "", "").unwrap();

        let copy = m.copy_session("a", Some("a")).unwrap();
        assert_eq!(copy.session.name, "a:v1");
        assert!(copy.warning.is_some());
    }

    #[test]
    fn generated_names_skip_existing() {
        let mut m = manager();
        let first = m.generate_default_name();
        m.create_session(&first, "", "").unwrap();

        assert_eq!(first, "Session 1");
        assert_eq!(m.generate_default_name(), "Session 2");
    }

    #[test]
    fn exhausted_default_names_stay_unique() {
        let mut m = manager().with_limits(NamingLimits {
            max_default_index: 1,
            ..NamingLimits::default()
        });
        for name in ["Session 1", "Chat 1", "Work 1", "Project 1"] {
            m.create_session(name, "", "").unwrap();
        }

        let a = m.copy_session("Session 1", None).unwrap().session;
        let b = m.copy_session("Session 1", None).unwrap().session;

        assert_ne!(a.name, b.name);
        assert_eq!(m.get_by_name(&a.name).unwrap().id, a.id);
        assert_eq!(m.get_by_name(&b.name).unwrap().id, b.id);
    }

    #[test]
    fn exhausted_versions_stay_unique() {
        let mut m = manager().with_limits(NamingLimits {
            max_version_attempts: 1,
            ..NamingLimits::default()
        });
        m.create_session("x", "", "").unwrap();
        m.create_session("x", "", "").unwrap();

        let a = m.create_session("x", "", "").unwrap().session;
        let b = m.create_session("x", "", "").unwrap().session;

        assert!(a.name.starts_with("x:v"));
        assert_ne!(a.name, b.name);
        assert_eq!(m.get_by_name(&a.name).unwrap().id, a.id);
        assert_eq!(m.get_by_name(&b.name).unwrap().id, b.id);
        assert_eq!(m.list_sessions().len(), 4);
    }

    #[test]
    fn whitespace_prompt_is_kept() {
        let mut m = manager();
        let created = m.create_session("ws", "  ", "").unwrap();
        assert_eq!(created.session.system_prompt, "  ");
    }
}
