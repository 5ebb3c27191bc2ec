//! Session records: every Double-Ratchet session we hold for one remote
//! address, keyed by the session's basing secret.

use crate::curve::PublicKey;
use crate::error::{Error, Result};
use crate::state::{BaseKeyType, SessionState};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of sessions (one open plus closed ones) retained per
/// record; closed sessions beyond this are retired oldest-first.
pub const MAX_SESSIONS: usize = 40;

const RECORD_VERSION: &str = "v1";

#[derive(Serialize)]
struct RecordDocumentRef<'a> {
    version: &'a str,
    #[serde(rename = "_sessions")]
    sessions: &'a BTreeMap<String, SessionState>,
}

#[derive(Deserialize)]
struct RecordDocument {
    version: String,
    #[serde(rename = "_sessions")]
    sessions: BTreeMap<String, SessionState>,
}

/// All sessions held for one remote address.
///
/// At most one session is open at any time; the rest are closed and kept
/// for trial decryption of late traffic until retired.
#[derive(Clone, Default)]
pub struct SessionRecord {
    sessions: BTreeMap<String, SessionState>,
}

impl SessionRecord {
    /// An empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn session_key(base_key: &PublicKey) -> String {
        BASE64.encode(base_key.serialize())
    }

    /// Look up a session by the peer's base key.
    ///
    /// Sessions based on our own ephemeral are never returned; lookups must
    /// use the peer's basing secret.
    pub(crate) fn get_session(&self, base_key: &PublicKey) -> Option<&SessionState> {
        self.sessions
            .get(&Self::session_key(base_key))
            .filter(|session| session.index_info.base_key_type != BaseKeyType::Ours)
    }

    /// The open session, if any.
    pub(crate) fn open_session(&self) -> Option<&SessionState> {
        self.sessions.values().find(|session| session.is_open())
    }

    pub(crate) fn open_session_mut(&mut self) -> Option<&mut SessionState> {
        self.sessions.values_mut().find(|session| session.is_open())
    }

    /// Whether an open session exists.
    #[must_use]
    pub fn has_open_session(&self) -> bool {
        self.open_session().is_some()
    }

    /// Number of sessions (open and closed) in the record.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions in most-recently-used order.
    pub(crate) fn sessions_mru(&self) -> Vec<&SessionState> {
        let mut sessions: Vec<&SessionState> = self.sessions.values().collect();
        sessions.sort_by(|a, b| b.index_info.used.cmp(&a.index_info.used));
        sessions
    }

    /// File a session under its base key and retire old closed sessions.
    pub(crate) fn update_session(&mut self, session: SessionState) {
        let key = Self::session_key(&session.index_info.base_key);
        self.sessions.insert(key, session);
        self.remove_old_sessions();
    }

    /// Close the open session, if any.
    pub(crate) fn close_open_session(&mut self, now: i64) {
        if let Some(open) = self.open_session_mut() {
            log::info!("Closing open session");
            open.close(now);
        }
    }

    /// Drop everything.
    pub fn delete_all_sessions(&mut self) {
        self.sessions.clear();
    }

    /// Retire closed sessions, oldest closing time first, until the record
    /// is back within [`MAX_SESSIONS`].
    fn remove_old_sessions(&mut self) {
        while self.sessions.len() > MAX_SESSIONS {
            let oldest = self
                .sessions
                .iter()
                .filter(|(_, session)| !session.is_open())
                .min_by_key(|(_, session)| session.index_info.closed)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    log::info!("Retiring session closed at oldest timestamp");
                    self.sessions.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Serialize to the stable `"v1"` document form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&RecordDocumentRef {
            version: RECORD_VERSION,
            sessions: &self.sessions,
        })
        .map_err(|e| Error::Storage(format!("failed to serialize session record: {e}")))
    }

    /// Parse a serialized record, migrating pre-`"v1"` documents first.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|_| Error::InvalidArgument("malformed session record"))?;
        migrate(&mut value)?;

        let doc: RecordDocument = serde_json::from_value(value)
            .map_err(|_| Error::InvalidArgument("malformed session record"))?;
        if doc.version != RECORD_VERSION {
            return Err(Error::InvalidArgument("unsupported session record version"));
        }
        Ok(Self {
            sessions: doc.sessions,
        })
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("sessions", &self.sessions.len())
            .field("open", &self.has_open_session())
            .finish()
    }
}

/// Bring a document up to the current version.
///
/// Version-less documents predate the `"v1"` tag: entries that no longer
/// parse as sessions are dropped, then the tag is stamped. Documents with
/// an unknown version are rejected by the caller.
fn migrate(value: &mut serde_json::Value) -> Result<()> {
    let obj = value
        .as_object_mut()
        .ok_or(Error::InvalidArgument("malformed session record"))?;
    if obj.contains_key("version") {
        return Ok(());
    }

    log::info!("Migrating legacy session record to v1");
    if let Some(sessions) = obj.get_mut("_sessions").and_then(|s| s.as_object_mut()) {
        sessions.retain(|_, entry| serde_json::from_value::<SessionState>(entry.clone()).is_ok());
    }
    obj.insert("version".into(), RECORD_VERSION.into());
    Ok(())
}
