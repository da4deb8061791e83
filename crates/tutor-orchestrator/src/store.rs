//! Session persistence.
//!
//! Snapshots are versioned JSON envelopes around [`SessionState`]. The file
//! store writes each snapshot to a temporary file and renames it into place
//! so readers never observe a partial write.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{Result, TutorError};
use crate::session_state::{SessionId, SessionState, STATE_VERSION};

/// Durable storage for session snapshots.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Stores `state` under its session id, replacing any previous snapshot.
    async fn save(&self, state: &SessionState) -> Result<()>;

    /// Loads a snapshot; `None` if the session is unknown.
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>>;

    /// Ids of every stored session, sorted.
    async fn list(&self) -> Result<Vec<SessionId>>;

    /// Every readable session started by `learner_nickname`, compared
    /// ignoring ASCII case. Unreadable snapshots are skipped.
    ///
    /// The default loads every stored session; stores should override it
    /// with something cheaper.
    async fn sessions_for_learner(&self, learner_nickname: &str) -> Result<Vec<SessionState>> {
        let mut sessions = Vec::new();
        for id in self.list().await? {
            match self.load(&id).await {
                Ok(Some(state)) if state.learner_nickname.eq_ignore_ascii_case(learner_nickname) => {
                    sessions.push(state);
                }
                Ok(_) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    /// Whether the store is usable.
    async fn healthy(&self) -> bool;
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    state: &'a SessionState,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    state: SessionState,
}

#[derive(Deserialize)]
struct LearnerEnvelope {
    state: LearnerOnly,
}

#[derive(Deserialize)]
struct LearnerOnly {
    learner_nickname: String,
}

/// Reads only the learner nickname out of an encoded snapshot.
fn learner_of(content: &str) -> Option<String> {
    serde_json::from_str::<LearnerEnvelope>(content)
        .ok()
        .map(|envelope| envelope.state.learner_nickname)
}

fn learner_key(learner_nickname: &str) -> String {
    learner_nickname.to_ascii_lowercase()
}

fn encode(state: &SessionState) -> Result<String> {
    Ok(serde_json::to_string_pretty(&EnvelopeRef {
        version: STATE_VERSION,
        state,
    })?)
}

fn decode(path: &Path, content: &str) -> Result<SessionState> {
    let envelope: Envelope = serde_json::from_str(content)
        .map_err(|e| TutorError::state_corrupted(path, e.to_string()))?;
    if envelope.version > STATE_VERSION {
        return Err(TutorError::state_corrupted(
            path,
            format!(
                "snapshot version {} is newer than supported version {STATE_VERSION}",
                envelope.version
            ),
        ));
    }
    Ok(envelope.state)
}

/// Session ids become file names, so only a conservative alphabet is accepted.
fn is_safe_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ============================================================================
// JsonFileStore
// ============================================================================

/// Session ids per lowercased learner nickname.
type LearnerIndex = HashMap<String, BTreeSet<SessionId>>;

/// One `<session_id>.json` file per session.
///
/// A learner index is built from the directory on the first
/// [`PersistenceStore::sessions_for_learner`] call and kept current by
/// [`PersistenceStore::save`]. Clones share the index.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
    learners: Arc<RwLock<Option<LearnerIndex>>>,
}

impl JsonFileStore {
    /// Creates a store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            learners: Arc::default(),
        }
    }

    /// Directory holding the snapshots.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    async fn build_learner_index(&self) -> Result<LearnerIndex> {
        let mut index = LearnerIndex::new();
        for id in self.list().await? {
            let path = self.path_for(&id);
            let learner = match tokio::fs::read_to_string(&path).await {
                Ok(content) => learner_of(&content),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session while indexing");
                    continue;
                }
            };
            match learner {
                Some(learner) => {
                    index.entry(learner_key(&learner)).or_default().insert(id);
                }
                None => warn!(path = %path.display(), "Skipping malformed session while indexing"),
            }
        }
        debug!(dir = %self.dir.display(), learners = index.len(), "Learner index built");
        Ok(index)
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn save(&self, state: &SessionState) -> Result<()> {
        if !is_safe_id(&state.session_id) {
            return Err(TutorError::persistence(format!(
                "session id '{}' cannot be used as a file name",
                state.session_id
            )));
        }
        let content = encode(state)?;
        let path = self.path_for(&state.session_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", state.session_id));

        let write = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&tmp, content.as_bytes()).await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            error!(session_id = %state.session_id, path = %path.display(), error = %e, "Failed to write session snapshot");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(TutorError::persistence(format!(
                "failed to write {}: {e}",
                path.display()
            )));
        }

        if let Some(index) = self.learners.write().await.as_mut() {
            index
                .entry(learner_key(&state.learner_nickname))
                .or_default()
                .insert(state.session_id.clone());
        }

        debug!(session_id = %state.session_id, path = %path.display(), "Session snapshot saved");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        if !is_safe_id(session_id) {
            return Ok(None);
        }
        let path = self.path_for(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => decode(&path, &content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_safe_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn sessions_for_learner(&self, learner_nickname: &str) -> Result<Vec<SessionState>> {
        let ids: Vec<SessionId> = {
            let mut index = self.learners.write().await;
            if index.is_none() {
                *index = Some(self.build_learner_index().await?);
            }
            index
                .as_ref()
                .and_then(|index| index.get(&learner_key(learner_nickname)))
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await {
                Ok(Some(state)) => sessions.push(state),
                Ok(None) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    async fn healthy(&self) -> bool {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            // Not created yet; the first save will create it.
            Err(e) => e.kind() == std::io::ErrorKind::NotFound,
        }
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-process store of serialized snapshots.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<SessionId, String>>,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent save fail with `PersistenceError` while `fail` is set.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Returns `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn save(&self, state: &SessionState) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            error!(session_id = %state.session_id, "Simulated save failure");
            return Err(TutorError::persistence("store is rejecting writes"));
        }
        let content = encode(state)?;
        self.snapshots
            .write()
            .await
            .insert(state.session_id.clone(), content);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let snapshots = self.snapshots.read().await;
        snapshots
            .get(session_id)
            .map(|content| decode(Path::new(session_id), content))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<_> = self.snapshots.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn sessions_for_learner(&self, learner_nickname: &str) -> Result<Vec<SessionState>> {
        let snapshots = self.snapshots.read().await;
        snapshots
            .iter()
            .filter(|(_, content)| {
                learner_of(content).is_some_and(|learner| learner.eq_ignore_ascii_case(learner_nickname))
            })
            .map(|(id, content)| decode(Path::new(id), content))
            .collect()
    }

    async fn healthy(&self) -> bool {
        !self.fail_saves.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================
