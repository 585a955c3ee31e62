//! Session registry: session descriptors plus the single active-session pointer.
//!
//! The pointer file is read and written only here; every other component asks
//! the registry which session is active.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::session_id::{is_valid_session_id, session_id};
use crate::io::checkpoint::CheckpointStore;
use crate::io::config::write_atomic;
use crate::io::init::{SessionPaths, TaskloopPaths};
use crate::io::plan_store;
use crate::io::progress_log::ProgressLog;
use crate::io::specs;

const PLAN_FILE_NAME: &str = "IMPLEMENTATION_PLAN.md";
const PROGRESS_FILE_NAME: &str = "progress.md";

/// Registry failures callers match on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session not found: {id}")]
    NotFound { id: String },
    #[error("session already exists: {id}")]
    AlreadyExists { id: String },
    #[error("invalid session name '{name}': it needs at least one letter or digit")]
    InvalidName { name: String },
    #[error("session {id} is archived")]
    Archived { id: String },
    #[error("no active session (run `taskloop session use <id>` or pass --session)")]
    NoActiveSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

/// Where a session's specs (or references) come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// The session's own folder.
    Session,
    /// `<root>/specs`.
    Global,
    /// A folder named by the session.
    Custom,
    None,
}

/// Session descriptor (`session.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created: String,
    pub status: SessionStatus,
    pub specs_source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs_folder: Option<PathBuf>,
    pub references_source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references_folder: Option<PathBuf>,
    #[serde(default)]
    pub references_enabled: bool,
    /// Relative to the project root unless absolute.
    pub plan_file: PathBuf,
    pub progress_file: PathBuf,
}

impl Session {
    pub fn plan_path(&self, paths: &TaskloopPaths) -> PathBuf {
        paths.resolve(&self.plan_file)
    }

    pub fn progress_log(&self, paths: &TaskloopPaths) -> ProgressLog {
        ProgressLog::new(paths.resolve(&self.progress_file))
    }

    /// Folder the specs selector points at, if any.
    pub fn specs_dir(&self, paths: &TaskloopPaths) -> Option<PathBuf> {
        source_dir(
            paths,
            &self.id,
            self.specs_source,
            self.specs_folder.as_deref(),
            false,
        )
    }

    /// Folder the references selector points at, only when references are enabled.
    pub fn references_dir(&self, paths: &TaskloopPaths) -> Option<PathBuf> {
        if !self.references_enabled {
            return None;
        }
        source_dir(
            paths,
            &self.id,
            self.references_source,
            self.references_folder.as_deref(),
            true,
        )
    }

    /// True when the specs selector resolves to a usable folder.
    pub fn spec_source_available(&self, paths: &TaskloopPaths) -> bool {
        self.specs_dir(paths).is_some_and(|dir| specs::is_usable(&dir))
    }

    pub fn is_archived(&self) -> bool {
        self.status == SessionStatus::Archived
    }
}

fn source_dir(
    paths: &TaskloopPaths,
    id: &str,
    kind: SourceKind,
    folder: Option<&Path>,
    references: bool,
) -> Option<PathBuf> {
    match kind {
        SourceKind::Session => {
            let session = paths.session(id);
            Some(if references {
                session.references_dir
            } else {
                session.specs_dir
            })
        }
        SourceKind::Global => Some(paths.global_specs_dir.clone()),
        SourceKind::Custom => folder.map(|folder| paths.resolve(folder)),
        SourceKind::None => None,
    }
}

/// Creates, lists and isolates sessions under `.taskloop/sessions/`.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    paths: TaskloopPaths,
    checkpoints: CheckpointStore,
}

impl SessionRegistry {
    pub fn new(paths: TaskloopPaths) -> Self {
        let checkpoints = CheckpointStore::new(paths.checkpoints_dir.clone());
        Self { paths, checkpoints }
    }

    pub fn paths(&self) -> &TaskloopPaths {
        &self.paths
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn create(&self, name: &str, description: &str) -> Result<Session> {
        self.create_at(name, description, Local::now().naive_local())
    }

    /// Create a session stamped with `created` (local time).
    ///
    /// Fails with [`RegistryError::AlreadyExists`] rather than overwriting when
    /// another session was created from the same name within the same second.
    pub fn create_at(&self, name: &str, description: &str, created: NaiveDateTime) -> Result<Session> {
        let id = session_id(name, created).ok_or_else(|| RegistryError::InvalidName {
            name: name.to_string(),
        })?;
        let session_paths = self.paths.session(&id);
        fs::create_dir_all(&self.paths.sessions_dir).with_context(|| {
            format!("create directory {}", self.paths.sessions_dir.display())
        })?;
        match fs::create_dir(&session_paths.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => {
                return Err(RegistryError::AlreadyExists { id }.into());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("create directory {}", session_paths.dir.display()));
            }
        }
        let session = populate_or_discard(&session_paths.dir, || {
            self.populate(&id, name, description, created, &session_paths)
        })?;
        info!(session_id = %id, "session created");
        Ok(session)
    }

    /// Lay out the files of a session whose directory was just created.
    fn populate(
        &self,
        id: &str,
        name: &str,
        description: &str,
        created: NaiveDateTime,
        session_paths: &SessionPaths,
    ) -> Result<Session> {
        for dir in [&session_paths.specs_dir, &session_paths.references_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        }

        let relative = session_paths
            .dir
            .strip_prefix(&self.paths.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| session_paths.dir.clone());
        let session = Session {
            id: id.to_string(),
            name: name.trim().to_string(),
            description: description.trim().to_string(),
            created: created_timestamp(created),
            status: SessionStatus::Active,
            specs_source: SourceKind::Session,
            specs_folder: None,
            references_source: SourceKind::Session,
            references_folder: None,
            references_enabled: false,
            plan_file: relative.join(PLAN_FILE_NAME),
            progress_file: relative.join(PROGRESS_FILE_NAME),
        };

        plan_store::reset_plan(&session.plan_path(&self.paths))?;
        session.progress_log(&self.paths).init(&session.name)?;
        self.save(&session)?;
        Ok(session)
    }

    /// Load a session descriptor. Unknown ids are `Ok(None)`.
    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        if !is_valid_session_id(id) {
            return Ok(None);
        }
        let path = self.paths.session(id).descriptor_path;
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read session {}", path.display()))?;
        let session: Session = serde_json::from_str(&contents)
            .with_context(|| format!("parse session {}", path.display()))?;
        Ok(Some(session))
    }

    /// Like [`get`](Self::get), but a missing session is [`RegistryError::NotFound`].
    pub fn require(&self, id: &str) -> Result<Session> {
        self.get(id)?.ok_or_else(|| {
            RegistryError::NotFound { id: id.to_string() }.into()
        })
    }

    /// All sessions, oldest first. Unreadable descriptors are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Session>> {
        if !self.paths.sessions_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let entries = fs::read_dir(&self.paths.sessions_dir).with_context(|| {
            format!("read directory {}", self.paths.sessions_dir.display())
        })?;
        for entry in entries {
            let entry = entry.context("read sessions entry")?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.get(&id) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => warn!(session_id = %id, err = %format!("{err:#}"), "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Point the active-session pointer at `id`.
    ///
    /// A missing or archived session is an error and leaves the pointer unchanged.
    pub fn set_active(&self, id: &str) -> Result<Session> {
        let session = self.require(id)?;
        if session.is_archived() {
            return Err(RegistryError::Archived { id: id.to_string() }.into());
        }
        write_atomic(&self.paths.active_session_path, &format!("{id}\n"))?;
        info!(session_id = %id, "active session set");
        Ok(session)
    }

    /// Raw pointer value, if any.
    pub fn active_id(&self) -> Result<Option<String>> {
        let path = &self.paths.active_session_path;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read active session pointer {}", path.display()))?;
        let id = contents.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    /// The active session. A pointer to a missing session reads as `None`.
    pub fn get_active(&self) -> Result<Option<Session>> {
        let Some(id) = self.active_id()? else {
            return Ok(None);
        };
        let session = self.get(&id)?;
        if session.is_none() {
            warn!(session_id = %id, "active session pointer references a missing session");
        }
        Ok(session)
    }

    /// Session named explicitly, or else the active one.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<Session> {
        match explicit {
            Some(id) => self.require(id),
            None => self
                .get_active()?
                .ok_or_else(|| RegistryError::NoActiveSession.into()),
        }
    }

    pub fn clear_active(&self) -> Result<()> {
        let path = &self.paths.active_session_path;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("remove active session pointer {}", path.display()))
            }
        }
    }

    /// Delete a session, its checkpoint, and the pointer if it referenced it.
    pub fn remove(&self, id: &str) -> Result<()> {
        let session = self.require(id)?;
        let dir = self.paths.session(&session.id).dir;
        fs::remove_dir_all(&dir).with_context(|| format!("remove session {}", dir.display()))?;
        self.checkpoints.delete(&session.id);
        self.clear_pointer_if(&session.id)?;
        info!(session_id = %id, "session removed");
        Ok(())
    }

    /// Mark a session archived; an archived session cannot stay active.
    pub fn archive(&self, id: &str) -> Result<Session> {
        let mut session = self.require(id)?;
        session.status = SessionStatus::Archived;
        self.save(&session)?;
        self.clear_pointer_if(&session.id)?;
        Ok(session)
    }

    pub fn set_specs(&self, id: &str, source: SourceKind, folder: Option<PathBuf>) -> Result<Session> {
        let mut session = self.require(id)?;
        session.specs_folder = custom_folder(source, folder)?;
        session.specs_source = source;
        self.save(&session)?;
        Ok(session)
    }

    pub fn set_references(
        &self,
        id: &str,
        source: SourceKind,
        folder: Option<PathBuf>,
        enabled: bool,
    ) -> Result<Session> {
        let mut session = self.require(id)?;
        session.references_folder = custom_folder(source, folder)?;
        session.references_source = source;
        session.references_enabled = enabled && source != SourceKind::None;
        self.save(&session)?;
        Ok(session)
    }

    fn clear_pointer_if(&self, id: &str) -> Result<()> {
        if self.active_id()?.as_deref() == Some(id) {
            debug!(session_id = %id, "clearing active session pointer");
            self.clear_active()?;
        }
        Ok(())
    }

    fn save(&self, session: &Session) -> Result<()> {
        let path = self.paths.session(&session.id).descriptor_path;
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }
}

fn custom_folder(source: SourceKind, folder: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match (source, folder) {
        (SourceKind::Custom, Some(folder)) => Ok(Some(folder)),
        (SourceKind::Custom, None) => Err(anyhow!("a custom source needs --folder")),
        (_, Some(_)) => Err(anyhow!("--folder is only valid with a custom source")),
        (_, None) => Ok(None),
    }
}

fn created_timestamp(created: NaiveDateTime) -> String {
    match Local.from_local_datetime(&created).earliest() {
        Some(local) => local.to_rfc3339_opts(SecondsFormat::Secs, false),
        None => Utc
            .from_utc_datetime(&created)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// Run `build` for a freshly created session directory, removing the
/// directory when it fails so the id can be reused.
fn populate_or_discard<T>(dir: &Path, build: impl FnOnce() -> Result<T>) -> Result<T> {
    let result = build();
    if result.is_err()
        && let Err(err) = fs::remove_dir_all(dir)
    {
        warn!(dir = %dir.display(), %err, "failed to remove partial session directory");
    }
    result
}
