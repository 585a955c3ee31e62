//! Workspace paths and `.taskloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{TaskloopConfig, write_config};

/// Canonical paths within `.taskloop/` for a project root.
#[derive(Debug, Clone)]
pub struct TaskloopPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub active_session_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    /// Specs folder shared by sessions whose specs source is `global`.
    pub global_specs_dir: PathBuf,
    /// Agent guidance file refreshed by `--mode agents`.
    pub agents_file: PathBuf,
}

impl TaskloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".taskloop");
        Self {
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            active_session_path: state_dir.join("active_session"),
            sessions_dir: state_dir.join("sessions"),
            checkpoints_dir: state_dir.join("checkpoints"),
            global_specs_dir: root.join("specs"),
            agents_file: root.join("AGENTS.md"),
            state_dir,
            root,
        }
    }

    pub fn session(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(self.sessions_dir.join(session_id))
    }

    /// Resolve a user-supplied folder against the project root.
    pub fn resolve(&self, folder: &Path) -> PathBuf {
        if folder.is_absolute() {
            folder.to_path_buf()
        } else {
            self.root.join(folder)
        }
    }
}

/// Paths owned by one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub descriptor_path: PathBuf,
    pub specs_dir: PathBuf,
    pub references_dir: PathBuf,
    pub iterations_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            descriptor_path: dir.join("session.json"),
            specs_dir: dir.join("specs"),
            references_dir: dir.join("references"),
            iterations_dir: dir.join("iterations"),
            dir,
        }
    }

    pub fn iteration_dir(&self, label: &str) -> PathBuf {
        self.iterations_dir.join(label)
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing engine-owned files.
    pub force: bool,
}

/// Create `.taskloop/` scaffolding in `root`.
///
/// Fails if `.taskloop/config.toml` already exists unless `options.force` is set.
/// Sessions and checkpoints are never touched.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<TaskloopPaths> {
    let paths = TaskloopPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("init: .taskloop exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.sessions_dir)?;
    create_dir(&paths.checkpoints_dir)?;
    create_dir(&paths.global_specs_dir)?;

    write_config(&paths.config_path, &TaskloopConfig::default())?;
    fs::write(&paths.gitignore_path, TASKLOOP_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const TASKLOOP_GITIGNORE: &str = "sessions/*/iterations/\ncheckpoints/\nactive_session\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.sessions_dir.is_dir());
        assert!(paths.checkpoints_dir.is_dir());
        assert!(paths.global_specs_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            TASKLOOP_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            TaskloopConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_workspace(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "model = \"custom\"\n").expect("write");
        init_workspace(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(load_config(&paths.config_path).expect("config").model, "sonnet");
    }

    #[test]
    fn session_paths_are_stable() {
        let paths = TaskloopPaths::new("/work");
        let session = paths.session("demo-20260101-000000");
        assert!(session.dir.ends_with(".taskloop/sessions/demo-20260101-000000"));
        assert!(session.descriptor_path.ends_with("session.json"));
        assert!(session.iteration_dir("3").ends_with("iterations/3"));
        assert_eq!(paths.resolve(Path::new("docs/specs")), PathBuf::from("/work/docs/specs"));
    }
}
