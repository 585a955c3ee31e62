//! Spec and reference folder scanning.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Spec documents directly inside `dir`, sorted; templates excluded.
pub fn spec_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut docs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() && is_markdown(&path) && !is_template(&path) {
            docs.push(path);
        }
    }
    docs.sort();
    Ok(docs)
}

/// A folder is usable when it holds at least one non-template markdown document.
pub fn is_usable(dir: &Path) -> bool {
    spec_documents(dir).is_ok_and(|docs| !docs.is_empty())
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

/// `_draft.md` and `feature-template.md` are scaffolding, not specs.
pub fn is_template(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    stem.starts_with('_') || stem.to_ascii_lowercase().contains("template")
}
