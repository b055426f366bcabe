//! Where revisions come from: the set compiled into this crate, or a
//! directory laid out the same way.
//!
//! ```text
//! migrations/
//!   0001_create_tasks/
//!     meta.json   {"id": "...", "parent": null, "message": "..."}
//!     up.sql
//!     down.sql
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::chain::RevisionChain;
use super::error::{CatalogError, MigrationError};
use super::revision::Revision;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevisionMeta {
    id: String,
    parent: Option<String>,
    message: String,
}

struct Embedded {
    dir: &'static str,
    meta: &'static str,
    up: &'static str,
    down: &'static str,
}

macro_rules! embed {
    ($dir:literal) => {
        Embedded {
            dir: $dir,
            meta: include_str!(concat!("../../migrations/", $dir, "/meta.json")),
            up: include_str!(concat!("../../migrations/", $dir, "/up.sql")),
            down: include_str!(concat!("../../migrations/", $dir, "/down.sql")),
        }
    };
}

const EMBEDDED: &[Embedded] = &[
    embed!("0001_create_tasks"),
    embed!("0002_create_contexts"),
    embed!("0003_task_feedback_and_triggers"),
    embed!("0004_add_webhook_configs"),
];

/// Revisions compiled into this build.
pub fn embedded() -> Result<Vec<Revision>, CatalogError> {
    EMBEDDED
        .iter()
        .map(|unit| {
            let meta: RevisionMeta =
                serde_json::from_str(unit.meta).map_err(|source| CatalogError::Meta {
                    path: Path::new(unit.dir).join("meta.json"),
                    source,
                })?;
            Ok(Revision::new(meta.id, meta.parent, meta.message, unit.up, unit.down))
        })
        .collect()
}

/// The validated chain of embedded revisions.
pub fn embedded_chain() -> Result<RevisionChain, MigrationError> {
    Ok(RevisionChain::new(embedded()?)?)
}

/// Read every revision directory under `root`. Directory names carry no
/// ordering meaning; the chain is rebuilt from `parent` pointers.
pub fn load_dir(root: impl AsRef<Path>) -> Result<Vec<Revision>, CatalogError> {
    let root = root.as_ref();
    let mut revisions = Vec::new();

    for dir in revision_dirs(root)? {
        let meta_path = dir.join("meta.json");
        let meta: RevisionMeta =
            serde_json::from_str(&read(&meta_path)?).map_err(|source| CatalogError::Meta {
                path: meta_path.clone(),
                source,
            })?;
        let up = read(&dir.join("up.sql"))?;
        let down = read(&dir.join("down.sql"))?;
        revisions.push(Revision::new(meta.id, meta.parent, meta.message, up, down));
    }

    Ok(revisions)
}

/// Scaffold a new revision on top of `parent`. Returns the new id and the
/// directory it was written to; the SQL files start out empty.
pub fn author(
    root: impl AsRef<Path>,
    message: &str,
    parent: Option<&str>,
) -> Result<(String, PathBuf), CatalogError> {
    let root = root.as_ref();
    let existing = if root.exists() {
        revision_dirs(root)?.len()
    } else {
        0
    };

    let suffix = Uuid::new_v4().simple().to_string();
    let id = format!("{}_{}", Utc::now().format("%Y%m%d_%H%M"), &suffix[..8]);
    let dir = root.join(format!("{:04}_{}", existing + 1, slug(message)));
    if dir.exists() {
        return Err(CatalogError::AlreadyExists(dir));
    }

    let meta = RevisionMeta {
        id: id.clone(),
        parent: parent.map(str::to_string),
        message: message.to_string(),
    };
    let meta_json = serde_json::to_string_pretty(&meta).map_err(|source| CatalogError::Meta {
        path: dir.join("meta.json"),
        source,
    })?;

    fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
    write(&dir.join("meta.json"), &format!("{meta_json}\n"))?;
    write(&dir.join("up.sql"), &format!("-- {message}\n"))?;
    write(&dir.join("down.sql"), &format!("-- Revert: {message}\n"))?;

    info!(%id, parent = parent.unwrap_or("base"), dir = %dir.display(), "created revision");
    Ok((id, dir))
}

fn revision_dirs(root: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let entries = fs::read_dir(root).map_err(|source| io_error(root, source))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|source| io_error(root, source))?.path();
        if path.is_dir() && path.join("meta.json").is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn slug(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for ch in message.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed: String = out.trim_matches('_').chars().take(40).collect();
    if trimmed.is_empty() {
        "revision".to_string()
    } else {
        trimmed.trim_end_matches('_').to_string()
    }
}

fn read(path: &Path) -> Result<String, CatalogError> {
    fs::read_to_string(path).map_err(|source| io_error(path, source))
}

fn write(path: &Path, contents: &str) -> Result<(), CatalogError> {
    fs::write(path, contents).map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> CatalogError {
    CatalogError::Io {
        path: path.to_path_buf(),
        source,
    }
}
