//! Dispositions applied by the finder to a discovered file.
//!
//! The standard action runs for new files, the alternative one for
//! duplicates. Only `Move` can be rolled back.

use crate::error::{EndpointError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(alias = "move")]
    Move,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "noop", alias = "Null", alias = "null")]
    Noop,
}

/// A configured action bound to its source and destination roots.
#[derive(Debug, Clone)]
pub enum Action {
    /// Move from `src` to `dst`, preserving the path below `src`.
    Move { src: PathBuf, dst: PathBuf },
    Delete,
    Noop,
}

/// Record of an executed action, able to undo a move.
#[derive(Debug)]
pub struct Executed {
    /// Where the file is after the action, `None` if deleted.
    pub location: Option<PathBuf>,
    undo: Option<MoveUndo>,
}

#[derive(Debug)]
struct MoveUndo {
    from: PathBuf,
    to: PathBuf,
    /// Directories created for the move, deepest first.
    created: Vec<PathBuf>,
}

impl Action {
    pub fn new(kind: ActionKind, src: &Path, dst: &Path) -> Self {
        match kind {
            ActionKind::Move => Action::Move {
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
            },
            ActionKind::Delete => Action::Delete,
            ActionKind::Noop => Action::Noop,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Move { .. } => ActionKind::Move,
            Action::Delete => ActionKind::Delete,
            Action::Noop => ActionKind::Noop,
        }
    }

    /// Apply the action to `path`. Blocking.
    pub fn execute(&self, path: &Path) -> Result<Executed> {
        match self {
            Action::Noop => Ok(Executed {
                location: Some(path.to_path_buf()),
                undo: None,
            }),
            Action::Delete => {
                fs::remove_file(path).map_err(|e| {
                    EndpointError::action(format!("cannot delete {}: {}", path.display(), e))
                })?;
                debug!(path = %path.display(), "Deleted");
                Ok(Executed {
                    location: None,
                    undo: None,
                })
            }
            Action::Move { src, dst } => move_preserving(path, src, dst),
        }
    }
}

fn move_preserving(path: &Path, src: &Path, dst: &Path) -> Result<Executed> {
    let relative = path.strip_prefix(src).map_err(|_| {
        EndpointError::action(format!(
            "cannot move {}: not in {}",
            path.display(),
            src.display()
        ))
    })?;
    let target = dst.join(relative);
    let parent = target
        .parent()
        .ok_or_else(|| EndpointError::action(format!("no parent for {}", target.display())))?;

    let created: Vec<PathBuf> = parent
        .ancestors()
        .take_while(|dir| *dir != dst && !dir.exists())
        .map(Path::to_path_buf)
        .collect();

    let moved = fs::create_dir_all(parent).and_then(|_| {
        if target.exists() {
            warn!(path = %target.display(), "Replacing file in storage");
        }
        rename_or_copy(path, &target)
    });
    if let Err(e) = moved {
        remove_empty_dirs(&created);
        return Err(EndpointError::action(format!(
            "cannot move {} to {}: {}",
            path.display(),
            target.display(),
            e
        )));
    }

    debug!(from = %path.display(), to = %target.display(), "Moved");
    Ok(Executed {
        location: Some(target.clone()),
        undo: Some(MoveUndo {
            from: path.to_path_buf(),
            to: target,
            created,
        }),
    })
}

/// Rename, falling back to copy+remove across filesystems.
fn rename_or_copy(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if fs::copy(from, to).is_err() {
                return Err(rename_err);
            }
            fs::remove_file(from)
        }
    }
}

fn remove_empty_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        // Fails on non-empty directories, which is what we want.
        if fs::remove_dir(dir).is_err() {
            break;
        }
    }
}

impl Executed {
    pub fn is_reversible(&self) -> bool {
        self.undo.is_some()
    }

    /// Put a moved file back and drop directories the move created.
    pub fn undo(self) -> Result<()> {
        let Some(undo) = self.undo else {
            return Ok(());
        };
        rename_or_copy(&undo.to, &undo.from).map_err(|e| {
            EndpointError::action(format!(
                "cannot move {} back to {}: {}",
                undo.to.display(),
                undo.from.display(),
                e
            ))
        })?;
        remove_empty_dirs(&undo.created);
        debug!(path = %undo.from.display(), "Move undone");
        Ok(())
    }
}
