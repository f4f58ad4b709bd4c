//! Recursive upload of a local file or directory tree

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::sink::{entry_name, ScpSink, SinkGuard};
use crate::error::{Error, Result};
use crate::process::Connection;

/// One directory level still to be sent.
struct TreeLevel {
    source: PathBuf,
    target: String,
    /// Canonical paths from the upload root down to `source`, inclusive
    ancestors: Vec<PathBuf>,
}

/// Immediate children of a local directory, split by kind and name-ordered.
#[derive(Default)]
struct Children {
    files: Vec<PathBuf>,
    dirs: Vec<ChildDir>,
}

struct ChildDir {
    path: PathBuf,
    canonical: PathBuf,
}

/// Upload `source` into the remote directory `target`.
///
/// A plain file lands at `target/<file name>`; a directory has its contents
/// placed under `target`. Missing directories along `target` are created
/// first. On a fatal ack the error carries the remote message and whatever
/// was already acknowledged stays on the remote side.
pub async fn copy_to(connection: &dyn Connection, source: &Path, target: &str) -> Result<()> {
    let target = target.trim();
    let segments = target_segments(target)?;

    // fail before touching the remote side
    let metadata = tokio::fs::metadata(source).await?;

    info!("[scp] upload {} -> {}", source.display(), display_target(target));

    if !segments.is_empty() {
        let base = if target.starts_with('/') { "/" } else { "." };
        let mut guard = SinkGuard::new(ScpSink::open(connection, base).await?);
        for segment in &segments {
            guard.push_dir(segment).await?;
        }
        for _ in &segments {
            guard.end_dir().await?;
        }
        guard.commit().await;
        debug!("[scp] ensured {} directory levels for {}", segments.len(), target);
    }

    let target = if target.is_empty() { "." } else { target };

    if !metadata.is_dir() {
        let mut guard = SinkGuard::new(ScpSink::open(connection, target).await?);
        guard.push_file(source).await?;
        guard.commit().await;
        return Ok(());
    }

    let mut pending = VecDeque::from([TreeLevel {
        source: source.to_path_buf(),
        target: target.to_string(),
        ancestors: vec![tokio::fs::canonicalize(source).await?],
    }]);

    while let Some(level) = pending.pop_front() {
        let children = list_children(&level.source, &level.ancestors).await?;
        let dir_names = children
            .dirs
            .iter()
            .map(|dir| entry_name(&dir.path))
            .collect::<Result<Vec<_>>>()?;

        let mut guard = SinkGuard::new(ScpSink::open(connection, &level.target).await?);
        for file in &children.files {
            guard.push_file(file).await?;
        }
        for name in &dir_names {
            guard.push_dir(name).await?;
            guard.end_dir().await?;
        }
        guard.commit().await;

        debug!(
            "[scp] {}: {} files, {} dirs",
            level.target,
            children.files.len(),
            children.dirs.len()
        );

        // depth first: this level's subdirectories go ahead of its siblings
        for (dir, name) in children.dirs.into_iter().zip(dir_names).rev() {
            let mut ancestors = level.ancestors.clone();
            ancestors.push(dir.canonical);
            pending.push_front(TreeLevel {
                source: dir.path,
                target: join_remote(&level.target, &name),
                ancestors,
            });
        }
    }

    info!("[scp] upload of {} finished", source.display());
    Ok(())
}

/// Non-blank `/`-separated components of `target`, sent verbatim.
fn target_segments(target: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = target
        .split('/')
        .filter(|s| !s.trim().is_empty() && *s != ".")
        .collect();
    if segments.contains(&"..") {
        return Err(Error::InvalidPath(format!(
            "target '{}' must not contain '..'",
            target
        )));
    }
    if target.contains('\n') {
        return Err(Error::InvalidPath("target contains a newline".into()));
    }
    Ok(segments)
}

/// List `dir`, following symlinks.
///
/// A directory whose canonical path is already in `ancestors` would repeat
/// the branch forever and is skipped.
async fn list_children(dir: &Path, ancestors: &[PathBuf]) -> Result<Children> {
    let mut children = Children::default();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("[scp] skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if metadata.is_dir() {
            let canonical = tokio::fs::canonicalize(&path).await?;
            if ancestors.contains(&canonical) {
                warn!(
                    "[scp] skipping {}: links back to {}",
                    path.display(),
                    canonical.display()
                );
                continue;
            }
            children.dirs.push(ChildDir { path, canonical });
        } else if metadata.is_file() {
            children.files.push(path);
        } else {
            warn!("[scp] skipping special file {}", path.display());
        }
    }

    children.files.sort();
    children.dirs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(children)
}

fn join_remote(parent: &str, name: &str) -> String {
    match parent {
        "" | "." => name.to_string(),
        p if p.ends_with('/') => format!("{}{}", p, name),
        p => format!("{}/{}", p, name),
    }
}

fn display_target(target: &str) -> &str {
    if target.is_empty() {
        "."
    } else {
        target
    }
}
