//! Expand dropped local paths into the list of files to upload

use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Slash-separated path below the drop base, used as the remote key suffix.
    pub relative: String,
    pub size: u64,
}

fn slash_join(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// `path` relative to `base`, or just its file name when it lives elsewhere.
fn relative_to(base: &Path, path: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => slash_join(rel),
        Err(_) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Flatten files and directories into individual files. Relative names are
/// taken from the parent directory of the first path, so dropping `~/pics`
/// yields `pics/a.jpg`, `pics/trip/b.jpg`, ...
pub async fn collect_local_files(paths: &[PathBuf]) -> EngineResult<Vec<LocalFile>> {
    let first = paths
        .first()
        .ok_or_else(|| EngineError::invalid("no local paths given"))?;
    let base = first.parent().map(Path::to_path_buf).unwrap_or_default();

    let io_err = |path: &Path, e: std::io::Error| {
        EngineError::invalid(format!("cannot read {}: {}", path.display(), e))
    };

    let mut files = Vec::new();
    for dropped in paths {
        let metadata = tokio::fs::metadata(dropped)
            .await
            .map_err(|e| io_err(dropped, e))?;

        if metadata.is_file() {
            files.push(LocalFile {
                path: dropped.clone(),
                relative: relative_to(&base, dropped),
                size: metadata.len(),
            });
            continue;
        }

        let dropped_base = if dropped.starts_with(&base) {
            base.clone()
        } else {
            dropped.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        let mut pending = vec![dropped.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| io_err(&dir, e))?;
            let mut children = Vec::new();
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
                children.push(entry.path());
            }
            children.sort();

            let mut subdirs = Vec::new();
            for child in children {
                let meta = tokio::fs::metadata(&child)
                    .await
                    .map_err(|e| io_err(&child, e))?;
                if meta.is_dir() {
                    subdirs.push(child);
                } else if meta.is_file() {
                    files.push(LocalFile {
                        relative: relative_to(&dropped_base, &child),
                        path: child,
                        size: meta.len(),
                    });
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }
    }

    log::debug!("local: {} paths expanded to {} files", paths.len(), files.len());
    Ok(files)
}
