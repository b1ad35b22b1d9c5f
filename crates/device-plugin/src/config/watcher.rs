use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Event;
use notify::EventKind;
use notify::event::ModifyKind;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use super::ConfigError;
use crate::platform::fswatch::parent_dir;
use crate::platform::fswatch::DirWatcher;

/// A watched configuration file changed, or watching it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChangeEvent {
    pub is_error: bool,
    pub filename: PathBuf,
    pub detail: String,
}

/// Reports changes to configuration files.
///
/// Parent directories are watched rather than the files themselves since
/// Kubernetes swaps ConfigMap contents by replacing a symlink, which shows
/// up only as a removal in the directory.
pub struct ConfigWatcher {
    _watcher: DirWatcher,
}

impl ConfigWatcher {
    /// Files whose directory does not exist are skipped.
    pub fn spawn(
        files: &[PathBuf],
        tx: mpsc::Sender<ConfigChangeEvent>,
    ) -> Result<Self, Report<ConfigError>> {
        let files: Vec<PathBuf> = files
            .iter()
            .filter(|file| {
                let exists = parent_dir(file).is_dir();
                if !exists {
                    warn!("not watching {}, its directory does not exist", file.display());
                }
                exists
            })
            .cloned()
            .collect();

        let mut dirs: Vec<PathBuf> = files.iter().map(|file| parent_dir(file)).collect();
        dirs.dedup();

        let (watcher, mut rx) =
            DirWatcher::new(&dirs, 16).change_context_lazy(|| ConfigError::Watch {
                path: dirs
                    .iter()
                    .map(|dir| dir.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let Some(event) = classify(&files, res) else {
                    continue;
                };
                info!(
                    "config file {} changed: {}",
                    event.filename.display(),
                    event.detail
                );
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

/// Maps a raw directory event to the config file it concerns.
fn classify(files: &[PathBuf], res: notify::Result<Event>) -> Option<ConfigChangeEvent> {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            let filename = e
                .paths
                .first()
                .cloned()
                .or_else(|| files.first().cloned())
                .unwrap_or_default();
            return Some(ConfigChangeEvent {
                is_error: true,
                filename,
                detail: e.to_string(),
            });
        }
    };

    if let EventKind::Remove(_) = event.kind {
        // a removal anywhere next to a watched file is how symlink swaps look
        let removed_dir = event.paths.first().map(|path| parent_dir(path));
        let filename = files
            .iter()
            .find(|file| Some(parent_dir(file)) == removed_dir)
            .or_else(|| files.first())?
            .clone();
        return Some(ConfigChangeEvent {
            is_error: false,
            filename,
            detail: "symlink updated".to_string(),
        });
    }

    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Any | ModifyKind::Data(_) | ModifyKind::Name(_))
    );
    if !relevant {
        return None;
    }

    let filename = files
        .iter()
        .find(|file| event.paths.iter().any(|path| same_file(path, file)))?
        .clone();
    Some(ConfigChangeEvent {
        is_error: false,
        filename,
        detail: format!("{:?}", event.kind),
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    a == b || (a.file_name() == b.file_name() && parent_dir(a).ends_with(parent_dir(b)))
}
