use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
#[error("failed to watch {path}")]
pub struct WatchError {
    pub path: String,
}

/// Watches directories (non-recursively) and forwards raw notify results
/// onto a tokio channel. Watching stops when this value is dropped.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    pub fn new(
        dirs: &[PathBuf],
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<notify::Result<Event>>), Report<WatchError>> {
        let (std_tx, std_rx) = std_mpsc::channel();
        let (tx, rx) = mpsc::channel(capacity);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // receiver gone means the forwarding task already ended
                let _ = std_tx.send(res);
            },
            Config::default(),
        )
        .change_context(WatchError {
            path: display_all(dirs),
        })?;

        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .change_context_lazy(|| WatchError {
                    path: dir.display().to_string(),
                })?;
            debug!("watching {}", dir.display());
        }

        // notify calls back on its own thread; bridge into the runtime
        tokio::task::spawn_blocking(move || {
            while let Ok(res) = std_rx.recv() {
                if tx.blocking_send(res).is_err() {
                    break;
                }
            }
        });

        Ok((Self { _watcher: watcher }, rx))
    }
}

fn display_all(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|dir| dir.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Directory holding `path`, or `.` for a bare file name.
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
