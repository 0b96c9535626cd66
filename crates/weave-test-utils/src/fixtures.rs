use std::path::PathBuf;

use tempfile::TempDir;
use tokio::sync::broadcast;

use weave_core::types::RuntimeEvent;

/// Write `content` to `weave.toml` in a fresh temp dir.
///
/// The directory is removed when the returned guard drops.
pub fn write_config(content: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("weave.toml");
    std::fs::write(&path, content).expect("write config");
    (dir, path)
}

/// Everything published so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Number of drained events matching `pred`.
pub fn count_where<F>(events: &[RuntimeEvent], pred: F) -> usize
where
    F: Fn(&RuntimeEvent) -> bool,
{
    events.iter().filter(|e| pred(e)).count()
}
