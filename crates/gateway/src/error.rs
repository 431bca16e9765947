use std::path::PathBuf;

use thiserror::Error;

/// Why the instance lock could not be taken.
#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "another gateway is already running (lock {}, pid {})",
        .path.display(),
        display_pid(.pid)
    )]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("failed to open instance lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_pid(pid: &Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_running_names_pid_and_path() {
        let err = LockError::AlreadyRunning {
            path: PathBuf::from("/tmp/gateway.lock"),
            pid: Some(4242),
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("/tmp/gateway.lock"));

        let unknown = LockError::AlreadyRunning {
            path: PathBuf::from("/tmp/gateway.lock"),
            pid: None,
        };
        assert!(unknown.to_string().contains("pid unknown"));
    }
}
