//! Liveness tracking. The poll loop records each successful cycle; the `health` subcommand reads the heartbeat file
//! to tell a supervisor whether the bridge is still making progress.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct Liveness {
    last_success: Option<Instant>,
    heartbeat: Option<PathBuf>,
}

impl Liveness {
    pub fn new(heartbeat: Option<PathBuf>) -> Self {
        Self {
            last_success: None,
            heartbeat,
        }
    }

    #[cfg(test)]
    pub(crate) fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    pub async fn record_success(&mut self) {
        if let Some(previous) = self.last_success.replace(Instant::now()) {
            debug!(since = ?previous.elapsed(), "Poll succeeded");
        }

        if let Some(path) = &self.heartbeat {
            let contents = unix_now().as_secs().to_string();
            if let Err(error) = tokio::fs::write(path, contents).await {
                warn!(path = %path.display(), %error, "Could not write heartbeat file");
            }
        }
    }
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Whether the heartbeat at `path` is at most `max_age` old. A missing file means no cycle has succeeded yet.
pub fn check<P: AsRef<Path>>(path: P, max_age: Duration) -> crate::Result<bool> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(error.into()),
    };
    let written: u64 = contents
        .trim()
        .parse()
        .map_err(|_| format!("heartbeat file holds {:?}, not a timestamp", contents.trim()))?;

    let age = unix_now().saturating_sub(Duration::from_secs(written));
    Ok(age <= max_age)
}
