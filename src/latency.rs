use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::Result;

#[derive(Debug, Serialize)]
struct Entry<'a> {
    timestamp: String,
    function: &'a str,
    duration: String,
}

/// Named timings, logged and optionally appended to a JSON-lines file.
#[derive(Debug, Clone, Default)]
pub struct LatencyLog {
    path: Option<PathBuf>,
}

impl LatencyLog {
    #[must_use]
    pub const fn disabled() -> Self {
        Self { path: None }
    }

    #[must_use]
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()) }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one measurement. A failing file write is logged, not returned.
    pub async fn record(&self, function: &str, elapsed: Duration) {
        tracing::info!(function, duration_secs = elapsed.as_secs_f64(), "Runtime recorded");
        if let Some(path) = &self.path {
            if let Err(err) = append(path, function, elapsed).await {
                tracing::warn!(path = %path.display(), error = %err, "Failed to append latency entry");
            }
        }
    }
}

async fn append(path: &Path, function: &str, elapsed: Duration) -> Result<()> {
    let entry = Entry {
        timestamp: chrono::Local::now().to_rfc3339(),
        function,
        duration: format!("{:.4}", elapsed.as_secs_f64()),
    };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
