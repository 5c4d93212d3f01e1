#![forbid(unsafe_code)]

//! Append-only error record kept next to the downloaded media.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::error::JobError;

pub const ERROR_LOG_FILE: &str = "error.log";

/// Writes one timestamped entry per unexpected failure. Entries are only ever
/// appended; the file is never truncated or rotated here.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            path: storage_root.join(ERROR_LOG_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a pipeline failure together with its cause chain.
    pub async fn record(&self, context: &str, error: &JobError) {
        tracing::error!(context, error = %error, "job failure");
        self.append(context, &error.to_string(), &error.chain()).await;
    }

    /// Records any other failure (listing, stat, startup).
    pub async fn record_anyhow(&self, context: &str, error: &anyhow::Error) {
        tracing::error!(context, error = %error, "unexpected failure");
        self.append(context, &error.to_string(), &format!("{error:?}"))
            .await;
    }

    async fn append(&self, context: &str, message: &str, stack: &str) {
        let entry = format_entry(
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            context,
            message,
            stack,
        );
        let _guard = self.write_lock.lock().await;
        let result = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(path = %self.path.display(), error = %err, "could not write error log");
        }
    }
}

fn format_entry(timestamp: &str, context: &str, message: &str, stack: &str) -> String {
    format!("{timestamp} - {context}: {message}\n{stack}\n\n")
}
