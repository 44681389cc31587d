use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Telegram request error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    #[error("Subprocess failed: {0}")]
    Subprocess(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("Cloud storage error: {0}")]
    CloudStorage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Network(_) => true,
            AppError::Reqwest(err) => err.is_timeout() || err.is_connect(),
            AppError::Telegram(teloxide::RequestError::Network(err)) => {
                err.is_timeout() || err.is_connect()
            }
            _ => false,
        }
    }

    /// The text shown to the requesting user when this error ends a job.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Cancelled => "Cancelled.".to_string(),
            AppError::ConfigMissing(what) => format!("Missing configuration: {what}."),
            AppError::Subprocess(detail) => format!("External tool failed: {detail}"),
            AppError::CloudStorage(detail) => format!("Cloud upload failed: {detail}"),
            AppError::Archive(err) => format!("Packaging failed: {err}"),
            AppError::Io(err) => format!("File error: {err}"),
            other => format!("Upload failed: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_transient() {
        assert!(AppError::Network("connection reset".into()).is_transient());
        assert!(!AppError::Cancelled.is_transient());
        assert!(!AppError::ConfigMissing("rclone dest".into()).is_transient());
        assert!(!AppError::RateLimited(Duration::from_secs(4)).is_transient());
    }

    #[test]
    fn cancellation_has_a_distinct_user_message() {
        assert_eq!(AppError::Cancelled.user_message(), "Cancelled.");
        let failed = AppError::Subprocess("exit code 2".into()).user_message();
        assert!(failed.contains("exit code 2"));
    }
}
