use std::env;
use std::path::PathBuf;

use crate::error::AppError;

const DEFAULT_MAX_WORKERS: usize = 3;

/// Process-wide configuration, read once at startup. Per-user overrides live
/// in the settings store and take precedence where both exist.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for per-user working copies of downloaded content.
    pub storage_dir: PathBuf,
    /// External downloader binary. It is run with `downloader_args`, then the
    /// requested URL, with its working directory set to the user's folder.
    pub downloader_path: PathBuf,
    pub downloader_args: Vec<String>,
    /// Label shown in captions and archive names.
    pub provider_label: String,
    /// Global fallback for the per-user `default_uploader` setting.
    pub default_uploader: Option<String>,
    pub gdrive_folder_id: Option<String>,
    pub use_service_accounts: bool,
    /// Pre-minted bearer token used when service-account auth is enabled.
    pub service_account_token: Option<PathBuf>,
    pub rclone_dest: Option<String>,
    pub rclone_config: Option<PathBuf>,
    pub rclone_flags: Option<String>,
    /// How many content items may be in flight at once.
    pub max_workers: usize,
    pub album_zip: bool,
    pub playlist_zip: bool,
    pub artist_zip: bool,
    pub video_as_document: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let downloader_path = env::var("DOWNLOADER_PATH")
            .map(PathBuf::from)
            .map_err(|_| AppError::ConfigMissing("DOWNLOADER_PATH".into()))?;

        Ok(Self {
            storage_dir: env::var("LOCAL_STORAGE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./downloads")),
            downloader_path,
            downloader_args: env::var("DOWNLOADER_ARGS")
                .map(|args| args.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            provider_label: env::var("PROVIDER_LABEL").unwrap_or_else(|_| "Music".to_string()),
            default_uploader: env::var("DEFAULT_UPLOAD").ok(),
            gdrive_folder_id: env::var("GDRIVE_ID").ok(),
            use_service_accounts: env_flag("USE_SERVICE_ACCOUNTS"),
            service_account_token: env::var("SERVICE_ACCOUNT_TOKEN").map(PathBuf::from).ok(),
            rclone_dest: env::var("RCLONE_DEST").ok(),
            rclone_config: env::var("RCLONE_CONFIG").map(PathBuf::from).ok(),
            rclone_flags: env::var("RCLONE_FLAGS").ok(),
            max_workers: env::var("MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_MAX_WORKERS),
            album_zip: env_flag("ALBUM_ZIP"),
            playlist_zip: env_flag("PLAYLIST_ZIP"),
            artist_zip: env_flag("ARTIST_ZIP"),
            video_as_document: env_flag("VIDEO_AS_DOCUMENT"),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./downloads"),
            downloader_path: PathBuf::from("downloader"),
            downloader_args: Vec::new(),
            provider_label: "Music".to_string(),
            default_uploader: None,
            gdrive_folder_id: None,
            use_service_accounts: false,
            service_account_token: None,
            rclone_dest: None,
            rclone_config: None,
            rclone_flags: None,
            max_workers: DEFAULT_MAX_WORKERS,
            album_zip: false,
            playlist_zip: false,
            artist_zip: false,
            video_as_document: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
        assert!(!config.album_zip);
        assert!(config.default_uploader.is_none());
    }
}
