use async_trait::async_trait;
use dashmap::DashMap;

pub const KEY_DEFAULT_UPLOADER: &str = "default_uploader";
pub const KEY_GDRIVE_ID: &str = "gdrive_id";
pub const KEY_GDRIVE_TOKEN: &str = "gdrive_token";
pub const KEY_RCLONE_CONFIG: &str = "rclone_config";
pub const KEY_RCLONE_DEST: &str = "rclone_dest";
pub const KEY_RCLONE_FLAGS: &str = "rclone_flags";

/// Per-user key/value settings. Callers fall back to the global `Config`
/// when a key is unset, so lookups return `None` rather than erroring.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, user_id: u64, key: &str) -> Option<String>;
    async fn get_blob(&self, user_id: u64, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, user_id: u64, key: &str, value: String);
    async fn set_blob(&self, user_id: u64, key: &str, value: Vec<u8>);
}

#[derive(Default)]
pub struct MemorySettings {
    values: DashMap<(u64, String), String>,
    blobs: DashMap<(u64, String), Vec<u8>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, user_id: u64, key: &str) -> Option<String> {
        self.values
            .get(&(user_id, key.to_string()))
            .map(|entry| entry.clone())
    }

    async fn get_blob(&self, user_id: u64, key: &str) -> Option<Vec<u8>> {
        self.blobs
            .get(&(user_id, key.to_string()))
            .map(|entry| entry.clone())
    }

    async fn set(&self, user_id: u64, key: &str, value: String) {
        self.values.insert((user_id, key.to_string()), value);
    }

    async fn set_blob(&self, user_id: u64, key: &str, value: Vec<u8>) {
        self.blobs.insert((user_id, key.to_string()), value);
    }
}
