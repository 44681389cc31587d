use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::LOCATION;
use tempfile::TempDir;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::AppError;

const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=resumable";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone)]
pub struct DriveTarget {
    pub folder_id: String,
    pub auth: DriveAuth,
}

#[derive(Debug, Clone)]
pub enum DriveAuth {
    /// Global credentials managed by the operator.
    ServiceAccount,
    /// Per-user token blob, materialized to a scratch file for one call.
    UserToken(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct DriveOutcome {
    pub link: String,
    /// Uploaded files and created folders, counted separately.
    pub files: u64,
    pub folders: u64,
    pub bytes: u64,
}

impl DriveOutcome {
    pub fn item_count(&self) -> u64 {
        self.files + self.folders
    }
}

/// The cloud-storage collaborator. Failure detail is opaque to the caller.
#[async_trait]
pub trait DriveClient: Send + Sync {
    async fn upload(
        &self,
        path: &Path,
        folder_id: &str,
        token_path: &Path,
    ) -> Result<DriveOutcome, String>;
}

/// Per-user credential material written under the user's storage directory
/// for the duration of one upload. Dropping the guard removes the whole
/// scratch directory, so cleanup holds on every exit path.
pub struct CredentialScratch {
    _dir: TempDir,
    token_path: PathBuf,
}

impl CredentialScratch {
    pub async fn for_user_token(scratch_root: &Path, blob: &[u8]) -> Result<Self, AppError> {
        tokio::fs::create_dir_all(scratch_root).await?;
        let dir = tempfile::Builder::new()
            .prefix("drive-creds-")
            .tempdir_in(scratch_root)?;
        let token_path = dir.path().join("token");
        tokio::fs::write(&token_path, blob).await?;
        Ok(Self {
            _dir: dir,
            token_path,
        })
    }

    pub fn token_path(&self) -> &Path {
        self.token_path.as_path()
    }
}

/// Drive REST client: resumable uploads, folder recursion, share links.
pub struct RestDriveClient {
    http: reqwest::Client,
}

impl RestDriveClient {
    pub fn new() -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }

    async fn create_folder(&self, token: &str, name: &str, parent: &str) -> Result<String, String> {
        let body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent],
        });
        let response = self
            .http
            .post(DRIVE_FILES_URL)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| format!("create folder: {err}"))?;
        parse_file_id(response).await
    }

    async fn upload_file(&self, token: &str, path: &Path, parent: &str) -> Result<String, String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let metadata = serde_json::json!({ "name": name, "parents": [parent] });

        let response = self
            .http
            .post(DRIVE_UPLOAD_URL)
            .bearer_auth(token)
            .json(&metadata)
            .send()
            .await
            .map_err(|err| format!("start upload: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("start upload: HTTP {}", response.status()));
        }
        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| "start upload: missing session URL".to_string())?
            .to_string();

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|err| format!("open {}: {err}", path.display()))?;
        let length = file
            .metadata()
            .await
            .map_err(|err| format!("stat {}: {err}", path.display()))?
            .len();
        debug!(name, bytes = length, "uploading file to drive");
        let response = self
            .http
            .put(&session_url)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|err| format!("upload {name}: {err}"))?;
        parse_file_id(response).await
    }

    async fn share(&self, token: &str, file_id: &str) -> Result<(), String> {
        let body = serde_json::json!({ "role": "reader", "type": "anyone" });
        let response = self
            .http
            .post(format!("{DRIVE_FILES_URL}/{file_id}/permissions"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| format!("share: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("share: HTTP {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl DriveClient for RestDriveClient {
    async fn upload(
        &self,
        path: &Path,
        folder_id: &str,
        token_path: &Path,
    ) -> Result<DriveOutcome, String> {
        let token = tokio::fs::read_to_string(token_path)
            .await
            .map_err(|err| format!("read credentials: {err}"))?
            .trim()
            .to_string();

        let mut files = 0u64;
        let mut folders = 0u64;
        let mut bytes = 0u64;

        if path.is_dir() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let root_id = self.create_folder(&token, &name, folder_id).await?;
            folders += 1;

            let mut queue: Vec<(PathBuf, String)> = vec![(path.to_path_buf(), root_id.clone())];
            while let Some((dir, parent)) = queue.pop() {
                let mut entries = tokio::fs::read_dir(&dir)
                    .await
                    .map_err(|err| format!("read {}: {err}", dir.display()))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|err| format!("read {}: {err}", dir.display()))?
                {
                    let entry_path = entry.path();
                    if entry_path.is_dir() {
                        let child_name = entry.file_name().to_string_lossy().into_owned();
                        let child_id =
                            self.create_folder(&token, &child_name, &parent).await?;
                        folders += 1;
                        queue.push((entry_path, child_id));
                    } else {
                        bytes += entry
                            .metadata()
                            .await
                            .map(|meta| meta.len())
                            .unwrap_or(0);
                        self.upload_file(&token, &entry_path, &parent).await?;
                        files += 1;
                    }
                }
            }

            self.share(&token, &root_id).await?;
            info!(files, folders, "drive folder upload finished");
            Ok(DriveOutcome {
                link: format!("https://drive.google.com/drive/folders/{root_id}"),
                files,
                folders,
                bytes,
            })
        } else {
            bytes += tokio::fs::metadata(path)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0);
            let file_id = self.upload_file(&token, path, folder_id).await?;
            self.share(&token, &file_id).await?;
            info!("drive file upload finished");
            Ok(DriveOutcome {
                link: format!("https://drive.google.com/file/d/{file_id}/view"),
                files: 1,
                folders: 0,
                bytes,
            })
        }
    }
}

async fn parse_file_id(response: reqwest::Response) -> Result<String, String> {
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        let detail: String = detail.trim().chars().take(200).collect();
        return Err(format!("HTTP {status}: {detail}"));
    }
    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|err| format!("decode response: {err}"))?;
    value["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| "response missing file id".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scratch_token_is_written_and_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let token_path;
        {
            let scratch = CredentialScratch::for_user_token(root.path(), b"ya29.token")
                .await
                .unwrap();
            token_path = scratch.token_path().to_path_buf();
            assert_eq!(
                tokio::fs::read(scratch.token_path()).await.unwrap(),
                b"ya29.token"
            );
        }
        assert!(!token_path.exists());
        // the user's scratch root itself survives
        assert!(root.path().exists());
    }
}
