use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::AppError;

/// Which part of the produced tree a copy ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyScope {
    /// Only the unit itself.
    Leaf,
    /// The unit's enclosing folder, so remote browse/move operations keep
    /// the sibling context.
    Tree,
}

#[derive(Debug, Clone)]
pub struct RcloneTarget {
    /// `remote:path` destination root.
    pub dest: String,
    /// Contents of the rclone config to run with.
    pub config: Vec<u8>,
    pub flags: Option<String>,
    pub scope: CopyScope,
}

/// One materialized rclone invocation context. The config blob lives in a
/// scratch directory that is removed when the session drops, on every exit
/// path.
pub struct RcloneSession {
    _scratch: TempDir,
    config_path: PathBuf,
    flags: Vec<String>,
}

impl RcloneSession {
    pub async fn materialize(scratch_root: &Path, target: &RcloneTarget) -> Result<Self, AppError> {
        tokio::fs::create_dir_all(scratch_root).await?;
        let scratch = tempfile::Builder::new()
            .prefix("rclone-")
            .tempdir_in(scratch_root)?;
        let config_path = scratch.path().join("rclone.conf");
        tokio::fs::write(&config_path, &target.config).await?;
        let flags = target
            .flags
            .as_deref()
            .map(|flags| flags.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self {
            _scratch: scratch,
            config_path,
            flags,
        })
    }

    pub fn config_path(&self) -> &Path {
        self.config_path.as_path()
    }

    /// `rclone copy <source> <dest>`; a non-zero exit aborts the upload with
    /// the captured stderr.
    pub async fn copy(&self, source: &Path, dest: &str) -> Result<(), AppError> {
        debug!(source = %source.display(), dest, "running rclone copy");
        let mut command = Command::new("rclone");
        command
            .arg("copy")
            .arg("--config")
            .arg(&self.config_path);
        for flag in &self.flags {
            command.arg(flag);
        }
        command.arg(source).arg(dest);
        command.kill_on_drop(true);

        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Subprocess(format!(
                "rclone copy exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        info!(dest, "rclone copy finished");
        Ok(())
    }

    /// `rclone link <target>`; link generation is best-effort and degrades to
    /// `None` instead of failing the upload.
    pub async fn link(&self, target: &str) -> Option<String> {
        let result = Command::new("rclone")
            .arg("link")
            .arg("--config")
            .arg(&self.config_path)
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                let link = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if link.is_empty() {
                    None
                } else {
                    Some(link)
                }
            }
            Ok(output) => {
                debug!(
                    status = %output.status,
                    "rclone link failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(err) => {
                debug!("rclone link could not run: {err}");
                None
            }
        }
    }
}

/// Remote sub-path of `path` under the explicit `base` directory; falls back
/// to the basename when the path lies outside the base.
pub fn remote_subpath(path: &Path, base: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().replace('\\', "/"),
        _ => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

pub fn join_remote(dest: &str, sub: &str) -> String {
    if sub.is_empty() {
        dest.to_string()
    } else {
        format!("{}/{}", dest.trim_end_matches('/'), sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subpath_is_relative_to_the_base() {
        let base = Path::new("/data/7");
        let path = Path::new("/data/7/Artist/Album/01.m4a");
        assert_eq!(remote_subpath(path, base), "Artist/Album/01.m4a");
    }

    #[test]
    fn paths_outside_the_base_degrade_to_the_basename() {
        let base = Path::new("/data/7");
        let path = Path::new("/elsewhere/track.m4a");
        assert_eq!(remote_subpath(path, base), "track.m4a");
        // the base itself has no sub-path; use its name
        assert_eq!(remote_subpath(base, base), "7");
    }

    #[test]
    fn remote_paths_join_without_doubled_slashes() {
        assert_eq!(join_remote("remote:music/", "a/b.m4a"), "remote:music/a/b.m4a");
        assert_eq!(join_remote("remote:music", ""), "remote:music");
    }

    #[tokio::test]
    async fn materialize_writes_the_config_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let target = RcloneTarget {
            dest: "remote:music".into(),
            config: b"[remote]\ntype = local\n".to_vec(),
            flags: Some("--transfers 4".into()),
            scope: CopyScope::Leaf,
        };
        let scratch_path;
        {
            let session = RcloneSession::materialize(root.path(), &target).await.unwrap();
            scratch_path = session.config_path().to_path_buf();
            assert_eq!(
                tokio::fs::read(session.config_path()).await.unwrap(),
                target.config
            );
            assert_eq!(session.flags, vec!["--transfers", "4"]);
        }
        assert!(!scratch_path.exists());
    }
}
