use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Track,
    Video,
    Album,
    Playlist,
    Artist,
}

impl ContentKind {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ContentKind::Album | ContentKind::Playlist | ContentKind::Artist
        )
    }
}

/// A content item points at exactly one of a file or a folder, never both.
#[derive(Debug, Clone)]
pub enum ContentLocation {
    File(PathBuf),
    Folder(PathBuf),
}

impl ContentLocation {
    pub fn path(&self) -> &Path {
        match self {
            ContentLocation::File(path) | ContentLocation::Folder(path) => path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackTags {
    pub duration_secs: u32,
    pub thumbnail: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ContentItem {
    pub kind: ContentKind,
    pub title: String,
    pub artist: String,
    pub provider: String,
    pub location: ContentLocation,
    /// Ordered children for container kinds; empty for leaves.
    pub tracks: Vec<ContentItem>,
    pub tags: Option<TrackTags>,
}

impl ContentItem {
    pub fn path(&self) -> &Path {
        self.location.path()
    }

    pub fn is_container(&self) -> bool {
        matches!(self.location, ContentLocation::Folder(_))
    }

    /// Byte size of the backing file or folder, computed off the async path.
    pub async fn byte_size(&self) -> Result<u64, AppError> {
        let path = self.path().to_path_buf();
        let size = tokio::task::spawn_blocking(move || disk_usage(&path)).await??;
        Ok(size)
    }
}

/// Metadata pulled out of a media file by the tag-reading collaborator.
#[derive(Debug, Clone)]
pub struct TrackMeta {
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
    pub thumbnail: Option<PathBuf>,
}

pub trait TagReader: Send + Sync {
    fn read(&self, path: &Path) -> TrackMeta;
}

/// Fallback reader: derives the title from the file name. Used when no real
/// tag extractor is wired in, and as the degraded path when extraction fails.
pub struct FileStemTags;

impl TagReader for FileStemTags {
    fn read(&self, path: &Path) -> TrackMeta {
        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Unknown".to_string());
        TrackMeta {
            title,
            artist: "Unknown Artist".to_string(),
            duration_secs: 0,
            thumbnail: None,
        }
    }
}

pub fn disk_usage(path: &Path) -> io::Result<u64> {
    let metadata = path.metadata()?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}

pub fn is_audio_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("m4a" | "mp3" | "flac" | "ogg" | "opus" | "wav" | "aac")
    )
}

pub fn is_video_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("mp4" | "m4v" | "mov" | "mkv" | "webm")
    )
}

/// Build a content item from whatever the downloader left in `root`.
///
/// A single audio file is a track, a single video file a video, anything
/// else a container; `hint` overrides the container kind for playlist and
/// discography requests, which cannot be told apart from the files alone.
pub fn discover_content(
    root: &Path,
    provider: &str,
    tags: &dyn TagReader,
    hint: Option<ContentKind>,
) -> Result<ContentItem, AppError> {
    let root = effective_root(root)?;
    let root = root.as_path();
    let mut media: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| AppError::Io(err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if is_audio_file(path) || is_video_file(path) {
            media.push(path.to_path_buf());
        }
    }

    if media.is_empty() {
        return Err(AppError::Subprocess(
            "downloader produced no media files".to_string(),
        ));
    }

    if media.len() == 1 {
        let path = media.remove(0);
        let kind = if is_video_file(&path) {
            ContentKind::Video
        } else {
            ContentKind::Track
        };
        return Ok(leaf_item(kind, path, provider, tags));
    }

    let kind = match hint {
        Some(kind) if kind.is_container() => kind,
        _ => ContentKind::Album,
    };
    let tracks: Vec<ContentItem> = media
        .into_iter()
        .map(|path| {
            let kind = if is_video_file(&path) {
                ContentKind::Video
            } else {
                ContentKind::Track
            };
            leaf_item(kind, path, provider, tags)
        })
        .collect();

    let title = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Unknown".to_string());
    let artist = tracks
        .first()
        .map(|track| track.artist.clone())
        .unwrap_or_else(|| "Unknown Artist".to_string());

    Ok(ContentItem {
        kind,
        title,
        artist,
        provider: provider.to_string(),
        location: ContentLocation::Folder(root.to_path_buf()),
        tracks,
        tags: None,
    })
}

/// Descend through wrapper directories that hold nothing but a single
/// subdirectory, so the content folder keeps its meaningful name instead of
/// the scratch directory's.
fn effective_root(root: &Path) -> Result<PathBuf, AppError> {
    let mut current = root.to_path_buf();
    loop {
        let mut subdirs: Vec<PathBuf> = Vec::new();
        let mut has_files = false;
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                subdirs.push(entry.path());
            } else {
                has_files = true;
            }
        }
        if has_files || subdirs.len() != 1 {
            return Ok(current);
        }
        current = subdirs.remove(0);
    }
}

fn leaf_item(kind: ContentKind, path: PathBuf, provider: &str, tags: &dyn TagReader) -> ContentItem {
    let meta = tags.read(&path);
    ContentItem {
        kind,
        title: meta.title,
        artist: meta.artist,
        provider: provider.to_string(),
        location: ContentLocation::File(path),
        tracks: Vec::new(),
        tags: Some(TrackTags {
            duration_secs: meta.duration_secs,
            thumbnail: meta.thumbnail,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::write(path, b"data").unwrap();
    }

    #[test]
    fn single_audio_file_is_a_track() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("song.m4a"));
        let item = discover_content(dir.path(), "Music", &FileStemTags, None).unwrap();
        assert_eq!(item.kind, ContentKind::Track);
        assert_eq!(item.title, "song");
        assert!(matches!(item.location, ContentLocation::File(_)));
    }

    #[test]
    fn multiple_files_become_an_album_with_ordered_tracks() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("01 first.m4a"));
        touch(&dir.path().join("02 second.m4a"));
        touch(&dir.path().join("cover.jpg"));
        let item = discover_content(dir.path(), "Music", &FileStemTags, None).unwrap();
        assert_eq!(item.kind, ContentKind::Album);
        assert_eq!(item.tracks.len(), 2);
        assert_eq!(item.tracks[0].title, "01 first");
        assert!(matches!(item.location, ContentLocation::Folder(_)));
    }

    #[test]
    fn container_hint_overrides_album() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.m4a"));
        touch(&dir.path().join("b.m4a"));
        let item =
            discover_content(dir.path(), "Music", &FileStemTags, Some(ContentKind::Playlist))
                .unwrap();
        assert_eq!(item.kind, ContentKind::Playlist);
    }

    #[test]
    fn wrapper_directories_are_descended_for_the_real_title() {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join("Artist").join("Great Album");
        fs::create_dir_all(&album).unwrap();
        touch(&album.join("01.m4a"));
        touch(&album.join("02.m4a"));
        let item = discover_content(dir.path(), "Music", &FileStemTags, None).unwrap();
        assert_eq!(item.title, "Great Album");
        assert_eq!(item.path(), album.as_path());
    }

    #[test]
    fn empty_directory_is_a_downloader_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_content(dir.path(), "Music", &FileStemTags, None).unwrap_err();
        assert!(matches!(err, AppError::Subprocess(_)));
    }

    #[test]
    fn disk_usage_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("inner")).unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("inner/b.bin"), vec![0u8; 32]).unwrap();
        assert_eq!(disk_usage(dir.path()).unwrap(), 42);
    }
}
