use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::content::{ContentItem, ContentKind};
use crate::error::AppError;
use crate::progress::{ProgressReporter, Stage};

/// Largest unit the chat transport accepts (1.9 GiB, leaving headroom under
/// the platform's 2 GiB cap).
pub const TELEGRAM_SIZE_CEILING: u64 = 19 * 1024 * 1024 * 1024 / 10;

const MAX_NAME_LEN: usize = 100;

/// One archive chunk produced by packaging.
#[derive(Debug, Clone)]
pub struct ZipPart {
    pub index: usize,
    pub total: usize,
    pub path: PathBuf,
    /// Sum of the source file sizes written into this part.
    pub source_bytes: u64,
    pub file_count: usize,
}

/// Split a folder into archives that each stay under `ceiling` source bytes.
///
/// Parts are sealed before they would cross the ceiling, so an early part may
/// come out undersized. Source files are deleted as they are archived, which
/// bounds peak disk usage to sealed parts plus the not-yet-archived originals.
/// On cancellation every archive created so far is removed and the remaining
/// source files are left untouched.
pub fn split_zip_folder(
    folder: &Path,
    ceiling: u64,
    reporter: Option<&ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<Vec<ZipPart>, AppError> {
    let files = collect_files(folder)?;
    let total_files = files.len() as u64;
    if let Some(reporter) = reporter {
        reporter.set_stage(Stage::Zipping);
        if total_files > 0 {
            reporter.update_zip(0, total_files);
        }
    }

    let mut parts: Vec<ZipPart> = Vec::new();
    let mut pending: Vec<SourceFile> = Vec::new();
    let mut pending_bytes = 0u64;
    let mut part_num = 1usize;
    let mut done = 0u64;

    let result = (|| {
        for file in files {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if !pending.is_empty() && pending_bytes + file.size > ceiling {
                let path = part_path(folder, part_num);
                let part = seal_part(
                    &path,
                    part_num,
                    &pending,
                    reporter,
                    cancel,
                    &mut done,
                    total_files,
                )?;
                parts.push(part);
                part_num += 1;
                pending.clear();
                pending_bytes = 0;
            }
            pending_bytes += file.size;
            pending.push(file);
        }
        if !pending.is_empty() {
            let path = part_path(folder, part_num);
            let part = seal_part(
                &path,
                part_num,
                &pending,
                reporter,
                cancel,
                &mut done,
                total_files,
            )?;
            parts.push(part);
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            let total = parts.len();
            for part in &mut parts {
                part.total = total;
            }
            Ok(parts)
        }
        Err(err) => {
            // no partial output survives a failed or cancelled packaging run
            for part in &parts {
                let _ = fs::remove_file(&part.path);
            }
            let _ = fs::remove_file(part_path(folder, part_num));
            Err(err)
        }
    }
}

/// Archive a whole folder that already fits under the transport ceiling into
/// one descriptively named zip placed next to the folder.
pub fn create_content_zip(
    folder: &Path,
    item: &ContentItem,
    reporter: Option<&ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<ZipPart, AppError> {
    let parent = folder.parent().unwrap_or(folder);
    let zip_path = unique_zip_path(parent, &archive_stem(item));

    let files = collect_files(folder)?;
    let total_files = files.len() as u64;
    if let Some(reporter) = reporter {
        reporter.set_stage(Stage::Zipping);
        if total_files > 0 {
            reporter.update_zip(0, total_files);
        }
    }

    let mut done = 0u64;
    match seal_part(&zip_path, 1, &files, reporter, cancel, &mut done, total_files) {
        Ok(part) => Ok(part),
        Err(err) => {
            let _ = fs::remove_file(&zip_path);
            Err(err)
        }
    }
}

struct SourceFile {
    path: PathBuf,
    size: u64,
    arc_name: String,
}

fn collect_files(folder: &Path) -> Result<Vec<SourceFile>, AppError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry.map_err(|err| AppError::Io(err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|err| AppError::Io(err.into()))?
            .len();
        let arc_name = entry
            .path()
            .strip_prefix(folder)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push(SourceFile {
            path: entry.path().to_path_buf(),
            size,
            arc_name,
        });
    }
    Ok(files)
}

fn seal_part(
    zip_path: &Path,
    index: usize,
    files: &[SourceFile],
    reporter: Option<&ProgressReporter>,
    cancel: &CancellationToken,
    done: &mut u64,
    total_files: u64,
) -> Result<ZipPart, AppError> {
    let out = File::create(zip_path)?;
    let mut writer = ZipWriter::new(out);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut source_bytes = 0u64;

    for file in files {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        writer.start_file(file.arc_name.as_str(), options)?;
        let mut source = File::open(&file.path)?;
        io::copy(&mut source, &mut writer)?;
        fs::remove_file(&file.path)?;
        source_bytes += file.size;
        *done += 1;
        if let Some(reporter) = reporter {
            reporter.update_zip(*done, total_files);
        }
    }
    writer.finish()?;

    Ok(ZipPart {
        index,
        total: index,
        path: zip_path.to_path_buf(),
        source_bytes,
        file_count: files.len(),
    })
}

fn part_path(folder: &Path, part_num: usize) -> PathBuf {
    let mut name = folder.as_os_str().to_os_string();
    if part_num == 1 {
        name.push(".zip");
    } else {
        name.push(format!(".part{part_num}.zip"));
    }
    PathBuf::from(name)
}

/// Strip path-hostile characters, collapse whitespace runs to underscores
/// and bound the length.
pub fn sanitize_title(title: &str) -> String {
    let stripped: String = title
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(MAX_NAME_LEN)
        .collect()
}

fn archive_stem(item: &ContentItem) -> String {
    let mut safe = sanitize_title(&item.title);
    if safe.is_empty() {
        safe = format!(
            "{}_{}",
            sanitize_title(&item.provider),
            chrono::Utc::now().timestamp()
        );
    }
    let qualifier = match item.kind {
        ContentKind::Playlist => " (Playlist)",
        ContentKind::Artist => " (Artist)",
        ContentKind::Video => " (Video)",
        ContentKind::Album | ContentKind::Track => "",
    };
    format!("[{}] {safe}{qualifier}", item.provider)
}

fn unique_zip_path(dir: &Path, stem: &str) -> PathBuf {
    let mut path = dir.join(format!("{stem}.zip"));
    let mut counter = 1;
    while path.exists() {
        path = dir.join(format!("{stem}_{counter}.zip"));
        counter += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentLocation;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn item_for(folder: &Path, kind: ContentKind, title: &str) -> ContentItem {
        ContentItem {
            kind,
            title: title.to_string(),
            artist: "Artist".to_string(),
            provider: "Music".to_string(),
            location: ContentLocation::Folder(folder.to_path_buf()),
            tracks: Vec::new(),
            tags: None,
        }
    }

    fn write_tree(root: &Path, files: &[(&str, usize)]) -> BTreeMap<String, Vec<u8>> {
        let mut contents = BTreeMap::new();
        for (i, (name, size)) in files.iter().enumerate() {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            let data = vec![i as u8 + 1; *size];
            fs::write(&path, &data).unwrap();
            contents.insert(name.replace('\\', "/"), data);
        }
        contents
    }

    fn read_archive(path: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut out = BTreeMap::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(entry.name().to_string(), data);
        }
        out
    }

    #[test]
    fn small_folder_round_trips_through_a_single_archive() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("album");
        fs::create_dir(&folder).unwrap();
        let originals = write_tree(&folder, &[("01.m4a", 40), ("02.m4a", 50), ("art/cover.jpg", 10)]);

        let item = item_for(&folder, ContentKind::Album, "My Album");
        let part =
            create_content_zip(&folder, &item, None, &CancellationToken::new()).unwrap();

        assert_eq!(part.file_count, 3);
        assert_eq!(part.source_bytes, 100);
        let name = part.path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "[Music] My_Album.zip");
        assert_eq!(read_archive(&part.path), originals);
        // sources are consumed as they are archived
        assert!(!folder.join("01.m4a").exists());
    }

    #[test]
    fn oversized_folder_splits_into_bounded_parts() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("album");
        fs::create_dir(&folder).unwrap();
        let originals = write_tree(
            &folder,
            &[("a.m4a", 40), ("b.m4a", 40), ("c.m4a", 40), ("d.m4a", 40)],
        );

        let parts =
            split_zip_folder(&folder, 100, None, &CancellationToken::new()).unwrap();

        assert_eq!(parts.len(), 2);
        let mut union = BTreeMap::new();
        for part in &parts {
            assert!(part.source_bytes <= 100);
            assert_eq!(part.total, 2);
            for (name, data) in read_archive(&part.path) {
                assert!(union.insert(name, data).is_none(), "duplicate entry");
            }
        }
        assert_eq!(union, originals);
        assert_eq!(parts[0].index, 1);
        assert_eq!(parts[1].index, 2);
        assert!(parts[0].path.to_string_lossy().ends_with("album.zip"));
        assert!(parts[1].path.to_string_lossy().ends_with("album.part2.zip"));
    }

    #[test]
    fn cancelled_split_leaves_no_archives_and_keeps_sources() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("album");
        fs::create_dir(&folder).unwrap();
        write_tree(&folder, &[("a.m4a", 40), ("b.m4a", 40)]);

        let token = CancellationToken::new();
        token.cancel();
        let result = split_zip_folder(&folder, 100, None, &token);
        assert!(matches!(result, Err(AppError::Cancelled)));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "zip"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(folder.join("a.m4a").exists());
        assert!(folder.join("b.m4a").exists());
    }

    #[test]
    fn empty_folder_packs_without_dividing_by_zero() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("album");
        fs::create_dir(&folder).unwrap();
        let item = item_for(&folder, ContentKind::Album, "Empty");
        let part =
            create_content_zip(&folder, &item, None, &CancellationToken::new()).unwrap();
        assert_eq!(part.file_count, 0);
        assert!(part.path.exists());
    }

    #[test]
    fn names_collide_into_numbered_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("[Music] Taken.zip"), b"x").unwrap();
        let path = unique_zip_path(dir.path(), "[Music] Taken");
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "[Music] Taken_1.zip"
        );
    }

    #[test]
    fn titles_are_sanitized_for_the_filesystem() {
        assert_eq!(sanitize_title("A/B:C?D"), "ABCD");
        assert_eq!(sanitize_title("  spaced   out  "), "spaced_out");
        let long = "x".repeat(300);
        assert_eq!(sanitize_title(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn empty_titles_fall_back_to_a_timestamped_name() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("album");
        fs::create_dir(&folder).unwrap();
        let item = item_for(&folder, ContentKind::Playlist, "???");
        let stem = archive_stem(&item);
        assert!(stem.starts_with("[Music] Music_"));
        assert!(stem.ends_with(" (Playlist)"));
        assert!(!stem.contains('?'));
    }
}
