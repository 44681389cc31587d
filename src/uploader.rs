use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{self, ZipPart, TELEGRAM_SIZE_CEILING};
use crate::config::Config;
use crate::content::{ContentItem, ContentKind, ContentLocation};
use crate::error::AppError;
use crate::gdrive::{CredentialScratch, DriveAuth, DriveClient, DriveTarget};
use crate::handlers::Services;
use crate::progress::{human_size, ProgressReporter, Stage};
use crate::rclone::{self, CopyScope, RcloneSession, RcloneTarget};
use crate::settings::{self, SettingsStore};
use crate::telegram::{
    send_file_with_retry, AttachmentKind, ChatRef, FileAttachment, Messenger, StatusMessage,
    TransferHook,
};

/// Everything one request carries through the pipeline.
pub struct JobContext {
    pub user_id: u64,
    pub chat: ChatRef,
    pub display_name: String,
    pub status: StatusMessage,
    pub cancel: CancellationToken,
    pub reporter: Option<Arc<ProgressReporter>>,
}

/// Where one upload goes. Adding a destination means adding a variant here
/// and an adapter below, nothing else.
#[derive(Debug, Clone)]
pub enum UploadDestination {
    Telegram,
    GDrive(DriveTarget),
    Rclone(RcloneTarget),
}

#[derive(Debug, Clone, Default)]
pub struct UploadOutcome {
    pub link: Option<String>,
    pub location: Option<String>,
}

/// One transportable unit: a media leaf, or one sealed archive part.
pub enum UnitPayload<'a> {
    Media(&'a ContentItem),
    Archive { part: &'a ZipPart, caption: &'a str },
}

pub struct Unit<'a> {
    pub payload: UnitPayload<'a>,
    pub index: Option<u64>,
    pub count: Option<u64>,
}

impl Unit<'_> {
    pub fn path(&self) -> &Path {
        match &self.payload {
            UnitPayload::Media(item) => item.path(),
            UnitPayload::Archive { part, .. } => &part.path,
        }
    }
}

#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Largest unit the destination accepts, if it has a limit. Packaging
    /// decisions key off this.
    fn size_ceiling(&self) -> Option<u64>;

    async fn deliver(&self, unit: Unit<'_>, ctx: &JobContext) -> Result<UploadOutcome, AppError>;
}

/// Resolve where this user's uploads go: per-user setting, else the global
/// default, else Telegram.
pub async fn resolve_destination(
    store: &dyn SettingsStore,
    config: &Config,
    user_id: u64,
) -> Result<UploadDestination, AppError> {
    let choice = match store.get(user_id, settings::KEY_DEFAULT_UPLOADER).await {
        Some(value) => value,
        None => config
            .default_uploader
            .clone()
            .unwrap_or_else(|| "telegram".to_string()),
    };
    match choice.to_ascii_lowercase().as_str() {
        "gdrive" => Ok(UploadDestination::GDrive(
            resolve_drive_target(store, config, user_id).await?,
        )),
        "rclone" => Ok(UploadDestination::Rclone(
            resolve_rclone_target(store, config, user_id).await?,
        )),
        _ => Ok(UploadDestination::Telegram),
    }
}

async fn resolve_drive_target(
    store: &dyn SettingsStore,
    config: &Config,
    user_id: u64,
) -> Result<DriveTarget, AppError> {
    let folder_id = match store.get(user_id, settings::KEY_GDRIVE_ID).await {
        Some(id) => id,
        None => config.gdrive_folder_id.clone().ok_or_else(|| {
            AppError::ConfigMissing(
                "Google Drive folder id (set it in uploader settings or GDRIVE_ID)".into(),
            )
        })?,
    };
    let auth = if config.use_service_accounts {
        DriveAuth::ServiceAccount
    } else {
        let blob = store
            .get_blob(user_id, settings::KEY_GDRIVE_TOKEN)
            .await
            .ok_or_else(|| {
                AppError::ConfigMissing(
                    "Google Drive token (upload it in uploader settings)".into(),
                )
            })?;
        DriveAuth::UserToken(blob)
    };
    Ok(DriveTarget { folder_id, auth })
}

async fn resolve_rclone_target(
    store: &dyn SettingsStore,
    config: &Config,
    user_id: u64,
) -> Result<RcloneTarget, AppError> {
    let config_blob = match store.get_blob(user_id, settings::KEY_RCLONE_CONFIG).await {
        Some(blob) => blob,
        None => {
            let path = config.rclone_config.as_ref().ok_or_else(rclone_config_missing)?;
            tokio::fs::read(path)
                .await
                .map_err(|_| rclone_config_missing())?
        }
    };
    let dest = match store.get(user_id, settings::KEY_RCLONE_DEST).await {
        Some(dest) => dest,
        None => config.rclone_dest.clone().ok_or_else(|| {
            AppError::ConfigMissing(
                "rclone destination (set it in uploader settings or RCLONE_DEST)".into(),
            )
        })?,
    };
    let flags = match store.get(user_id, settings::KEY_RCLONE_FLAGS).await {
        Some(flags) => Some(flags),
        None => config.rclone_flags.clone(),
    };
    Ok(RcloneTarget {
        dest,
        config: config_blob,
        flags,
        scope: CopyScope::Leaf,
    })
}

fn rclone_config_missing() -> AppError {
    AppError::ConfigMissing(
        "rclone config (upload rclone.conf in uploader settings or set RCLONE_CONFIG)".into(),
    )
}

/// Deliver one content item to the user's destination: resolve, package if
/// the transport needs it, transfer unit by unit, then clean up.
pub async fn upload_content(
    services: &Services,
    ctx: &JobContext,
    item: &ContentItem,
) -> Result<UploadOutcome, AppError> {
    let mut destination =
        resolve_destination(services.settings.as_ref(), &services.config, ctx.user_id).await?;
    if let UploadDestination::Rclone(target) = &mut destination {
        target.scope = if item.is_container() {
            CopyScope::Tree
        } else {
            CopyScope::Leaf
        };
    }

    let user_dir = services.config.storage_dir.join(ctx.user_id.to_string());
    let adapter = build_adapter(services, &destination, &user_dir);
    let outcome = dispatch(&services.config, ctx, item, adapter.as_ref()).await?;

    if !matches!(destination, UploadDestination::Telegram) {
        remove_source(item).await;
    }
    Ok(outcome)
}

fn build_adapter(
    services: &Services,
    destination: &UploadDestination,
    user_dir: &Path,
) -> Box<dyn DestinationAdapter> {
    match destination {
        UploadDestination::Telegram => Box::new(TelegramAdapter {
            messenger: services.messenger.clone(),
            video_as_document: services.config.video_as_document,
        }),
        UploadDestination::GDrive(target) => Box::new(DriveAdapter {
            client: services.drive.clone(),
            target: target.clone(),
            scratch_root: user_dir.to_path_buf(),
            service_account_token: services.config.service_account_token.clone(),
        }),
        UploadDestination::Rclone(target) => Box::new(RcloneAdapter {
            target: target.clone(),
            base_dir: user_dir.to_path_buf(),
            scratch_root: user_dir.to_path_buf(),
        }),
    }
}

pub(crate) async fn dispatch(
    config: &Config,
    ctx: &JobContext,
    item: &ContentItem,
    adapter: &dyn DestinationAdapter,
) -> Result<UploadOutcome, AppError> {
    match &item.location {
        ContentLocation::File(_) => {
            adapter
                .deliver(
                    Unit {
                        payload: UnitPayload::Media(item),
                        index: None,
                        count: None,
                    },
                    ctx,
                )
                .await
        }
        ContentLocation::Folder(folder) => match adapter.size_ceiling() {
            Some(ceiling) if zip_enabled(config, item.kind) => {
                deliver_packaged(ctx, item, folder, ceiling, adapter).await
            }
            Some(_) => deliver_tracks(ctx, item, adapter).await,
            None => {
                adapter
                    .deliver(
                        Unit {
                            payload: UnitPayload::Media(item),
                            index: None,
                            count: None,
                        },
                        ctx,
                    )
                    .await
            }
        },
    }
}

fn zip_enabled(config: &Config, kind: ContentKind) -> bool {
    match kind {
        ContentKind::Album => config.album_zip,
        ContentKind::Playlist => config.playlist_zip,
        ContentKind::Artist => config.artist_zip,
        ContentKind::Track | ContentKind::Video => false,
    }
}

/// Package a folder for a size-limited transport and send the parts in
/// order. Whether to split is decided against the ceiling before any
/// archiving starts.
async fn deliver_packaged(
    ctx: &JobContext,
    item: &ContentItem,
    folder: &Path,
    ceiling: u64,
    adapter: &dyn DestinationAdapter,
) -> Result<UploadOutcome, AppError> {
    let total_size = item.byte_size().await?;
    info!(
        folder = %folder.display(),
        total_size,
        ceiling,
        split = total_size > ceiling,
        "packaging content for transport"
    );

    let parts: Vec<ZipPart> = if total_size > ceiling {
        let folder = folder.to_path_buf();
        let reporter = ctx.reporter.clone();
        let cancel = ctx.cancel.clone();
        tokio::task::spawn_blocking(move || {
            archive::split_zip_folder(&folder, ceiling, reporter.as_deref(), &cancel)
        })
        .await??
    } else {
        let folder = folder.to_path_buf();
        let item = item.clone();
        let reporter = ctx.reporter.clone();
        let cancel = ctx.cancel.clone();
        let part = tokio::task::spawn_blocking(move || {
            archive::create_content_zip(&folder, &item, reporter.as_deref(), &cancel)
        })
        .await??;
        vec![part]
    };

    let caption = caption_for(item);
    let count = parts.first().map(|part| part.total as u64).unwrap_or(0);
    for part in &parts {
        debug!(
            part = part.index,
            bytes = part.source_bytes,
            files = part.file_count,
            "sealed archive part"
        );
    }
    let mut last = UploadOutcome::default();
    for part in &parts {
        if ctx.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let unit = Unit {
            payload: UnitPayload::Archive {
                part,
                caption: &caption,
            },
            index: Some(part.index as u64),
            count: Some(count),
        };
        last = adapter.deliver(unit, ctx).await?;
        // consumed once transported; failures leave the archive for a retry
        let _ = tokio::fs::remove_file(&part.path).await;
    }
    Ok(last)
}

/// Send a container's children one at a time, feeding "track i of n" to the
/// reporter. A failed track aborts this item; other queued items are
/// unaffected.
async fn deliver_tracks(
    ctx: &JobContext,
    item: &ContentItem,
    adapter: &dyn DestinationAdapter,
) -> Result<UploadOutcome, AppError> {
    let total = item.tracks.len() as u64;
    if let Some(reporter) = &ctx.reporter {
        reporter.update_tracks(0, total);
    }
    for (i, track) in item.tracks.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let index = i as u64 + 1;
        let unit = Unit {
            payload: UnitPayload::Media(track),
            index: Some(index),
            count: Some(total),
        };
        adapter.deliver(unit, ctx).await?;
        if let Some(reporter) = &ctx.reporter {
            reporter.update_tracks(index, total);
        }
    }
    Ok(UploadOutcome::default())
}

async fn remove_source(item: &ContentItem) {
    let path = item.path();
    let result = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(err) = result {
        warn!("failed to remove uploaded source {}: {err}", path.display());
    }
    if let Some(thumbnail) = item.tags.as_ref().and_then(|tags| tags.thumbnail.as_ref()) {
        let _ = tokio::fs::remove_file(thumbnail).await;
    }
}

pub(crate) fn caption_for(item: &ContentItem) -> String {
    match item.kind {
        ContentKind::Track => format!(
            "🎵 {}\n👤 {}\n🎧 {}",
            item.title, item.artist, item.provider
        ),
        ContentKind::Video => format!(
            "🎬 {}\n👤 {}\n🎧 {} Music Video",
            item.title, item.artist, item.provider
        ),
        ContentKind::Album => format!(
            "💿 {}\n👤 {}\n🎧 {}",
            item.title, item.artist, item.provider
        ),
        ContentKind::Playlist => format!(
            "🎵 {}\n👤 Curated by {}\n🎧 {} Playlist",
            item.title, item.artist, item.provider
        ),
        ContentKind::Artist => {
            format!("🎤 {}\n🎧 {} Discography", item.artist, item.provider)
        }
    }
}

struct TelegramAdapter {
    messenger: Arc<dyn Messenger>,
    video_as_document: bool,
}

#[async_trait]
impl DestinationAdapter for TelegramAdapter {
    fn size_ceiling(&self) -> Option<u64> {
        Some(TELEGRAM_SIZE_CEILING)
    }

    async fn deliver(&self, unit: Unit<'_>, ctx: &JobContext) -> Result<UploadOutcome, AppError> {
        if let Some(reporter) = &ctx.reporter {
            reporter.set_stage(Stage::Uploading);
        }
        let attachment = match &unit.payload {
            UnitPayload::Media(item) => media_attachment(item, self.video_as_document)?,
            UnitPayload::Archive { part, caption } => FileAttachment {
                path: part.path.clone(),
                file_name: part
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "archive.zip".to_string()),
                caption: (*caption).to_string(),
                kind: AttachmentKind::Document,
            },
        };
        let hook = TransferHook::new(
            ctx.reporter.clone(),
            ctx.cancel.clone(),
            unit.index,
            unit.count,
        );
        send_file_with_retry(self.messenger.as_ref(), ctx.chat, &attachment, &hook).await?;
        Ok(UploadOutcome::default())
    }
}

fn media_attachment(
    item: &ContentItem,
    video_as_document: bool,
) -> Result<FileAttachment, AppError> {
    let path = match &item.location {
        ContentLocation::File(path) => path.clone(),
        ContentLocation::Folder(_) => {
            return Err(AppError::Internal(
                "containers must be packaged or recursed before sending".into(),
            ))
        }
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    let caption = caption_for(item);
    let tags = item.tags.clone().unwrap_or_default();
    let kind = match item.kind {
        ContentKind::Track => AttachmentKind::Audio {
            performer: item.artist.clone(),
            title: item.title.clone(),
            tags,
        },
        ContentKind::Video if video_as_document => AttachmentKind::Document,
        ContentKind::Video => AttachmentKind::Video {
            duration_secs: tags.duration_secs,
        },
        _ => AttachmentKind::Document,
    };
    Ok(FileAttachment {
        path,
        file_name,
        caption,
        kind,
    })
}

struct RcloneAdapter {
    target: RcloneTarget,
    /// The produced tree is addressed relative to this directory on the
    /// remote; units outside it degrade to their basename.
    base_dir: PathBuf,
    scratch_root: PathBuf,
}

#[async_trait]
impl DestinationAdapter for RcloneAdapter {
    fn size_ceiling(&self) -> Option<u64> {
        None
    }

    async fn deliver(&self, unit: Unit<'_>, ctx: &JobContext) -> Result<UploadOutcome, AppError> {
        if let Some(reporter) = &ctx.reporter {
            reporter.set_stage(Stage::Uploading);
        }
        let session = RcloneSession::materialize(&self.scratch_root, &self.target).await?;
        let path = unit.path();
        let (source, dest, link_target) = match self.target.scope {
            CopyScope::Leaf => {
                let sub = rclone::remote_subpath(path, &self.base_dir);
                let parent = Path::new(&sub)
                    .parent()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                (
                    path.to_path_buf(),
                    rclone::join_remote(&self.target.dest, &parent),
                    rclone::join_remote(&self.target.dest, &sub),
                )
            }
            CopyScope::Tree => {
                let folder = if path.is_dir() {
                    path.to_path_buf()
                } else {
                    path.parent().unwrap_or(path).to_path_buf()
                };
                let sub = rclone::remote_subpath(&folder, &self.base_dir);
                let dest = rclone::join_remote(&self.target.dest, &sub);
                (folder, dest.clone(), dest)
            }
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(AppError::Cancelled),
            result = session.copy(&source, &dest) => result?,
        }
        let link = session.link(&link_target).await;
        Ok(UploadOutcome {
            link,
            location: Some(link_target),
        })
    }
}

struct DriveAdapter {
    client: Arc<dyn DriveClient>,
    target: DriveTarget,
    scratch_root: PathBuf,
    service_account_token: Option<PathBuf>,
}

#[async_trait]
impl DestinationAdapter for DriveAdapter {
    fn size_ceiling(&self) -> Option<u64> {
        None
    }

    async fn deliver(&self, unit: Unit<'_>, ctx: &JobContext) -> Result<UploadOutcome, AppError> {
        if let Some(reporter) = &ctx.reporter {
            reporter.set_stage(Stage::Uploading);
        }
        let (scratch, token_path) = match &self.target.auth {
            DriveAuth::ServiceAccount => {
                let path = self.service_account_token.clone().ok_or_else(|| {
                    AppError::ConfigMissing("service account token (SERVICE_ACCOUNT_TOKEN)".into())
                })?;
                (None, path)
            }
            DriveAuth::UserToken(blob) => {
                let scratch = CredentialScratch::for_user_token(&self.scratch_root, blob).await?;
                let token_path = scratch.token_path().to_path_buf();
                (Some(scratch), token_path)
            }
        };

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AppError::Cancelled),
            result = self
                .client
                .upload(unit.path(), &self.target.folder_id, &token_path) => {
                result.map_err(AppError::CloudStorage)
            }
        };
        // credential material is gone before the outcome is looked at
        drop(scratch);
        let outcome = result?;
        let location = Some(format!(
            "{} items, {}",
            outcome.item_count(),
            human_size(outcome.bytes)
        ));
        Ok(UploadOutcome {
            link: Some(outcome.link),
            location,
        })
    }
}
