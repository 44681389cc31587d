use std::sync::Arc;
use std::time::Duration;

use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::content::{discover_content, is_audio_file, is_video_file, FileStemTags, TagReader};
use crate::downloader;
use crate::error::AppError;
use crate::gdrive::{DriveClient, RestDriveClient};
use crate::progress::{spawn_status_editor, ProgressReporter, Stage};
use crate::settings::{MemorySettings, SettingsStore};
use crate::tasks::{
    build_cancel_callback, parse_cancel_callback, ActiveChats, ChatClaim, Job, JobGuard,
    JobRegistry,
};
use crate::telegram::{ChatRef, Messenger, TelegramMessenger};
use crate::uploader::{self, JobContext, UploadOutcome};

/// Shared collaborators handed to every handler through the dispatcher.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub settings: Arc<dyn SettingsStore>,
    pub messenger: Arc<dyn Messenger>,
    pub drive: Arc<dyn DriveClient>,
    pub tags: Arc<dyn TagReader>,
    pub jobs: JobRegistry,
    pub chats: ActiveChats,
    /// Bounds how many content items are in flight across all chats.
    pub pool: Arc<Semaphore>,
    /// Client for direct media fetches, separate from the bot's own client.
    pub http: reqwest::Client,
}

impl Services {
    pub fn new(bot: Bot, config: Config) -> Result<Self, AppError> {
        let pool = Arc::new(Semaphore::new(config.max_workers));
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            settings: Arc::new(MemorySettings::new()),
            messenger: Arc::new(TelegramMessenger::new(bot)),
            drive: Arc::new(RestDriveClient::new()?),
            tags: Arc::new(FileStemTags),
            jobs: JobRegistry::new(),
            chats: ActiveChats::new(),
            pool,
            http,
        })
    }
}

pub fn build_handler(
) -> Handler<'static, DependencyMap, Result<(), AppError>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_map(extract_url)
                .endpoint(handle_url),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback))
}

fn extract_url(msg: Message) -> Option<(Message, String)> {
    let text = msg.text()?.trim().to_string();
    if text.starts_with("http://") || text.starts_with("https://") {
        Some((msg, text))
    } else {
        None
    }
}

async fn handle_url(
    services: Services,
    msg_and_url: (Message, String),
) -> Result<(), AppError> {
    let (msg, url) = msg_and_url;
    let chat_id = msg.chat.id;
    let chat = ChatRef {
        chat_id,
        reply_to: Some(msg.id),
    };

    let Some(claim) = services.chats.claim(chat_id) else {
        services
            .messenger
            .send_text(chat, "Still working on something here. Cancel it or wait.", None)
            .await?;
        return Ok(());
    };

    let user_id = msg.from().map(|user| user.id.0).unwrap_or_default();
    let display_name = msg
        .from()
        .map(|user| user.first_name.clone())
        .unwrap_or_default();

    let job = services.jobs.insert(Job::new(chat_id, user_id));
    // drops remove the job again if anything below bails out early
    let guard = services.jobs.guard(job.id.clone());
    let markup = InlineKeyboardMarkup::new([[InlineKeyboardButton::callback(
        "Cancel",
        build_cancel_callback(&job.id),
    )]]);
    let status = services
        .messenger
        .send_text(chat, "Queued…", Some(markup))
        .await?;

    let reporter = ProgressReporter::new("");
    let editor = spawn_status_editor(reporter.clone(), services.messenger.clone(), status);
    let ctx = JobContext {
        user_id,
        chat,
        display_name,
        status,
        cancel: job.cancel.clone(),
        reporter: Some(reporter.clone()),
    };

    info!(job_id = %job.id, user_id = job.user_id, url, "job accepted");
    tokio::spawn(async move {
        run_job(services, ctx, url, reporter, editor, guard, claim).await;
    });

    Ok(())
}

async fn handle_callback(bot: Bot, services: Services, q: CallbackQuery) -> Result<(), AppError> {
    let data = q.data.clone().unwrap_or_default();
    let Some(job_id) = parse_cancel_callback(&data) else {
        return Ok(());
    };
    // the button only counts inside the chat the job belongs to
    let known = services.jobs.get(&job_id).is_some_and(|job| {
        q.message
            .as_ref()
            .map_or(true, |message| message.chat.id == job.chat_id)
    });
    let mut answer = bot.answer_callback_query(q.id);
    if known && services.jobs.cancel(&job_id) {
        info!(job_id = %job_id, "cancellation requested");
        answer = answer.text("Cancelling…");
    } else {
        answer = answer.text("Nothing to cancel.");
    }
    answer.await?;
    Ok(())
}

/// Drive one job through download → discover → upload, then report the
/// outcome. Every failure is converted to a user-facing message here; the
/// worker pool and other jobs never see it.
async fn run_job(
    services: Services,
    ctx: JobContext,
    url: String,
    reporter: Arc<ProgressReporter>,
    editor: JoinHandle<()>,
    _guard: JobGuard,
    _claim: ChatClaim,
) {
    let result = run_pipeline(&services, &ctx, &url).await;

    reporter.finish();
    let _ = editor.await;

    let text = match &result {
        Ok(outcome) => success_text(outcome),
        Err(AppError::Cancelled) => "❌ Cancelled.".to_string(),
        Err(err) => {
            warn!(requester = %ctx.display_name, "job failed: {err}");
            format!("❌ {}", err.user_message())
        }
    };
    if let Err(err) = services.messenger.edit_text(&ctx.status, &text).await {
        warn!("failed to post final status: {err}");
        let _ = services.messenger.send_text(ctx.chat, &text, None).await;
    }

    cleanup_user_dir(&services, ctx.user_id).await;
}

async fn run_pipeline(
    services: &Services,
    ctx: &JobContext,
    url: &str,
) -> Result<UploadOutcome, AppError> {
    let _permit = services
        .pool
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| AppError::Internal("worker pool closed".into()))?;
    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    let user_dir = services.config.storage_dir.join(ctx.user_id.to_string());
    tokio::fs::create_dir_all(&user_dir).await?;

    if let Some(file_name) = direct_file_name(url) {
        // the URL points straight at a media file; no downloader needed
        if let Some(reporter) = &ctx.reporter {
            reporter.set_stage(Stage::Downloading);
        }
        downloader::download_file(
            &services.http,
            url,
            &user_dir.join(&file_name),
            downloader::FETCH_MAX_RETRIES,
            &ctx.cancel,
        )
        .await?;
    } else {
        downloader::run_downloader(
            &services.config,
            url,
            &user_dir,
            ctx.reporter.as_deref(),
            &ctx.cancel,
        )
        .await?;
    }

    let item = {
        let tags = services.tags.clone();
        let dir = user_dir.clone();
        let provider = services.config.provider_label.clone();
        tokio::task::spawn_blocking(move || discover_content(&dir, &provider, tags.as_ref(), None))
            .await??
    };
    if let Some(reporter) = &ctx.reporter {
        reporter.set_title(item.title.clone());
    }
    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    uploader::upload_content(services, ctx, &item).await
}

/// File name of a URL that points directly at a media file, if it does.
fn direct_file_name(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let name = trimmed.rsplit('/').next()?;
    let path = std::path::Path::new(name);
    if is_audio_file(path) || is_video_file(path) {
        Some(name.to_string())
    } else {
        None
    }
}

fn success_text(outcome: &UploadOutcome) -> String {
    let mut text = "✅ Done.".to_string();
    if let Some(location) = &outcome.location {
        text.push_str(&format!("\n{location}"));
    }
    if let Some(link) = &outcome.link {
        text.push_str(&format!("\n{link}"));
    }
    text
}

async fn cleanup_user_dir(services: &Services, user_id: u64) {
    let dir = services.config.storage_dir.join(user_id.to_string());
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to clean {}: {err}", dir.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_text_includes_link_and_location() {
        let outcome = UploadOutcome {
            link: Some("https://example.com/x".into()),
            location: Some("remote:music/album".into()),
        };
        let text = success_text(&outcome);
        assert!(text.contains("✅"));
        assert!(text.contains("remote:music/album"));
        assert!(text.contains("https://example.com/x"));

        assert_eq!(success_text(&UploadOutcome::default()), "✅ Done.");
    }

    #[test]
    fn direct_media_urls_are_recognized() {
        assert_eq!(
            direct_file_name("https://cdn.example/music/track.m4a?sig=abc"),
            Some("track.m4a".to_string())
        );
        assert_eq!(
            direct_file_name("https://cdn.example/video/clip.mp4"),
            Some("clip.mp4".to_string())
        );
        assert_eq!(direct_file_name("https://music.example/album/123"), None);
    }
}
