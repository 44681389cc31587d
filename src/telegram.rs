use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardMarkup, InputFile, MessageId};
use teloxide::{ApiError, RequestError};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::content::TrackTags;
use crate::error::AppError;
use crate::progress::ProgressReporter;

pub const SEND_MAX_RETRIES: usize = 3;
const SEND_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const SEND_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct ChatRef {
    pub chat_id: ChatId,
    pub reply_to: Option<MessageId>,
}

/// Handle to the editable status message of one job.
#[derive(Debug, Clone, Copy)]
pub struct StatusMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone)]
pub enum AttachmentKind {
    Audio {
        tags: TrackTags,
        performer: String,
        title: String,
    },
    Video {
        duration_secs: u32,
    },
    Document,
}

#[derive(Debug, Clone)]
pub struct FileAttachment {
    pub path: PathBuf,
    pub file_name: String,
    pub caption: String,
    pub kind: AttachmentKind,
}

/// Per-transfer progress callback handed to the messenger. Must stay cheap
/// and non-blocking: it only touches the reporter's in-memory state and the
/// cancellation flag, never the network.
pub struct TransferHook {
    reporter: Option<Arc<ProgressReporter>>,
    cancel: CancellationToken,
    file_index: Option<u64>,
    file_count: Option<u64>,
}

impl TransferHook {
    pub fn new(
        reporter: Option<Arc<ProgressReporter>>,
        cancel: CancellationToken,
        file_index: Option<u64>,
        file_count: Option<u64>,
    ) -> Self {
        Self {
            reporter,
            cancel,
            file_index,
            file_count,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Raises `Cancelled` to abort the in-flight transfer.
    pub fn on_chunk(&self, done: u64, total: u64) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if let Some(reporter) = &self.reporter {
            reporter.update_upload(done, total, self.file_index, self.file_count);
        }
        Ok(())
    }
}

/// The narrow seam to the chat platform: send or edit a message, send one
/// file. A rate-limit response surfaces as `AppError::RateLimited` carrying
/// the wait the platform demanded.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(
        &self,
        chat: ChatRef,
        text: &str,
        markup: Option<InlineKeyboardMarkup>,
    ) -> Result<StatusMessage, AppError>;

    async fn edit_text(&self, msg: &StatusMessage, text: &str) -> Result<(), AppError>;

    async fn send_file(
        &self,
        chat: ChatRef,
        attachment: &FileAttachment,
        hook: &TransferHook,
    ) -> Result<(), AppError>;
}

pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

type SendFuture<'a> =
    Pin<Box<dyn Future<Output = Result<teloxide::types::Message, RequestError>> + Send + 'a>>;

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(
        &self,
        chat: ChatRef,
        text: &str,
        markup: Option<InlineKeyboardMarkup>,
    ) -> Result<StatusMessage, AppError> {
        let mut request = self.bot.send_message(chat.chat_id, text);
        if let Some(reply_to) = chat.reply_to {
            request = request.reply_to_message_id(reply_to);
        }
        if let Some(markup) = markup {
            request = request.reply_markup(markup);
        }
        let message = request.await.map_err(map_request_error)?;
        Ok(StatusMessage {
            chat_id: message.chat.id,
            message_id: message.id,
        })
    }

    async fn edit_text(&self, msg: &StatusMessage, text: &str) -> Result<(), AppError> {
        match self
            .bot
            .edit_message_text(msg.chat_id, msg.message_id, text)
            .await
        {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(err) => Err(map_request_error(err)),
        }
    }

    async fn send_file(
        &self,
        chat: ChatRef,
        attachment: &FileAttachment,
        hook: &TransferHook,
    ) -> Result<(), AppError> {
        let total = tokio::fs::metadata(&attachment.path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        hook.on_chunk(0, total)?;

        let input = InputFile::file(attachment.path.clone()).file_name(attachment.file_name.clone());
        let send: SendFuture<'_> = match &attachment.kind {
            AttachmentKind::Audio {
                tags,
                performer,
                title,
            } => {
                let mut request = self
                    .bot
                    .send_audio(chat.chat_id, input)
                    .caption(attachment.caption.clone())
                    .performer(performer.clone())
                    .title(title.clone())
                    .duration(tags.duration_secs);
                if let Some(thumbnail) = &tags.thumbnail {
                    request = request.thumb(InputFile::file(thumbnail.clone()));
                }
                Box::pin(async move { request.await })
            }
            AttachmentKind::Video { duration_secs } => {
                let request = self
                    .bot
                    .send_video(chat.chat_id, input)
                    .caption(attachment.caption.clone())
                    .duration(*duration_secs);
                Box::pin(async move { request.await })
            }
            AttachmentKind::Document => {
                let request = self
                    .bot
                    .send_document(chat.chat_id, input)
                    .caption(attachment.caption.clone());
                Box::pin(async move { request.await })
            }
        };

        // Dropping the request future aborts the in-flight transfer.
        tokio::select! {
            _ = hook.cancel_token().cancelled() => Err(AppError::Cancelled),
            result = send => {
                result.map_err(map_request_error)?;
                hook.on_chunk(total, total)?;
                Ok(())
            }
        }
    }
}

fn map_request_error(err: RequestError) -> AppError {
    match err {
        RequestError::RetryAfter(delay) => AppError::RateLimited(delay),
        other => AppError::Telegram(other),
    }
}

/// Send a file, waiting out rate limits and retrying transient failures.
///
/// A rate-limit wait is protocol-mandated, not a failure: the sleep is
/// exactly what the platform reported, the retry repeats the identical
/// arguments, and no attempt is counted. Transient network failures get
/// bounded exponential backoff with jitter instead.
pub async fn send_file_with_retry(
    messenger: &dyn Messenger,
    chat: ChatRef,
    attachment: &FileAttachment,
    hook: &TransferHook,
) -> Result<(), AppError> {
    let mut attempt = 0usize;
    loop {
        if hook.cancel_token().is_cancelled() {
            return Err(AppError::Cancelled);
        }
        match messenger.send_file(chat, attachment, hook).await {
            Ok(()) => return Ok(()),
            Err(AppError::RateLimited(wait)) => {
                warn!(
                    wait_secs = wait.as_secs(),
                    "rate limited while sending, waiting it out"
                );
                time::sleep(wait).await;
            }
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt >= SEND_MAX_RETRIES {
                    return Err(err);
                }
                let delay = backoff_delay(attempt);
                warn!("send attempt {attempt} failed; retrying in {delay:?}: {err}");
                time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(attempt: usize) -> Duration {
    let base_ms = SEND_RETRY_BASE_DELAY.as_millis() as u64;
    let factor = 1u64 << (attempt - 1).min(16);
    let delay_ms = base_ms
        .saturating_mul(factor)
        .min(SEND_RETRY_MAX_DELAY.as_millis() as u64);
    let jitter_ms = rand::thread_rng().gen_range(0..=500);
    Duration::from_millis(delay_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    #[derive(Default)]
    struct ScriptedMessenger {
        plan: Mutex<VecDeque<AppError>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedMessenger {
        fn failing_with(errors: Vec<AppError>) -> Self {
            Self {
                plan: Mutex::new(errors.into()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Messenger for ScriptedMessenger {
        async fn send_text(
            &self,
            _chat: ChatRef,
            _text: &str,
            _markup: Option<InlineKeyboardMarkup>,
        ) -> Result<StatusMessage, AppError> {
            Ok(StatusMessage {
                chat_id: ChatId(0),
                message_id: MessageId(0),
            })
        }

        async fn edit_text(&self, _msg: &StatusMessage, _text: &str) -> Result<(), AppError> {
            Ok(())
        }

        async fn send_file(
            &self,
            _chat: ChatRef,
            attachment: &FileAttachment,
            hook: &TransferHook,
        ) -> Result<(), AppError> {
            self.sent.lock().push((
                attachment.path.display().to_string(),
                attachment.caption.clone(),
            ));
            hook.on_chunk(0, 100)?;
            if let Some(err) = self.plan.lock().pop_front() {
                return Err(err);
            }
            hook.on_chunk(100, 100)?;
            Ok(())
        }
    }

    fn attachment() -> FileAttachment {
        FileAttachment {
            path: PathBuf::from("/tmp/a.zip"),
            file_name: "a.zip".into(),
            caption: "caption".into(),
            kind: AttachmentKind::Document,
        }
    }

    fn chat() -> ChatRef {
        ChatRef {
            chat_id: ChatId(1),
            reply_to: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_then_resends_identical_arguments() {
        let wait = Duration::from_millis(500);
        let messenger =
            ScriptedMessenger::failing_with(vec![AppError::RateLimited(wait)]);
        let hook = TransferHook::new(None, CancellationToken::new(), None, None);
        let started = Instant::now();
        send_file_with_retry(&messenger, chat(), &attachment(), &hook)
            .await
            .unwrap();
        assert!(started.elapsed() >= wait);
        let sent = messenger.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_bounded() {
        let messenger = ScriptedMessenger::failing_with(vec![
            AppError::Network("reset".into()),
            AppError::Network("reset".into()),
            AppError::Network("reset".into()),
            AppError::Network("reset".into()),
        ]);
        let hook = TransferHook::new(None, CancellationToken::new(), None, None);
        let result = send_file_with_retry(&messenger, chat(), &attachment(), &hook).await;
        assert!(matches!(result, Err(AppError::Network(_))));
        assert_eq!(messenger.sent.lock().len(), SEND_MAX_RETRIES);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let messenger = ScriptedMessenger::failing_with(vec![AppError::ConfigMissing(
            "folder id".into(),
        )]);
        let hook = TransferHook::new(None, CancellationToken::new(), None, None);
        let result = send_file_with_retry(&messenger, chat(), &attachment(), &hook).await;
        assert!(matches!(result, Err(AppError::ConfigMissing(_))));
        assert_eq!(messenger.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_jobs_never_reach_the_messenger() {
        let messenger = ScriptedMessenger::default();
        let token = CancellationToken::new();
        token.cancel();
        let hook = TransferHook::new(None, token, None, None);
        let result = send_file_with_retry(&messenger, chat(), &attachment(), &hook).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(messenger.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn hook_raises_cancellation_from_inside_a_transfer() {
        let token = CancellationToken::new();
        let hook = TransferHook::new(None, token.clone(), None, None);
        assert!(hook.on_chunk(10, 100).is_ok());
        token.cancel();
        assert!(matches!(hook.on_chunk(20, 100), Err(AppError::Cancelled)));
    }
}
