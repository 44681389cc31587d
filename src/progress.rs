use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::telegram::{Messenger, StatusMessage};

/// Minimum gap between forwarded progress frames for one job. Editing the
/// status message is rate limited by Telegram, so per-chunk updates are
/// collapsed down to this cadence; stage changes bypass the gate.
pub const MIN_EMIT_INTERVAL: Duration = Duration::from_secs(2);

const FRAME_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Downloading,
    Zipping,
    Uploading,
    Processing,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Downloading => "Downloading",
            Stage::Zipping => "Zipping",
            Stage::Uploading => "Uploading",
            Stage::Processing => "Processing",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counter {
    done: u64,
    total: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct UploadCounter {
    done: u64,
    total: u64,
    file_index: Option<u64>,
    file_count: Option<u64>,
}

/// Snapshot of a job's progress at the moment it passed the throttle gate.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub title: String,
    pub stage: Stage,
    pub download_percent: Option<u8>,
    pub zip: Option<(u64, u64)>,
    pub upload: Option<(u64, u64)>,
    pub file_of: Option<(u64, u64)>,
    pub tracks: Option<(u64, u64)>,
}

impl Snapshot {
    pub fn render(&self) -> String {
        let mut text = String::new();
        if !self.title.is_empty() {
            text.push_str(&self.title);
            text.push('\n');
        }
        text.push_str(self.stage.label());
        text.push('…');
        match self.stage {
            Stage::Downloading => {
                if let Some(pct) = self.download_percent {
                    text.push_str(&format!("\n{} {pct}%", bar(pct as u64, 100)));
                }
            }
            Stage::Zipping => {
                if let Some((done, total)) = self.zip {
                    text.push_str(&format!(
                        "\n{} {}% ({done}/{total} files)",
                        bar(done, total),
                        percent(done, total)
                    ));
                }
            }
            Stage::Uploading => {
                if let Some((done, total)) = self.upload {
                    text.push_str(&format!(
                        "\n{} {}% ({} / {})",
                        bar(done, total),
                        percent(done, total),
                        human_size(done),
                        human_size(total)
                    ));
                }
                if let Some((index, count)) = self.file_of {
                    text.push_str(&format!("\nFile {index} of {count}"));
                }
            }
            Stage::Processing => {}
        }
        if let Some((done, total)) = self.tracks {
            if total > 0 && self.stage != Stage::Zipping {
                text.push_str(&format!("\nTrack {} of {total}", done.min(total).max(1)));
            }
        }
        text
    }
}

enum Frame {
    Update(Snapshot),
    Finished,
}

#[derive(Default)]
struct Inner {
    title: String,
    stage: Option<Stage>,
    download_percent: Option<u8>,
    zip: Option<Counter>,
    upload: Option<UploadCounter>,
    tracks: Option<Counter>,
    last_emit: Option<Instant>,
}

/// Stage-tagged, throttled progress state for one job.
///
/// Mutating calls are cheap and non-blocking so they can run inside transfer
/// callbacks; forwarded frames land on a small drop-oldest queue consumed by
/// the single task that owns all status-message edits.
pub struct ProgressReporter {
    min_interval: Duration,
    inner: Mutex<Inner>,
    frames: FrameQueue,
}

impl ProgressReporter {
    pub fn new(title: impl Into<String>) -> Arc<Self> {
        Self::with_interval(title, MIN_EMIT_INTERVAL)
    }

    pub fn with_interval(title: impl Into<String>, min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            min_interval,
            inner: Mutex::new(Inner {
                title: title.into(),
                ..Inner::default()
            }),
            frames: FrameQueue::new(FRAME_QUEUE_CAPACITY),
        })
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.inner.lock().title = title.into();
    }

    /// Stage transitions always forward, so the user sees them immediately.
    pub fn set_stage(&self, stage: Stage) {
        let mut inner = self.inner.lock();
        inner.stage = Some(stage);
        inner.last_emit = Some(Instant::now());
        let snapshot = snapshot_of(&inner);
        drop(inner);
        self.frames.push(Frame::Update(snapshot));
    }

    pub fn update_download(&self, percent: u8) {
        self.update_with(|inner| {
            let pct = percent.min(100);
            let floor = inner.download_percent.unwrap_or(0);
            inner.download_percent = Some(pct.max(floor));
        });
    }

    pub fn set_total_tracks(&self, total: u64) {
        self.update_with(|inner| {
            let counter = inner.tracks.get_or_insert_with(Counter::default);
            counter.total = total;
        });
    }

    pub fn update_tracks(&self, done: u64, total: u64) {
        self.update_with(|inner| {
            let counter = inner.tracks.get_or_insert_with(Counter::default);
            counter.total = total;
            counter.done = clamp_done(counter.done, done, total);
        });
    }

    pub fn update_zip(&self, done: u64, total: u64) {
        self.update_with(|inner| {
            let counter = inner.zip.get_or_insert_with(Counter::default);
            counter.total = total;
            counter.done = clamp_done(counter.done, done, total);
        });
    }

    pub fn update_upload(
        &self,
        done: u64,
        total: u64,
        file_index: Option<u64>,
        file_count: Option<u64>,
    ) {
        self.update_with(|inner| {
            let counter = inner.upload.get_or_insert_with(UploadCounter::default);
            if counter.file_index != file_index {
                // a new file restarts the byte counter
                counter.done = 0;
            }
            counter.file_index = file_index;
            counter.file_count = file_count;
            counter.total = total;
            counter.done = clamp_done(counter.done, done, total);
        });
    }

    /// Ends the editor task once every queued frame has been drained.
    pub fn finish(&self) {
        self.frames.push(Frame::Finished);
    }

    fn update_with(&self, apply: impl FnOnce(&mut Inner)) {
        let mut inner = self.inner.lock();
        apply(&mut inner);
        let now = Instant::now();
        if let Some(last) = inner.last_emit {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }
        inner.last_emit = Some(now);
        let snapshot = snapshot_of(&inner);
        drop(inner);
        self.frames.push(Frame::Update(snapshot));
    }

    #[cfg(test)]
    fn drain_snapshots(&self) -> Vec<Snapshot> {
        let mut out = Vec::new();
        while let Some(frame) = self.frames.try_pop() {
            if let Frame::Update(snapshot) = frame {
                out.push(snapshot);
            }
        }
        out
    }
}

fn snapshot_of(inner: &Inner) -> Snapshot {
    Snapshot {
        title: inner.title.clone(),
        stage: inner.stage.unwrap_or(Stage::Processing),
        download_percent: inner.download_percent,
        zip: inner.zip.map(|c| (c.done, c.total)),
        upload: inner.upload.map(|c| (c.done, c.total)),
        file_of: inner
            .upload
            .and_then(|c| Some((c.file_index?, c.file_count?))),
        tracks: inner.tracks.map(|c| (c.done, c.total)),
    }
}

fn clamp_done(previous: u64, done: u64, total: u64) -> u64 {
    let done = if total > 0 { done.min(total) } else { done };
    done.max(previous)
}

struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, frame: Frame) {
        let mut frames = self.frames.lock();
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    async fn pop(&self) -> Frame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

/// Spawn the single task that owns edits of the job's status message.
/// Identical frames are skipped; a rate-limited edit drops the frame (the
/// next one catches up) rather than stalling the producer side.
pub fn spawn_status_editor(
    reporter: Arc<ProgressReporter>,
    messenger: Arc<dyn Messenger>,
    status: StatusMessage,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_text: Option<String> = None;
        loop {
            match reporter.frames.pop().await {
                Frame::Finished => break,
                Frame::Update(snapshot) => {
                    let text = snapshot.render();
                    if last_text.as_deref() == Some(text.as_str()) {
                        continue;
                    }
                    match messenger.edit_text(&status, &text).await {
                        Ok(()) => last_text = Some(text),
                        Err(AppError::RateLimited(wait)) => {
                            debug!(
                                wait_secs = wait.as_secs(),
                                "progress edit rate limited, skipping frame"
                            );
                        }
                        Err(err) => warn!("failed to edit progress message: {err}"),
                    }
                }
            }
        }
    })
}

pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

fn bar(done: u64, total: u64) -> String {
    let filled = if total == 0 {
        0
    } else {
        ((done.min(total) * 10) / total) as usize
    };
    let mut bar = String::new();
    for _ in 0..filled {
        bar.push('▰');
    }
    for _ in filled..10 {
        bar.push('▱');
    }
    bar
}

pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes_f = bytes as f64;
    if bytes_f >= GB {
        format!("{:.2} GB", bytes_f / GB)
    } else if bytes_f >= MB {
        format!("{:.1} MB", bytes_f / MB)
    } else if bytes_f >= KB {
        format!("{:.1} KB", bytes_f / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_changes_bypass_the_throttle() {
        let reporter = ProgressReporter::with_interval("t", Duration::from_secs(3600));
        reporter.set_stage(Stage::Downloading);
        reporter.update_download(10);
        reporter.update_download(20);
        reporter.set_stage(Stage::Uploading);
        let frames = reporter.drain_snapshots();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].stage, Stage::Downloading);
        assert_eq!(frames[1].stage, Stage::Uploading);
    }

    #[test]
    fn updates_inside_the_window_are_suppressed() {
        let reporter = ProgressReporter::with_interval("t", Duration::from_secs(3600));
        reporter.update_zip(1, 10);
        reporter.update_zip(2, 10);
        reporter.update_zip(3, 10);
        let frames = reporter.drain_snapshots();
        // only the first update lands; the rest sit behind the gate
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].zip, Some((1, 10)));
    }

    #[test]
    fn done_never_decreases_within_a_stage() {
        let reporter = ProgressReporter::with_interval("t", Duration::ZERO);
        reporter.update_upload(500, 1000, Some(1), Some(1));
        reporter.update_upload(300, 1000, Some(1), Some(1));
        let frames = reporter.drain_snapshots();
        let dones: Vec<u64> = frames.iter().filter_map(|f| f.upload.map(|u| u.0)).collect();
        assert_eq!(dones, vec![500, 500]);
    }

    #[test]
    fn done_is_clamped_to_total() {
        let reporter = ProgressReporter::with_interval("t", Duration::ZERO);
        reporter.update_zip(15, 10);
        let frames = reporter.drain_snapshots();
        assert_eq!(frames[0].zip, Some((10, 10)));
    }

    #[test]
    fn a_new_file_restarts_the_byte_counter() {
        let reporter = ProgressReporter::with_interval("t", Duration::ZERO);
        reporter.update_upload(900, 1000, Some(1), Some(2));
        reporter.update_upload(50, 800, Some(2), Some(2));
        let frames = reporter.drain_snapshots();
        assert_eq!(frames[1].upload, Some((50, 800)));
        assert_eq!(frames[1].file_of, Some((2, 2)));
    }

    #[test]
    fn zero_total_renders_as_zero_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(5, 0), 0);
        assert_eq!(bar(5, 0), "▱▱▱▱▱▱▱▱▱▱");
    }

    #[test]
    fn render_mentions_stage_and_file_index() {
        let snapshot = Snapshot {
            title: "Some Album".into(),
            stage: Stage::Uploading,
            download_percent: None,
            zip: None,
            upload: Some((512, 1024)),
            file_of: Some((1, 2)),
            tracks: None,
        };
        let text = snapshot.render();
        assert!(text.contains("Some Album"));
        assert!(text.contains("Uploading"));
        assert!(text.contains("50%"));
        assert!(text.contains("File 1 of 2"));
    }

    #[test]
    fn queue_drops_the_oldest_frame_when_full() {
        let reporter = ProgressReporter::with_interval("t", Duration::ZERO);
        for i in 0..(FRAME_QUEUE_CAPACITY as u64 + 4) {
            reporter.update_zip(i, 100);
        }
        let frames = reporter.drain_snapshots();
        assert_eq!(frames.len(), FRAME_QUEUE_CAPACITY);
        // the newest state survived
        assert_eq!(
            frames.last().and_then(|f| f.zip),
            Some((FRAME_QUEUE_CAPACITY as u64 + 3, 100))
        );
    }
}
