use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use rand::{distributions::Alphanumeric, Rng};
use teloxide::types::ChatId;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One in-flight job: who asked for it and how to cancel it.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub chat_id: ChatId,
    pub user_id: u64,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(chat_id: ChatId, user_id: u64) -> Self {
        Self {
            id: JobId::new(),
            chat_id,
            user_id,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<DashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Arc<Job> {
        let id = job.id.clone();
        let job = Arc::new(job);
        self.inner.insert(id, job.clone());
        job
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<Job>> {
        self.inner.get(id).map(|entry| entry.clone())
    }

    /// Signals the job's cancellation token. Returns false for unknown ids.
    pub fn cancel(&self, id: &JobId) -> bool {
        match self.get(id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &JobId) -> Option<Arc<Job>> {
        self.inner.remove(id).map(|(_, job)| job)
    }

    pub fn guard(&self, id: JobId) -> JobGuard {
        JobGuard {
            registry: self.clone(),
            id,
        }
    }
}

pub struct JobGuard {
    registry: JobRegistry,
    id: JobId,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let _ = self.registry.remove(&self.id);
    }
}

/// The set of chats with a job in flight. One job per chat; the claim
/// releases itself when dropped, so a panicking job cannot wedge its chat.
#[derive(Clone, Default)]
pub struct ActiveChats {
    inner: Arc<DashSet<ChatId>>,
}

impl ActiveChats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, chat_id: ChatId) -> Option<ChatClaim> {
        if self.inner.insert(chat_id) {
            Some(ChatClaim {
                chats: self.clone(),
                chat_id,
            })
        } else {
            None
        }
    }
}

pub struct ChatClaim {
    chats: ActiveChats,
    chat_id: ChatId,
}

impl Drop for ChatClaim {
    fn drop(&mut self) {
        self.chats.inner.remove(&self.chat_id);
    }
}

const CANCEL_CALLBACK_PREFIX: &str = "cancel:";

pub fn build_cancel_callback(id: &JobId) -> String {
    format!("{CANCEL_CALLBACK_PREFIX}{}", id.as_str())
}

pub fn parse_cancel_callback(data: &str) -> Option<JobId> {
    let payload = data.strip_prefix(CANCEL_CALLBACK_PREFIX)?;
    let id = payload.trim();
    if id.is_empty() {
        return None;
    }
    Some(JobId::from_raw(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_callback_roundtrip() {
        let id = JobId::from_raw("job1234567");
        let data = build_cancel_callback(&id);
        assert_eq!(parse_cancel_callback(&data), Some(id));
        assert_eq!(parse_cancel_callback("cancel:"), None);
        assert_eq!(parse_cancel_callback("other:abc"), None);
    }

    #[test]
    fn registry_insert_get_remove() {
        let registry = JobRegistry::new();
        let job = registry.insert(Job::new(ChatId(1), 7));
        assert!(registry.get(&job.id).is_some());
        registry.remove(&job.id);
        assert!(registry.get(&job.id).is_none());
    }

    #[test]
    fn guard_removes_on_drop() {
        let registry = JobRegistry::new();
        let job = registry.insert(Job::new(ChatId(1), 7));
        {
            let _guard = registry.guard(job.id.clone());
        }
        assert!(registry.get(&job.id).is_none());
    }

    #[test]
    fn cancel_trips_the_token() {
        let registry = JobRegistry::new();
        let job = registry.insert(Job::new(ChatId(1), 7));
        assert!(!job.cancel.is_cancelled());
        assert!(registry.cancel(&job.id));
        assert!(job.cancel.is_cancelled());
        assert!(!registry.cancel(&JobId::from_raw("missing")));
    }

    #[test]
    fn one_claim_per_chat() {
        let chats = ActiveChats::new();
        let claim = chats.claim(ChatId(5));
        assert!(claim.is_some());
        assert!(chats.claim(ChatId(5)).is_none());
        assert!(chats.claim(ChatId(6)).is_some());
        drop(claim);
        assert!(chats.claim(ChatId(5)).is_some());
    }
}
