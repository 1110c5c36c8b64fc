//! Hand-rolled doubles shared by the job subsystem tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};

use crate::db::entries::EntryStore;
use crate::db::models::HealthEntryRow;
use crate::jobs::model::{DedupPolicy, Job, JobPayload, JobState, NewJob};
use crate::jobs::store::{JobStore, StallSweep, StoreError};
use crate::llm::client::{ChatApi, ChatMessage, LlmError};

fn backend_down() -> StoreError {
    StoreError::Database(sqlx::Error::PoolClosed)
}

struct Slot {
    job: Job,
    available_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    seq: u64,
}

struct Inner {
    slots: HashMap<String, Slot>,
    progress: HashMap<String, Vec<u8>>,
    next_seq: u64,
    /// Test-controlled clock offset so backoff and lease expiry are
    /// observable without real waiting.
    offset: ChronoDuration,
    /// Forces the id derived for override-less submissions, making
    /// dedup reachable through the dispatcher.
    derived_id: Option<String>,
}

/// In-memory `JobStore` with a manually advanced clock
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    dedup: DedupPolicy,
    reachable: AtomicBool,
    fail_enqueue: AtomicBool,
    pings: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_dedup(DedupPolicy::Reuse)
    }

    pub fn with_dedup(dedup: DedupPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                progress: HashMap::new(),
                next_seq: 0,
                offset: ChronoDuration::zero(),
                derived_id: None,
            }),
            dedup,
            reachable: AtomicBool::new(true),
            fail_enqueue: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    pub fn set_derived_id(&self, id: &str) {
        self.inner.lock().unwrap().derived_id = Some(id.to_string());
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.offset += ChronoDuration::from_std(by).unwrap();
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.inner
            .lock()
            .unwrap()
            .slots
            .get(id)
            .map(|slot| slot.job.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Progress values recorded for a job, in order, including the final
    /// 100 written at completion.
    pub fn progress_history(&self, id: &str) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap()
            .progress
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn enqueue_with_id(
        &self,
        id: &str,
        user_id: i64,
        payload: JobPayload,
    ) -> Result<String, StoreError> {
        self.enqueue(NewJob::new(user_id, payload, 3).with_id(id))
            .await
    }

    fn now(inner: &Inner) -> DateTime<Utc> {
        Utc::now() + inner.offset
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(backend_down())
        }
    }

    async fn enqueue(&self, new: NewJob) -> Result<String, StoreError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(backend_down());
        }

        let mut inner = self.inner.lock().unwrap();
        let now = Self::now(&inner);
        let id = match (&new.id_override, &inner.derived_id) {
            (None, Some(forced)) => forced.clone(),
            _ => new.job_id(now),
        };

        if inner.slots.contains_key(&id) {
            return match self.dedup {
                DedupPolicy::Reuse => Ok(id),
                DedupPolicy::Reject => Err(StoreError::DuplicateJob(id)),
            };
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.slots.insert(
            id.clone(),
            Slot {
                job: Job {
                    id: id.clone(),
                    kind: new.payload.kind(),
                    user_id: new.user_id,
                    payload: new.payload,
                    state: JobState::Waiting,
                    progress: 0,
                    attempts: 0,
                    max_attempts: new.max_attempts,
                    stalled_count: 0,
                    result: None,
                    failure_reason: None,
                    created_at: now,
                },
                available_at: now,
                locked_until: None,
                finished_at: None,
                seq,
            },
        );

        Ok(id)
    }

    async fn lease_next(&self, lock_duration: Duration) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Self::now(&inner);

        let next = inner
            .slots
            .values()
            .filter(|slot| slot.job.state == JobState::Waiting && slot.available_at <= now)
            .min_by_key(|slot| slot.seq)
            .map(|slot| slot.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        let lock = ChronoDuration::from_std(lock_duration).unwrap();
        let slot = inner.slots.get_mut(&id).unwrap();
        slot.job.state = JobState::Active;
        slot.job.attempts += 1;
        slot.locked_until = Some(now + lock);

        Ok(Some(slot.job.clone()))
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.job(id))
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner.slots.get_mut(id) else {
            return Ok(());
        };
        if slot.job.state != JobState::Active {
            return Ok(());
        }

        let value = slot.job.progress.max(progress.min(100));
        slot.job.progress = value;
        inner.progress.entry(id.to_string()).or_default().push(value);
        Ok(())
    }

    async fn complete(&self, id: &str, result: serde_json::Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Self::now(&inner);
        let Some(slot) = inner.slots.get_mut(id) else {
            return Ok(());
        };
        if slot.job.state.is_terminal() {
            return Ok(());
        }

        slot.job.state = JobState::Completed;
        slot.job.progress = 100;
        slot.job.result = Some(result);
        slot.locked_until = None;
        slot.finished_at = Some(now);
        inner.progress.entry(id.to_string()).or_default().push(100);
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Self::now(&inner);
        let Some(slot) = inner.slots.get_mut(id) else {
            return Ok(());
        };
        if slot.job.state.is_terminal() {
            return Ok(());
        }

        slot.job.state = JobState::Failed;
        slot.job.failure_reason = Some(reason.to_string());
        slot.locked_until = None;
        slot.finished_at = Some(now);
        Ok(())
    }

    async fn retry_later(&self, id: &str, delay: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Self::now(&inner);
        let Some(slot) = inner.slots.get_mut(id) else {
            return Ok(());
        };
        if slot.job.state != JobState::Active {
            return Ok(());
        }

        slot.job.state = JobState::Waiting;
        slot.available_at = now + ChronoDuration::from_std(delay).unwrap();
        slot.locked_until = None;
        Ok(())
    }

    async fn reclaim_stalled(&self, max_stalled: u32) -> Result<StallSweep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Self::now(&inner);
        let mut sweep = StallSweep::default();

        for slot in inner.slots.values_mut() {
            if slot.job.state != JobState::Active {
                continue;
            }
            let Some(locked_until) = slot.locked_until else {
                continue;
            };
            if locked_until >= now {
                continue;
            }

            if slot.job.stalled_count >= max_stalled {
                slot.job.state = JobState::Failed;
                slot.job.failure_reason =
                    Some("job stalled: worker lease expired too many times".to_string());
                slot.locked_until = None;
                slot.finished_at = Some(now);
                sweep.failed += 1;
            } else {
                slot.job.state = JobState::Waiting;
                slot.job.stalled_count += 1;
                slot.available_at = now;
                slot.locked_until = None;
                sweep.requeued += 1;
            }
        }

        Ok(sweep)
    }

    async fn cleanup(&self, max_age: Duration, max_count: u32) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Self::now(&inner) - ChronoDuration::from_std(max_age).unwrap();

        let mut expired: Vec<(DateTime<Utc>, String)> = inner
            .slots
            .values()
            .filter(|slot| slot.job.state.is_terminal())
            .filter_map(|slot| {
                slot.finished_at
                    .filter(|at| *at < cutoff)
                    .map(|at| (at, slot.job.id.clone()))
            })
            .collect();
        expired.sort();

        let mut removed = 0;
        for (_, id) in expired.into_iter().take(max_count as usize) {
            inner.slots.remove(&id);
            removed += 1;
        }

        Ok(removed)
    }
}

enum ChatFallback {
    Reply(String),
    Status(u16),
    Exhausted,
}

/// `ChatApi` double playing back a scripted sequence of results
pub struct ScriptedChat {
    script: Mutex<Vec<Result<String, LlmError>>>,
    fallback: ChatFallback,
    calls: AtomicUsize,
}

impl ScriptedChat {
    /// Play back `script` front-first, then error.
    pub fn replies(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script),
            fallback: ChatFallback::Exhausted,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every call with the same reply.
    pub fn always(reply: &str) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback: ChatFallback::Reply(reply.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every call with an upstream error of the given status.
    pub fn failing_with_status(status: u16) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback: ChatFallback::Status(status),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for ScriptedChat {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut script = self.script.lock().unwrap();
        if !script.is_empty() {
            return script.remove(0);
        }

        match &self.fallback {
            ChatFallback::Reply(reply) => Ok(reply.clone()),
            ChatFallback::Status(status) => Err(LlmError::Upstream {
                status: *status,
                body: "scripted failure".to_string(),
            }),
            ChatFallback::Exhausted => Err(LlmError::Network("script exhausted".to_string())),
        }
    }
}

/// `EntryStore` double serving a fixed entry set
pub struct FixedEntries {
    entries: Vec<HealthEntryRow>,
    fail: bool,
}

impl FixedEntries {
    pub fn new(entries: Vec<HealthEntryRow>) -> Self {
        Self {
            entries,
            fail: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn failing() -> Self {
        Self {
            entries: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl EntryStore for FixedEntries {
    async fn entries_since(
        &self,
        user_id: i64,
        from: NaiveDate,
    ) -> Result<Vec<HealthEntryRow>, sqlx::Error> {
        if self.fail {
            return Err(sqlx::Error::PoolTimedOut);
        }

        let mut entries: Vec<HealthEntryRow> = self
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.entry_date >= from)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.entry_date);
        Ok(entries)
    }
}

/// Shorthand for a health-entry row in tests.
pub fn entry(
    user_id: i64,
    date: &str,
    calories: i32,
    sleep_hours: f64,
    workout: Option<&str>,
    food_intake: Option<&str>,
) -> HealthEntryRow {
    HealthEntryRow {
        id: 0,
        user_id,
        entry_date: date.parse().expect("valid test date"),
        calories,
        sleep_hours,
        workout: workout.map(str::to_string),
        food_intake: food_intake.map(str::to_string),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
