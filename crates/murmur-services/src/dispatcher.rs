//! Per-contact message dispatcher.
//!
//! Each connected contact gets one dispatcher with two tasks:
//!
//! - the pick loop waits for a non-empty candidate set, rescores it,
//!   draws a candidate by stochastic acceptance and pushes it through the
//!   best channel to the contact;
//! - the event task drains a bounded queue of store/profile notifications
//!   and applies them to the candidate set.
//!
//! Both share one `CandidateState` behind a mutex that is never held
//! across an await. Callers enqueue notifications with `try_send`, so they
//! never wait on either task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use murmur_core::config::DispatchConfig;
use murmur_core::message::now_millis;
use murmur_core::{Command, Contact, GroupId, PushCommand, UserId};

use crate::scoring::ScoringFunction;
use crate::storage::{LocalId, StatusRecord, StatusStore};
use crate::transport::ChannelSelector;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no channel to contact {0}")]
    ChannelUnavailable(UserId),

    #[error("dispatcher already started")]
    AlreadyRunning,

    #[error("no running dispatcher for contact {0}")]
    NotRunning(UserId),
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Notifications a dispatcher reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherEvent {
    StatusInserted(LocalId),
    StatusDeleted(LocalId),
    GroupsChanged(BTreeSet<GroupId>),
    InterestsChanged(BTreeMap<String, u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Created,
            1 => Phase::Running,
            _ => Phase::Stopped,
        }
    }
}

/// Collaborators shared by every dispatcher.
#[derive(Clone)]
pub struct DispatchContext {
    pub store: Arc<dyn StatusStore>,
    pub selector: Arc<dyn ChannelSelector>,
    pub scoring: ScoringFunction,
    pub config: DispatchConfig,
}

// ── Candidate state ───────────────────────────────────────────────────────────

struct CandidateState {
    candidates: BTreeSet<LocalId>,
    cached_max: Option<(LocalId, f32)>,
    threshold: f32,
    profile: Contact,
    running: bool,
}

impl CandidateState {
    fn remove(&mut self, id: LocalId) -> bool {
        let removed = self.candidates.remove(&id);
        if matches!(self.cached_max, Some((max, _)) if max == id) {
            self.cached_max = None;
        }
        removed
    }

    fn offer(&mut self, id: LocalId, score: f32) -> bool {
        if score <= self.threshold {
            return false;
        }
        self.candidates.insert(id);
        if self.cached_max.map_or(true, |(_, best)| score > best) {
            self.cached_max = Some((id, score));
        }
        true
    }
}

/// Draw one id with probability proportional to its score.
///
/// `max` must be the largest score in `scored`. Each round picks an entry
/// uniformly and keeps it with probability `score / max`. With no positive
/// score every entry is equally likely.
pub fn stochastic_accept<R: Rng + ?Sized>(
    scored: &[(LocalId, f32)],
    max: f32,
    rng: &mut R,
) -> Option<LocalId> {
    if scored.is_empty() {
        return None;
    }
    if max <= 0.0 {
        return Some(scored[rng.gen_range(0..scored.len())].0);
    }
    loop {
        let (id, score) = scored[rng.gen_range(0..scored.len())];
        if rng.gen::<f32>() * max < score {
            return Some(id);
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

struct Inner {
    contact: UserId,
    ctx: DispatchContext,
    state: Mutex<CandidateState>,
    wake: Notify,
    cancel: CancellationToken,
    phase: AtomicU8,
}

pub struct MessageDispatcher {
    inner: Arc<Inner>,
    events: mpsc::Sender<DispatcherEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<DispatcherEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageDispatcher {
    pub fn new(profile: Contact, ctx: DispatchContext) -> Self {
        let (events, event_rx) = mpsc::channel(ctx.config.event_queue_capacity.max(1));
        let state = CandidateState {
            candidates: BTreeSet::new(),
            cached_max: None,
            threshold: ctx.config.threshold,
            profile: profile.clone(),
            running: false,
        };
        Self {
            inner: Arc::new(Inner {
                contact: profile.uid,
                ctx,
                state: Mutex::new(state),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                phase: AtomicU8::new(Phase::Created as u8),
            }),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn contact(&self) -> UserId {
        self.inner.contact
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    /// Spawn the pick loop and the event task.
    pub fn start(&self) -> Result<(), DispatchError> {
        self.inner
            .phase
            .compare_exchange(
                Phase::Created as u8,
                Phase::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| DispatchError::AlreadyRunning)?;
        let Some(event_rx) = lock(&self.event_rx).take() else {
            return Err(DispatchError::AlreadyRunning);
        };
        self.inner.state().running = true;

        tracing::info!(contact = %self.inner.contact.short(), "dispatcher started");
        let events = tokio::spawn(event_task(self.inner.clone(), event_rx));
        let picks = tokio::spawn(pick_loop(self.inner.clone()));
        lock(&self.tasks).extend([events, picks]);
        Ok(())
    }

    /// Stop both tasks and drop the candidate set. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop and wait for both tasks to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Queue a notification without waiting. Returns false when it was
    /// dropped because the queue is full or the dispatcher stopped.
    pub fn notify(&self, event: DispatcherEvent) -> bool {
        if self.phase() == Phase::Stopped {
            return false;
        }
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    contact = %self.inner.contact.short(),
                    ?event,
                    "dispatcher queue full, event dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Current candidate ids, for inspection.
    pub fn candidates(&self) -> Vec<LocalId> {
        self.inner.state().candidates.iter().copied().collect()
    }

    pub fn threshold(&self) -> f32 {
        self.inner.state().threshold
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.inner.state().threshold = threshold;
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, CandidateState> {
        lock(&self.state)
    }

    fn stop(&self) {
        let previous = self.phase.swap(Phase::Stopped as u8, Ordering::AcqRel);
        {
            let mut state = self.state();
            state.running = false;
            state.candidates.clear();
            state.cached_max = None;
        }
        self.cancel.cancel();
        if previous == Phase::Running as u8 {
            tracing::info!(contact = %self.contact.short(), "dispatcher stopped");
        }
    }

    fn score(&self, record: &StatusRecord, profile: &Contact, now_ms: u64) -> f32 {
        self.ctx.scoring.score(record, profile, now_ms)
    }

    fn eligible(&self, id: LocalId, profile: &Contact, now_ms: u64) -> Option<f32> {
        let record = self.ctx.store.get(id)?;
        if !record.eligible_for(&self.contact, now_ms) {
            return None;
        }
        Some(self.score(&record, profile, now_ms))
    }

    // ── Event handlers ────────────────────────────────────────────────────

    fn on_status_inserted(&self, id: LocalId) {
        let now = now_millis();
        let mut state = self.state();
        if !state.running {
            return;
        }
        let Some(score) = self.eligible(id, &state.profile, now) else {
            return;
        };
        if state.offer(id, score) {
            drop(state);
            self.wake.notify_one();
        }
    }

    fn on_status_deleted(&self, id: LocalId) {
        let mut state = self.state();
        if state.running {
            state.remove(id);
        }
    }

    /// Membership changed: rebuild the whole set from storage.
    fn on_groups_changed(&self, groups: BTreeSet<GroupId>) {
        let now = now_millis();
        let profile = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            state.profile.groups = groups;
            state.profile.clone()
        };

        let ids = self
            .ctx
            .store
            .query_candidates(&profile.groups, &self.contact, now);
        let scored: Vec<(LocalId, f32)> = ids
            .into_iter()
            .filter_map(|id| self.eligible(id, &profile, now).map(|s| (id, s)))
            .collect();

        let mut state = self.state();
        if !state.running {
            return;
        }
        state.candidates.clear();
        state.cached_max = None;
        for (id, score) in scored {
            state.offer(id, score);
        }
        let wake = !state.candidates.is_empty();
        tracing::debug!(
            contact = %self.contact.short(),
            candidates = state.candidates.len(),
            "candidate set refreshed"
        );
        drop(state);
        if wake {
            self.wake.notify_one();
        }
    }

    fn on_interests_changed(&self, interests: BTreeMap<String, u8>) {
        let mut state = self.state();
        if state.running {
            state.profile.interests = interests;
        }
    }

    fn apply(&self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::StatusInserted(id) => self.on_status_inserted(id),
            DispatcherEvent::StatusDeleted(id) => self.on_status_deleted(id),
            DispatcherEvent::GroupsChanged(groups) => self.on_groups_changed(groups),
            DispatcherEvent::InterestsChanged(interests) => self.on_interests_changed(interests),
        }
    }

    // ── Pick loop steps ───────────────────────────────────────────────────

    /// Rescore every candidate, drop those at or below the threshold and
    /// refresh the cached max. Returns the survivors with their scores.
    fn rescore(&self, state: &mut CandidateState, now_ms: u64) -> Vec<(LocalId, f32)> {
        let mut survivors = Vec::with_capacity(state.candidates.len());
        let mut max: Option<(LocalId, f32)> = None;
        let threshold = state.threshold;
        let profile = &state.profile;
        state.candidates.retain(|&id| match self.eligible(id, profile, now_ms) {
            Some(score) if score > threshold => {
                if max.map_or(true, |(_, best)| score > best) {
                    max = Some((id, score));
                }
                survivors.push((id, score));
                true
            }
            _ => false,
        });
        state.cached_max = max;
        survivors
    }

    /// Pick the next candidate and fetch its record. `None` when the set
    /// emptied out during rescoring.
    fn select(&self, rng: &mut StdRng) -> Option<StatusRecord> {
        let now = now_millis();
        let mut state = self.state();
        if !state.running {
            return None;
        }
        let scored = self.rescore(&mut state, now);
        let (_, max) = state.cached_max?;
        let id = stochastic_accept(&scored, max, rng)?;
        drop(state);
        self.ctx.store.get(id)
    }

    fn build_command(&self, record: StatusRecord) -> Command {
        let group_key = self
            .ctx
            .store
            .group(&record.status.group)
            .and_then(|g| g.key.clone());
        Command::PushStatus(PushCommand {
            status: record.status,
            attachment: record.attachment,
            group_key,
        })
    }

    fn delivered(&self, id: LocalId) {
        self.ctx.store.mark_sent(id, &self.contact);
        let mut state = self.state();
        state.remove(id);
    }
}

async fn event_task(inner: Arc<Inner>, mut rx: mpsc::Receiver<DispatcherEvent>) {
    let groups = inner.state().profile.groups.clone();
    inner.on_groups_changed(groups);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => inner.apply(event),
                None => return,
            },
        }
    }
}

async fn pick_loop(inner: Arc<Inner>) {
    let mut rng = StdRng::from_entropy();
    let backoff = Duration::from_millis(inner.ctx.config.retry_backoff_ms);
    loop {
        // Wait for something to send.
        loop {
            {
                let state = inner.state();
                if !state.running {
                    return;
                }
                if !state.candidates.is_empty() {
                    break;
                }
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = inner.wake.notified() => {}
            }
        }

        let Some(record) = inner.select(&mut rng) else {
            continue;
        };
        let Some(channel) = inner.ctx.selector.choose_best_channel(&inner.contact) else {
            tracing::info!(
                contact = %inner.contact.short(),
                "no channel to contact, stopping dispatcher"
            );
            inner.stop();
            return;
        };

        let id = record.local_id;
        let status = record.status.id;
        let command = inner.build_command(record);
        let sent = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            sent = channel.execute(command) => sent,
        };

        if sent {
            tracing::debug!(
                contact = %inner.contact.short(),
                status = %status.short(),
                "status pushed"
            );
            inner.delivered(id);
        } else {
            tracing::debug!(
                contact = %inner.contact.short(),
                status = %status.short(),
                "push failed, candidate kept"
            );
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
