//! PushService — owns the per-contact dispatchers and routes what the
//! block processor reads into storage.
//!
//! One instance per device. Everything a dispatcher needs (storage, channel
//! selection, scoring, density counters) is handed in at construction.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use murmur_core::crypto::GroupKeyring;
use murmur_core::{
    BlockProcessor, Command, Contact, MurmurConfig, ProtocolError, PushStatus, ReceivedEvent,
    UserId,
};

use crate::density::ReplicationDensityWatcher;
use crate::dispatcher::{
    DispatchContext, DispatchError, DispatcherEvent, MessageDispatcher, Phase,
};
use crate::scoring::ScoringFunction;
use crate::storage::{ChatLog, InsertOutcome, LocalId, StatusStore};
use crate::transport::ChannelSelector;

pub struct PushService {
    config: MurmurConfig,
    store: Arc<dyn StatusStore>,
    keyring: Arc<dyn GroupKeyring>,
    selector: Arc<dyn ChannelSelector>,
    chats: ChatLog,
    watcher: ReplicationDensityWatcher,
    scoring: ScoringFunction,
    contacts: DashMap<UserId, Contact>,
    dispatchers: DashMap<UserId, MessageDispatcher>,
    shutdown: CancellationToken,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl PushService {
    pub fn new(
        config: MurmurConfig,
        store: Arc<dyn StatusStore>,
        keyring: Arc<dyn GroupKeyring>,
        selector: Arc<dyn ChannelSelector>,
    ) -> Self {
        let watcher =
            ReplicationDensityWatcher::new(Duration::from_secs(config.density.window_secs));
        let scoring = ScoringFunction::new(
            config.dispatch.weights,
            config.dispatch.max_interest,
            watcher.clone(),
        );
        Self {
            config,
            store,
            keyring,
            selector,
            chats: ChatLog::new(),
            watcher,
            scoring,
            contacts: DashMap::new(),
            dispatchers: DashMap::new(),
            shutdown: CancellationToken::new(),
            pruner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MurmurConfig {
        &self.config
    }

    pub fn watcher(&self) -> &ReplicationDensityWatcher {
        &self.watcher
    }

    pub fn scoring(&self) -> &ScoringFunction {
        &self.scoring
    }

    pub fn chats(&self) -> &ChatLog {
        &self.chats
    }

    /// Start background housekeeping.
    pub fn start(&self) {
        let mut pruner = self.pruner.lock().unwrap_or_else(|e| e.into_inner());
        if pruner.is_none() {
            let interval = Duration::from_secs(self.config.density.prune_interval_secs.max(1));
            *pruner = Some(self.watcher.spawn_pruner(interval, self.shutdown.child_token()));
        }
    }

    // ── Contacts ──────────────────────────────────────────────────────────

    /// A contact connected or sent fresh profile data.
    ///
    /// Starts a dispatcher for a new contact. For a contact with a running
    /// dispatcher only the parts of the profile that changed are forwarded.
    pub fn contact_connected(&self, contact: Contact) -> Result<(), DispatchError> {
        let uid = contact.uid;
        let previous = self.contacts.insert(uid, contact.clone());

        let running = self
            .dispatchers
            .get(&uid)
            .is_some_and(|d| d.phase() == Phase::Running);
        if running {
            if let Some(previous) = previous {
                if previous.groups != contact.groups {
                    self.notify_contact(&uid, DispatcherEvent::GroupsChanged(contact.groups))?;
                }
                if previous.interests != contact.interests {
                    self.notify_contact(
                        &uid,
                        DispatcherEvent::InterestsChanged(contact.interests),
                    )?;
                }
            }
            return Ok(());
        }

        let dispatcher = MessageDispatcher::new(contact, self.dispatch_context());
        dispatcher.start()?;
        if let Some(stale) = self.dispatchers.insert(uid, dispatcher) {
            stale.stop();
        }
        tracing::debug!(contact = %uid.short(), "contact connected");
        Ok(())
    }

    pub async fn contact_disconnected(&self, uid: &UserId) {
        self.contacts.remove(uid);
        if let Some((_, dispatcher)) = self.dispatchers.remove(uid) {
            dispatcher.shutdown().await;
            tracing::debug!(contact = %uid.short(), "contact disconnected");
        }
    }

    pub fn contact(&self, uid: &UserId) -> Option<Contact> {
        self.contacts.get(uid).map(|c| c.clone())
    }

    pub fn dispatcher_phase(&self, uid: &UserId) -> Option<Phase> {
        self.dispatchers.get(uid).map(|d| d.phase())
    }

    pub fn candidates(&self, uid: &UserId) -> Vec<LocalId> {
        self.dispatchers
            .get(uid)
            .map(|d| d.candidates())
            .unwrap_or_default()
    }

    /// Queue an event for one contact's dispatcher.
    pub fn notify_contact(&self, uid: &UserId, event: DispatcherEvent) -> Result<(), DispatchError> {
        match self.dispatchers.get(uid) {
            Some(d) if d.phase() == Phase::Running => {
                d.notify(event);
                Ok(())
            }
            _ => Err(DispatchError::NotRunning(*uid)),
        }
    }

    /// Queue an event for every dispatcher. Returns how many accepted it.
    pub fn publish(&self, event: DispatcherEvent) -> usize {
        self.dispatchers
            .iter()
            .filter(|d| d.notify(event.clone()))
            .count()
    }

    // ── Statuses ──────────────────────────────────────────────────────────

    /// Store a status authored on this device and offer it to every contact.
    pub fn post(&self, status: PushStatus, attachment: Option<PathBuf>) -> Result<LocalId> {
        match (&status.filename, &attachment) {
            (Some(name), None) => bail!("status names attachment {name} but no file was given"),
            (None, Some(path)) => bail!("file {} given for a status without a filename", path.display()),
            (Some(_), Some(path)) => {
                let meta = std::fs::metadata(path)
                    .with_context(|| format!("attachment {}", path.display()))?;
                if meta.len() > self.config.protocol.max_file_size {
                    bail!(
                        "attachment {} is {} bytes, limit is {}",
                        path.display(),
                        meta.len(),
                        self.config.protocol.max_file_size
                    );
                }
            }
            (None, None) => {}
        }

        let status_id = status.id;
        match self.store.insert(status, None, attachment) {
            InsertOutcome::Inserted(id) => {
                let notified = self.publish(DispatcherEvent::StatusInserted(id));
                tracing::debug!(status = %status_id.short(), local_id = id, notified, "status posted");
                Ok(id)
            }
            InsertOutcome::Merged(id) => {
                bail!("status {} already stored as {id}", status_id.short())
            }
        }
    }

    pub fn delete_status(&self, id: LocalId) -> bool {
        let Some(record) = self.store.delete(id) else {
            return false;
        };
        self.watcher.forget(&record.status.id);
        self.publish(DispatcherEvent::StatusDeleted(id));
        true
    }

    // ── Receive path ──────────────────────────────────────────────────────

    /// Route one event read from `from`'s stream.
    pub fn on_received(&self, from: UserId, event: ReceivedEvent) {
        match event {
            ReceivedEvent::Status { mut status, attachment } => {
                status.hop_count = status.hop_count.saturating_add(1);
                self.watcher.record_copy(status.id);
                let status_id = status.id;
                let path = attachment.map(|f| f.path);
                match self.store.insert(status, Some(from), path.clone()) {
                    InsertOutcome::Inserted(id) => {
                        tracing::debug!(
                            from = %from.short(),
                            status = %status_id.short(),
                            local_id = id,
                            "status received"
                        );
                        self.publish(DispatcherEvent::StatusInserted(id));
                    }
                    InsertOutcome::Merged(id) => {
                        tracing::trace!(
                            from = %from.short(),
                            status = %status_id.short(),
                            local_id = id,
                            "duplicate status merged"
                        );
                        if let Some(path) = path {
                            self.drop_unused_attachment(id, path);
                        }
                    }
                }
            }
            ReceivedEvent::Contact(contact) => {
                if contact.uid != from {
                    tracing::debug!(
                        from = %from.short(),
                        contact = %contact.uid.short(),
                        "contact block describes another user"
                    );
                }
                if let Err(e) = self.contact_connected(contact) {
                    tracing::debug!(from = %from.short(), error = %e, "contact update ignored");
                }
            }
            ReceivedEvent::Chat(message) => {
                let chat = message.id;
                if self.chats.add(from, message) {
                    tracing::debug!(from = %from.short(), chat = %chat.short(), "chat received");
                } else {
                    tracing::trace!(from = %from.short(), chat = %chat.short(), "repeated chat ignored");
                }
            }
            ReceivedEvent::File(file) => {
                tracing::info!(
                    from = %from.short(),
                    owner = hex::encode(&file.owner[..8]),
                    size = file.size,
                    path = %file.path.display(),
                    "file received"
                );
            }
            ReceivedEvent::KeepAlive => {
                tracing::trace!(from = %from.short(), "keep-alive");
            }
        }
    }

    /// Remove a freshly received attachment the merged record did not keep.
    fn drop_unused_attachment(&self, id: LocalId, path: PathBuf) {
        let kept = self
            .store
            .get(id)
            .and_then(|record| record.attachment)
            .is_some_and(|stored| stored == path);
        if kept {
            return;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "cannot remove duplicate attachment");
        }
    }

    /// Read blocks from `from` until the stream ends or the service shuts
    /// down. Returns the number of events handled.
    pub async fn serve<R>(&self, from: UserId, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut processor = BlockProcessor::new(self.config.protocol.clone(), self.keyring.clone());
        let mut handled = 0u64;
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = processor.process_next(&mut reader) => next,
            };
            match next {
                Ok(Some(event)) => {
                    handled += 1;
                    self.on_received(from, event);
                }
                Ok(None) => {}
                Err(ProtocolError::EndOfStream) => break,
                Err(e) => {
                    return Err(e).with_context(|| format!("stream from {}", from.short()));
                }
            }
        }
        if processor.discarded_blocks() > 0 {
            tracing::debug!(
                from = %from.short(),
                discarded = processor.discarded_blocks(),
                "encrypted blocks skipped without a key"
            );
        }
        Ok(handled)
    }

    pub fn keep_alive(&self, uid: &UserId) -> Result<(), DispatchError> {
        let channel = self
            .selector
            .choose_best_channel(uid)
            .ok_or(DispatchError::ChannelUnavailable(*uid))?;
        channel.execute_nonblocking(Command::KeepAlive);
        Ok(())
    }

    /// Stop every dispatcher and background task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let uids: Vec<UserId> = self.dispatchers.iter().map(|d| *d.key()).collect();
        for uid in uids {
            if let Some((_, dispatcher)) = self.dispatchers.remove(&uid) {
                dispatcher.shutdown().await;
            }
        }
        let pruner = self
            .pruner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pruner) = pruner {
            let _ = pruner.await;
        }
        tracing::info!("push service stopped");
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            store: self.store.clone(),
            selector: self.selector.clone(),
            scoring: self.scoring.clone(),
            config: self.config.dispatch.clone(),
        }
    }
}
