//! Transport collaborator: channels to a contact and how to pick one.
//!
//! A [`Channel`] runs one command exchange at a time. [`WireChannel`] is
//! the stream-backed implementation: it serialises commands with the
//! [`CommandProcessor`] onto any `AsyncWrite` half of a link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use murmur_core::config::ProtocolConfig;
use murmur_core::{Command, CommandProcessor, ProtocolError, UserId};

#[async_trait]
pub trait Channel: Send + Sync {
    /// Contact at the other end.
    fn peer(&self) -> UserId;

    fn is_open(&self) -> bool;

    /// Run one command exchange to completion. `false` means nothing
    /// usable reached the peer.
    async fn execute(&self, command: Command) -> bool;

    /// Fire and forget.
    fn execute_nonblocking(self: Arc<Self>, command: Command);

    fn stats(&self) -> &ChannelStats;
}

/// Picks the channel a dispatcher should push through.
pub trait ChannelSelector: Send + Sync {
    fn choose_best_channel(&self, contact: &UserId) -> Option<Arc<dyn Channel>>;
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Running counters. Advisory only.
#[derive(Debug, Default)]
pub struct ChannelStats {
    bytes_sent: AtomicU64,
    blocks_sent: AtomicU64,
    commands: AtomicU64,
    failures: AtomicU64,
    send_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    pub bytes_sent: u64,
    pub blocks_sent: u64,
    pub commands: u64,
    pub failures: u64,
    pub send_micros: u64,
}

impl ChannelStats {
    pub fn record_success(&self, bytes: u64, blocks: u32, micros: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.blocks_sent.fetch_add(u64::from(blocks), Ordering::Relaxed);
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.send_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            send_micros: self.send_micros.load(Ordering::Relaxed),
        }
    }
}

// ── Stream-backed channel ─────────────────────────────────────────────────────

pub struct WireChannel<W> {
    peer: UserId,
    writer: Mutex<W>,
    processor: CommandProcessor,
    open: AtomicBool,
    stats: ChannelStats,
}

impl<W> WireChannel<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(peer: UserId, writer: W, config: ProtocolConfig) -> Self {
        Self {
            peer,
            writer: Mutex::new(writer),
            processor: CommandProcessor::new(config),
            open: AtomicBool::new(true),
            stats: ChannelStats::default(),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Like [`Channel::execute`] but with the error kept.
    ///
    /// A send dropped before it finishes leaves a partial bundle on the
    /// stream, so the channel closes itself rather than frame anything
    /// after it.
    pub async fn send(&self, command: &Command) -> Result<(), ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "channel closed",
            )));
        }
        let started = Instant::now();
        let mut writer = self.writer.lock().await;
        let mut guard = CloseOnDrop {
            open: &self.open,
            armed: true,
        };
        let result = self.processor.execute(&mut *writer, command).await;
        guard.armed = false;
        match result {
            Ok(sent) => {
                self.stats.record_success(
                    sent.bytes,
                    sent.blocks,
                    started.elapsed().as_micros() as u64,
                );
                Ok(())
            }
            Err(e) => {
                self.stats.record_failure();
                if matches!(e, ProtocolError::Io(_)) {
                    self.close();
                }
                Err(e)
            }
        }
    }
}

struct CloseOnDrop<'a> {
    open: &'a AtomicBool,
    armed: bool,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.open.store(false, Ordering::Release);
            tracing::debug!("send interrupted mid-bundle, channel closed");
        }
    }
}

#[async_trait]
impl<W> Channel for WireChannel<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn peer(&self) -> UserId {
        self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn execute(&self, command: Command) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.send(&command).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    peer = %self.peer.short(),
                    command = command.kind(),
                    error = %e,
                    "command failed"
                );
                false
            }
        }
    }

    fn execute_nonblocking(self: Arc<Self>, command: Command) {
        tokio::spawn(async move {
            self.execute(command).await;
        });
    }

    fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Channels per contact. The best channel is the open one with the fewest
/// failures.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<DashMap<UserId, Vec<Arc<dyn Channel>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn Channel>) {
        self.channels.entry(channel.peer()).or_default().push(channel);
    }

    /// Drop every channel to `contact`.
    pub fn unregister(&self, contact: &UserId) {
        self.channels.remove(contact);
    }

    /// Drop closed channels. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.channels.retain(|_, list| {
            let before = list.len();
            list.retain(|c| c.is_open());
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }
}

impl ChannelSelector for ChannelRegistry {
    fn choose_best_channel(&self, contact: &UserId) -> Option<Arc<dyn Channel>> {
        self.channels
            .get(contact)?
            .iter()
            .filter(|c| c.is_open())
            .min_by_key(|c| c.stats().snapshot().failures)
            .cloned()
    }
}
