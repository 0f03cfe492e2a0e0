//! Murmur integration test harness.
//!
//! Every test builds simulated devices in-process and links them with
//! `tokio::io::duplex` pipes, one per direction, exactly as a radio link
//! would hand the stack a pair of byte streams.
//!
//!   RUST_LOG=murmur_services=debug cargo test --test integration
//!
//! Each device gets its own attachment directory under the system temp dir.

mod dissemination;
mod protocol;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use murmur_core::{Command, Contact, Group, MurmurConfig, UserId};
use murmur_services::{ChannelRegistry, MemoryStatusStore, PushService, StatusStore, WireChannel};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Pipe capacity per direction.
pub const PIPE_SIZE: usize = 256 * 1024;

static TRACING: Once = Once::new();
static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn temp_dir(label: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "murmur-it-{label}-{}-{n}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// One simulated device.
pub struct Device {
    pub profile: Contact,
    pub store: MemoryStatusStore,
    pub registry: ChannelRegistry,
    pub service: Arc<PushService>,
    pub dir: PathBuf,
}

impl Device {
    pub fn new(name: &str) -> Self {
        init_tracing();
        let dir = temp_dir(name);
        let mut config = MurmurConfig::default();
        config.protocol.attachment_dir = dir.join("attachments");
        config.dispatch.retry_backoff_ms = 20;

        let store = MemoryStatusStore::new();
        let registry = ChannelRegistry::new();
        let service = Arc::new(PushService::new(
            config,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(registry.clone()),
        ));
        service.start();
        Self {
            profile: Contact::new(UserId::random(), name),
            store,
            registry,
            service,
            dir,
        }
    }

    pub fn uid(&self) -> UserId {
        self.profile.uid
    }

    /// Join `group`, learning its key if it has one.
    pub fn join(&mut self, group: &Group) {
        self.store.add_group(group.clone());
        self.profile.groups.insert(group.id);
    }

    pub fn interested_in(&mut self, tag: &str, level: u8) {
        self.profile.interests.insert(tag.to_string(), level);
    }

    pub fn has_status(&self, status: &murmur_core::StatusId) -> bool {
        self.store.find(status).is_some()
    }
}

/// Reader tasks of a link, one per direction.
pub struct Link {
    pub readers: Vec<JoinHandle<Result<u64>>>,
}

impl Link {
    pub async fn close(self) {
        for reader in self.readers {
            reader.abort();
            let _ = reader.await;
        }
    }
}

/// Open a pipe in each direction, then have each side announce its profile.
pub async fn connect(a: &Device, b: &Device) -> Result<Link> {
    let mut readers = Vec::new();
    let mut channels = Vec::new();
    for (from, to) in [(a, b), (b, a)] {
        let (writer, reader) = tokio::io::duplex(PIPE_SIZE);
        let channel = Arc::new(WireChannel::new(
            to.uid(),
            writer,
            from.service.config().protocol.clone(),
        ));
        from.registry.register(channel.clone());
        channels.push((from, channel));

        let service = to.service.clone();
        let sender = from.uid();
        readers.push(tokio::spawn(async move { service.serve(sender, reader).await }));
    }

    for (from, channel) in channels {
        channel
            .send(&Command::Contact(from.profile.clone()))
            .await
            .with_context(|| format!("announce {}", from.profile.name))?;
    }
    Ok(Link { readers })
}

/// Poll `done` until it holds or five seconds pass.
pub async fn wait_for(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}
