//! murmur-services — deciding what to push to whom.
//!
//! Storage and transport are reached through traits so the dispatcher
//! logic runs unchanged against the in-memory implementations here or
//! against a real database and link layer.

pub mod density;
pub mod dispatcher;
pub mod push_service;
pub mod scoring;
pub mod storage;
pub mod transport;

pub use density::ReplicationDensityWatcher;
pub use dispatcher::{
    stochastic_accept, DispatchContext, DispatchError, DispatcherEvent, MessageDispatcher, Phase,
};
pub use push_service::PushService;
pub use scoring::{ScoreBreakdown, ScoringFunction};
pub use storage::{ChatLog, InsertOutcome, LocalId, MemoryStatusStore, StatusRecord, StatusStore};
pub use transport::{Channel, ChannelRegistry, ChannelSelector, ChannelStats, WireChannel};
