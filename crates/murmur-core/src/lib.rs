//! murmur-core — wire format, message model, group crypto and the block
//! reader/writer pair. The services crate builds the dissemination logic
//! on top of this one.

pub mod block;
pub mod command;
pub mod config;
pub mod crypto;
pub mod ids;
pub mod message;
pub mod processor;
pub mod wire;

pub use command::{Command, CommandProcessor, PushCommand, Transmission};
pub use config::{MurmurConfig, ScoringWeights};
pub use ids::{ChatId, GroupId, StatusId, UserId};
pub use message::{ChatMessage, Contact, Group, PushStatus};
pub use processor::{BlockProcessor, ProcessorState, ReceivedEvent};
pub use wire::{BlockHeader, BlockType, ProtocolError};
