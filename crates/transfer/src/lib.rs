//! Core engine shared by both transfer roles.
//!
//! The sender walks a [`SourceNode`] tree with a [`FrameBuilder`]; the
//! receiver replays the resulting frames into a [`ReceiveState`] through a
//! [`FrameAssembler`]. Both sides track their lifecycle with a
//! [`StateMachine`] and agree on file content through SHA-256 digests.

mod assembler;
mod builder;
mod checksum;
pub mod config;
mod error;
mod id;
mod progress;
mod state;
pub mod tree;
mod validation;

pub use assembler::{FrameAssembler, ReceiveState};
pub use builder::FrameBuilder;
pub use checksum::{ChecksumTracker, checksum_bytes};
pub use config::TransferConfig;
pub use error::{TransferError, ValidationError, ValidationKind};
pub use id::{IdGenerator, MonotonicIdGenerator, UuidIdGenerator};
pub use progress::{ProgressThrottle, SpeedCalculator, TransferProgress};
pub use state::{Role, StateMachine};
pub use tree::{FileSource, FsSource, MemorySource, SourceDirectory, SourceFile, SourceNode, scan_dir};
pub use validation::{validate_entry_name, validate_relative_path};
