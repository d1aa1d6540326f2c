//! Frames and the blocks they carry.
//!
//! A [`Frame`] is the unit of network transfer. Its blocks are applied in
//! array order; `FileData` blocks slice the frame payload sequentially, so
//! the payload of a frame is exactly the concatenation of its `FileData`
//! ranges in block order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic sequence number of a frame within one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl FrameId {
    /// The id of the first frame of every transfer.
    pub const FIRST: FrameId = FrameId(0);

    /// Returns the id following this one.
    pub fn next(self) -> FrameId {
        FrameId(self.0 + 1)
    }

    /// Returns the id preceding this one, or `None` for the first frame.
    pub fn prev(self) -> Option<FrameId> {
        self.0.checked_sub(1).map(FrameId)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tree-reconstruction step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    /// Open a child directory of the current directory.
    DirBegin { name: String },
    /// Close the current directory.
    DirEnd,
    /// Create a file in the current directory.
    FileBegin { name: String, size: u64 },
    /// Write `length` payload bytes at `offset` of the open file.
    #[serde(rename_all = "camelCase")]
    FileData { offset: u64, length: u64 },
    /// Close the open file.
    #[serde(rename_all = "camelCase")]
    FileEnd {
        checksum: String,
        last_modified_ms: i64,
    },
}

impl Block {
    /// Number of payload bytes this block consumes.
    pub fn payload_len(&self) -> u64 {
        match self {
            Block::FileData { length, .. } => *length,
            _ => 0,
        }
    }

    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Block::DirBegin { .. } => "dir_begin",
            Block::DirEnd => "dir_end",
            Block::FileBegin { .. } => "file_begin",
            Block::FileData { .. } => "file_data",
            Block::FileEnd { .. } => "file_end",
        }
    }
}

/// A frame violated its size or block-count bounds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameViolation {
    #[error("payload is {actual} bytes but blocks reference {expected}")]
    PayloadMismatch { expected: u64, actual: u64 },

    #[error("frame size {size} exceeds limit {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("frame has {count} blocks, limit is {limit}")]
    TooManyBlocks { count: usize, limit: usize },

    #[error("frame has no blocks")]
    Empty,
}

/// Bounded transfer unit: ordered blocks plus the payload they reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub id: FrameId,
    pub blocks: Vec<Block>,
    #[serde(with = "crate::messages::base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub is_last: bool,
}

impl Frame {
    /// Total payload bytes carried by this frame.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Sum of the payload lengths referenced by the blocks, or `None` if
    /// the lengths overflow a `u64`.
    pub fn referenced_bytes(&self) -> Option<u64> {
        self.blocks
            .iter()
            .try_fold(0u64, |acc, b| acc.checked_add(b.payload_len()))
    }

    /// Checks the structural bounds of the frame.
    pub fn check_bounds(&self, max_size: u64, max_blocks: usize) -> Result<(), FrameViolation> {
        if self.blocks.is_empty() {
            return Err(FrameViolation::Empty);
        }
        let expected = self.referenced_bytes().unwrap_or(u64::MAX);
        if expected != self.size() {
            return Err(FrameViolation::PayloadMismatch {
                expected,
                actual: self.size(),
            });
        }
        if self.size() > max_size {
            return Err(FrameViolation::TooLarge {
                size: self.size(),
                limit: max_size,
            });
        }
        if self.blocks.len() > max_blocks {
            return Err(FrameViolation::TooManyBlocks {
                count: self.blocks.len(),
                limit: max_blocks,
            });
        }
        Ok(())
    }
}
