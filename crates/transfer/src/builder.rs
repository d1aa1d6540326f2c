//! Splits a source tree into bounded frames.
//!
//! The walk is pre-order depth-first with an explicit cursor instead of
//! recursion, so a frame can close anywhere in the tree (including in the
//! middle of a file) and the next call resumes from the same position.
//! Frame construction depends only on the tree and the cursor: rewinding
//! with [`FrameBuilder::reset`] reproduces byte-identical frames.

use arbor_protocol::{Block, Frame, FrameId, ManifestEntry};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::checksum::ChecksumTracker;
use crate::config::TransferConfig;
use crate::error::{ValidationError, ValidationKind};
use crate::tree::{SourceFile, SourceNode, tree_totals};
use crate::validation::validate_entry_name;
use crate::TransferError;

/// File whose bytes are currently being enqueued.
struct OpenFile {
    file: SourceFile,
    id: String,
    offset: u64,
    tracker: ChecksumTracker,
}

/// What the cursor finds next when no file is open.
enum Step {
    Dir(String),
    File(SourceFile),
    Up,
    Done,
}

/// Produces the frame sequence of one transfer.
pub struct FrameBuilder {
    roots: Vec<SourceNode>,
    max_frame_size: u64,
    max_frame_blocks: usize,
    /// `levels[d]` is the index of the next child to visit in the directory
    /// open at depth `d` (depth 0 is the transfer root).
    levels: Vec<usize>,
    dir_names: Vec<String>,
    open_file: Option<OpenFile>,
    next_id: FrameId,
    finished: bool,
    manifest: Vec<ManifestEntry>,
    bytes_enqueued: u64,
    total_bytes: u64,
    file_count: usize,
    cancel: CancellationToken,
}

impl FrameBuilder {
    /// Creates a builder over the top-level items of a transfer.
    ///
    /// An empty item list is a validation error: a transfer must contain at
    /// least one directory or file.
    pub fn new(roots: Vec<SourceNode>, config: &TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        if roots.is_empty() {
            return Err(ValidationError::new(
                ValidationKind::EmptyTransfer,
                "a transfer must contain at least one item",
            )
            .into());
        }
        let (total_bytes, file_count) = tree_totals(&roots);
        Ok(Self {
            roots,
            max_frame_size: config.max_frame_size,
            max_frame_blocks: config.max_frame_blocks,
            levels: vec![0],
            dir_names: Vec::new(),
            open_file: None,
            next_id: FrameId::FIRST,
            finished: false,
            manifest: Vec::new(),
            bytes_enqueued: 0,
            total_bytes,
            file_count,
            cancel: CancellationToken::new(),
        })
    }

    /// Sets the token sampled between blocks.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Rewinds to the first frame.
    pub fn reset(&mut self) {
        self.levels = vec![0];
        self.dir_names.clear();
        if let Some(open) = self.open_file.take() {
            open.file.source.release();
        }
        self.next_id = FrameId::FIRST;
        self.finished = false;
        self.manifest.clear();
        self.bytes_enqueued = 0;
    }

    /// Total file bytes in the tree.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of files in the tree.
    pub fn file_count(&self) -> usize {
        self.file_count
    }

    /// File bytes placed into frames so far.
    pub fn bytes_enqueued(&self) -> u64 {
        self.bytes_enqueued
    }

    /// `true` once the frame marked `is_last` has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Digests of every file closed so far, in transfer order.
    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }

    /// Builds the next frame, or `None` after the last one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        let mut blocks = Vec::new();
        let mut payload = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if blocks.len() >= self.max_frame_blocks {
                break;
            }

            match self.open_file.as_ref().map(|f| f.offset < f.file.size) {
                Some(true) => {
                    if !self.push_file_data(&mut blocks, &mut payload)? {
                        break;
                    }
                }
                Some(false) => self.push_file_end(&mut blocks),
                None => match self.peek_step() {
                    Step::Dir(name) => {
                        validate_entry_name(&name)?;
                        self.advance();
                        self.levels.push(0);
                        self.dir_names.push(name.clone());
                        blocks.push(Block::DirBegin { name });
                    }
                    Step::File(file) => {
                        validate_entry_name(&file.name)?;
                        self.advance();
                        blocks.push(Block::FileBegin {
                            name: file.name.clone(),
                            size: file.size,
                        });
                        let id = self.file_id(&file.name);
                        self.open_file = Some(OpenFile {
                            file,
                            id,
                            offset: 0,
                            tracker: ChecksumTracker::new(),
                        });
                    }
                    Step::Up => {
                        self.levels.pop();
                        self.dir_names.pop();
                        blocks.push(Block::DirEnd);
                    }
                    Step::Done => break,
                },
            }
        }

        let is_last = !self.has_more();
        let frame = Frame {
            id: self.next_id,
            blocks,
            payload,
            is_last,
        };
        self.next_id = self.next_id.next();
        self.finished = is_last;

        trace!(
            frame = %frame.id,
            blocks = frame.blocks.len(),
            bytes = frame.size(),
            is_last,
            "frame built"
        );
        Ok(Some(frame))
    }

    /// Appends one `FileData` block filling as much of the frame as the
    /// open file allows. Returns `false` if the frame has no room left.
    fn push_file_data(
        &mut self,
        blocks: &mut Vec<Block>,
        payload: &mut Vec<u8>,
    ) -> Result<bool, TransferError> {
        let room = self.max_frame_size - payload.len() as u64;
        if room == 0 {
            return Ok(false);
        }
        let Some(open) = self.open_file.as_mut() else {
            return Ok(false);
        };

        let offset = open.offset;
        let length = (open.file.size - offset).min(room);
        let start = payload.len();
        payload.resize(start + length as usize, 0);
        read_exact_at(open, offset, &mut payload[start..])?;
        open.tracker.update(&payload[start..]);
        open.offset += length;
        self.bytes_enqueued += length;

        blocks.push(Block::FileData { offset, length });
        Ok(true)
    }

    /// Closes the open file once every byte has been enqueued.
    fn push_file_end(&mut self, blocks: &mut Vec<Block>) {
        let Some(open) = self.open_file.take() else {
            return;
        };
        open.file.source.release();
        let checksum = open.tracker.finalize();
        self.manifest.push(ManifestEntry {
            file: open.id,
            checksum: checksum.clone(),
        });
        blocks.push(Block::FileEnd {
            checksum,
            last_modified_ms: open.file.last_modified_ms,
        });
    }

    fn current_children(&self) -> &[SourceNode] {
        let mut nodes: &[SourceNode] = &self.roots;
        for &next in &self.levels[..self.levels.len() - 1] {
            nodes = nodes[next - 1].children();
        }
        nodes
    }

    fn peek_step(&self) -> Step {
        let children = self.current_children();
        let index = self.levels.last().copied().unwrap_or(usize::MAX);
        match children.get(index) {
            Some(SourceNode::Directory(d)) => Step::Dir(d.name.clone()),
            Some(SourceNode::File(f)) => Step::File(f.clone()),
            None if self.levels.len() > 1 => Step::Up,
            None => Step::Done,
        }
    }

    fn advance(&mut self) {
        if let Some(index) = self.levels.last_mut() {
            *index += 1;
        }
    }

    fn has_more(&self) -> bool {
        self.open_file.is_some() || self.levels.len() > 1 || self.levels[0] < self.roots.len()
    }

    fn file_id(&self, name: &str) -> String {
        let mut id = self.dir_names.join("/");
        if !id.is_empty() {
            id.push('/');
        }
        id.push_str(name);
        id
    }
}

impl Iterator for FrameBuilder {
    type Item = Result<Frame, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Fills `buf` from the open file at `offset`, failing if the source is
/// shorter than its declared size.
fn read_exact_at(open: &OpenFile, offset: u64, buf: &mut [u8]) -> Result<(), TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = open
            .file
            .source
            .read_at(offset + filled as u64, &mut buf[filled..])
            .map_err(|e| TransferError::io(&open.id, e))?;
        if n == 0 {
            return Err(TransferError::io(
                &open.id,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended at {} bytes, declared size is {}",
                        offset + filled as u64,
                        open.file.size
                    ),
                ),
            ));
        }
        filled += n;
    }
    Ok(())
}
