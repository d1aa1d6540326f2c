//! Applies frames to the filesystem.
//!
//! [`ReceiveState`] is the reconstruction cursor: a stack of open
//! directories rooted at the transfer root and at most one open file.
//! [`FrameAssembler`] validates a frame and applies its blocks in order.
//! Every invariant violation is a fatal [`ValidationError`]; nothing is
//! rolled back.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use arbor_protocol::{Block, Frame, ManifestEntry};
use chrono::DateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::checksum::ChecksumTracker;
use crate::error::{ValidationError, ValidationKind};
use crate::validation::{validate_entry_name, validate_relative_path};
use crate::TransferError;

/// File currently being written.
struct OpenWrite {
    id: String,
    path: PathBuf,
    file: File,
    declared: u64,
    written: u64,
    tracker: ChecksumTracker,
}

/// Receiver-side reconstruction cursor for one transfer.
pub struct ReceiveState {
    /// `dirs[0]` is the transfer root.
    dirs: Vec<PathBuf>,
    names: Vec<String>,
    open: Option<OpenWrite>,
    /// Recomputed digest of every closed file, keyed by file id.
    closed: HashMap<String, String>,
    bytes_written: u64,
}

impl ReceiveState {
    /// Creates the cursor, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| TransferError::io(&root, e))?;
        Ok(Self {
            dirs: vec![root],
            names: Vec::new(),
            open: None,
            closed: HashMap::new(),
            bytes_written: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.dirs[0]
    }

    /// Number of open directories below the root.
    pub fn depth(&self) -> usize {
        self.dirs.len() - 1
    }

    pub fn has_open_file(&self) -> bool {
        self.open.is_some()
    }

    /// `true` when no file is open and the stack is back at the root.
    pub fn is_at_rest(&self) -> bool {
        self.open.is_none() && self.dirs.len() == 1
    }

    /// Number of files opened and closed so far.
    pub fn files_closed(&self) -> usize {
        self.closed.len()
    }

    /// File bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Checks a prepare-phase manifest against the files actually received.
    pub fn verify_manifest(&self, manifest: &[ManifestEntry]) -> Result<(), ValidationError> {
        let mut seen = HashSet::with_capacity(manifest.len());
        for entry in manifest {
            validate_relative_path(&entry.file)?;
            if !seen.insert(entry.file.as_str()) {
                return Err(ValidationError::new(
                    ValidationKind::DuplicateFile,
                    "file listed twice in manifest",
                )
                .with("file", &entry.file));
            }
            let Some(received) = self.closed.get(&entry.file) else {
                return Err(ValidationError::new(
                    ValidationKind::UnknownFile,
                    "manifest lists a file that was not transferred",
                )
                .with("file", &entry.file));
            };
            if *received != entry.checksum {
                return Err(ValidationError::checksum_mismatch(
                    &entry.file,
                    &entry.checksum,
                    received,
                ));
            }
        }
        if manifest.len() != self.closed.len() {
            return Err(ValidationError::new(
                ValidationKind::ManifestSize,
                "manifest does not cover every transferred file",
            )
            .with("expected", self.closed.len())
            .with("received", manifest.len()));
        }
        Ok(())
    }

    fn current_dir(&self) -> &Path {
        &self.dirs[self.dirs.len() - 1]
    }

    fn file_id(&self, name: &str) -> String {
        let mut id = self.names.join("/");
        if !id.is_empty() {
            id.push('/');
        }
        id.push_str(name);
        id
    }

    fn dir_begin(&mut self, name: &str) -> Result<(), TransferError> {
        if let Some(open) = &self.open {
            return Err(ValidationError::sequence("directory opened while a file is open")
                .with("file", &open.id)
                .with("name", name)
                .into());
        }
        validate_entry_name(name)?;
        let path = self.current_dir().join(name);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(TransferError::io(&path, e)),
        }
        trace!(path = %path.display(), "directory opened");
        self.dirs.push(path);
        self.names.push(name.to_string());
        Ok(())
    }

    fn dir_end(&mut self) -> Result<(), TransferError> {
        if let Some(open) = &self.open {
            return Err(ValidationError::sequence("directory closed while a file is open")
                .with("file", &open.id)
                .into());
        }
        if self.dirs.len() == 1 {
            return Err(ValidationError::sequence("cannot close the transfer root").into());
        }
        self.dirs.pop();
        self.names.pop();
        Ok(())
    }

    fn file_begin(&mut self, name: &str, size: u64) -> Result<(), TransferError> {
        if let Some(open) = &self.open {
            return Err(ValidationError::sequence("file opened while another file is open")
                .with("file", &open.id)
                .with("name", name)
                .into());
        }
        validate_entry_name(name)?;
        let id = self.file_id(name);
        if self.closed.contains_key(&id) {
            return Err(ValidationError::new(
                ValidationKind::DuplicateFile,
                "file transferred twice",
            )
            .with("file", &id)
            .into());
        }
        let path = self.current_dir().join(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TransferError::io(&path, e))?;
        trace!(file = %id, size, "file opened");
        self.open = Some(OpenWrite {
            id,
            path,
            file,
            declared: size,
            written: 0,
            tracker: ChecksumTracker::new(),
        });
        Ok(())
    }

    fn file_data(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let Some(open) = self.open.as_mut() else {
            return Err(ValidationError::sequence("file data without an open file")
                .with("offset", offset)
                .into());
        };
        if offset != open.written {
            return Err(ValidationError::new(
                ValidationKind::OffsetMismatch,
                "data does not continue the file",
            )
            .with("file", &open.id)
            .with("expected", open.written)
            .with("received", offset)
            .into());
        }
        let length = data.len() as u64;
        if open.written + length > open.declared {
            return Err(ValidationError::new(
                ValidationKind::SizeMismatch,
                "write past the declared file size",
            )
            .with("file", &open.id)
            .with("declared", open.declared)
            .with("received", open.written + length)
            .into());
        }
        open.file
            .write_all(data)
            .map_err(|e| TransferError::io(&open.path, e))?;
        open.tracker.update(data);
        open.written += length;
        self.bytes_written += length;
        Ok(())
    }

    fn file_end(&mut self, checksum: &str, last_modified_ms: i64) -> Result<(), TransferError> {
        let Some(open) = self.open.take() else {
            return Err(ValidationError::sequence("file end without an open file").into());
        };
        if open.written != open.declared {
            return Err(ValidationError::new(
                ValidationKind::SizeMismatch,
                "file closed before its declared size was written",
            )
            .with("file", &open.id)
            .with("declared", open.declared)
            .with("received", open.written)
            .into());
        }
        let digest = open.tracker.finalize();
        if digest != checksum {
            return Err(ValidationError::checksum_mismatch(&open.id, checksum, &digest).into());
        }

        let modified = DateTime::from_timestamp_millis(last_modified_ms)
            .map(SystemTime::from)
            .ok_or_else(|| {
                ValidationError::new(ValidationKind::InvalidTimestamp, "timestamp out of range")
                    .with("file", &open.id)
                    .with("last_modified_ms", last_modified_ms)
            })?;
        open.file
            .set_modified(modified)
            .map_err(|e| TransferError::io(&open.path, e))?;
        open.file
            .sync_all()
            .map_err(|e| TransferError::io(&open.path, e))?;

        trace!(file = %open.id, bytes = open.written, "file closed");
        self.closed.insert(open.id, digest);
        Ok(())
    }
}

/// Validates and applies frames to a [`ReceiveState`].
#[derive(Debug, Clone, Copy)]
pub struct FrameAssembler {
    max_frame_size: u64,
    max_frame_blocks: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_size: u64, max_frame_blocks: usize) -> Self {
        Self {
            max_frame_size,
            max_frame_blocks,
        }
    }

    /// Applies every block of `frame` in order.
    ///
    /// `cancel` is sampled before each block; a block, once started, is
    /// always applied completely. Returns the number of file bytes written.
    pub fn apply(
        &self,
        state: &mut ReceiveState,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        frame
            .check_bounds(self.max_frame_size, self.max_frame_blocks)
            .map_err(|v| {
                ValidationError::new(ValidationKind::FrameBounds, v.to_string())
                    .with("frame", frame.id)
            })?;

        let mut cursor = 0usize;
        for (index, block) in frame.blocks.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(frame = %frame.id, block = index, "frame application cancelled");
                return Err(TransferError::Cancelled);
            }
            match block {
                Block::DirBegin { name } => state.dir_begin(name)?,
                Block::DirEnd => state.dir_end()?,
                Block::FileBegin { name, size } => state.file_begin(name, *size)?,
                Block::FileData { offset, length } => {
                    let data = usize::try_from(*length)
                        .ok()
                        .and_then(|len| cursor.checked_add(len))
                        .and_then(|end| frame.payload.get(cursor..end))
                        .ok_or_else(|| {
                            ValidationError::new(
                                ValidationKind::FrameBounds,
                                "block references bytes past the payload",
                            )
                            .with("frame", frame.id)
                            .with("block", index)
                        })?;
                    state.file_data(*offset, data)?;
                    cursor += data.len();
                }
                Block::FileEnd {
                    checksum,
                    last_modified_ms,
                } => state.file_end(checksum, *last_modified_ms)?,
            }
        }
        Ok(cursor as u64)
    }
}
