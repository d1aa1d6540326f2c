//! Source tree consumed by the frame builder.
//!
//! A transfer moves an ordered list of top-level [`SourceNode`]s. File
//! contents are read through [`FileSource::read_at`], which is positional
//! so that building frame N twice reads the same bytes.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::TransferError;

/// Positional read access to one file's content.
pub trait FileSource: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; 0 means end of content.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Frees any resource held between reads. Called once every byte of
    /// the file has been read; a later `read_at` must still work.
    fn release(&self) {}
}

/// In-memory file content.
#[derive(Debug, Clone)]
pub struct MemorySource(Arc<Vec<u8>>);

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(data.into()))
    }
}

impl FileSource for MemorySource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.0.as_slice();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}

/// File content read from disk.
///
/// The handle is opened on the first read and kept until
/// [`release`](FileSource::release), so only the file currently being
/// enqueued holds a descriptor.
pub struct FsSource {
    path: PathBuf,
    handle: Mutex<Option<File>>,
}

impl FsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` while a descriptor is held.
    pub fn is_open(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl FileSource for FsSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(File::open(&self.path)?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(0);
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn release(&self) {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// A file to transfer.
#[derive(Clone)]
pub struct SourceFile {
    pub name: String,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub last_modified_ms: i64,
    pub source: Arc<dyn FileSource>,
}

impl SourceFile {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        last_modified_ms: i64,
        source: Arc<dyn FileSource>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            last_modified_ms,
            source,
        }
    }

    /// Convenience constructor for in-memory content.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>, last_modified_ms: i64) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(name, size, last_modified_ms, Arc::new(MemorySource::new(data)))
    }
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("last_modified_ms", &self.last_modified_ms)
            .finish_non_exhaustive()
    }
}

/// A directory to transfer, with its children in transfer order.
#[derive(Debug, Clone)]
pub struct SourceDirectory {
    pub name: String,
    pub children: Vec<SourceNode>,
}

/// A node of the source tree.
#[derive(Debug, Clone)]
pub enum SourceNode {
    Directory(SourceDirectory),
    File(SourceFile),
}

impl SourceNode {
    pub fn dir(name: impl Into<String>, children: Vec<SourceNode>) -> Self {
        SourceNode::Directory(SourceDirectory {
            name: name.into(),
            children,
        })
    }

    pub fn file(name: impl Into<String>, data: impl Into<Vec<u8>>, last_modified_ms: i64) -> Self {
        SourceNode::File(SourceFile::from_bytes(name, data, last_modified_ms))
    }

    pub fn name(&self) -> &str {
        match self {
            SourceNode::Directory(d) => &d.name,
            SourceNode::File(f) => &f.name,
        }
    }

    /// Children of a directory; empty for files.
    pub fn children(&self) -> &[SourceNode] {
        match self {
            SourceNode::Directory(d) => &d.children,
            SourceNode::File(_) => &[],
        }
    }
}

/// Total file bytes and file count under `nodes`.
pub fn tree_totals(nodes: &[SourceNode]) -> (u64, usize) {
    nodes.iter().fold((0, 0), |(bytes, files), node| match node {
        SourceNode::File(f) => (bytes + f.size, files + 1),
        SourceNode::Directory(d) => {
            let (b, n) = tree_totals(&d.children);
            (bytes + b, files + n)
        }
    })
}

/// Converts a filesystem timestamp to milliseconds since the Unix epoch.
pub fn system_time_to_ms(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_millis()
}

/// Scans a directory recursively and returns its children as source nodes.
///
/// Entries are sorted by name so repeated scans of an unchanged directory
/// produce identical frame sequences. Anything that is neither a regular
/// file nor a directory (sockets, symlinks) is skipped.
pub fn scan_dir(root: &Path) -> Result<Vec<SourceNode>, TransferError> {
    let mut entries = std::fs::read_dir(root)
        .map_err(|e| TransferError::io(root, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransferError::io(root, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| TransferError::io(&path, e))?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!(
                    path = %path.display(),
                    name = ?raw,
                    "skipping entry with non-UTF-8 name"
                );
                continue;
            }
        };

        if metadata.is_dir() {
            nodes.push(SourceNode::Directory(SourceDirectory {
                name,
                children: scan_dir(&path)?,
            }));
        } else if metadata.is_file() {
            let modified = metadata
                .modified()
                .map_err(|e| TransferError::io(&path, e))?;
            nodes.push(SourceNode::File(SourceFile::new(
                name,
                metadata.len(),
                system_time_to_ms(modified),
                Arc::new(FsSource::new(path)),
            )));
        } else {
            tracing::debug!(path = %path.display(), "skipping special file");
        }
    }

    Ok(nodes)
}
