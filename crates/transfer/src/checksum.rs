use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut tracker = ChecksumTracker::new();
    tracker.update(data);
    tracker.finalize()
}

// ---------------------------------------------------------------------------
// ChecksumTracker
// ---------------------------------------------------------------------------

/// Incremental content digest for one file.
///
/// Used by the sender while bytes are read into frames and by the receiver
/// while bytes are written, so both sides compute the digest in a single
/// pass.
#[derive(Clone, Default)]
pub struct ChecksumTracker {
    hasher: Sha256,
    bytes: u64,
}

impl ChecksumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next run of file bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consumes the tracker and returns the lowercase hex digest.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl std::fmt::Debug for ChecksumTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumTracker")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}
