//! Transfer identifier generation.
//!
//! Generators are injected into the services that need them, so tests can
//! use predictable ids.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces unique, opaque transfer identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// `prefix-N` identifiers from a counter starting at 1.
#[derive(Debug)]
pub struct MonotonicIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl MonotonicIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for MonotonicIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.prefix)
    }
}
