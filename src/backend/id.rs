//! Identifier sources for broker client ids and connection names

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces identifiers that are unique for the lifetime of the process
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random identifiers backed by UUID v4
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdSource;

impl IdSource for UuidIdSource {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Deterministic `<prefix><n>` identifiers
#[derive(Debug)]
pub struct SequentialIdSource {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdSource for SequentialIdSource {
    fn next_id(&self) -> String {
        format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
    }
}
