//! Process-wide unique identifiers.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Random per-process prefix, drawn once on first use.
static PREFIX: OnceLock<u64> = OnceLock::new();

/// Counter for the sequence half of the identifier.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// A collision-free identifier.
///
/// The prefix is random per process and the sequence increments, so ids
/// from different processes don't collide and ids from one process never
/// repeat. Used to match remote-call replies with their requests, and to
/// name short-lived channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId {
    prefix: u64,
    seq: u64,
}

impl CallId {
    /// Returns a fresh identifier.
    pub fn next() -> Self {
        let prefix = *PREFIX.get_or_init(rand::random::<u64>);
        Self {
            prefix,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{}", self.prefix, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_never_repeat_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| (0..1000).map(|_| CallId::next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_ids_share_the_process_prefix() {
        let a = CallId::next().to_string();
        let b = CallId::next().to_string();
        assert_eq!(a.split('-').next(), b.split('-').next());
        assert_ne!(a, b);
    }
}
