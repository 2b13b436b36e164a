//! Round-robin rotation over the configured backends
//!
//! Rotation is purely positional: every configured port stays in the cycle
//! whether or not its process is running or logged in. A dead backend shows
//! up as a connection failure on the requests that land on it.

use crate::registry::BackendRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// One rotation target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub port: u16,
}

/// A selected target plus the rotation slot it was assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Pre-advance cursor value, unique per call
    pub slot: usize,
    pub target: Target,
}

/// Round-robin selector
#[derive(Debug)]
pub struct RoundRobin {
    targets: Vec<Target>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Rotation over every backend in the registry, in registry order
    pub fn from_registry(registry: &BackendRegistry) -> Self {
        Self::new(
            registry
                .iter()
                .map(|b| Target {
                    id: b.id.clone(),
                    port: b.port,
                })
                .collect(),
        )
    }

    /// Select the next target and advance the cursor in one atomic step
    pub fn next(&self) -> Option<Selection> {
        if self.targets.is_empty() {
            return None;
        }

        let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
        let target = &self.targets[slot % self.targets.len()];

        debug!(slot, id = %target.id, port = target.port, "Selected backend");

        Some(Selection {
            slot,
            target: target.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
