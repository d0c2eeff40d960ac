//! Two-lane bounded work queue feeding one operation thread.
//!
//! Each lane is a lock-free `SegQueue` with an atomic length gate enforcing
//! its capacity, so offering never blocks and a full lane rejects instead.
//! The consumer always drains the urgent lane before the normal lane.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::Unparker;

use super::task::Work;

/// Which lane of a queue an item travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Normal,
    Urgent,
}

impl Lane {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct BoundedLane {
    items: SegQueue<Work>,
    len: AtomicUsize,
    capacity: usize,
}

impl BoundedLane {
    fn new(capacity: usize) -> Self {
        Self {
            items: SegQueue::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    fn offer(&self, work: Work) -> Result<(), Work> {
        if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(work);
        }
        self.items.push(work);
        Ok(())
    }

    fn poll(&self) -> Option<Work> {
        let work = self.items.pop()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(work)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Queue owned by exactly one consuming thread, fed by any number of
/// producers.
pub(crate) struct OperationQueue {
    normal: BoundedLane,
    urgent: BoundedLane,
    unparker: Unparker,
}

impl OperationQueue {
    pub(crate) fn new(capacity: usize, urgent_capacity: usize, unparker: Unparker) -> Self {
        Self {
            normal: BoundedLane::new(capacity),
            urgent: BoundedLane::new(urgent_capacity),
            unparker,
        }
    }

    /// Adds `work` to the lane matching its urgency and wakes the consumer.
    ///
    /// On a full lane the work is handed back together with the lane.
    pub(crate) fn offer(&self, work: Work) -> Result<(), (Lane, Work)> {
        let lane = if work.is_urgent() {
            Lane::Urgent
        } else {
            Lane::Normal
        };
        let accepted = match lane {
            Lane::Urgent => self.urgent.offer(work),
            Lane::Normal => self.normal.offer(work),
        };
        match accepted {
            Ok(()) => {
                self.unparker.unpark();
                Ok(())
            }
            Err(work) => Err((lane, work)),
        }
    }

    /// Takes the next item, urgent first.
    pub(crate) fn poll(&self) -> Option<Work> {
        self.urgent.poll().or_else(|| self.normal.poll())
    }

    /// Removes everything still queued, urgent items first.
    pub(crate) fn drain(&self) -> Vec<Work> {
        std::iter::from_fn(|| self.poll()).collect()
    }

    pub(crate) fn wake(&self) {
        self.unparker.unpark();
    }

    /// Items in the normal lane.
    pub(crate) fn normal_len(&self) -> usize {
        self.normal.len()
    }

    /// Items in the urgent lane.
    pub(crate) fn urgent_len(&self) -> usize {
        self.urgent.len()
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("normal", &self.normal_len())
            .field("urgent", &self.urgent_len())
            .finish_non_exhaustive()
    }
}
