//! Deferred release of GPU resources.
//!
//! A replaced buffer or pipeline may still be read by work the GPU has not
//! finished. Instead of destroying it, callers retire it together with the
//! fence value of the last submission that can reference it; the resource is
//! released once the frame-fence collaborator reports that value complete.

use std::collections::VecDeque;

use crate::error::Result;
use crate::handle::{BufferHandle, FenceValue, PipelineHandle};

/// A resource waiting for its fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Retired {
    Buffer(BufferHandle),
    Pipeline(PipelineHandle),
}

#[derive(Debug)]
struct PendingRelease {
    resource: Retired,
    retire_after: FenceValue,
}

/// Queue of resources released once a fence value completes.
#[derive(Debug, Default)]
pub struct RetireQueue {
    pending: VecDeque<PendingRelease>,
}

impl RetireQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `resource` for release once `retire_after` has completed.
    ///
    /// Fence values are clamped to be non-decreasing so only the front of the
    /// queue can ever be ready.
    pub fn retire(&mut self, resource: Retired, retire_after: FenceValue) {
        let retire_after = self
            .pending
            .back()
            .map_or(retire_after, |last| last.retire_after.max(retire_after));
        self.pending.push_back(PendingRelease {
            resource,
            retire_after,
        });
    }

    /// Release every resource whose fence value is at or below `completed`.
    ///
    /// Returns the number released. A failing release does not stop the
    /// sweep: the failed resource is dropped from the queue and the first
    /// error is returned once every ready resource has been visited.
    pub fn release_completed<F>(&mut self, completed: FenceValue, mut release: F) -> Result<usize>
    where
        F: FnMut(Retired) -> Result<()>,
    {
        let ready = self
            .pending
            .iter()
            .take_while(|pending| pending.retire_after <= completed)
            .count();
        let batch: Vec<_> = self.pending.drain(..ready).collect();
        sweep(batch, &mut release)
    }

    /// Release everything regardless of fence state.
    ///
    /// Only valid once the device is idle.
    pub fn flush<F>(&mut self, mut release: F) -> Result<usize>
    where
        F: FnMut(Retired) -> Result<()>,
    {
        let batch: Vec<_> = self.pending.drain(..).collect();
        sweep(batch, &mut release)
    }

    /// Number of resources still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `resource` is waiting for release.
    pub fn is_pending(&self, resource: Retired) -> bool {
        self.pending.iter().any(|pending| pending.resource == resource)
    }
}

fn sweep<F>(batch: Vec<PendingRelease>, release: &mut F) -> Result<usize>
where
    F: FnMut(Retired) -> Result<()>,
{
    let mut released = 0;
    let mut first_error = None;
    for pending in batch {
        match release(pending.resource) {
            Ok(()) => released += 1,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(released), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::handle::SlotHandle;

    fn buffer(index: u32) -> Retired {
        Retired::Buffer(BufferHandle::from_parts(index, 0))
    }

    #[test]
    fn releases_only_after_fence() {
        let mut queue = RetireQueue::new();
        queue.retire(buffer(0), 3);
        queue.retire(buffer(1), 5);

        let mut released = Vec::new();
        assert_eq!(queue.release_completed(2, |r| { released.push(r); Ok(()) }).unwrap(), 0);
        assert_eq!(queue.release_completed(3, |r| { released.push(r); Ok(()) }).unwrap(), 1);
        assert_eq!(released, vec![buffer(0)]);
        assert!(queue.is_pending(buffer(1)));

        assert_eq!(queue.release_completed(9, |r| { released.push(r); Ok(()) }).unwrap(), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn fence_values_are_clamped_monotonic() {
        let mut queue = RetireQueue::new();
        queue.retire(buffer(0), 10);
        queue.retire(buffer(1), 4);

        // The later entry cannot overtake the earlier one.
        assert_eq!(queue.release_completed(4, |_| Ok(())).unwrap(), 0);
        assert_eq!(queue.release_completed(10, |_| Ok(())).unwrap(), 2);
    }

    #[test]
    fn failing_release_keeps_sweeping() {
        let mut queue = RetireQueue::new();
        queue.retire(buffer(0), 1);
        queue.retire(buffer(1), 1);
        queue.retire(buffer(2), 5);

        let mut released = Vec::new();
        let result = queue.release_completed(1, |r| {
            if r == buffer(0) {
                return Err(Error::Device("lost".to_string()));
            }
            released.push(r);
            Ok(())
        });
        assert!(matches!(result, Err(Error::Device(_))));
        assert_eq!(released, vec![buffer(1)]);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.is_pending(buffer(2)));
    }

    #[test]
    fn flush_visits_entries_after_a_failure() {
        let mut queue = RetireQueue::new();
        queue.retire(buffer(0), 1);
        queue.retire(buffer(1), 2);
        queue.retire(Retired::Pipeline(PipelineHandle::from_parts(0, 0)), 3);

        let mut released = 0;
        let result = queue.flush(|r| {
            if r == buffer(0) {
                return Err(Error::StaleHandle("gone".to_string()));
            }
            released += 1;
            Ok(())
        });
        assert!(matches!(result, Err(Error::StaleHandle(_))));
        assert_eq!(released, 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn flush_releases_everything() {
        let mut queue = RetireQueue::new();
        queue.retire(buffer(0), 100);
        queue.retire(Retired::Pipeline(PipelineHandle::from_parts(0, 0)), 200);
        assert_eq!(queue.flush(|_| Ok(())).unwrap(), 2);
        assert_eq!(queue.pending_count(), 0);
    }
}
