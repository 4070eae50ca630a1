//! Registry of in-flight requests awaiting a reply.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use ezrpc_protocol::{Frames, RequestId};

use crate::error::{ClientError, ClientResult};

/// Draws to find an id that is not already pending before giving up.
pub const MAX_ID_ATTEMPTS: usize = 64;

/// Source of correlation ids.
pub trait IdSource: Send + Sync {
    /// Returns a candidate id; the registry rejects ids already in flight.
    fn next_id(&self) -> RequestId;
}

/// Random [`RequestId::WIDTH`]-byte ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&self) -> RequestId {
        RequestId::random()
    }
}

#[derive(Default)]
struct PendingState {
    slots: HashMap<RequestId, oneshot::Sender<Frames>>,
    terminated: bool,
}

/// Map from request id to the single-use slot its reply is delivered into.
///
/// Shared between the requesting tasks and the listener task.
#[derive(Default)]
pub(crate) struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    fn state(&self) -> MutexGuard<'_, PendingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a slot under a fresh id that collides with no pending one.
    pub(crate) fn register(
        &self,
        ids: &dyn IdSource,
    ) -> ClientResult<(RequestId, oneshot::Receiver<Frames>)> {
        let mut state = self.state();
        if state.terminated {
            return Err(ClientError::ListenerTerminated);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            if let Entry::Vacant(slot) = state.slots.entry(ids.next_id()) {
                let request_id = slot.key().clone();
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                return Ok((request_id, rx));
            }
        }

        Err(ClientError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Delivers `body` to the slot of `request_id`, removing it.
    ///
    /// Returns false when no slot exists (already answered or timed out) or
    /// its requester has gone away.
    pub(crate) fn fulfill(&self, request_id: &RequestId, body: Frames) -> bool {
        let slot = self.state().slots.remove(request_id);
        match slot {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }

    /// Drops the slot of `request_id`, if still present.
    pub(crate) fn remove(&self, request_id: &RequestId) -> bool {
        self.state().slots.remove(request_id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.state().slots.len()
    }

    /// Fails every pending request and refuses new ones.
    ///
    /// Returns how many requests were pending.
    pub(crate) fn terminate(&self) -> usize {
        let mut state = self.state();
        state.terminated = true;
        let failed = state.slots.len();
        state.slots.clear();
        failed
    }
}

/// Removes a request's slot when the request future finishes or is dropped.
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    request_id: RequestId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingRequests, request_id: RequestId) -> Self {
        Self {
            pending,
            request_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::bytes::Bytes;

    struct FixedIds {
        ids: Vec<u8>,
        next: AtomicUsize,
    }

    impl FixedIds {
        fn new(ids: &[u8]) -> Self {
            Self {
                ids: ids.to_vec(),
                next: AtomicUsize::new(0),
            }
        }
    }

    impl IdSource for FixedIds {
        fn next_id(&self) -> RequestId {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            RequestId::new(vec![self.ids[n % self.ids.len()]])
        }
    }

    #[test]
    fn register_skips_ids_in_flight() {
        let pending = PendingRequests::default();
        let ids = FixedIds::new(&[7, 7, 8]);

        let (first, _rx1) = pending.register(&ids).unwrap();
        let (second, _rx2) = pending.register(&ids).unwrap();

        assert_eq!(first.as_bytes(), &[7]);
        assert_eq!(second.as_bytes(), &[8]);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn register_gives_up_when_space_exhausted() {
        let pending = PendingRequests::default();
        let ids = FixedIds::new(&[1]);

        let (_id, _rx) = pending.register(&ids).unwrap();
        assert!(matches!(
            pending.register(&ids),
            Err(ClientError::IdSpaceExhausted {
                attempts: MAX_ID_ATTEMPTS
            })
        ));
    }

    #[test]
    fn fulfill_delivers_once() {
        let pending = PendingRequests::default();
        let (id, mut rx) = pending.register(&RandomIds).unwrap();

        assert!(pending.fulfill(&id, vec![Bytes::from("first")]));
        assert!(!pending.fulfill(&id, vec![Bytes::from("second")]));

        assert_eq!(rx.try_recv().unwrap(), vec![Bytes::from("first")]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn fulfill_after_requester_left_reports_failure() {
        let pending = PendingRequests::default();
        let (id, rx) = pending.register(&RandomIds).unwrap();
        drop(rx);

        assert!(!pending.fulfill(&id, vec![Bytes::from("late")]));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn guard_removes_slot_on_drop() {
        let pending = PendingRequests::default();
        let (id, _rx) = pending.register(&RandomIds).unwrap();

        {
            let _guard = PendingGuard::new(&pending, id.clone());
            assert_eq!(pending.len(), 1);
        }

        assert_eq!(pending.len(), 0);
        assert!(!pending.remove(&id));
    }

    #[test]
    fn terminate_fails_pending_and_future_requests() {
        let pending = PendingRequests::default();
        let (_id, mut rx) = pending.register(&RandomIds).unwrap();

        assert_eq!(pending.terminate(), 1);

        assert!(rx.try_recv().is_err());
        assert!(matches!(
            pending.register(&RandomIds),
            Err(ClientError::ListenerTerminated)
        ));
    }
}
