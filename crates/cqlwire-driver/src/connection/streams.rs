//! Stream id free-list and the stream to pending-operation table

use cqlwire_frame::{Frame, MAX_STREAMS};

use crate::error::ConnectionError;
use crate::pending::Completer;

pub(crate) type ResponseCompleter = Completer<Frame, ConnectionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocError {
    Exhausted,
    Closed,
}

/// Free-list of stream ids plus the operation waiting on each live id.
///
/// Both halves live under one lock so allocation and release are atomic
/// with respect to each other.
#[derive(Debug)]
pub(crate) struct StreamTable {
    free: Vec<i16>,
    slots: Vec<Option<ResponseCompleter>>,
    closed: bool,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        Self {
            // Popped from the back, so ids are handed out lowest first
            free: (0..MAX_STREAMS as i16).rev().collect(),
            slots: (0..MAX_STREAMS).map(|_| None).collect(),
            closed: false,
        }
    }

    pub(crate) fn allocate(&mut self, completer: ResponseCompleter) -> Result<i16, AllocError> {
        if self.closed {
            return Err(AllocError::Closed);
        }
        let id = self.free.pop().ok_or(AllocError::Exhausted)?;
        self.slots[id as usize] = Some(completer);
        Ok(id)
    }

    /// Take the operation for `id` and return the id to the free-list.
    /// Unknown or already released ids yield `None`.
    pub(crate) fn release(&mut self, id: i16) -> Option<ResponseCompleter> {
        let slot = self.slots.get_mut(usize::try_from(id).ok()?)?;
        let completer = slot.take()?;
        if !self.closed {
            self.free.push(id);
        }
        Some(completer)
    }

    /// Refuse further allocations and hand back every live operation
    pub(crate) fn close(&mut self) -> Vec<ResponseCompleter> {
        self.closed = true;
        self.free.clear();
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pending::pending_operation;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn completer() -> ResponseCompleter {
        pending_operation().0
    }

    #[test]
    fn test_ids_unique_until_exhausted() {
        let mut table = StreamTable::new();
        let mut seen = HashSet::new();
        for _ in 0..MAX_STREAMS {
            assert!(seen.insert(table.allocate(completer()).unwrap()));
        }
        assert_eq!(table.allocate(completer()), Err(AllocError::Exhausted));
        assert_eq!(table.in_flight(), MAX_STREAMS);
        assert!(seen.iter().all(|id| (0..128).contains(id)));
    }

    #[test]
    fn test_release_once() {
        let mut table = StreamTable::new();
        let id = table.allocate(completer()).unwrap();
        assert_eq!(id, 0);
        assert!(table.release(id).is_some());
        assert!(table.release(id).is_none());
        assert_eq!(table.available(), MAX_STREAMS);
        assert!(table.release(-1).is_none());
        assert!(table.release(500).is_none());
    }

    #[test]
    fn test_released_id_is_reused() {
        let mut table = StreamTable::new();
        let first = table.allocate(completer()).unwrap();
        let _second = table.allocate(completer()).unwrap();
        table.release(first);
        assert_eq!(table.allocate(completer()).unwrap(), first);
    }

    #[test]
    fn test_close_drains_everything() {
        let mut table = StreamTable::new();
        for _ in 0..5 {
            table.allocate(completer()).unwrap();
        }
        assert_eq!(table.close().len(), 5);
        assert_eq!(table.in_flight(), 0);
        assert_eq!(table.allocate(completer()), Err(AllocError::Closed));
    }

    proptest! {
        #[test]
        fn test_live_ids_never_collide(
            ops in prop::collection::vec((prop::bool::weighted(0.7), any::<u8>()), 1..600)
        ) {
            let mut table = StreamTable::new();
            let mut live: Vec<i16> = Vec::new();
            for (allocate, pick) in ops {
                if allocate {
                    match table.allocate(completer()) {
                        Ok(id) => {
                            prop_assert!((0..128).contains(&id));
                            prop_assert!(!live.contains(&id));
                            live.push(id);
                        }
                        Err(error) => {
                            prop_assert_eq!(error, AllocError::Exhausted);
                            prop_assert_eq!(live.len(), MAX_STREAMS);
                        }
                    }
                } else if !live.is_empty() {
                    let id = live.swap_remove(usize::from(pick) % live.len());
                    prop_assert!(table.release(id).is_some());
                }
                prop_assert_eq!(table.in_flight(), live.len());
                prop_assert_eq!(table.available(), MAX_STREAMS - live.len());
            }
        }
    }
}
