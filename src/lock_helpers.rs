//! Lock acquisition helpers.
//!
//! parking_lot locks never poison, so the macros are plain wrappers. They
//! mark every place the queue takes a lock, which keeps the lock order
//! (arena read, then ends, then edge link, then FIFO) easy to audit.

use crate::ends::{Ends, EndsLists};
use parking_lot::MutexGuard;

/// Acquire a parking_lot::Mutex lock
#[macro_export]
macro_rules! lock_mutex {
    ($mutex:expr) => {{
        $mutex.lock()
    }};
}

/// Acquire a parking_lot::RwLock read lock
#[macro_export]
macro_rules! lock_read {
    ($rwlock:expr) => {{
        $rwlock.read()
    }};
}

/// Acquire a parking_lot::RwLock write lock
#[macro_export]
macro_rules! lock_write {
    ($rwlock:expr) => {{
        $rwlock.write()
    }};
}

/// List guards of the two ends of an edge.
///
/// When both sides are the same ends only one lock is taken.
pub(crate) struct EndsPair<'a> {
    input: MutexGuard<'a, EndsLists>,
    output: Option<MutexGuard<'a, EndsLists>>,
}

impl EndsPair<'_> {
    pub fn input(&mut self) -> &mut EndsLists {
        &mut self.input
    }

    pub fn output(&mut self) -> &mut EndsLists {
        match self.output.as_mut() {
            Some(output) => output,
            None => &mut self.input,
        }
    }
}

/// Locks the lists of two ends, lower arena key first.
pub(crate) fn lock_ends_pair<'a>(input: &'a Ends, output: &'a Ends) -> EndsPair<'a> {
    if input.id == output.id {
        return EndsPair {
            input: lock_mutex!(input.lists),
            output: None,
        };
    }
    if input.id.key < output.id.key {
        let input = lock_mutex!(input.lists);
        let output = lock_mutex!(output.lists);
        EndsPair {
            input,
            output: Some(output),
        }
    } else {
        let output = lock_mutex!(output.lists);
        let input = lock_mutex!(input.lists);
        EndsPair {
            input,
            output: Some(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::test_handle;
    use crate::ends::test_ends_id;

    #[test]
    fn test_pair_on_same_ends_shares_guard() {
        let ends = Ends::new(test_ends_id(2), "loop".to_string(), None);
        let mut pair = lock_ends_pair(&ends, &ends);
        pair.input().inlist.push(test_handle(1));
        pair.output().outlist.push(test_handle(1));
        drop(pair);

        let lists = lock_mutex!(ends.lists);
        assert_eq!(lists.inlist.len(), 1);
        assert_eq!(lists.outlist.len(), 1);
    }

    #[test]
    fn test_pair_orders_by_key() {
        let a = Ends::new(test_ends_id(1), "a".to_string(), None);
        let b = Ends::new(test_ends_id(0), "b".to_string(), None);
        let mut pair = lock_ends_pair(&a, &b);
        pair.input().inlist.push(test_handle(9));
        pair.output().outlist.push(test_handle(9));
        drop(pair);
        assert_eq!(lock_mutex!(a.lists).inlist, vec![test_handle(9)]);
        assert_eq!(lock_mutex!(b.lists).outlist, vec![test_handle(9)]);
    }
}
