//! Ends: producers and consumers attached to edges.

use crate::edge::{EdgeHandle, Placement};
use crate::notify::Notify;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Number of priority classes. Class `PRIO_NR - 1` is served first.
pub const PRIO_NR: usize = 8;

/// Stable reference to an ends in the queue arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndsId {
    pub(crate) key: usize,
    pub(crate) serial: u32,
}

impl EndsId {
    pub fn serial(&self) -> u32 {
        self.serial
    }
}

impl fmt::Display for EndsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ends({})", self.serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndsState {
    Open,
    /// Disposal started; no new edges are accepted
    Dying,
    Dead,
}

/// Edge membership lists of one ends.
#[derive(Debug)]
pub(crate) struct EndsLists {
    /// Incoming edges with ready frames, one queue per priority class
    pub active: [VecDeque<EdgeHandle>; PRIO_NR],
    /// Incoming edges without ready frames
    pub idle: VecDeque<EdgeHandle>,
    /// Edges this ends produces into
    pub inlist: Vec<EdgeHandle>,
    /// Edges this ends consumes from
    pub outlist: Vec<EdgeHandle>,
    pub state: EndsState,
}

impl EndsLists {
    fn new() -> Self {
        Self {
            active: Default::default(),
            idle: VecDeque::new(),
            inlist: Vec::new(),
            outlist: Vec::new(),
            state: EndsState::Open,
        }
    }

    fn placement_list(&mut self, placement: Placement) -> Option<&mut VecDeque<EdgeHandle>> {
        match placement {
            Placement::Unlinked => None,
            Placement::Idle => Some(&mut self.idle),
            Placement::Active(prio) => self.active.get_mut(usize::from(prio)),
        }
    }

    /// Removes `edge` from the list `placement` names.
    pub fn unplace(&mut self, edge: EdgeHandle, placement: Placement) {
        if let Some(list) = self.placement_list(placement) {
            if let Some(pos) = list.iter().position(|h| *h == edge) {
                list.remove(pos);
            }
        }
    }

    /// Moves `edge` from `from` to the tail of `to`.
    pub fn move_edge(&mut self, edge: EdgeHandle, from: Placement, to: Placement) {
        self.unplace(edge, from);
        if let Some(list) = self.placement_list(to) {
            list.push_back(edge);
        }
    }

    /// Drops `edge` from every list of this ends.
    pub fn unlink(&mut self, edge: EdgeHandle, placement: Placement) {
        self.unplace(edge, placement);
        self.inlist.retain(|h| *h != edge);
        self.outlist.retain(|h| *h != edge);
    }

    pub fn is_detached(&self) -> bool {
        self.inlist.is_empty() && self.outlist.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().map(VecDeque::len).sum()
    }
}

pub(crate) struct Ends {
    pub id: EndsId,
    pub name: String,
    pub lists: Mutex<EndsLists>,
    notify: Option<Arc<dyn Notify>>,
}

impl Ends {
    pub fn new(id: EndsId, name: String, notify: Option<Arc<dyn Notify>>) -> Self {
        Self {
            id,
            name,
            lists: Mutex::new(EndsLists::new()),
            notify,
        }
    }

    pub fn listener(&self) -> Option<&Arc<dyn Notify>> {
        self.notify.as_ref()
    }
}

impl fmt::Debug for Ends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ends")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lists", &*self.lists.lock())
            .finish()
    }
}

/// Point-in-time view of an ends' membership lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndsSnapshot {
    pub id: EndsId,
    pub name: String,
    pub state: EndsState,
    pub inlist: Vec<EdgeHandle>,
    pub outlist: Vec<EdgeHandle>,
    pub idle: Vec<EdgeHandle>,
    /// Active edges per priority class, index = class
    pub active: Vec<Vec<EdgeHandle>>,
}

impl EndsSnapshot {
    pub(crate) fn capture(ends: &Ends) -> Self {
        let lists = ends.lists.lock();
        Self {
            id: ends.id,
            name: ends.name.clone(),
            state: lists.state,
            inlist: lists.inlist.clone(),
            outlist: lists.outlist.clone(),
            idle: lists.idle.iter().copied().collect(),
            active: lists
                .active
                .iter()
                .map(|class| class.iter().copied().collect())
                .collect(),
        }
    }

    /// True if `edge` appears in any list of this ends.
    pub fn references(&self, edge: EdgeHandle) -> bool {
        self.inlist.contains(&edge)
            || self.outlist.contains(&edge)
            || self.idle.contains(&edge)
            || self.active.iter().any(|class| class.contains(&edge))
    }
}

#[cfg(test)]
pub(crate) fn test_ends_id(serial: u32) -> EndsId {
    EndsId {
        key: serial as usize,
        serial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::test_handle;

    #[test]
    fn test_move_between_lists() {
        let mut lists = EndsLists::new();
        let edge = test_handle(1);
        lists.idle.push_back(edge);
        lists.outlist.push(edge);

        lists.move_edge(edge, Placement::Idle, Placement::Active(3));
        assert!(lists.idle.is_empty());
        assert_eq!(lists.active[3].front(), Some(&edge));
        assert_eq!(lists.active_count(), 1);

        lists.unlink(edge, Placement::Active(3));
        assert_eq!(lists.active_count(), 0);
        assert!(lists.is_detached());
    }

    #[test]
    fn test_snapshot_references() {
        let ends = Ends::new(test_ends_id(0), "can0".to_string(), None);
        let edge = test_handle(5);
        ends.lists.lock().inlist.push(edge);

        let snap = EndsSnapshot::capture(&ends);
        assert!(snap.references(edge));
        assert!(!snap.references(test_handle(6)));
        assert_eq!(snap.active.len(), PRIO_NR);
        assert_eq!(snap.state, EndsState::Open);
    }
}
