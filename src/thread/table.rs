//! Arena of thread control blocks.
//!
//! Queues link threads by slot index, never by pointer, so the arena can
//! grow without invalidating any queue.
//!
//! The arena lives on the global heap, not in the scheduler's
//! [`Allocator`](crate::mem::Allocator); growth is fallible and reported as
//! [`SpawnError::OutOfMemory`].

extern crate alloc;
use alloc::vec::Vec;

use super::{Tcb, ThreadId};
use crate::arch::Arch;
use crate::errors::SpawnError;

/// Index of a TCB in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Slot(pub(crate) u32);

impl Slot {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

struct Entry<A: Arch> {
    generation: u32,
    tcb: Option<Tcb<A>>,
}

pub(crate) struct ThreadTable<A: Arch> {
    entries: Vec<Entry<A>>,
    /// Vacant slots, reused most-recently-freed first.
    free: Vec<u32>,
    live: usize,
}

impl<A: Arch> ThreadTable<A> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store `tcb` and assign its id.
    ///
    /// On failure the control block is handed back so the caller can release
    /// what it owns.
    pub(crate) fn try_insert(&mut self, mut tcb: Tcb<A>) -> Result<ThreadId, (SpawnError, Tcb<A>)> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let Ok(slot) = u32::try_from(self.entries.len()) else {
                    return Err((SpawnError::TooManyThreads, tcb));
                };
                // Keep room in the free list for every slot, so removal
                // never allocates.
                let spare = self.entries.len() + 1 - self.free.len();
                if self.entries.try_reserve(1).is_err() || self.free.try_reserve(spare).is_err() {
                    return Err((SpawnError::OutOfMemory, tcb));
                }
                self.entries.push(Entry {
                    generation: 1,
                    tcb: None,
                });
                slot
            }
        };
        let entry = &mut self.entries[slot as usize];
        let id = ThreadId::from_parts(slot, entry.generation);
        tcb.id = id;
        entry.tcb = Some(tcb);
        self.live += 1;
        Ok(id)
    }

    /// Take the control block out; its id becomes stale.
    pub(crate) fn remove(&mut self, slot: Slot) -> Option<Tcb<A>> {
        let entry = self.entries.get_mut(slot.index())?;
        let tcb = entry.tcb.take()?;
        entry.generation = match entry.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.free.push(slot.0);
        self.live -= 1;
        Some(tcb)
    }

    /// Look up a live thread, rejecting stale ids.
    pub(crate) fn get(&self, id: ThreadId) -> Option<&Tcb<A>> {
        self.entries
            .get(id.slot().index())?
            .tcb
            .as_ref()
            .filter(|t| t.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Tcb<A>> {
        self.entries
            .get_mut(id.slot().index())?
            .tcb
            .as_mut()
            .filter(|t| t.id == id)
    }

    /// The control block in `slot`, which must be occupied.
    pub(crate) fn tcb(&self, slot: Slot) -> &Tcb<A> {
        match self.entries.get(slot.index()).and_then(|e| e.tcb.as_ref()) {
            Some(tcb) => tcb,
            None => panic!("scheduler invariant violated: slot {} is vacant", slot.0),
        }
    }

    pub(crate) fn tcb_mut(&mut self, slot: Slot) -> &mut Tcb<A> {
        match self.entries.get_mut(slot.index()).and_then(|e| e.tcb.as_mut()) {
            Some(tcb) => tcb,
            None => panic!("scheduler invariant violated: slot {} is vacant", slot.0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Tcb<A>> + '_ {
        self.entries.iter().filter_map(|e| e.tcb.as_ref())
    }

    /// Remove every control block.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Tcb<A>> + '_ {
        self.free.clear();
        self.live = 0;
        self.entries.drain(..).filter_map(|e| e.tcb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::DefaultArch;
    use crate::thread::ThreadKind;

    fn tcb() -> Tcb<DefaultArch> {
        Tcb::new(ThreadKind::Worker, None)
    }

    #[test]
    fn test_insert_assigns_ids() {
        let mut table = ThreadTable::<DefaultArch>::new();
        let a = table.try_insert(tcb()).ok().unwrap();
        let b = table.try_insert(tcb()).ok().unwrap();
        assert_eq!(a, ThreadId::from_parts(0, 1));
        assert_eq!(b, ThreadId::from_parts(1, 1));
        assert_eq!(table.get(a).unwrap().id, a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_reused_slot_gets_new_generation() {
        let mut table = ThreadTable::<DefaultArch>::new();
        let a = table.try_insert(tcb()).ok().unwrap();
        assert!(table.remove(a.slot()).is_some());
        assert!(table.remove(a.slot()).is_none());
        assert!(table.get(a).is_none());

        let b = table.try_insert(tcb()).ok().unwrap();
        assert_eq!(b.slot(), a.slot());
        assert_eq!(b.generation(), 2);
        assert!(table.get(a).is_none());
        assert!(table.get_mut(b).is_some());
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = ThreadTable::<DefaultArch>::new();
        for _ in 0..4 {
            let _ = table.try_insert(tcb());
        }
        assert_eq!(table.drain().count(), 4);
        assert_eq!(table.len(), 0);
        assert_eq!(table.iter().count(), 0);
    }
}
