//! Doubly linked lists threaded through the TCB arena by slot index.
//!
//! A TCB carries two links: `queue_link` for the run queue or a wait queue
//! (a thread is in at most one of those) and `timer_link` for the deadline
//! list. The list head only stores indices, so it holds no borrow of the
//! arena and every operation takes the table explicitly.

use core::marker::PhantomData;

use crate::arch::Arch;
use crate::thread::{Slot, Tcb, ThreadTable};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    prev: Option<Slot>,
    next: Option<Slot>,
}

/// Selects which link of a TCB a list uses.
pub(crate) trait Adapter {
    fn link<A: Arch>(tcb: &Tcb<A>) -> &Link;
    fn link_mut<A: Arch>(tcb: &mut Tcb<A>) -> &mut Link;
}

pub(crate) struct QueueLink;

impl Adapter for QueueLink {
    fn link<A: Arch>(tcb: &Tcb<A>) -> &Link {
        &tcb.queue_link
    }

    fn link_mut<A: Arch>(tcb: &mut Tcb<A>) -> &mut Link {
        &mut tcb.queue_link
    }
}

pub(crate) struct TimerLink;

impl Adapter for TimerLink {
    fn link<A: Arch>(tcb: &Tcb<A>) -> &Link {
        &tcb.timer_link
    }

    fn link_mut<A: Arch>(tcb: &mut Tcb<A>) -> &mut Link {
        &mut tcb.timer_link
    }
}

pub(crate) struct IndexList<L> {
    head: Option<Slot>,
    tail: Option<Slot>,
    len: usize,
    _link: PhantomData<L>,
}

/// Run queue and wait queues.
pub(crate) type ThreadList = IndexList<QueueLink>;
/// Threads sleeping with a deadline, earliest first.
pub(crate) type TimerList = IndexList<TimerLink>;

impl<L: Adapter> IndexList<L> {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _link: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn front(&self) -> Option<Slot> {
        self.head
    }

    pub(crate) fn back(&self) -> Option<Slot> {
        self.tail
    }

    pub(crate) fn next<A: Arch>(table: &ThreadTable<A>, slot: Slot) -> Option<Slot> {
        L::link(table.tcb(slot)).next
    }

    pub(crate) fn prev<A: Arch>(table: &ThreadTable<A>, slot: Slot) -> Option<Slot> {
        L::link(table.tcb(slot)).prev
    }

    pub(crate) fn push_back<A: Arch>(&mut self, table: &mut ThreadTable<A>, slot: Slot) {
        self.insert_after(table, self.tail, slot);
    }

    /// Link `slot` right after `after`, or at the front when `after` is `None`.
    pub(crate) fn insert_after<A: Arch>(
        &mut self,
        table: &mut ThreadTable<A>,
        after: Option<Slot>,
        slot: Slot,
    ) {
        debug_assert_eq!(*L::link(table.tcb(slot)), Link::default(), "slot {} already linked", slot.0);
        let next = match after {
            Some(prev) => L::link(table.tcb(prev)).next,
            None => self.head,
        };
        *L::link_mut(table.tcb_mut(slot)) = Link { prev: after, next };
        match after {
            Some(prev) => L::link_mut(table.tcb_mut(prev)).next = Some(slot),
            None => self.head = Some(slot),
        }
        match next {
            Some(next) => L::link_mut(table.tcb_mut(next)).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.len += 1;
    }

    pub(crate) fn pop_front<A: Arch>(&mut self, table: &mut ThreadTable<A>) -> Option<Slot> {
        let head = self.head?;
        self.remove(table, head);
        Some(head)
    }

    /// Unlink `slot`, which must be on this list.
    pub(crate) fn remove<A: Arch>(&mut self, table: &mut ThreadTable<A>, slot: Slot) {
        assert!(self.len > 0, "scheduler invariant violated: removal from empty list");
        let Link { prev, next } = core::mem::take(L::link_mut(table.tcb_mut(slot)));
        match prev {
            Some(prev) => L::link_mut(table.tcb_mut(prev)).next = next,
            None => {
                debug_assert_eq!(self.head, Some(slot));
                self.head = next;
            }
        }
        match next {
            Some(next) => L::link_mut(table.tcb_mut(next)).prev = prev,
            None => {
                debug_assert_eq!(self.tail, Some(slot));
                self.tail = prev;
            }
        }
        self.len -= 1;
    }

    pub(crate) fn iter<'a, A: Arch>(&self, table: &'a ThreadTable<A>) -> Iter<'a, A, L> {
        Iter {
            table,
            cursor: self.head,
            _link: PhantomData,
        }
    }

    pub(crate) fn contains<A: Arch>(&self, table: &ThreadTable<A>, slot: Slot) -> bool {
        self.iter(table).any(|s| s == slot)
    }

    /// Walk the list both ways and check the links agree with `len`.
    pub(crate) fn is_well_formed<A: Arch>(&self, table: &ThreadTable<A>) -> bool {
        let mut count = 0;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            if Self::prev(table, slot) != prev || count > self.len {
                return false;
            }
            count += 1;
            prev = Some(slot);
            cursor = Self::next(table, slot);
        }
        count == self.len && prev == self.tail
    }
}

impl<L: Adapter> Default for IndexList<L> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Iter<'a, A: Arch, L> {
    table: &'a ThreadTable<A>,
    cursor: Option<Slot>,
    _link: PhantomData<L>,
}

impl<A: Arch, L: Adapter> Iterator for Iter<'_, A, L> {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let slot = self.cursor?;
        self.cursor = L::link(self.table.tcb(slot)).next;
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::DefaultArch;
    use crate::thread::ThreadKind;
    use alloc::vec::Vec;

    fn table_with(n: usize) -> (ThreadTable<DefaultArch>, Vec<Slot>) {
        let mut table = ThreadTable::new();
        let slots = (0..n)
            .map(|_| table.try_insert(Tcb::new(ThreadKind::Worker, None)).ok().unwrap().slot())
            .collect();
        (table, slots)
    }

    #[test]
    fn test_fifo_order() {
        let (mut table, s) = table_with(3);
        let mut list = ThreadList::new();
        for &slot in &s {
            list.push_back(&mut table, slot);
        }
        assert_eq!(list.len(), 3);
        assert!(list.is_well_formed(&table));
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), s);
        assert_eq!(list.pop_front(&mut table), Some(s[0]));
        assert_eq!(list.pop_front(&mut table), Some(s[1]));
        assert_eq!(list.pop_front(&mut table), Some(s[2]));
        assert_eq!(list.pop_front(&mut table), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let (mut table, s) = table_with(4);
        let mut list = ThreadList::new();
        for &slot in &s {
            list.push_back(&mut table, slot);
        }
        list.remove(&mut table, s[1]);
        assert!(list.is_well_formed(&table));
        list.remove(&mut table, s[3]);
        list.remove(&mut table, s[0]);
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [s[2]]);
        assert_eq!((list.front(), list.back()), (Some(s[2]), Some(s[2])));
        // A removed slot can be linked again.
        list.push_back(&mut table, s[1]);
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [s[2], s[1]]);
    }

    #[test]
    fn test_two_links_are_independent() {
        let (mut table, s) = table_with(2);
        let mut queue = ThreadList::new();
        let mut timers = TimerList::new();
        queue.push_back(&mut table, s[0]);
        queue.push_back(&mut table, s[1]);
        timers.insert_after(&mut table, None, s[1]);
        timers.insert_after(&mut table, None, s[0]);
        assert_eq!(queue.iter(&table).collect::<Vec<_>>(), [s[0], s[1]]);
        assert_eq!(timers.iter(&table).collect::<Vec<_>>(), [s[0], s[1]]);
        timers.remove(&mut table, s[0]);
        assert!(queue.contains(&table, s[0]));
        assert!(!timers.contains(&table, s[0]));
        assert!(queue.is_well_formed(&table) && timers.is_well_formed(&table));
    }
}
