//! Ordered suspension queue embedded in every synchronization object.
//!
//! Insertion is FIFO or priority-ordered per the object's flag. The waiter
//! count is tracked separately from the queue itself: a timeout unlinks the
//! thread without touching the count, and the woken operation settles the
//! count when it observes the error. Single wake pops the head and
//! decrements; broadcast repeats single wakes until empty.

use alloc::collections::VecDeque;

use rex_core::{Priority, WaitOrder};

use crate::thread::ThreadId;

pub struct WaitQueue {
    order: WaitOrder,
    queue: VecDeque<ThreadId>,
    count: usize,
}

impl WaitQueue {
    pub fn new(order: WaitOrder) -> Self {
        Self {
            order,
            queue: VecDeque::new(),
            count: 0,
        }
    }

    pub fn order(&self) -> WaitOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Suspended-waiter count, including timed-out threads that have not yet
    /// settled their wait.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Settles one timed-out or torn-down wait.
    pub fn dec_count(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    /// Enqueues a waiter. `prio_of` resolves a queued peer's current
    /// priority for ordered insertion.
    pub fn insert(
        &mut self,
        tid: ThreadId,
        prio: Priority,
        prio_of: impl Fn(ThreadId) -> Priority,
    ) {
        self.count += 1;
        match self.order {
            WaitOrder::Fifo => self.queue.push_back(tid),
            WaitOrder::Priority => {
                // Before the first strictly less urgent peer; arrival order
                // within one level.
                let pos = self
                    .queue
                    .iter()
                    .position(|&peer| prio.is_more_urgent_than(prio_of(peer)));
                match pos {
                    Some(i) => self.queue.insert(i, tid),
                    None => self.queue.push_back(tid),
                }
            }
        }
    }

    /// Pops the next waiter to wake and settles its count.
    pub fn pop_head(&mut self) -> Option<ThreadId> {
        let tid = self.queue.pop_front()?;
        self.count = self.count.saturating_sub(1);
        Some(tid)
    }

    /// Unlinks a waiter without settling its count (the timeout path).
    pub fn unlink(&mut self, tid: ThreadId) {
        self.queue.retain(|&t| t != tid);
    }

    /// Waiter at a queue position, for scan-style wakes.
    pub fn peek_at(&self, index: usize) -> Option<ThreadId> {
        self.queue.get(index).copied()
    }

    /// Wakes a waiter out of queue order, settling its count.
    pub fn remove_at(&mut self, index: usize) -> Option<ThreadId> {
        let tid = self.queue.remove(index)?;
        self.count = self.count.saturating_sub(1);
        Some(tid)
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.queue.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: ThreadId = ThreadId(1);
    const T2: ThreadId = ThreadId(2);
    const T3: ThreadId = ThreadId(3);

    fn fixed(prio_by_id: &[(ThreadId, u8)]) -> impl Fn(ThreadId) -> Priority + '_ {
        move |tid| {
            Priority(
                prio_by_id
                    .iter()
                    .find(|(t, _)| *t == tid)
                    .map(|(_, p)| *p)
                    .unwrap_or(u8::MAX),
            )
        }
    }

    #[test]
    fn fifo_wakes_in_arrival_order() {
        let table = [(T1, 9u8), (T2, 3), (T3, 6)];
        let mut wq = WaitQueue::new(WaitOrder::Fifo);
        wq.insert(T1, Priority(9), fixed(&table));
        wq.insert(T2, Priority(3), fixed(&table));
        wq.insert(T3, Priority(6), fixed(&table));

        assert_eq!(wq.pop_head(), Some(T1));
        assert_eq!(wq.pop_head(), Some(T2));
        assert_eq!(wq.pop_head(), Some(T3));
        assert_eq!(wq.count(), 0);
    }

    #[test]
    fn priority_order_with_fifo_ties() {
        let table = [(T1, 6u8), (T2, 3), (T3, 6)];
        let mut wq = WaitQueue::new(WaitOrder::Priority);
        wq.insert(T1, Priority(6), fixed(&table));
        wq.insert(T2, Priority(3), fixed(&table));
        wq.insert(T3, Priority(6), fixed(&table));

        // T2 is most urgent; T3 ties with T1 and goes behind it.
        assert_eq!(wq.pop_head(), Some(T2));
        assert_eq!(wq.pop_head(), Some(T1));
        assert_eq!(wq.pop_head(), Some(T3));
    }

    #[test]
    fn unlink_leaves_count_for_later_settling() {
        let table = [(T1, 5u8), (T2, 5)];
        let mut wq = WaitQueue::new(WaitOrder::Fifo);
        wq.insert(T1, Priority(5), fixed(&table));
        wq.insert(T2, Priority(5), fixed(&table));

        wq.unlink(T1);
        assert_eq!(wq.len(), 1);
        assert_eq!(wq.count(), 2);

        wq.dec_count();
        assert_eq!(wq.count(), 1);
    }
}
