//! Per-priority ready table.
//!
//! One FIFO queue per priority level plus the two-level bitmap for O(1)
//! most-urgent lookup. The running thread stays at the front of its level's
//! queue; yielding and slice expiry rotate it to the back.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use rex_core::{Priority, ReadyMask};

use crate::thread::ThreadId;

pub struct ReadyTable {
    queues: Vec<VecDeque<ThreadId>>,
    mask: ReadyMask,
}

impl ReadyTable {
    pub fn new(levels: usize) -> Self {
        let mut queues = Vec::with_capacity(levels);
        queues.resize_with(levels, VecDeque::new);
        Self {
            queues,
            mask: ReadyMask::new(),
        }
    }

    pub fn levels(&self) -> usize {
        self.queues.len()
    }

    /// Appends the thread to its level's queue and marks the level ready.
    pub fn insert(&mut self, tid: ThreadId, prio: Priority) {
        self.queues[prio.raw() as usize].push_back(tid);
        self.mask.set(prio);
    }

    /// Unlinks the thread from its level's queue.
    pub fn remove(&mut self, tid: ThreadId, prio: Priority) {
        let queue = &mut self.queues[prio.raw() as usize];
        queue.retain(|&t| t != tid);
        if queue.is_empty() {
            self.mask.clear(prio);
        }
    }

    /// Moves the thread to the back of its level's queue.
    pub fn rotate_to_back(&mut self, tid: ThreadId, prio: Priority) {
        let queue = &mut self.queues[prio.raw() as usize];
        if let Some(pos) = queue.iter().position(|&t| t == tid) {
            queue.remove(pos);
            queue.push_back(tid);
        }
    }

    /// The thread the scheduler picker would run now.
    pub fn highest(&self) -> Option<ThreadId> {
        let prio = self.mask.most_urgent()?;
        self.queues[prio.raw() as usize].front().copied()
    }

    pub fn len_at(&self, prio: Priority) -> usize {
        self.queues[prio.raw() as usize].len()
    }

    pub fn contains(&self, tid: ThreadId, prio: Priority) -> bool {
        self.queues[prio.raw() as usize].contains(&tid)
    }

    pub fn iter_level(&self, prio: Priority) -> impl Iterator<Item = ThreadId> + '_ {
        self.queues[prio.raw() as usize].iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }
}
