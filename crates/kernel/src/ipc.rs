//! Blocking synchronization objects.
//!
//! Five object kinds share one shape: a typed header, a wait queue ordered
//! FIFO or by priority, and a waiter count. Handles are plain indices into
//! the kernel's per-class arenas; every method takes the kernel it was
//! created in.
//!
//! Acquisition follows the kernel's blocking convention: an unavailable
//! object suspends the caller and returns
//! [`WouldBlock`](OsError::WouldBlock); the re-issued call on the next
//! dispatch yields the wake-up reason. Wakers hand the transferred resource
//! (a permit, a mail, a message, the satisfied event set) to the woken
//! thread inside the same critical section, so wake order is exactly queue
//! order and nothing can barge in between.
//!
//! Tearing an object down (`detach` for statically owned objects, `delete`
//! for kernel-owned ones) broadcast-wakes every waiter with `Error` first.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use rex_core::{ObjectClass, OsError, OsResult, Priority, Timeout, WaitOrder};

use crate::kernel::{Kernel, KernelState};
use crate::registry::{Named, ObjectHeader};
use crate::thread::{FinishedWait, ThreadId, WaitRef, WakePayload};
use crate::trace::TraceEvent;
use crate::wait::WaitQueue;

// Counting semaphore

/// Handle to a counting semaphore.
#[cfg(feature = "semaphore")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    id: u32,
}

#[cfg(feature = "semaphore")]
pub(crate) struct SemObject {
    pub header: ObjectHeader,
    pub wq: WaitQueue,
    /// Signed: blocked takers drive it negative until releases rebalance.
    pub value: i32,
}

#[cfg(feature = "semaphore")]
impl Named for SemObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

#[cfg(feature = "semaphore")]
impl Semaphore {
    /// Initializes a statically owned semaphore; release with
    /// [`Semaphore::detach`].
    pub fn init(
        kernel: &Kernel,
        name: impl Into<String>,
        initial: u32,
        order: WaitOrder,
    ) -> OsResult<Self> {
        Self::build(kernel, name, initial, order, true)
    }

    /// Creates a kernel-owned semaphore; release with
    /// [`Semaphore::delete`].
    pub fn create(
        kernel: &Kernel,
        name: impl Into<String>,
        initial: u32,
        order: WaitOrder,
    ) -> OsResult<Self> {
        Self::build(kernel, name, initial, order, false)
    }

    fn build(
        kernel: &Kernel,
        name: impl Into<String>,
        initial: u32,
        order: WaitOrder,
        is_static: bool,
    ) -> OsResult<Self> {
        let mut st = kernel.state.lock();
        let id = st.sems.insert(SemObject {
            header: ObjectHeader::new(ObjectClass::Semaphore, name, is_static),
            wq: WaitQueue::new(order),
            value: initial as i32,
        })?;
        Ok(Self { id })
    }

    /// Takes one permit, waiting up to `timeout` for one to appear.
    pub fn take(&self, kernel: &Kernel, timeout: Timeout) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;

        if let Some(result) = st.consume_finished(WaitRef::Semaphore(self.id)) {
            return match result {
                Ok(_) => {
                    if let Some(sem) = st.sems.get(self.id) {
                        kernel.emit(TraceEvent::Take {
                            class: ObjectClass::Semaphore,
                            name: &sem.header.name,
                        });
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }

        let Some(sem) = st.sems.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::TryTake {
            class: ObjectClass::Semaphore,
            name: &sem.header.name,
        });

        if sem.value > 0 {
            sem.value -= 1;
            kernel.emit(TraceEvent::Take {
                class: ObjectClass::Semaphore,
                name: &sem.header.name,
            });
            return Ok(());
        }
        if timeout.is_poll() {
            return Err(OsError::Timeout);
        }

        // The pending take is pre-charged; a timed-out wait leaves the
        // value skewed until the next release rebalances it.
        sem.value -= 1;
        let tid = st.block_current(WaitRef::Semaphore(self.id), timeout);
        enqueue_sem(st, self.id, tid);
        Err(OsError::WouldBlock)
    }

    /// Poll-mode take.
    pub fn try_take(&self, kernel: &Kernel) -> OsResult<()> {
        self.take(kernel, Timeout::Poll)
    }

    /// Returns one permit, waking the head waiter when any taker is parked.
    pub fn release(&self, kernel: &Kernel) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(sem) = st.sems.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::Put {
            class: ObjectClass::Semaphore,
            name: &sem.header.name,
        });
        sem.value += 1;
        let woken = if sem.value <= 0 && sem.wq.count() > 0 {
            sem.wq.pop_head()
        } else {
            None
        };
        if let Some(w) = woken {
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::Semaphore(self.id),
                    result: Ok(WakePayload::Unit),
                    counted: true,
                }),
            );
        }
        Ok(())
    }

    pub fn value(&self, kernel: &Kernel) -> OsResult<i32> {
        let st = kernel.state.lock();
        st.sems.get(self.id).map(|s| s.value).ok_or(OsError::Error)
    }

    /// Current waiter count.
    pub fn waiting(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.sems
            .get(self.id)
            .map(|s| s.wq.count())
            .ok_or(OsError::Error)
    }

    /// Tears down a statically owned semaphore, waking all waiters with
    /// `Error`.
    pub fn detach(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, true)
    }

    /// Tears down a kernel-owned semaphore, waking all waiters with
    /// `Error`.
    pub fn delete(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, false)
    }

    fn destroy(self, kernel: &Kernel, expect_static: bool) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(sem) = st.sems.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        if sem.header.is_static != expect_static {
            return Err(OsError::Error);
        }
        let mut woken = Vec::new();
        while let Some(w) = sem.wq.pop_head() {
            woken.push(w);
        }
        for w in woken {
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::Semaphore(self.id),
                    result: Err(OsError::Error),
                    counted: true,
                }),
            );
        }
        st.sems.remove(self.id);
        st.switch_pending = true;
        Ok(())
    }
}

#[cfg(feature = "semaphore")]
fn enqueue_sem(st: &mut KernelState, id: u32, tid: ThreadId) {
    let prio = KernelState::waiter_priority(&st.threads, tid);
    let threads = &st.threads;
    st.sems
        .get_mut(id)
        .expect("semaphore vanished under its waiter")
        .wq
        .insert(tid, prio, |peer| {
            KernelState::waiter_priority(threads, peer)
        });
}

// Priority-inheritance mutex

/// Handle to a recursive mutex with single-level priority inheritance.
///
/// While a more urgent thread waits, the owner runs boosted to the waiter's
/// level; a full release reverts the owner to its base priority. The boost
/// is single-level: chains through several mutexes are not recomputed.
#[cfg(feature = "mutex")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex {
    id: u32,
}

#[cfg(feature = "mutex")]
pub(crate) struct MutexObject {
    pub header: ObjectHeader,
    pub wq: WaitQueue,
    pub value: i8,
    pub owner: Option<ThreadId>,
    pub original_priority: Priority,
    pub hold: u32,
}

#[cfg(feature = "mutex")]
impl Named for MutexObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

#[cfg(feature = "mutex")]
impl Mutex {
    pub fn init(kernel: &Kernel, name: impl Into<String>, order: WaitOrder) -> OsResult<Self> {
        Self::build(kernel, name, order, true)
    }

    pub fn create(kernel: &Kernel, name: impl Into<String>, order: WaitOrder) -> OsResult<Self> {
        Self::build(kernel, name, order, false)
    }

    fn build(
        kernel: &Kernel,
        name: impl Into<String>,
        order: WaitOrder,
        is_static: bool,
    ) -> OsResult<Self> {
        let mut st = kernel.state.lock();
        let id = st.mutexes.insert(MutexObject {
            header: ObjectHeader::new(ObjectClass::Mutex, name, is_static),
            wq: WaitQueue::new(order),
            value: 1,
            owner: None,
            original_priority: Priority(u8::MAX),
            hold: 0,
        })?;
        Ok(Self { id })
    }

    /// Acquires the lock, recursing when the caller already owns it.
    pub fn take(&self, kernel: &Kernel, timeout: Timeout) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;

        if let Some(result) = st.consume_finished(WaitRef::Mutex(self.id)) {
            return match result {
                Ok(_) => {
                    // Ownership moved to us when the releaser woke us.
                    if let Some(mx) = st.mutexes.get(self.id) {
                        kernel.emit(TraceEvent::Take {
                            class: ObjectClass::Mutex,
                            name: &mx.header.name,
                        });
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }

        let tid = st.current.expect("mutex take requires a running thread");
        let caller_prio = KernelState::waiter_priority(&st.threads, tid);

        let Some(mx) = st.mutexes.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::TryTake {
            class: ObjectClass::Mutex,
            name: &mx.header.name,
        });

        if mx.owner == Some(tid) {
            mx.hold += 1;
            kernel.emit(TraceEvent::Take {
                class: ObjectClass::Mutex,
                name: &mx.header.name,
            });
            return Ok(());
        }
        if mx.value > 0 {
            mx.value -= 1;
            mx.owner = Some(tid);
            mx.original_priority = caller_prio;
            mx.hold = 1;
            kernel.emit(TraceEvent::Take {
                class: ObjectClass::Mutex,
                name: &mx.header.name,
            });
            return Ok(());
        }
        if timeout.is_poll() {
            return Err(OsError::Timeout);
        }

        mx.value -= 1;
        let owner = mx.owner.expect("contended mutex without owner");
        let owner_prio = KernelState::waiter_priority(&st.threads, owner);
        if caller_prio.is_more_urgent_than(owner_prio) {
            // Boost the owner so a middling thread cannot hold us off
            // through it. Equal levels do not boost.
            st.change_priority(owner, caller_prio)?;
        }
        st.block_current(WaitRef::Mutex(self.id), timeout);
        enqueue_mutex(st, self.id, tid);
        Err(OsError::WouldBlock)
    }

    /// Poll-mode take.
    pub fn try_take(&self, kernel: &Kernel) -> OsResult<()> {
        self.take(kernel, Timeout::Poll)
    }

    /// Releases one hold. The final release reverts any boost, hands the
    /// lock to the head waiter, and requests a switch. Only the owner may
    /// release.
    pub fn release(&self, kernel: &Kernel) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let tid = st.current.ok_or(OsError::Error)?;

        let Some(mx) = st.mutexes.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::Put {
            class: ObjectClass::Mutex,
            name: &mx.header.name,
        });
        if mx.owner != Some(tid) {
            return Err(OsError::Error);
        }
        mx.hold -= 1;
        if mx.hold > 0 {
            return Ok(());
        }

        // Any boost reverts on the final release.
        let (base, current) = {
            let th = st.threads.get(tid.0).expect("owner vanished");
            (th.init_priority, th.current_priority)
        };
        if base != current {
            st.change_priority(tid, base)?;
        }

        let mx = st.mutexes.get_mut(self.id).expect("mutex vanished");
        let woken = if mx.value <= 0 && mx.wq.count() > 0 {
            mx.wq.pop_head()
        } else {
            None
        };
        mx.value += 1;
        match woken {
            Some(w) => {
                let w_prio = KernelState::waiter_priority(&st.threads, w);
                let mx = st.mutexes.get_mut(self.id).expect("mutex vanished");
                mx.owner = Some(w);
                mx.original_priority = w_prio;
                mx.hold = 1;
                st.make_ready(
                    w,
                    Some(FinishedWait {
                        on: WaitRef::Mutex(self.id),
                        result: Ok(WakePayload::Unit),
                        counted: true,
                    }),
                );
            }
            None => {
                mx.owner = None;
                mx.original_priority = Priority(u8::MAX);
            }
        }
        st.switch_pending = true;
        Ok(())
    }

    pub fn owner(&self, kernel: &Kernel) -> OsResult<Option<ThreadId>> {
        let st = kernel.state.lock();
        st.mutexes
            .get(self.id)
            .map(|m| m.owner)
            .ok_or(OsError::Error)
    }

    pub fn hold(&self, kernel: &Kernel) -> OsResult<u32> {
        let st = kernel.state.lock();
        st.mutexes
            .get(self.id)
            .map(|m| m.hold)
            .ok_or(OsError::Error)
    }

    pub fn waiting(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.mutexes
            .get(self.id)
            .map(|m| m.wq.count())
            .ok_or(OsError::Error)
    }

    pub fn detach(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, true)
    }

    pub fn delete(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, false)
    }

    fn destroy(self, kernel: &Kernel, expect_static: bool) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(mx) = st.mutexes.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        if mx.header.is_static != expect_static {
            return Err(OsError::Error);
        }
        let mut woken = Vec::new();
        while let Some(w) = mx.wq.pop_head() {
            woken.push(w);
        }
        for w in woken {
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::Mutex(self.id),
                    result: Err(OsError::Error),
                    counted: true,
                }),
            );
        }
        st.mutexes.remove(self.id);
        st.switch_pending = true;
        Ok(())
    }
}

#[cfg(feature = "mutex")]
fn enqueue_mutex(st: &mut KernelState, id: u32, tid: ThreadId) {
    let prio = KernelState::waiter_priority(&st.threads, tid);
    let threads = &st.threads;
    st.mutexes
        .get_mut(id)
        .expect("mutex vanished under its waiter")
        .wq
        .insert(tid, prio, |peer| {
            KernelState::waiter_priority(threads, peer)
        });
}

// Event flag group

/// How a receiver's interest set is matched against the group.
#[cfg(feature = "event")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Any interesting bit satisfies the wait.
    Any,
    /// Every interesting bit must be present at once.
    All,
}

/// Interest a blocked receiver left behind for senders to match.
#[cfg(feature = "event")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventWait {
    pub set: u32,
    pub mode: EventMode,
    pub clear: bool,
}

/// Handle to a 32-bit event flag group.
#[cfg(feature = "event")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    id: u32,
}

#[cfg(feature = "event")]
pub(crate) struct EventObject {
    pub header: ObjectHeader,
    pub wq: WaitQueue,
    pub set: u32,
}

#[cfg(feature = "event")]
impl Named for EventObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

#[cfg(feature = "event")]
impl Event {
    pub fn init(kernel: &Kernel, name: impl Into<String>, order: WaitOrder) -> OsResult<Self> {
        Self::build(kernel, name, order, true)
    }

    pub fn create(kernel: &Kernel, name: impl Into<String>, order: WaitOrder) -> OsResult<Self> {
        Self::build(kernel, name, order, false)
    }

    fn build(
        kernel: &Kernel,
        name: impl Into<String>,
        order: WaitOrder,
        is_static: bool,
    ) -> OsResult<Self> {
        let mut st = kernel.state.lock();
        let id = st.events.insert(EventObject {
            header: ObjectHeader::new(ObjectClass::Event, name, is_static),
            wq: WaitQueue::new(order),
            set: 0,
        })?;
        Ok(Self { id })
    }

    /// Ors `set` into the group and wakes every waiter whose interest is
    /// now satisfied, clearing satisfied bits for waiters that asked.
    ///
    /// The scan observes clears as it goes: a waiter with clear-on-satisfy
    /// can consume bits a later waiter would have matched.
    pub fn send(&self, kernel: &Kernel, set: u32) -> OsResult<()> {
        if set == 0 {
            return Err(OsError::Error);
        }
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(ev) = st.events.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::Put {
            class: ObjectClass::Event,
            name: &ev.header.name,
        });
        ev.set |= set;

        let threads = &st.threads;
        let mut winners: Vec<(ThreadId, u32)> = Vec::new();
        let mut i = 0;
        while let Some(tid) = ev.wq.peek_at(i) {
            let Some(wait) = threads.get(tid.0).and_then(|t| t.event_wait) else {
                i += 1;
                continue;
            };
            let satisfied = match wait.mode {
                EventMode::All => ev.set & wait.set == wait.set,
                EventMode::Any => ev.set & wait.set != 0,
            };
            if satisfied {
                let _ = ev.wq.remove_at(i);
                if wait.clear {
                    ev.set &= !wait.set;
                }
                winners.push((tid, ev.set));
            } else {
                i += 1;
            }
        }

        for (tid, recved) in winners {
            if let Some(th) = st.threads.get_mut(tid.0) {
                th.event_wait = None;
            }
            st.make_ready(
                tid,
                Some(FinishedWait {
                    on: WaitRef::Event(self.id),
                    result: Ok(WakePayload::Events(recved)),
                    counted: true,
                }),
            );
        }
        Ok(())
    }

    /// Waits for `set` under `mode`, optionally clearing the matched bits,
    /// and returns the group's flags as observed at satisfaction.
    pub fn recv(
        &self,
        kernel: &Kernel,
        set: u32,
        mode: EventMode,
        clear: bool,
        timeout: Timeout,
    ) -> OsResult<u32> {
        if set == 0 {
            return Err(OsError::Error);
        }
        let mut guard = kernel.state.lock();
        let st = &mut *guard;

        if let Some(result) = st.consume_finished(WaitRef::Event(self.id)) {
            return match result {
                Ok(WakePayload::Events(recved)) => {
                    if let Some(ev) = st.events.get(self.id) {
                        kernel.emit(TraceEvent::Take {
                            class: ObjectClass::Event,
                            name: &ev.header.name,
                        });
                    }
                    Ok(recved)
                }
                // Woken from outside without a satisfying send; report the
                // flags as they stand.
                Ok(_) => Ok(st.events.get(self.id).map(|e| e.set).unwrap_or(0)),
                Err(e) => Err(e),
            };
        }

        let Some(ev) = st.events.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::TryTake {
            class: ObjectClass::Event,
            name: &ev.header.name,
        });

        let hit = match mode {
            EventMode::All => ev.set & set == set,
            EventMode::Any => ev.set & set != 0,
        };
        if hit {
            let recved = ev.set;
            if clear {
                ev.set &= !set;
            }
            kernel.emit(TraceEvent::Take {
                class: ObjectClass::Event,
                name: &ev.header.name,
            });
            return Ok(recved);
        }
        if timeout.is_poll() {
            return Err(OsError::Timeout);
        }

        let tid = st.block_current(WaitRef::Event(self.id), timeout);
        st.threads
            .get_mut(tid.0)
            .expect("blocked thread vanished")
            .event_wait = Some(EventWait { set, mode, clear });
        enqueue_event(st, self.id, tid);
        Err(OsError::WouldBlock)
    }

    /// Flags currently pending in the group.
    pub fn set(&self, kernel: &Kernel) -> OsResult<u32> {
        let st = kernel.state.lock();
        st.events.get(self.id).map(|e| e.set).ok_or(OsError::Error)
    }

    pub fn waiting(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.events
            .get(self.id)
            .map(|e| e.wq.count())
            .ok_or(OsError::Error)
    }

    pub fn detach(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, true)
    }

    pub fn delete(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, false)
    }

    fn destroy(self, kernel: &Kernel, expect_static: bool) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(ev) = st.events.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        if ev.header.is_static != expect_static {
            return Err(OsError::Error);
        }
        let mut woken = Vec::new();
        while let Some(w) = ev.wq.pop_head() {
            woken.push(w);
        }
        for w in woken {
            if let Some(th) = st.threads.get_mut(w.0) {
                th.event_wait = None;
            }
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::Event(self.id),
                    result: Err(OsError::Error),
                    counted: true,
                }),
            );
        }
        st.events.remove(self.id);
        st.switch_pending = true;
        Ok(())
    }
}

#[cfg(feature = "event")]
fn enqueue_event(st: &mut KernelState, id: u32, tid: ThreadId) {
    let prio = KernelState::waiter_priority(&st.threads, tid);
    let threads = &st.threads;
    st.events
        .get_mut(id)
        .expect("event group vanished under its waiter")
        .wq
        .insert(tid, prio, |peer| {
            KernelState::waiter_priority(threads, peer)
        });
}

// Mailbox

/// Handle to a fixed-capacity ring of word-sized mails.
///
/// Send never blocks: a full ring fails fast with `Full`. Receive blocks.
#[cfg(feature = "mailbox")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox {
    id: u32,
}

#[cfg(feature = "mailbox")]
pub(crate) struct MailboxObject {
    pub header: ObjectHeader,
    pub wq: WaitQueue,
    pub pool: Vec<usize>,
    pub size: usize,
    pub entry: usize,
    pub in_offset: usize,
    pub out_offset: usize,
}

#[cfg(feature = "mailbox")]
impl Named for MailboxObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

#[cfg(feature = "mailbox")]
impl Mailbox {
    pub fn init(
        kernel: &Kernel,
        name: impl Into<String>,
        capacity: usize,
        order: WaitOrder,
    ) -> OsResult<Self> {
        Self::build(kernel, name, capacity, order, true)
    }

    pub fn create(
        kernel: &Kernel,
        name: impl Into<String>,
        capacity: usize,
        order: WaitOrder,
    ) -> OsResult<Self> {
        Self::build(kernel, name, capacity, order, false)
    }

    fn build(
        kernel: &Kernel,
        name: impl Into<String>,
        capacity: usize,
        order: WaitOrder,
        is_static: bool,
    ) -> OsResult<Self> {
        assert!(capacity > 0, "mailbox needs at least one slot");
        let mut st = kernel.state.lock();
        let id = st.mailboxes.insert(MailboxObject {
            header: ObjectHeader::new(ObjectClass::Mailbox, name, is_static),
            wq: WaitQueue::new(order),
            pool: vec![0; capacity],
            size: capacity,
            entry: 0,
            in_offset: 0,
            out_offset: 0,
        })?;
        Ok(Self { id })
    }

    /// Posts a mail, waking the head receiver when one is parked. Fails
    /// fast with `Full`; senders never block.
    pub fn send(&self, kernel: &Kernel, value: usize) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(mb) = st.mailboxes.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::Put {
            class: ObjectClass::Mailbox,
            name: &mb.header.name,
        });
        if mb.entry == mb.size {
            return Err(OsError::Full);
        }
        mb.pool[mb.in_offset] = value;
        mb.in_offset = (mb.in_offset + 1) % mb.size;
        mb.entry += 1;

        let mut handoff = None;
        if mb.wq.count() > 0 {
            if let Some(w) = mb.wq.pop_head() {
                let mail = mb.pool[mb.out_offset];
                mb.out_offset = (mb.out_offset + 1) % mb.size;
                mb.entry -= 1;
                handoff = Some((w, mail));
            }
        }
        if let Some((w, mail)) = handoff {
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::Mailbox(self.id),
                    result: Ok(WakePayload::Mail(mail)),
                    counted: true,
                }),
            );
        }
        Ok(())
    }

    /// Takes the oldest mail, waiting up to `timeout` when the ring is
    /// empty.
    pub fn recv(&self, kernel: &Kernel, timeout: Timeout) -> OsResult<usize> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;

        if let Some(result) = st.consume_finished(WaitRef::Mailbox(self.id)) {
            return match result {
                Ok(WakePayload::Mail(value)) => {
                    if let Some(mb) = st.mailboxes.get(self.id) {
                        kernel.emit(TraceEvent::Take {
                            class: ObjectClass::Mailbox,
                            name: &mb.header.name,
                        });
                    }
                    Ok(value)
                }
                Ok(_) => Err(OsError::Error),
                Err(e) => Err(e),
            };
        }

        let Some(mb) = st.mailboxes.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::TryTake {
            class: ObjectClass::Mailbox,
            name: &mb.header.name,
        });
        if mb.entry > 0 {
            let value = mb.pool[mb.out_offset];
            mb.out_offset = (mb.out_offset + 1) % mb.size;
            mb.entry -= 1;
            kernel.emit(TraceEvent::Take {
                class: ObjectClass::Mailbox,
                name: &mb.header.name,
            });
            return Ok(value);
        }
        if timeout.is_poll() {
            return Err(OsError::Timeout);
        }

        let tid = st.block_current(WaitRef::Mailbox(self.id), timeout);
        enqueue_mailbox(st, self.id, tid);
        Err(OsError::WouldBlock)
    }

    /// Mails currently queued.
    pub fn len(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.mailboxes
            .get(self.id)
            .map(|m| m.entry)
            .ok_or(OsError::Error)
    }

    pub fn is_empty(&self, kernel: &Kernel) -> OsResult<bool> {
        self.len(kernel).map(|n| n == 0)
    }

    pub fn capacity(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.mailboxes
            .get(self.id)
            .map(|m| m.size)
            .ok_or(OsError::Error)
    }

    pub fn waiting(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.mailboxes
            .get(self.id)
            .map(|m| m.wq.count())
            .ok_or(OsError::Error)
    }

    pub fn detach(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, true)
    }

    pub fn delete(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, false)
    }

    fn destroy(self, kernel: &Kernel, expect_static: bool) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(mb) = st.mailboxes.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        if mb.header.is_static != expect_static {
            return Err(OsError::Error);
        }
        let mut woken = Vec::new();
        while let Some(w) = mb.wq.pop_head() {
            woken.push(w);
        }
        for w in woken {
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::Mailbox(self.id),
                    result: Err(OsError::Error),
                    counted: true,
                }),
            );
        }
        st.mailboxes.remove(self.id);
        st.switch_pending = true;
        Ok(())
    }
}

#[cfg(feature = "mailbox")]
fn enqueue_mailbox(st: &mut KernelState, id: u32, tid: ThreadId) {
    let prio = KernelState::waiter_priority(&st.threads, tid);
    let threads = &st.threads;
    st.mailboxes
        .get_mut(id)
        .expect("mailbox vanished under its waiter")
        .wq
        .insert(tid, prio, |peer| {
            KernelState::waiter_priority(threads, peer)
        });
}

// Message queue

#[cfg(feature = "msgqueue")]
pub(crate) struct MsgCell {
    pub data: Vec<u8>,
    pub len: usize,
}

/// Handle to a fixed-capacity queue of variable-size messages.
///
/// The pool is carved into `max_msgs` cells of `msg_size` bytes (rounded up
/// to word alignment). Cells live on exactly one of the free list or the
/// FIFO. Urgent sends prepend.
#[cfg(feature = "msgqueue")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueue {
    id: u32,
}

#[cfg(feature = "msgqueue")]
pub(crate) struct MqObject {
    pub header: ObjectHeader,
    pub wq: WaitQueue,
    pub msg_size: usize,
    pub cells: Vec<MsgCell>,
    pub free: Vec<usize>,
    pub fifo: VecDeque<usize>,
}

#[cfg(feature = "msgqueue")]
impl Named for MqObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

#[cfg(feature = "msgqueue")]
impl MessageQueue {
    pub fn init(
        kernel: &Kernel,
        name: impl Into<String>,
        msg_size: usize,
        max_msgs: usize,
        order: WaitOrder,
    ) -> OsResult<Self> {
        Self::build(kernel, name, msg_size, max_msgs, order, true)
    }

    pub fn create(
        kernel: &Kernel,
        name: impl Into<String>,
        msg_size: usize,
        max_msgs: usize,
        order: WaitOrder,
    ) -> OsResult<Self> {
        Self::build(kernel, name, msg_size, max_msgs, order, false)
    }

    fn build(
        kernel: &Kernel,
        name: impl Into<String>,
        msg_size: usize,
        max_msgs: usize,
        order: WaitOrder,
        is_static: bool,
    ) -> OsResult<Self> {
        assert!(msg_size > 0 && max_msgs > 0, "message queue needs room");
        let align = core::mem::size_of::<usize>();
        let msg_size = (msg_size + align - 1) & !(align - 1);
        let mut st = kernel.state.lock();
        let id = st.queues.insert(MqObject {
            header: ObjectHeader::new(ObjectClass::MessageQueue, name, is_static),
            wq: WaitQueue::new(order),
            msg_size,
            cells: (0..max_msgs)
                .map(|_| MsgCell {
                    data: vec![0; msg_size],
                    len: 0,
                })
                .collect(),
            free: (0..max_msgs).rev().collect(),
            fifo: VecDeque::new(),
        })?;
        Ok(Self { id })
    }

    /// Appends a message, waking the head receiver when one is parked.
    /// Oversized messages fail with `Error`, an exhausted pool with `Full`.
    pub fn send(&self, kernel: &Kernel, msg: &[u8]) -> OsResult<()> {
        self.post(kernel, msg, false)
    }

    /// Prepends a message so the next receive takes it first.
    pub fn urgent(&self, kernel: &Kernel, msg: &[u8]) -> OsResult<()> {
        self.post(kernel, msg, true)
    }

    fn post(&self, kernel: &Kernel, msg: &[u8], to_front: bool) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(mq) = st.queues.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        if msg.len() > mq.msg_size {
            return Err(OsError::Error);
        }
        kernel.emit(TraceEvent::Put {
            class: ObjectClass::MessageQueue,
            name: &mq.header.name,
        });
        let Some(idx) = mq.free.pop() else {
            return Err(OsError::Full);
        };
        let cell = &mut mq.cells[idx];
        cell.data[..msg.len()].copy_from_slice(msg);
        cell.len = msg.len();
        if to_front {
            mq.fifo.push_front(idx);
        } else {
            mq.fifo.push_back(idx);
        }

        let mut handoff = None;
        if mq.wq.count() > 0 {
            if let Some(w) = mq.wq.pop_head() {
                let idx = mq.fifo.pop_front().expect("message just queued");
                let cell = &mq.cells[idx];
                let payload = cell.data[..cell.len].to_vec();
                mq.free.push(idx);
                handoff = Some((w, payload));
            }
        }
        if let Some((w, payload)) = handoff {
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::MsgQueue(self.id),
                    result: Ok(WakePayload::Message(payload)),
                    counted: true,
                }),
            );
        }
        Ok(())
    }

    /// Takes the head message into `buf`, waiting up to `timeout` on an
    /// empty queue. Returns the copied length, at most `buf.len()`.
    pub fn recv(&self, kernel: &Kernel, buf: &mut [u8], timeout: Timeout) -> OsResult<usize> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;

        if let Some(result) = st.consume_finished(WaitRef::MsgQueue(self.id)) {
            return match result {
                Ok(WakePayload::Message(payload)) => {
                    let n = buf.len().min(payload.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    if let Some(mq) = st.queues.get(self.id) {
                        kernel.emit(TraceEvent::Take {
                            class: ObjectClass::MessageQueue,
                            name: &mq.header.name,
                        });
                    }
                    Ok(n)
                }
                Ok(_) => Err(OsError::Error),
                Err(e) => Err(e),
            };
        }

        let Some(mq) = st.queues.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        kernel.emit(TraceEvent::TryTake {
            class: ObjectClass::MessageQueue,
            name: &mq.header.name,
        });
        if let Some(idx) = mq.fifo.pop_front() {
            let cell = &mut mq.cells[idx];
            let n = buf.len().min(cell.len);
            buf[..n].copy_from_slice(&cell.data[..n]);
            mq.free.push(idx);
            kernel.emit(TraceEvent::Take {
                class: ObjectClass::MessageQueue,
                name: &mq.header.name,
            });
            return Ok(n);
        }
        if timeout.is_poll() {
            return Err(OsError::Timeout);
        }

        let tid = st.block_current(WaitRef::MsgQueue(self.id), timeout);
        enqueue_msgqueue(st, self.id, tid);
        Err(OsError::WouldBlock)
    }

    /// Messages currently queued.
    pub fn len(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.queues
            .get(self.id)
            .map(|q| q.fifo.len())
            .ok_or(OsError::Error)
    }

    pub fn is_empty(&self, kernel: &Kernel) -> OsResult<bool> {
        self.len(kernel).map(|n| n == 0)
    }

    pub fn capacity(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.queues
            .get(self.id)
            .map(|q| q.cells.len())
            .ok_or(OsError::Error)
    }

    pub fn waiting(&self, kernel: &Kernel) -> OsResult<usize> {
        let st = kernel.state.lock();
        st.queues
            .get(self.id)
            .map(|q| q.wq.count())
            .ok_or(OsError::Error)
    }

    pub fn detach(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, true)
    }

    pub fn delete(self, kernel: &Kernel) -> OsResult<()> {
        self.destroy(kernel, false)
    }

    fn destroy(self, kernel: &Kernel, expect_static: bool) -> OsResult<()> {
        let mut guard = kernel.state.lock();
        let st = &mut *guard;
        let Some(mq) = st.queues.get_mut(self.id) else {
            return Err(OsError::Error);
        };
        if mq.header.is_static != expect_static {
            return Err(OsError::Error);
        }
        let mut woken = Vec::new();
        while let Some(w) = mq.wq.pop_head() {
            woken.push(w);
        }
        for w in woken {
            st.make_ready(
                w,
                Some(FinishedWait {
                    on: WaitRef::MsgQueue(self.id),
                    result: Err(OsError::Error),
                    counted: true,
                }),
            );
        }
        st.queues.remove(self.id);
        st.switch_pending = true;
        Ok(())
    }
}

#[cfg(feature = "msgqueue")]
fn enqueue_msgqueue(st: &mut KernelState, id: u32, tid: ThreadId) {
    let prio = KernelState::waiter_priority(&st.threads, tid);
    let threads = &st.threads;
    st.queues
        .get_mut(id)
        .expect("message queue vanished under its waiter")
        .wq
        .insert(tid, prio, |peer| {
            KernelState::waiter_priority(threads, peer)
        });
}
