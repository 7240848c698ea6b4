//! Kernel facade: configuration, the dispatch loop, the tick, and the
//! defunct-thread sweep.
//!
//! All kernel state sits behind one platform mutex, the host rendering of
//! the single-core interrupt mask. Operations take the lock, mutate, and
//! release before any thread body runs, so context switches happen with the
//! mask open. The dispatch loop always runs the most urgent ready thread;
//! a body executes one step per dispatch and reports what it did.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use rex_core::priority::PRIO_LIMIT;
use rex_core::{ObjectClass, OsError, OsResult, Priority, Tick, Timeout};

use crate::port;
use crate::registry::{Arena, ObjectHeader};
use crate::sched::ReadyTable;
use crate::sync;
use crate::thread::{
    FinishedWait, Thread, ThreadAction, ThreadConfig, ThreadContext, ThreadControl, ThreadId,
    ThreadState, WaitRef, WakePayload,
};
use crate::trace::TraceEvent;
#[cfg(feature = "trace")]
use crate::trace::TraceHook;
#[cfg(any(
    feature = "semaphore",
    feature = "mutex",
    feature = "event",
    feature = "mailbox",
    feature = "msgqueue"
))]
use crate::wait::WaitQueue;

/// Build-time knobs of a kernel instance.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Instance name, mainly for trace output.
    pub name: &'static str,
    /// Number of priority levels (1 to 256). 32 keeps the ready bitmap to a
    /// single group word; 256 uses the full two-level layout.
    pub max_priority: usize,
    /// Capacity of each per-class object arena. `create` calls fail with
    /// `NoMem` once a class is full.
    pub max_objects: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "rex",
            max_priority: 32,
            max_objects: 64,
        }
    }
}

pub(crate) struct KernelState {
    pub config: KernelConfig,
    pub threads: Arena<Thread>,
    #[cfg(feature = "semaphore")]
    pub sems: Arena<crate::ipc::SemObject>,
    #[cfg(feature = "mutex")]
    pub mutexes: Arena<crate::ipc::MutexObject>,
    #[cfg(feature = "event")]
    pub events: Arena<crate::ipc::EventObject>,
    #[cfg(feature = "mailbox")]
    pub mailboxes: Arena<crate::ipc::MailboxObject>,
    #[cfg(feature = "msgqueue")]
    pub queues: Arena<crate::ipc::MqObject>,
    pub ready: ReadyTable,
    pub current: Option<ThreadId>,
    pub defunct: VecDeque<ThreadId>,
    pub switch_pending: bool,
}

impl KernelState {
    fn new(config: KernelConfig) -> Self {
        let cap = config.max_objects;
        let levels = config.max_priority;
        Self {
            config,
            threads: Arena::new(cap),
            #[cfg(feature = "semaphore")]
            sems: Arena::new(cap),
            #[cfg(feature = "mutex")]
            mutexes: Arena::new(cap),
            #[cfg(feature = "event")]
            events: Arena::new(cap),
            #[cfg(feature = "mailbox")]
            mailboxes: Arena::new(cap),
            #[cfg(feature = "msgqueue")]
            queues: Arena::new(cap),
            ready: ReadyTable::new(levels),
            current: None,
            defunct: VecDeque::new(),
            switch_pending: false,
        }
    }

    /// Suspends the running thread on `on`, arming its timer for bounded
    /// waits, and requests a switch. The caller links the thread into the
    /// object's wait queue where one exists.
    pub fn block_current(&mut self, on: WaitRef, timeout: Timeout) -> ThreadId {
        let tid = self.current.expect("blocking call without a running thread");
        self.discard_finished(tid);
        let prio = {
            let th = self
                .threads
                .get_mut(tid.0)
                .expect("running thread missing from arena");
            debug_assert_eq!(th.state, ThreadState::Ready);
            th.error = None;
            th.state = ThreadState::Suspended;
            th.blocked_on = Some(on);
            if let Some(ticks) = timeout.arming() {
                th.timer.set_timeout(ticks);
                th.timer.start();
            }
            th.current_priority
        };
        self.ready.remove(tid, prio);
        self.switch_pending = true;
        tid
    }

    /// Moves a suspended thread back to the ready table, stamping the wake
    /// reason when the wait completed (rather than merely started).
    pub fn make_ready(&mut self, tid: ThreadId, finished: Option<FinishedWait>) {
        let prio = {
            let th = self
                .threads
                .get_mut(tid.0)
                .expect("woken thread missing from arena");
            debug_assert_eq!(th.state, ThreadState::Suspended);
            th.timer.stop();
            th.blocked_on = None;
            if let Some(f) = finished {
                th.error = f.error();
                th.finished = Some(f);
            }
            th.state = ThreadState::Ready;
            th.coords = th.current_priority.coords();
            th.current_priority
        };
        self.ready.insert(tid, prio);
        self.switch_pending = true;
    }

    /// Hands the running thread the result of the wait it just came back
    /// from, if its re-issued call matches. Settles the object's waiter
    /// count for waits the waker did not settle (the timeout path).
    pub fn consume_finished(&mut self, on: WaitRef) -> Option<Result<WakePayload, OsError>> {
        let tid = self.current?;
        let taken = {
            let th = self.threads.get_mut(tid.0)?;
            match &th.finished {
                Some(f) if f.on == on => th.finished.take(),
                _ => None,
            }
        }?;
        if taken.result.is_err() && !taken.counted {
            self.wait_count_decrement(on);
        }
        Some(taken.result)
    }

    /// Drops a wake result the thread never collected.
    ///
    /// An uncounted error result still owes the object its waiter-count
    /// settle; discarding without it would leak the count forever.
    pub fn discard_finished(&mut self, tid: ThreadId) {
        let unsettled = {
            let Some(th) = self.threads.get_mut(tid.0) else {
                return;
            };
            match th.finished.take() {
                Some(f) if !f.counted && f.result.is_err() => Some(f.on),
                _ => None,
            }
        };
        if let Some(on) = unsettled {
            self.wait_count_decrement(on);
        }
    }

    /// One-sided waiter-count settle for a wait that ended without the waker
    /// popping the queue.
    pub fn wait_count_decrement(&mut self, on: WaitRef) {
        #[allow(unreachable_patterns)]
        match on {
            #[cfg(feature = "semaphore")]
            WaitRef::Semaphore(id) => {
                if let Some(o) = self.sems.get_mut(id) {
                    o.wq.dec_count();
                }
            }
            #[cfg(feature = "mutex")]
            WaitRef::Mutex(id) => {
                if let Some(o) = self.mutexes.get_mut(id) {
                    o.wq.dec_count();
                }
            }
            #[cfg(feature = "event")]
            WaitRef::Event(id) => {
                if let Some(o) = self.events.get_mut(id) {
                    o.wq.dec_count();
                }
            }
            #[cfg(feature = "mailbox")]
            WaitRef::Mailbox(id) => {
                if let Some(o) = self.mailboxes.get_mut(id) {
                    o.wq.dec_count();
                }
            }
            #[cfg(feature = "msgqueue")]
            WaitRef::MsgQueue(id) => {
                if let Some(o) = self.queues.get_mut(id) {
                    o.wq.dec_count();
                }
            }
            _ => {}
        }
    }

    /// Unlinks a thread from the wait queue it is blocked on without
    /// settling the count; the woken call settles it later.
    pub fn unlink_waiter(&mut self, tid: ThreadId, on: WaitRef) {
        #[allow(unreachable_patterns)]
        match on {
            #[cfg(feature = "semaphore")]
            WaitRef::Semaphore(id) => {
                if let Some(o) = self.sems.get_mut(id) {
                    o.wq.unlink(tid);
                }
            }
            #[cfg(feature = "mutex")]
            WaitRef::Mutex(id) => {
                if let Some(o) = self.mutexes.get_mut(id) {
                    o.wq.unlink(tid);
                }
            }
            #[cfg(feature = "event")]
            WaitRef::Event(id) => {
                if let Some(o) = self.events.get_mut(id) {
                    o.wq.unlink(tid);
                }
            }
            #[cfg(feature = "mailbox")]
            WaitRef::Mailbox(id) => {
                if let Some(o) = self.mailboxes.get_mut(id) {
                    o.wq.unlink(tid);
                }
            }
            #[cfg(feature = "msgqueue")]
            WaitRef::MsgQueue(id) => {
                if let Some(o) = self.queues.get_mut(id) {
                    o.wq.unlink(tid);
                }
            }
            _ => {}
        }
    }

    /// Resolves a queued peer's current priority for ordered wait-queue
    /// insertion. Unknown ids sort last.
    pub fn waiter_priority(threads: &Arena<Thread>, tid: ThreadId) -> Priority {
        threads
            .get(tid.0)
            .map(|t| t.current_priority)
            .unwrap_or(Priority(u8::MAX))
    }

    pub fn change_priority(&mut self, tid: ThreadId, new: Priority) -> OsResult<()> {
        assert!(
            (new.raw() as usize) < self.config.max_priority,
            "priority {new} out of range"
        );
        let (old, requeue) = {
            let th = self.threads.get_mut(tid.0).ok_or(OsError::Error)?;
            (th.current_priority, th.state == ThreadState::Ready)
        };
        if requeue {
            self.ready.remove(tid, old);
        }
        {
            let th = self.threads.get_mut(tid.0).expect("thread vanished");
            th.current_priority = new;
            th.coords = new.coords();
        }
        if requeue {
            self.ready.insert(tid, new);
            self.switch_pending = true;
        }
        Ok(())
    }

    /// Rotates a ready thread behind its same-priority peers, when it has
    /// any.
    pub fn yield_thread(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get(tid.0) else {
            return;
        };
        if th.state != ThreadState::Ready {
            return;
        }
        let prio = th.current_priority;
        if self.ready.len_at(prio) > 1 {
            self.ready.rotate_to_back(tid, prio);
            self.switch_pending = true;
        }
    }

    /// Common exit path: unlink everywhere, close, detach the timer, then
    /// either free the slot (static threads, and every `detach`) or park the
    /// thread on the defunct list for the sweeper.
    pub fn retire_thread(&mut self, tid: ThreadId, force_immediate: bool) {
        // A timed-out wait the thread never re-issued still owes its settle.
        self.discard_finished(tid);
        let (state, prio, on, is_static) = {
            let Some(th) = self.threads.get_mut(tid.0) else {
                return;
            };
            if th.state == ThreadState::Closed {
                return;
            }
            let snapshot = (th.state, th.current_priority, th.blocked_on, th.header.is_static);
            th.state = ThreadState::Closed;
            th.timer.stop();
            th.handler = None;
            th.blocked_on = None;
            snapshot
        };
        match state {
            ThreadState::Ready => self.ready.remove(tid, prio),
            ThreadState::Suspended => {
                if let Some(on) = on {
                    self.unlink_waiter(tid, on);
                    self.wait_count_decrement(on);
                }
            }
            _ => {}
        }
        if self.current == Some(tid) {
            self.current = None;
        }
        self.switch_pending = true;
        if force_immediate || is_static {
            self.threads.remove(tid.0);
        } else {
            self.defunct.push_back(tid);
        }
    }
}

/// A kernel instance.
///
/// Owns every thread and synchronization object created through it. Tests
/// and embedders drive it with [`Kernel::dispatch_once`] /
/// [`Kernel::run_until_idle`] and feed time with [`Kernel::tick`].
pub struct Kernel {
    pub(crate) state: sync::Mutex<KernelState>,
    #[cfg(feature = "trace")]
    trace: sync::Mutex<Option<TraceHook>>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        assert!(
            config.max_priority >= 1 && config.max_priority <= PRIO_LIMIT,
            "priority levels must be 1..={PRIO_LIMIT}"
        );
        Self {
            state: sync::Mutex::new(KernelState::new(config)),
            #[cfg(feature = "trace")]
            trace: sync::Mutex::new(None),
        }
    }

    /// Installs or clears the trace sink.
    #[cfg(feature = "trace")]
    pub fn set_trace_hook(&self, hook: Option<TraceHook>) {
        *self.trace.lock() = hook;
    }

    pub(crate) fn emit(&self, event: TraceEvent<'_>) {
        #[cfg(feature = "trace")]
        if let Some(hook) = &*self.trace.lock() {
            hook(event);
        }
        #[cfg(not(feature = "trace"))]
        let _ = event;
    }

    // Thread lifecycle

    /// Creates a thread in the `Init` state.
    ///
    /// The stack is kernel-allocated unless the configuration supplied one;
    /// either way it is painted for later watermarking. Fails with `NoMem`
    /// when the thread arena is full, leaving nothing allocated.
    pub fn create_thread(&self, config: ThreadConfig) -> OsResult<ThreadId> {
        let ThreadConfig {
            name,
            priority,
            tick,
            stack_size,
            stack,
            user_data,
            handler,
        } = config;
        let mut st = self.state.lock();
        assert!(
            (priority.raw() as usize) < st.config.max_priority,
            "priority {priority} out of range"
        );
        let is_static = stack.is_some();
        let mut stack = stack.unwrap_or_else(|| alloc::vec![0u8; stack_size]);
        let sp = port::stack_init(&mut stack);
        let thread = Thread {
            header: ObjectHeader::new(ObjectClass::Thread, name, is_static),
            handler: Some(handler),
            user_data,
            stack,
            sp,
            init_priority: priority,
            current_priority: priority,
            coords: priority.coords(),
            state: ThreadState::Init,
            init_tick: tick,
            remaining_tick: tick,
            error: None,
            blocked_on: None,
            finished: None,
            timer: crate::timer::ThreadTimer::new(),
            #[cfg(feature = "event")]
            event_wait: None,
            iterations: 0,
        };
        st.threads.insert(thread).map(ThreadId)
    }

    /// Creates and immediately starts a thread.
    pub fn spawn(&self, config: ThreadConfig) -> OsResult<ThreadId> {
        let tid = self.create_thread(config)?;
        self.startup(tid)?;
        Ok(tid)
    }

    /// Moves an `Init` thread through `Suspended` into the ready table.
    pub fn startup(&self, tid: ThreadId) -> OsResult<()> {
        let mut st = self.state.lock();
        {
            let th = st.threads.get_mut(tid.0).ok_or(OsError::Error)?;
            if th.state != ThreadState::Init {
                return Err(OsError::Error);
            }
            th.current_priority = th.init_priority;
            th.coords = th.init_priority.coords();
            th.remaining_tick = th.init_tick;
            th.state = ThreadState::Suspended;
        }
        st.make_ready(tid, None);
        Ok(())
    }

    /// Starts every thread still in the `Init` state.
    pub fn start(&self) {
        let ids: Vec<ThreadId> = {
            let st = self.state.lock();
            st.threads
                .iter()
                .filter(|(_, t)| t.state == ThreadState::Init)
                .map(|(id, _)| ThreadId(id))
                .collect()
        };
        for tid in ids {
            let _ = self.startup(tid);
        }
    }

    /// The running thread, if a dispatch step is in progress or was the last
    /// thing to happen.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.state.lock().current
    }

    /// Suspends a thread.
    ///
    /// Suspending another thread requires it to be `Ready` and takes effect
    /// immediately. Suspending the calling thread follows the blocking
    /// convention: first call parks it and returns `WouldBlock`; the
    /// re-issued call reports how the park ended.
    pub fn suspend(&self, tid: ThreadId) -> OsResult<()> {
        let mut st = self.state.lock();
        if st.current == Some(tid) {
            if let Some(result) = st.consume_finished(WaitRef::Park) {
                return result.map(|_| ());
            }
            let ready = st
                .threads
                .get(tid.0)
                .map(|t| t.state == ThreadState::Ready)
                .unwrap_or(false);
            if !ready {
                return Err(OsError::Error);
            }
            st.block_current(WaitRef::Park, Timeout::Forever);
            return Err(OsError::WouldBlock);
        }
        {
            let th = st.threads.get(tid.0).ok_or(OsError::Error)?;
            if th.state != ThreadState::Ready {
                return Err(OsError::Error);
            }
        }
        st.discard_finished(tid);
        let prio = {
            let th = st.threads.get_mut(tid.0).expect("thread vanished");
            th.error = None;
            th.state = ThreadState::Suspended;
            th.blocked_on = Some(WaitRef::Park);
            th.current_priority
        };
        st.ready.remove(tid, prio);
        st.switch_pending = true;
        Ok(())
    }

    /// Wakes a suspended thread: unlinks it from whatever it waits on, stops
    /// its timer, and puts it back in the ready table. Fails with `Error`
    /// when the thread is not suspended.
    pub fn resume(&self, tid: ThreadId) -> OsResult<()> {
        let mut st = self.state.lock();
        let (state, on) = {
            let th = st.threads.get(tid.0).ok_or(OsError::Error)?;
            (th.state, th.blocked_on)
        };
        if state != ThreadState::Suspended {
            return Err(OsError::Error);
        }
        match on {
            Some(on) => {
                st.unlink_waiter(tid, on);
                st.wait_count_decrement(on);
                #[cfg(feature = "event")]
                if let Some(th) = st.threads.get_mut(tid.0) {
                    th.event_wait = None;
                }
                // A waiter pulled off a payload-carrying object by an
                // outside resume has nothing to receive; surface that
                // instead of letting it read an empty container.
                #[allow(unreachable_patterns)]
                let result = match on {
                    #[cfg(feature = "mailbox")]
                    WaitRef::Mailbox(_) => Err(OsError::Error),
                    #[cfg(feature = "msgqueue")]
                    WaitRef::MsgQueue(_) => Err(OsError::Error),
                    _ => Ok(WakePayload::Unit),
                };
                st.make_ready(
                    tid,
                    Some(FinishedWait {
                        on,
                        result,
                        counted: true,
                    }),
                );
            }
            None => st.make_ready(tid, None),
        }
        Ok(())
    }

    /// Suspends the calling thread for `ticks`, waking through its timer.
    ///
    /// First call returns `WouldBlock`; the re-issued call returns `Ok` when
    /// the timer fired, or the error stamped by whoever woke it early.
    pub fn sleep(&self, ticks: Tick) -> OsResult<()> {
        let mut st = self.state.lock();
        if let Some(result) = st.consume_finished(WaitRef::Sleep) {
            return match result {
                Ok(_) | Err(OsError::Timeout) => Ok(()),
                Err(e) => Err(e),
            };
        }
        assert!(ticks > 0, "sleep needs a nonzero tick count");
        st.block_current(WaitRef::Sleep, Timeout::Ticks(ticks));
        Err(OsError::WouldBlock)
    }

    /// Alias of [`Kernel::sleep`].
    pub fn delay(&self, ticks: Tick) -> OsResult<()> {
        self.sleep(ticks)
    }

    /// Rotates the calling thread behind same-priority peers, if any.
    pub fn yield_now(&self) -> OsResult<()> {
        let mut st = self.state.lock();
        let tid = st.current.ok_or(OsError::Error)?;
        st.yield_thread(tid);
        Ok(())
    }

    /// Thread control dispatch.
    pub fn control(&self, tid: ThreadId, cmd: ThreadControl) -> OsResult<()> {
        match cmd {
            ThreadControl::ChangePriority(p) => self.change_priority(tid, p),
            ThreadControl::Startup => self.startup(tid),
            ThreadControl::Close => self.delete_thread(tid),
        }
    }

    /// Changes a thread's current priority, re-queueing it when ready.
    pub fn change_priority(&self, tid: ThreadId, new: Priority) -> OsResult<()> {
        self.state.lock().change_priority(tid, new)
    }

    /// Terminates a thread. Heap threads park on the defunct list until
    /// [`Kernel::reclaim`]; static threads detach immediately.
    pub fn delete_thread(&self, tid: ThreadId) -> OsResult<()> {
        let mut st = self.state.lock();
        if st.threads.get(tid.0).is_none() {
            return Err(OsError::Error);
        }
        st.retire_thread(tid, false);
        Ok(())
    }

    /// Terminates a thread and frees its slot immediately.
    pub fn detach_thread(&self, tid: ThreadId) -> OsResult<()> {
        let mut st = self.state.lock();
        if st.threads.get(tid.0).is_none() {
            return Err(OsError::Error);
        }
        st.retire_thread(tid, true);
        Ok(())
    }

    /// Registry lookup by thread name.
    pub fn find_thread(&self, name: &str) -> Option<ThreadId> {
        self.state.lock().threads.find(name).map(ThreadId)
    }

    // Introspection

    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.state.lock().threads.get(tid.0).map(|t| t.state)
    }

    pub fn thread_priority(&self, tid: ThreadId) -> Option<Priority> {
        self.state
            .lock()
            .threads
            .get(tid.0)
            .map(|t| t.current_priority)
    }

    pub fn thread_user_data(&self, tid: ThreadId) -> Option<usize> {
        self.state.lock().threads.get(tid.0).map(|t| t.user_data)
    }

    /// The thread's last wake-up reason; `None` when it woke cleanly or
    /// never blocked.
    pub fn thread_error(&self, tid: ThreadId) -> Option<OsError> {
        self.state.lock().threads.get(tid.0).and_then(|t| t.error)
    }

    /// Deepest stack excursion so far, in bytes.
    pub fn thread_stack_used(&self, tid: ThreadId) -> Option<usize> {
        self.state
            .lock()
            .threads
            .get(tid.0)
            .map(|t| port::stack_watermark(&t.stack))
    }

    /// Threads awaiting the defunct sweep.
    pub fn defunct_count(&self) -> usize {
        self.state.lock().defunct.len()
    }

    /// True when a wake, yield, or priority change has asked for a switch
    /// since the last dispatch.
    pub fn reschedule_requested(&self) -> bool {
        self.state.lock().switch_pending
    }

    // Execution

    /// Runs one step of the most urgent ready thread. Returns false when
    /// nothing is ready.
    pub fn dispatch_once(&self) -> bool {
        let (tid, mut handler, iteration) = {
            let mut st = self.state.lock();
            let Some(tid) = st.ready.highest() else {
                st.current = None;
                return false;
            };
            st.current = Some(tid);
            st.switch_pending = false;
            let th = st
                .threads
                .get_mut(tid.0)
                .expect("ready table references a dead thread");
            th.iterations += 1;
            let iteration = th.iterations;
            let handler = th.handler.take().expect("ready thread without a body");
            (tid, handler, iteration)
        };

        let action = {
            let mut ctx = ThreadContext {
                kernel: self,
                id: tid,
                iteration,
            };
            handler(&mut ctx)
        };

        let mut st = self.state.lock();
        let still_open = st
            .threads
            .get(tid.0)
            .map(|t| t.state != ThreadState::Closed)
            .unwrap_or(false);
        if still_open {
            let th = st.threads.get_mut(tid.0).expect("thread vanished");
            th.handler = Some(handler);
            // A wake result not collected during this step is stale; drop it
            // and settle any count it still carried.
            st.discard_finished(tid);
            match action {
                ThreadAction::Exit => st.retire_thread(tid, false),
                ThreadAction::Yield => st.yield_thread(tid),
                ThreadAction::Block | ThreadAction::Continue => {}
            }
        }
        true
    }

    /// Dispatches until no thread is ready, then sweeps the defunct list.
    pub fn run_until_idle(&self) {
        while self.dispatch_once() {}
        self.reclaim();
    }

    /// One tick of kernel time: round-robin slice accounting for the running
    /// thread, then every armed per-thread timer.
    pub fn tick(&self) {
        let mut st = self.state.lock();

        // Slice accounting.
        if let Some(cur) = st.current {
            if let Some(th) = st.threads.get_mut(cur.0) {
                if th.state == ThreadState::Ready && th.init_tick > 0 {
                    th.remaining_tick = th.remaining_tick.saturating_sub(1);
                    if th.remaining_tick == 0 {
                        th.remaining_tick = th.init_tick;
                        let prio = th.current_priority;
                        st.ready.rotate_to_back(cur, prio);
                        st.switch_pending = true;
                    }
                }
            }
        }

        // Timer expiry: the thread-timeout routine.
        let ids: Vec<u32> = st.threads.ids().collect();
        for raw in ids {
            let tid = ThreadId(raw);
            let fired = {
                let Some(th) = st.threads.get_mut(raw) else {
                    continue;
                };
                th.state == ThreadState::Suspended && th.timer.advance()
            };
            if !fired {
                continue;
            }
            let (on, name) = {
                let th = st.threads.get(raw).expect("thread vanished");
                (
                    th.blocked_on.expect("armed timer on a thread waiting on nothing"),
                    th.header.name.clone(),
                )
            };
            if on != WaitRef::Sleep && on != WaitRef::Park {
                st.unlink_waiter(tid, on);
            }
            #[cfg(feature = "event")]
            if let Some(th) = st.threads.get_mut(raw) {
                th.event_wait = None;
            }
            st.make_ready(
                tid,
                Some(FinishedWait {
                    on,
                    result: Err(OsError::Timeout),
                    counted: false,
                }),
            );
            self.emit(TraceEvent::Timeout { thread: &name });
        }
    }

    /// Sweeps the defunct list, freeing stacks and slots of self-terminated
    /// heap threads. Returns how many were reclaimed.
    pub fn reclaim(&self) -> usize {
        let mut st = self.state.lock();
        let mut swept = 0;
        while let Some(tid) = st.defunct.pop_front() {
            st.threads.remove(tid.0);
            swept += 1;
        }
        swept
    }

    // Consistency checking, used heavily by the randomized tests.

    /// Structural checks over the whole kernel: every thread linked
    /// consistently with its state, ready table and bitmap in agreement,
    /// waiter counts reconciled, container bookkeeping intact. Returns one
    /// message per violation.
    pub fn consistency_errors(&self) -> Vec<String> {
        let st = self.state.lock();
        let mut errs = Vec::new();

        for (raw, th) in st.threads.iter() {
            let tid = ThreadId(raw);
            let name = &th.header.name;
            let in_ready = st.ready.contains(tid, th.current_priority);
            match th.state {
                ThreadState::Init => {
                    if in_ready {
                        errs.push(format!("init thread {name} in ready table"));
                    }
                    if th.blocked_on.is_some() {
                        errs.push(format!("init thread {name} has a wait"));
                    }
                }
                ThreadState::Ready => {
                    if !in_ready {
                        errs.push(format!("ready thread {name} not in ready table"));
                    }
                    if th.coords != th.current_priority.coords() {
                        errs.push(format!("ready thread {name} has stale coords"));
                    }
                    if th.blocked_on.is_some() {
                        errs.push(format!("ready thread {name} still has a wait"));
                    }
                    if th.timer.is_armed() {
                        errs.push(format!("ready thread {name} has an armed timer"));
                    }
                }
                ThreadState::Suspended => {
                    if in_ready {
                        errs.push(format!("suspended thread {name} in ready table"));
                    }
                    if th.timer.is_armed() && th.blocked_on.is_none() {
                        errs.push(format!("suspended thread {name} timed but waiting on nothing"));
                    }
                }
                ThreadState::Closed => {
                    if in_ready {
                        errs.push(format!("closed thread {name} in ready table"));
                    }
                    if !th.header.is_static && !st.defunct.contains(&tid) {
                        errs.push(format!("closed heap thread {name} not on defunct list"));
                    }
                }
            }
        }

        for level in 0..st.ready.levels() {
            let prio = Priority(level as u8);
            for tid in st.ready.iter_level(prio) {
                match st.threads.get(tid.0) {
                    None => errs.push(format!("ready table holds dead thread at {prio}")),
                    Some(th) => {
                        if th.state != ThreadState::Ready {
                            errs.push(format!(
                                "ready table holds non-ready thread {}",
                                th.header.name
                            ));
                        }
                        if th.current_priority != prio {
                            errs.push(format!(
                                "thread {} queued at wrong level",
                                th.header.name
                            ));
                        }
                    }
                }
            }
        }

        #[cfg(feature = "semaphore")]
        for (id, sem) in st.sems.iter() {
            check_wait_queue(&st, WaitRef::Semaphore(id), &sem.wq, &sem.header.name, &mut errs);
        }
        #[cfg(feature = "mutex")]
        for (id, mx) in st.mutexes.iter() {
            check_wait_queue(&st, WaitRef::Mutex(id), &mx.wq, &mx.header.name, &mut errs);
            if mx.hold > 0 {
                match mx.owner {
                    None => errs.push(format!("held mutex {} without owner", mx.header.name)),
                    Some(owner) => {
                        let owner_prio = st
                            .threads
                            .get(owner.0)
                            .map(|t| t.current_priority)
                            .unwrap_or(Priority(u8::MAX));
                        for waiter in mx.wq.iter() {
                            let wp = KernelState::waiter_priority(&st.threads, waiter);
                            if wp.is_more_urgent_than(owner_prio) {
                                errs.push(format!(
                                    "mutex {} owner outprioritized by a waiter",
                                    mx.header.name
                                ));
                            }
                        }
                    }
                }
            } else if mx.owner.is_some() {
                errs.push(format!("free mutex {} has an owner", mx.header.name));
            }
        }
        #[cfg(feature = "event")]
        for (id, ev) in st.events.iter() {
            check_wait_queue(&st, WaitRef::Event(id), &ev.wq, &ev.header.name, &mut errs);
        }
        #[cfg(feature = "mailbox")]
        for (id, mb) in st.mailboxes.iter() {
            check_wait_queue(&st, WaitRef::Mailbox(id), &mb.wq, &mb.header.name, &mut errs);
            if mb.entry > mb.size {
                errs.push(format!("mailbox {} overfull", mb.header.name));
            }
            if mb.in_offset >= mb.size || mb.out_offset >= mb.size {
                errs.push(format!("mailbox {} offsets out of range", mb.header.name));
            }
        }
        #[cfg(feature = "msgqueue")]
        for (id, mq) in st.queues.iter() {
            check_wait_queue(&st, WaitRef::MsgQueue(id), &mq.wq, &mq.header.name, &mut errs);
            if mq.fifo.len() + mq.free.len() != mq.cells.len() {
                errs.push(format!("message queue {} lost cells", mq.header.name));
            }
            for idx in mq.fifo.iter() {
                if mq.free.contains(idx) {
                    errs.push(format!(
                        "message queue {} cell on both lists",
                        mq.header.name
                    ));
                }
            }
        }

        errs
    }

    /// Panics with the first structural violation found.
    pub fn assert_consistent(&self) {
        let errs = self.consistency_errors();
        assert!(errs.is_empty(), "kernel inconsistent: {}", errs.join("; "));
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(
    feature = "semaphore",
    feature = "mutex",
    feature = "event",
    feature = "mailbox",
    feature = "msgqueue"
))]
fn check_wait_queue(
    st: &KernelState,
    on: WaitRef,
    wq: &WaitQueue,
    name: &str,
    errs: &mut Vec<String>,
) {
    for tid in wq.iter() {
        match st.threads.get(tid.0) {
            None => errs.push(format!("{name} queues a dead thread")),
            Some(th) => {
                if th.state != ThreadState::Suspended {
                    errs.push(format!("{name} queues a non-suspended thread"));
                }
                if th.blocked_on != Some(on) {
                    errs.push(format!("{name} queues a thread waiting elsewhere"));
                }
            }
        }
    }
    // Timed-out waiters that have not yet settled their count.
    let unsettled = st
        .threads
        .iter()
        .filter(|(_, t)| {
            matches!(&t.finished, Some(f) if f.on == on && !f.counted && f.result.is_err())
        })
        .count();
    if wq.count() != wq.len() + unsettled {
        errs.push(format!(
            "{name} waiter count {} disagrees with queue {} (+{unsettled} unsettled)",
            wq.count(),
            wq.len()
        ));
    }
}
