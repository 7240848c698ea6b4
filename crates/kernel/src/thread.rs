//! Thread lifecycle and state machine.
//!
//! A thread is the unit of execution: its own stack, a fixed base priority,
//! a round-robin slice for same-level peers, and an embedded one-shot timer
//! shared by every bounded wait. Thread bodies are step functions invoked by
//! the dispatch loop; each step returns a [`ThreadAction`] telling the
//! kernel what the thread did.
//!
//! State machine:
//!
//! ```text
//! Init --startup--> Suspended --resume--> Ready
//! Ready --suspend/sleep/wait--> Suspended
//! Ready --exit--> Closed
//! Suspended --timeout or wake--> Ready
//! ```
//!
//! `Closed` is terminal; any transition not listed is illegal.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use rex_core::{OsError, OsResult, PrioCoords, Priority, Tick};

use crate::kernel::Kernel;
use crate::registry::{Named, ObjectHeader};
use crate::timer::ThreadTimer;

/// Thread identifier: the thread's slot in the kernel's thread arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

/// Thread execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Initialized, never started.
    Init,
    /// Runnable; linked in the ready table.
    Ready,
    /// Blocked: parked, sleeping, or linked in one wait queue.
    Suspended,
    /// Terminated. Heap-owned threads park on the defunct list until swept.
    Closed,
}

/// What a thread body did during one dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAction {
    /// Keep running; dispatch me again when I am still the most urgent.
    Continue,
    /// Rotate behind my same-priority peers.
    Yield,
    /// A blocking call suspended me; dispatch whoever is ready.
    Block,
    /// I am done; run the exit path.
    Exit,
}

/// Thread body: a step function re-invoked by the dispatch loop.
pub type ThreadHandler = Box<dyn FnMut(&mut ThreadContext<'_>) -> ThreadAction + Send>;

/// Thread control verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadControl {
    ChangePriority(Priority),
    Startup,
    Close,
}

/// What a suspended thread is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitRef {
    /// Timer-only wait (`sleep`).
    Sleep,
    /// Bare suspension (`suspend`), woken only by `resume`.
    Park,
    #[cfg(feature = "semaphore")]
    Semaphore(u32),
    #[cfg(feature = "mutex")]
    Mutex(u32),
    #[cfg(feature = "event")]
    Event(u32),
    #[cfg(feature = "mailbox")]
    Mailbox(u32),
    #[cfg(feature = "msgqueue")]
    MsgQueue(u32),
}

/// Payload a waker hands to the thread it wakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WakePayload {
    Unit,
    #[cfg(feature = "event")]
    Events(u32),
    #[cfg(feature = "mailbox")]
    Mail(usize),
    #[cfg(feature = "msgqueue")]
    Message(Vec<u8>),
}

/// A completed wait, consumed when the woken thread re-issues its call.
#[derive(Debug)]
pub(crate) struct FinishedWait {
    pub on: WaitRef,
    pub result: Result<WakePayload, OsError>,
    /// True when the waker already settled the object's waiter count.
    pub counted: bool,
}

impl FinishedWait {
    pub fn error(&self) -> Option<OsError> {
        self.result.as_ref().err().copied()
    }
}

/// Configuration for creating a thread.
pub struct ThreadConfig {
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) tick: Tick,
    pub(crate) stack_size: usize,
    pub(crate) stack: Option<Vec<u8>>,
    pub(crate) user_data: usize,
    pub(crate) handler: ThreadHandler,
}

impl ThreadConfig {
    /// Default stack size for threads that do not ask for one.
    pub const DEFAULT_STACK_SIZE: usize = 4096;

    pub fn new(name: impl Into<String>, priority: Priority, handler: ThreadHandler) -> Self {
        Self {
            name: name.into(),
            priority,
            tick: 1,
            stack_size: Self::DEFAULT_STACK_SIZE,
            stack: None,
            user_data: 0,
            handler,
        }
    }

    /// Sets the size of the kernel-allocated stack.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Supplies a caller-owned stack buffer, making this a static thread:
    /// on exit it detaches immediately instead of parking on the defunct
    /// list.
    pub fn with_stack(mut self, stack: Vec<u8>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Sets the round-robin slice shared with same-priority peers.
    pub fn with_tick(mut self, tick: Tick) -> Self {
        self.tick = tick;
        self
    }

    /// Attaches an opaque word the body can read back through its context.
    pub fn with_user_data(mut self, user_data: usize) -> Self {
        self.user_data = user_data;
        self
    }
}

impl fmt::Debug for ThreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("tick", &self.tick)
            .field("stack_size", &self.stack_size)
            .field("static", &self.stack.is_some())
            .finish()
    }
}

/// A thread as the kernel stores it.
pub(crate) struct Thread {
    pub header: ObjectHeader,
    pub handler: Option<ThreadHandler>,
    pub user_data: usize,
    pub stack: Vec<u8>,
    #[allow(dead_code)]
    pub sp: usize,
    pub init_priority: Priority,
    pub current_priority: Priority,
    pub coords: PrioCoords,
    pub state: ThreadState,
    pub init_tick: Tick,
    pub remaining_tick: Tick,
    /// Last wake-up reason, written by the waker before the thread runs.
    pub error: Option<OsError>,
    pub blocked_on: Option<WaitRef>,
    pub finished: Option<FinishedWait>,
    pub timer: ThreadTimer,
    #[cfg(feature = "event")]
    pub event_wait: Option<crate::ipc::EventWait>,
    pub iterations: u64,
}

impl Named for Thread {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.header.name)
            .field("state", &self.state)
            .field("priority", &self.current_priority)
            .field("stack_size", &self.stack.len())
            .finish()
    }
}

/// Handed to a thread body on every dispatch step.
pub struct ThreadContext<'a> {
    pub(crate) kernel: &'a Kernel,
    pub(crate) id: ThreadId,
    pub(crate) iteration: u64,
}

impl<'a> ThreadContext<'a> {
    pub fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    /// How many times this body has been dispatched, starting at 1.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn priority(&self) -> Priority {
        self.kernel
            .thread_priority(self.id)
            .expect("running thread vanished")
    }

    pub fn user_data(&self) -> usize {
        self.kernel
            .thread_user_data(self.id)
            .expect("running thread vanished")
    }

    /// Suspends the calling thread for `ticks`. First call returns
    /// `WouldBlock`; the re-issued call reports how the sleep ended.
    pub fn sleep(&self, ticks: Tick) -> OsResult<()> {
        self.kernel.sleep(ticks)
    }

    /// Alias of [`ThreadContext::sleep`].
    pub fn delay(&self, ticks: Tick) -> OsResult<()> {
        self.kernel.sleep(ticks)
    }

    /// Suspends the calling thread until another thread resumes it.
    pub fn suspend_self(&self) -> OsResult<()> {
        self.kernel.suspend(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_defaults() {
        let config = ThreadConfig::new("worker", Priority(7), Box::new(|_| ThreadAction::Exit));
        assert_eq!(config.priority, Priority(7));
        assert_eq!(config.tick, 1);
        assert_eq!(config.stack_size, ThreadConfig::DEFAULT_STACK_SIZE);
        assert!(config.stack.is_none());
    }

    #[test]
    fn config_builder_static_stack() {
        let config = ThreadConfig::new("boot", Priority(0), Box::new(|_| ThreadAction::Exit))
            .with_stack(alloc::vec![0u8; 512])
            .with_tick(5)
            .with_user_data(42);
        assert!(config.stack.is_some());
        assert_eq!(config.tick, 5);
        assert_eq!(config.user_data, 42);
    }
}
