//! Kernel-object classes and wait-queue ordering.

use core::fmt;

/// Class tag carried by every kernel object's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    Thread,
    Semaphore,
    Mutex,
    Event,
    Mailbox,
    MessageQueue,
    Timer,
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Thread => "thread",
            Self::Semaphore => "semaphore",
            Self::Mutex => "mutex",
            Self::Event => "event",
            Self::Mailbox => "mailbox",
            Self::MessageQueue => "message queue",
            Self::Timer => "timer",
        };
        f.write_str(name)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ObjectClass {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", match self {
            Self::Thread => "thread",
            Self::Semaphore => "semaphore",
            Self::Mutex => "mutex",
            Self::Event => "event",
            Self::Mailbox => "mailbox",
            Self::MessageQueue => "message queue",
            Self::Timer => "timer",
        });
    }
}

/// Ordering of a synchronization object's wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitOrder {
    /// Waiters wake in arrival order.
    #[default]
    Fifo,
    /// Waiters wake most-urgent first, arrival order within one level.
    Priority,
}
