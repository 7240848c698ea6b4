//! Kernel activity tracing.
//!
//! A single sink injected into the kernel replaces the classic trio of
//! global hook pointers (try-take, take, put). The sink runs inside the
//! critical section and must not call back into the kernel.

use rex_core::ObjectClass;

#[cfg(feature = "trace")]
use crate::sync::Arc;

/// One record handed to the trace sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent<'a> {
    /// A thread is about to attempt acquiring an object.
    TryTake { class: ObjectClass, name: &'a str },
    /// An object was acquired (immediately or after a wait).
    Take { class: ObjectClass, name: &'a str },
    /// An object was released or posted to.
    Put { class: ObjectClass, name: &'a str },
    /// A suspended thread's wait window elapsed.
    Timeout { thread: &'a str },
}

/// The injected sink.
#[cfg(feature = "trace")]
pub type TraceHook = Arc<dyn Fn(TraceEvent<'_>) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_compare_by_object() {
        let a = TraceEvent::Take {
            class: ObjectClass::Semaphore,
            name: "s0",
        };
        let b = TraceEvent::Take {
            class: ObjectClass::Semaphore,
            name: "s0",
        };
        assert_eq!(a, b);
    }
}
