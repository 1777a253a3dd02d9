// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Concurrency markers.
//!
//! This engine is single-task cooperative: public configuration entry
//! points are expected to run with exclusive access against the one network
//! task. That expectation is made explicit with two zero-cost marker types
//! rather than silently relying on `&mut self`: a whole-engine lock that
//! serializes configuration calls against the network task (the "global
//! network lock"), and a short critical section protecting the handful of
//! values read from ISR-deferred contexts (`protocol_conflict`, the
//! reassembly timeout configuration value).

use ::std::cell::RefCell;

/// Serializes configuration-mutating calls against the single network task.
/// A real platform would back this with a mutex or a disable/enable-
/// scheduler pair; in this single-threaded engine it is a `RefCell` whose
/// borrow panics make "should have been impossible" contention visible
/// immediately instead of silently corrupting state.
pub struct NetLock<T> {
    inner: RefCell<T>,
}

impl<T> NetLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}

/// Marks a block of code as a "short critical section": the one or two
/// memory locations touched from both the network task and an ISR-deferred
/// context (`protocol_conflict`, the reassembly timeout configuration
/// value). On a real target this is where a HAL would disable/enable
/// interrupts; in portable Rust there is nothing to disable, so the type
/// exists purely to name the hook at the call site.
pub struct CriticalSection;

impl CriticalSection {
    pub fn enter<R>(f: impl FnOnce() -> R) -> R {
        f()
    }
}
