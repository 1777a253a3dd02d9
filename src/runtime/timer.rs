// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! One-shot timer service.
//!
//! This engine has no executor of its own and the receive/validate/
//! reassemble/demux path never suspends, so timers here are a small
//! poll-driven service instead of futures tied to an async runtime: the
//! network task calls [`TimerService::expire_up_to`] once per tick and gets
//! back the timers that fired, in firing order.

use crate::runtime::memory::BufferHandle;

/// Stable handle to a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u32);

struct Entry {
    handle: TimerHandle,
    deadline: u64,
    owner: BufferHandle,
}

/// Poll-driven one-shot timer wheel. Deadlines are expressed in abstract
/// ticks (the caller decides what a tick means — seconds, for the
/// `FRAG_REASM_TIMEOUT_SEC` default of 15).
#[derive(Default)]
pub struct TimerService {
    entries: Vec<Entry>,
    next_id: u32,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    /// Acquires a new one-shot timer that will fire at `now + ticks`,
    /// referencing `owner` (the reassembly-list head buffer it belongs to).
    pub fn acquire(&mut self, now: u64, ticks: u64, owner: BufferHandle) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push(Entry {
            handle,
            deadline: now.saturating_add(ticks),
            owner,
        });
        handle
    }

    /// Reschedules an existing timer to fire at `now + ticks`. A no-op if
    /// the timer was already freed or has already fired (stale handle).
    pub fn set(&mut self, timer: TimerHandle, now: u64, ticks: u64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.handle == timer) {
            e.deadline = now.saturating_add(ticks);
        }
    }

    /// Cancels a timer. A freed timer never fires afterwards, even if it
    /// was already past its deadline when `free` is called.
    pub fn free(&mut self, timer: TimerHandle) {
        self.entries.retain(|e| e.handle != timer);
    }

    /// Re-points a live timer at a different owner without disturbing its
    /// deadline. Used when a reassembly list's head fragment changes (an
    /// earlier-offset fragment arrives) so the timer keeps tracking the new
    /// head rather than the buffer that is about to be demoted.
    pub fn retarget(&mut self, timer: TimerHandle, new_owner: BufferHandle) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.handle == timer) {
            e.owner = new_owner;
        }
    }

    /// Returns the owners of every timer whose deadline is `<= now`, removing
    /// them from the wheel. Order is deadline-ascending, matching "oldest
    /// list head fires first" expectations in a single-threaded engine.
    pub fn expire_up_to(&mut self, now: u64) -> Vec<(TimerHandle, BufferHandle)> {
        let mut fired: Vec<(u64, TimerHandle, BufferHandle)> = Vec::new();
        self.entries.retain(|e| {
            if e.deadline <= now {
                fired.push((e.deadline, e.handle, e.owner));
                false
            } else {
                true
            }
        });
        fired.sort_by_key(|&(deadline, ..)| deadline);
        fired.into_iter().map(|(_, handle, owner)| (handle, owner)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
