// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fragment reassembly engine — the dominant module of this crate.
//!
//! The engine maintains a **list of lists**: a doubly-linked sequence of
//! reassembly-list heads (linked through each head buffer's `prev_list`/
//! `next_list` fields), where each reassembly list is itself a doubly-
//! linked sequence of fragments in ascending offset order (`prev_frag`/
//! `next_frag`). Reassembly-wide bookkeeping — the timer, the list-of-
//! lists position, and the size accumulators — lives only in the list's
//! current head (the fragment at the smallest offset seen so far).
//!
//! Buffers are addressed by [`BufferHandle`] into a [`BufferPool`] rather
//! than by intrusive pointer, so relinking a fragment between lists, or
//! promoting a newly-arrived lower-offset fragment to head, is a
//! pointer-field update rather than a move of any bytes.

use crate::protocols::ipv4::types::FlagsFragOffset;
use crate::runtime::fail::FragError;
use crate::runtime::memory::{BufferHandle, BufferPool, PacketBuffer, ProtocolHdrType};
use crate::runtime::timer::{TimerHandle, TimerService};

/// Maximum fragment offset (13 bits), in 8-byte units.
const MAX_FRAG_OFFSET: u16 = 8191;
/// Maximum total reassembled IP content length (total-length field is 16
/// bits and the header itself takes at least 20 of those bytes).
const MAX_TOTAL_IP_LENGTH: u32 = 65535;

/// What happened to a buffer handed to [`ReassemblyEngine::reassemble`].
#[derive(Debug)]
pub enum ReassembleOutcome {
    /// Not a fragment (`MF=0`, `offset=0`); hand it straight to the demux.
    NonFragment(PacketBuffer),
    /// Queued on a reassembly list; nothing more to do with this buffer.
    InProgress,
    /// The list is now complete; `PacketBuffer` is the reassembled
    /// datagram (the list's head fragment, with every other fragment's
    /// payload appended and the total-length field rewritten to match).
    Complete(PacketBuffer),
    /// The incoming fragment (and, for overlap/poisoning, its entire
    /// list) was discarded.
    Discard(FragError),
}

/// The list-of-lists plus the per-list doubly-linked fragment chains,
/// realized over a shared [`BufferPool`]/[`TimerService`] rather than
/// owning buffers or timers itself — both are shared with the validator,
/// demultiplexer, and timer-tick driver.
#[derive(Default)]
pub struct ReassemblyEngine {
    lists_head: Option<BufferHandle>,
    lists_tail: Option<BufferHandle>,
}

impl ReassemblyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active (incomplete) reassembly lists. Exposed for tests
    /// and diagnostics, not used by the reassembly algorithm itself.
    pub fn active_list_count(&self, pool: &BufferPool) -> usize {
        let mut count = 0;
        let mut cur = self.lists_head;
        while let Some(h) = cur {
            count += 1;
            cur = pool.get(h).and_then(|b| b.next_list);
        }
        count
    }

    /// Classifies and, if `buf` is a fragment, dispatches it into the
    /// list-of-lists. `buf` must already have passed
    /// [`crate::protocols::ipv4::validate::validate`].
    pub fn reassemble(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerService,
        buf: PacketBuffer,
        now: u64,
        timeout_ticks: u64,
    ) -> ReassembleOutcome {
        let flags = FlagsFragOffset::decode(buf.ip_flags_frag_offset);
        if !flags.more_fragments && flags.fragment_offset == 0 {
            return ReassembleOutcome::NonFragment(buf);
        }

        match self.find_list(pool, &buf) {
            Some(head) => self.insert_into_existing(pool, timers, head, buf, now, timeout_ticks),
            None => self.create_new_list(pool, timers, buf, now, timeout_ticks),
        }
    }

    /// Walks the list-of-lists head to tail, returning the first
    /// list whose 4-tuple (src, dest, id, protocol) matches `buf`'s.
    fn find_list(&self, pool: &BufferPool, buf: &PacketBuffer) -> Option<BufferHandle> {
        let mut cur = self.lists_head;
        while let Some(h) = cur {
            let head = pool.get(h).expect("list-of-lists handle must be live");
            if head.ip_addr_src == buf.ip_addr_src
                && head.ip_addr_dest == buf.ip_addr_dest
                && head.ip_id == buf.ip_id
                && head.protocol_hdr_type == buf.protocol_hdr_type
            {
                return Some(h);
            }
            cur = head.next_list;
        }
        None
    }

    /// Creates a brand-new single-fragment list and appends it at
    /// the tail of the list-of-lists.
    fn create_new_list(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerService,
        mut buf: PacketBuffer,
        now: u64,
        timeout_ticks: u64,
    ) -> ReassembleOutcome {
        let flags = FlagsFragOffset::decode(buf.ip_flags_frag_offset);
        let frag_size = buf.data_len as u32;
        if let Err(e) = validate_frag_shape(flags, frag_size) {
            return ReassembleOutcome::Discard(e);
        }

        buf.prev_list = self.lists_tail;
        buf.next_list = None;
        buf.prev_frag = None;
        buf.next_frag = None;
        buf.ip_frag_size_cur = frag_size;
        buf.ip_frag_size_tot = if flags.more_fragments {
            None
        } else {
            Some(flags.fragment_offset as u32 * 8 + frag_size)
        };

        let handle = pool.insert(buf);
        let timer = timers.acquire(now, timeout_ticks, handle);
        pool.get_mut(handle).expect("just inserted").timer = Some(timer);

        match self.lists_tail {
            Some(old_tail) => pool.get_mut(old_tail).expect("tail handle must be live").next_list = Some(handle),
            None => self.lists_head = Some(handle),
        }
        self.lists_tail = Some(handle);

        self.check_completeness(pool, timers, handle, now, timeout_ticks)
    }

    /// Inserts `buf` into the list headed by `head`, handling
    /// duplicate/overlap detection and head-fragment migration.
    fn insert_into_existing(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerService,
        head: BufferHandle,
        mut buf: PacketBuffer,
        now: u64,
        timeout_ticks: u64,
    ) -> ReassembleOutcome {
        let flags = FlagsFragOffset::decode(buf.ip_flags_frag_offset);
        let frag_size = buf.data_len as u32;
        if let Err(e) = validate_frag_shape(flags, frag_size) {
            return ReassembleOutcome::Discard(e);
        }
        let new_offset = flags.fragment_offset;
        let new_start = new_offset as u32 * 8;
        let new_end = new_start + frag_size;

        let mut cur = head;
        loop {
            let cur_buf = pool.get(cur).expect("fragment handle must be live");
            let cur_flags = FlagsFragOffset::decode(cur_buf.ip_flags_frag_offset);
            let cur_offset = cur_flags.fragment_offset;
            let cur_size = cur_buf.data_len as u32;

            if new_offset > cur_offset {
                match cur_buf.next_frag {
                    Some(next) => {
                        cur = next;
                        continue;
                    }
                    None => {
                        let cur_end = cur_offset as u32 * 8 + cur_size;
                        if cur_end > new_start {
                            self.discard_list(pool, timers, head);
                            return ReassembleOutcome::Discard(FragError::FragDiscard);
                        }
                        buf.prev_frag = Some(cur);
                        buf.next_frag = None;
                        let new_handle = pool.insert(buf);
                        pool.get_mut(cur).expect("tail handle must be live").next_frag = Some(new_handle);
                        return self.finish_insert(pool, timers, head, frag_size, flags, now, timeout_ticks);
                    }
                }
            } else if new_offset == cur_offset {
                if cur_size == frag_size {
                    return ReassembleOutcome::Discard(FragError::FragDiscard);
                }
                self.discard_list(pool, timers, head);
                return ReassembleOutcome::Discard(FragError::FragDiscard);
            } else {
                let cur_start = cur_offset as u32 * 8;
                if new_end > cur_start {
                    self.discard_list(pool, timers, head);
                    return ReassembleOutcome::Discard(FragError::FragDiscard);
                }
                match cur_buf.prev_frag {
                    Some(prev) => {
                        let prev_buf = pool.get(prev).expect("prev fragment handle must be live");
                        let prev_flags = FlagsFragOffset::decode(prev_buf.ip_flags_frag_offset);
                        let prev_end = prev_flags.fragment_offset as u32 * 8 + prev_buf.data_len as u32;
                        if prev_end > new_start {
                            self.discard_list(pool, timers, head);
                            return ReassembleOutcome::Discard(FragError::FragDiscard);
                        }
                        buf.prev_frag = Some(prev);
                        buf.next_frag = Some(cur);
                        let new_handle = pool.insert(buf);
                        pool.get_mut(prev).expect("prev handle must be live").next_frag = Some(new_handle);
                        pool.get_mut(cur).expect("cur handle must be live").prev_frag = Some(new_handle);
                        return self.finish_insert(pool, timers, head, frag_size, flags, now, timeout_ticks);
                    }
                    None => {
                        // `cur` is the head: the new fragment becomes the
                        // smallest-offset fragment, so list-level metadata
                        // migrates to it in one step.
                        debug_assert_eq!(cur, head);
                        let (prev_list, next_list, timer, frag_cur, frag_tot) = {
                            let old_head = pool.get(head).expect("head handle must be live");
                            (
                                old_head.prev_list,
                                old_head.next_list,
                                old_head.timer,
                                old_head.ip_frag_size_cur,
                                old_head.ip_frag_size_tot,
                            )
                        };
                        buf.prev_frag = None;
                        buf.next_frag = Some(head);
                        buf.prev_list = prev_list;
                        buf.next_list = next_list;
                        buf.timer = timer;
                        buf.ip_frag_size_cur = frag_cur;
                        buf.ip_frag_size_tot = frag_tot;
                        let new_head = pool.insert(buf);

                        {
                            let old_head = pool.get_mut(head).expect("head handle must be live");
                            old_head.prev_frag = Some(new_head);
                            old_head.prev_list = None;
                            old_head.next_list = None;
                            old_head.timer = None;
                            old_head.ip_frag_size_cur = 0;
                            old_head.ip_frag_size_tot = None;
                        }
                        match prev_list {
                            Some(p) => pool.get_mut(p).expect("list-of-lists handle must be live").next_list = Some(new_head),
                            None => self.lists_head = Some(new_head),
                        }
                        match next_list {
                            Some(n) => pool.get_mut(n).expect("list-of-lists handle must be live").prev_list = Some(new_head),
                            None => self.lists_tail = Some(new_head),
                        }
                        if let Some(t) = timer {
                            timers.retarget(t, new_head);
                        }
                        return self.finish_insert(pool, timers, new_head, frag_size, flags, now, timeout_ticks);
                    }
                }
            }
        }
    }

    /// Shared tail of both splice paths in `insert_into_existing`: bumps
    /// the (possibly just-migrated) head's size accumulators and runs the
    /// completeness check.
    fn finish_insert(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerService,
        head: BufferHandle,
        frag_size: u32,
        flags: FlagsFragOffset,
        now: u64,
        timeout_ticks: u64,
    ) -> ReassembleOutcome {
        let head_buf = pool.get_mut(head).expect("head handle must be live");
        head_buf.ip_frag_size_cur += frag_size;
        if !flags.more_fragments {
            let tot = flags.fragment_offset as u32 * 8 + frag_size;
            if tot > MAX_TOTAL_IP_LENGTH {
                self.discard_list(pool, timers, head);
                return ReassembleOutcome::Discard(FragError::FragSizeTot);
            }
            head_buf.ip_frag_size_tot = Some(tot);
        }
        self.check_completeness(pool, timers, head, now, timeout_ticks)
    }

    /// After any successful insertion, checks whether the list is
    /// now complete, over-sized, or should simply have its timer reset.
    fn check_completeness(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerService,
        head: BufferHandle,
        now: u64,
        timeout_ticks: u64,
    ) -> ReassembleOutcome {
        let (cur, tot, hdr_len, timer) = {
            let h = pool.get(head).expect("head handle must be live");
            (h.ip_frag_size_cur, h.ip_frag_size_tot, h.ip_hdr_len, h.timer)
        };

        let Some(tot) = tot else {
            if let Some(t) = timer {
                timers.set(t, now, timeout_ticks);
            }
            return ReassembleOutcome::InProgress;
        };

        if cur > tot {
            self.discard_list(pool, timers, head);
            return ReassembleOutcome::Discard(FragError::FragSizeTot);
        }
        if cur < tot {
            if let Some(t) = timer {
                timers.set(t, now, timeout_ticks);
            }
            return ReassembleOutcome::InProgress;
        }

        // cur == tot: every byte from offset 0 through the "more=0"
        // fragment's end is accounted for with no gaps (a gap would make
        // the spanned range, `tot`, exceed the sum of fragment sizes,
        // `cur`) and no overlap (already rejected during splicing).
        let total_ip_length = hdr_len as u32 + tot;
        if total_ip_length > MAX_TOTAL_IP_LENGTH {
            self.discard_list(pool, timers, head);
            return ReassembleOutcome::Discard(FragError::FragLenTot);
        }

        self.unlink_list(pool, head);
        if let Some(t) = timer {
            timers.free(t);
        }
        ReassembleOutcome::Complete(self.coalesce(pool, head, hdr_len, tot, total_ip_length))
    }

    /// Concatenates every fragment's payload onto the head buffer (which
    /// is always the offset-0 fragment by the time a list completes — any
    /// smaller offset would already have migrated to head), rewrites the
    /// total-length field, and frees the now-empty fragment buffers.
    fn coalesce(
        &mut self,
        pool: &mut BufferPool,
        head: BufferHandle,
        hdr_len: u8,
        frag_size_tot: u32,
        total_ip_length: u32,
    ) -> PacketBuffer {
        let hdr_ix = pool.get(head).unwrap().ip_hdr_ix.unwrap_or(0);
        let mut write_at = hdr_ix + hdr_len as usize + pool.get(head).unwrap().data_len;

        let mut next = pool.get(head).unwrap().next_frag;
        while let Some(h) = next {
            let frag = pool.remove(h).expect("fragment handle must be live");
            let frag_ix = frag.transport_ix.or(frag.ip_hdr_ix).unwrap_or(0);
            let n = frag.data_len;
            {
                let head_buf = pool.get_mut(head).unwrap();
                head_buf.data[write_at..write_at + n].copy_from_slice(&frag.data[frag_ix..frag_ix + n]);
            }
            write_at += n;
            next = frag.next_frag;
        }

        let mut head_buf = pool.remove(head).expect("head handle must be live");
        // `data_len` excludes the IP header, matching the non-fragment path
        // (validate.rs sets `data_len = tot_len - hdr_len`): the demux and
        // every upper layer index payload-only, never header-inclusive.
        head_buf.tot_len = hdr_len as usize + frag_size_tot as usize;
        head_buf.data_len = frag_size_tot as usize;
        head_buf.ip_datagram_len = total_ip_length as u16;
        head_buf.prev_frag = None;
        head_buf.next_frag = None;
        head_buf.prev_list = None;
        head_buf.next_list = None;
        head_buf.timer = None;
        crate::protocols::checksum::write_u16(&mut head_buf.data[..hdr_len as usize], 2, total_ip_length as u16);
        head_buf
    }

    /// Advances every list whose timer has fired past `now`,
    /// invoking `on_timeout` with the (still-populated) head buffer
    /// before its fragments are freed, then removing the list and
    /// reclaiming every fragment buffer.
    pub fn process_timeouts(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerService,
        now: u64,
        mut on_timeout: impl FnMut(&PacketBuffer),
    ) {
        for (_, head) in timers.expire_up_to(now) {
            self.unlink_list(pool, head);
            if let Some(h) = pool.get(head) {
                on_timeout(h);
            }
            let mut cur = Some(head);
            while let Some(c) = cur {
                let next = pool.get(c).and_then(|b| b.next_frag);
                pool.remove(c);
                cur = next;
            }
        }
    }

    /// Discards an entire poisoned/overlapping list: frees every fragment
    /// buffer and its timer, and unlinks it from the list-of-lists.
    fn discard_list(&mut self, pool: &mut BufferPool, timers: &mut TimerService, head: BufferHandle) {
        self.unlink_list(pool, head);
        let timer = pool.get(head).and_then(|b| b.timer);
        if let Some(t) = timer {
            timers.free(t);
        }
        let mut cur = Some(head);
        while let Some(c) = cur {
            let next = pool.get(c).and_then(|b| b.next_frag);
            pool.remove(c);
            cur = next;
        }
    }

    /// Removes a list head from the list-of-lists, patching its
    /// neighbors' links (or `lists_head`/`lists_tail`) in its place.
    fn unlink_list(&mut self, pool: &mut BufferPool, head: BufferHandle) {
        let (prev_list, next_list) = match pool.get(head) {
            Some(b) => (b.prev_list, b.next_list),
            None => return,
        };
        match prev_list {
            Some(p) => pool.get_mut(p).expect("list-of-lists handle must be live").next_list = next_list,
            None => self.lists_head = next_list,
        }
        match next_list {
            Some(n) => pool.get_mut(n).expect("list-of-lists handle must be live").prev_list = prev_list,
            None => self.lists_tail = prev_list,
        }
    }
}

/// Offset and size bounds, shared by list creation and insertion.
fn validate_frag_shape(flags: FlagsFragOffset, frag_size: u32) -> Result<(), FragError> {
    if flags.fragment_offset > MAX_FRAG_OFFSET {
        return Err(FragError::FragOffset);
    }
    if flags.more_fragments {
        if frag_size < 8 || frag_size % 8 != 0 {
            return Err(FragError::FragSize);
        }
    } else if frag_size < 1 || frag_size > 65515 {
        return Err(FragError::FragSize);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ipv4::types::Protocol;
    use ::std::net::Ipv4Addr;

    fn fragment(
        src: Ipv4Addr,
        dest: Ipv4Addr,
        id: u16,
        offset_units: u16,
        more: bool,
        payload_len: usize,
    ) -> PacketBuffer {
        let mut buf = PacketBuffer::default();
        buf.ip_addr_src = src;
        buf.ip_addr_dest = dest;
        buf.ip_id = id;
        buf.ip_hdr_ix = Some(0);
        buf.ip_hdr_len = 20;
        buf.protocol_hdr_type = ProtocolHdrType::Udpv4;
        buf.ip_flags_frag_offset = FlagsFragOffset {
            reserved: false,
            dont_fragment: false,
            more_fragments: more,
            fragment_offset: offset_units,
        }
        .encode();
        buf.transport_ix = Some(20);
        buf.data_len = payload_len;
        let _ = Protocol::Udp;
        buf
    }

    #[test]
    fn non_fragment_passes_through() {
        let mut engine = ReassemblyEngine::new();
        let mut pool = BufferPool::new();
        let mut timers = TimerService::new();
        let buf = fragment(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1, 0, false, 64);
        match engine.reassemble(&mut pool, &mut timers, buf, 0, 15) {
            ReassembleOutcome::NonFragment(_) => {}
            other => panic!("expected NonFragment, got {other:?}"),
        }
    }

    #[test]
    fn two_fragment_in_order_reassembly_completes() {
        let mut engine = ReassemblyEngine::new();
        let mut pool = BufferPool::new();
        let mut timers = TimerService::new();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);

        let first = fragment(src, dest, 7, 0, true, 1480);
        assert!(matches!(
            engine.reassemble(&mut pool, &mut timers, first, 0, 15),
            ReassembleOutcome::InProgress
        ));

        let second = fragment(src, dest, 7, 185, false, 8);
        match engine.reassemble(&mut pool, &mut timers, second, 1, 15) {
            ReassembleOutcome::Complete(buf) => {
                assert_eq!(buf.data_len, 1488);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        assert_eq!(engine.active_list_count(&pool), 0);
        assert!(timers.is_empty());
    }

    #[test]
    fn out_of_order_arrival_migrates_head() {
        let mut engine = ReassemblyEngine::new();
        let mut pool = BufferPool::new();
        let mut timers = TimerService::new();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);

        let second = fragment(src, dest, 9, 185, false, 8);
        assert!(matches!(
            engine.reassemble(&mut pool, &mut timers, second, 0, 15),
            ReassembleOutcome::InProgress
        ));

        let first = fragment(src, dest, 9, 0, true, 1480);
        match engine.reassemble(&mut pool, &mut timers, first, 1, 15) {
            ReassembleOutcome::Complete(buf) => {
                assert_eq!(buf.data_len, 1488);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn overlap_discards_the_whole_list() {
        let mut engine = ReassemblyEngine::new();
        let mut pool = BufferPool::new();
        let mut timers = TimerService::new();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);

        let a = fragment(src, dest, 3, 0, true, 16);
        engine.reassemble(&mut pool, &mut timers, a, 0, 15);
        let b = fragment(src, dest, 3, 2, true, 16);
        engine.reassemble(&mut pool, &mut timers, b, 0, 15);
        // Overlaps fragment b's [16, 32) range at offset 1 (byte 8).
        let c = fragment(src, dest, 3, 1, false, 16);
        match engine.reassemble(&mut pool, &mut timers, c, 0, 15) {
            ReassembleOutcome::Discard(FragError::FragDiscard) => {}
            other => panic!("expected FragDiscard, got {other:?}"),
        }
        assert_eq!(engine.active_list_count(&pool), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn duplicate_with_equal_size_is_dropped_without_poisoning_the_list() {
        let mut engine = ReassemblyEngine::new();
        let mut pool = BufferPool::new();
        let mut timers = TimerService::new();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);

        let first = fragment(src, dest, 5, 0, true, 1480);
        engine.reassemble(&mut pool, &mut timers, first, 0, 15);

        let dup = fragment(src, dest, 5, 0, true, 1480);
        match engine.reassemble(&mut pool, &mut timers, dup, 0, 15) {
            ReassembleOutcome::Discard(FragError::FragDiscard) => {}
            other => panic!("expected FragDiscard, got {other:?}"),
        }
        assert_eq!(engine.active_list_count(&pool), 1);

        let last = fragment(src, dest, 5, 185, false, 8);
        match engine.reassemble(&mut pool, &mut timers, last, 0, 15) {
            ReassembleOutcome::Complete(_) => {}
            other => panic!("expected Complete after duplicate drop, got {other:?}"),
        }
    }

    #[test]
    fn timeout_frees_every_fragment() {
        let mut engine = ReassemblyEngine::new();
        let mut pool = BufferPool::new();
        let mut timers = TimerService::new();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);

        let only = fragment(src, dest, 11, 0, true, 64);
        engine.reassemble(&mut pool, &mut timers, only, 0, 15);
        assert_eq!(engine.active_list_count(&pool), 1);

        let mut notified = 0;
        engine.process_timeouts(&mut pool, &mut timers, 15, |_head| notified += 1);
        assert_eq!(notified, 1);
        assert_eq!(engine.active_list_count(&pool), 0);
        assert!(pool.is_empty());
    }
}
