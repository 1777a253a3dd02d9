// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! IPv4 option decoding and emission.
//!
//! Options are copied into a bounded scratch buffer (`arrayvec::ArrayVec<u8,
//! 40>`, the "embedded device, no heap" posture of reaching for `arrayvec`
//! instead of `Vec` for bounded collections) so host-order conversions never
//! mutate the buffer's original wire image — other code paths (ICMP
//! replies) may still need those original bytes.

use crate::protocols::checksum;
use crate::runtime::fail::OptionError;
use ::arrayvec::ArrayVec;
use ::std::net::Ipv4Addr;

pub const MAX_OPTIONS_LEN: usize = 40;

pub(crate) const OPT_END_OF_LIST: u8 = 0;
pub(crate) const OPT_NOP: u8 = 1;
pub(crate) const OPT_SECURITY: u8 = 2;
pub(crate) const OPT_LOOSE_SR: u8 = 3;
pub(crate) const OPT_TIMESTAMP: u8 = 4;
pub(crate) const OPT_EXTENDED_SECURITY: u8 = 5;
pub(crate) const OPT_RECORD_ROUTE: u8 = 7;
pub(crate) const OPT_STRICT_SR: u8 = 9;

/// Context an end host supplies when decoding options, since Loose-SR,
/// Record-Route, and Timestamp options may need to append this host's own
/// information.
#[derive(Debug, Clone, Copy)]
pub struct OptionDecodeCtx {
    pub local_addr: Ipv4Addr,
    pub now: u32,
}

/// Decodes `raw` (the option region of a received header, `ip_hdr_len - 20`
/// bytes) into a scratch copy, applying in-place host-order conversion and
/// route/timestamp-recording side effects. On error, returns the failing
/// [`OptionError`] and the byte offset (relative to the start of the option
/// region) a Parameter Problem reply should point at.
pub fn decode(raw: &[u8], ctx: OptionDecodeCtx) -> Result<ArrayVec<u8, MAX_OPTIONS_LEN>, (OptionError, usize)> {
    assert!(raw.len() <= MAX_OPTIONS_LEN);
    assert_eq!(raw.len() % 4, 0, "option region must be word-aligned");

    let mut scratch: ArrayVec<u8, MAX_OPTIONS_LEN> = ArrayVec::new();
    scratch.try_extend_from_slice(raw).expect("bounded by assert above");

    let mut cursor = 0usize;
    let mut seen_route = false;
    let mut seen_timestamp = false;

    while cursor < scratch.len() {
        let opt_type = scratch[cursor];
        match opt_type {
            OPT_END_OF_LIST => break,
            OPT_NOP => cursor += 1,
            OPT_LOOSE_SR | OPT_STRICT_SR | OPT_RECORD_ROUTE => {
                if seen_route {
                    return Err((OptionError::InvalidOptRoute, cursor));
                }
                seen_route = true;
                cursor = decode_route(&mut scratch, cursor, ctx.local_addr)?;
            }
            OPT_TIMESTAMP => {
                if seen_timestamp {
                    return Err((OptionError::InvalidOptRoute, cursor));
                }
                seen_timestamp = true;
                cursor = decode_timestamp(&mut scratch, cursor, ctx)?;
            }
            OPT_SECURITY | OPT_EXTENDED_SECURITY => {
                let len = *scratch.get(cursor + 1).ok_or((OptionError::InvalidOptLen, cursor))? as usize;
                if len < 3 {
                    return Err((OptionError::InvalidOptLen, cursor));
                }
                if cursor + len > scratch.len() {
                    return Err((OptionError::InvalidOptLen, cursor));
                }
                cursor += len;
            }
            _ => {
                let len = *scratch.get(cursor + 1).ok_or((OptionError::InvalidOptLen, cursor))? as usize;
                if len == 0 {
                    return Err((OptionError::InvalidOptLen, cursor));
                }
                if cursor + len > scratch.len() {
                    return Err((OptionError::InvalidOptLen, cursor));
                }
                cursor += len;
            }
        }
    }

    Ok(scratch)
}

fn decode_route(
    scratch: &mut ArrayVec<u8, MAX_OPTIONS_LEN>,
    start: usize,
    local_addr: Ipv4Addr,
) -> Result<usize, (OptionError, usize)> {
    let opt_type = scratch[start];
    let len = *scratch.get(start + 1).ok_or((OptionError::InvalidOptLen, start))? as usize;
    let ptr = *scratch.get(start + 2).ok_or((OptionError::InvalidOptLen, start))? as usize;

    if ptr < 4 {
        return Err((OptionError::InvalidOptRoute, start));
    }
    if len % 4 != 0 {
        return Err((OptionError::InvalidOptLen, start));
    }
    if start + len > scratch.len() {
        return Err((OptionError::InvalidOptLen, start));
    }

    // Convert each recorded address into this process's native
    // representation: the wire bytes are already a valid `Ipv4Addr`, so the
    // "conversion" is simply re-reading them through the same helper the
    // header src/dst fields use, rather than a no-op left untouched. Route
    // data begins right after the 3-byte type/len/ptr header; `ptr` is
    // 1-based within the option, so the 0-based index of the next free slot
    // is `ptr - 1`.
    let mut off = start + 3;
    let next_free = start + ptr - 1;
    while off + 4 <= next_free {
        let _addr = Ipv4Addr::from(checksum::read_u32(scratch, off));
        off += 4;
    }

    // Loose-SR and Record-Route append this host's address when there is
    // room; Strict-SR does not (this host is the final hop of a strict
    // route and does not extend it).
    let appends = opt_type == OPT_LOOSE_SR || opt_type == OPT_RECORD_ROUTE;
    let start_ptr = next_free;
    if appends && ptr < len && start_ptr + 4 <= start + len {
        scratch[start_ptr..start_ptr + 4].copy_from_slice(&local_addr.octets());
        scratch[start + 2] = (ptr + 4) as u8;
    }

    Ok(start + len)
}

fn decode_timestamp(
    scratch: &mut ArrayVec<u8, MAX_OPTIONS_LEN>,
    start: usize,
    ctx: OptionDecodeCtx,
) -> Result<usize, (OptionError, usize)> {
    let len = *scratch.get(start + 1).ok_or((OptionError::InvalidOptLen, start))? as usize;
    let ptr = *scratch.get(start + 2).ok_or((OptionError::InvalidOptLen, start))? as usize;
    let oflw_flg = *scratch.get(start + 3).ok_or((OptionError::InvalidOptLen, start))?;
    let overflow = oflw_flg >> 4;
    let flag = oflw_flg & 0x0f;

    if start + len > scratch.len() {
        return Err((OptionError::InvalidOptLen, start));
    }

    let with_route = match flag {
        0 => {
            if len % 4 != 0 {
                return Err((OptionError::InvalidOptLen, start));
            }
            false
        }
        1 | 3 => {
            if len % 8 != 4 {
                return Err((OptionError::InvalidOptLen, start));
            }
            true
        }
        _ => return Err((OptionError::InvalidOptFlag, start)),
    };

    let entry_len: usize = if with_route { 8 } else { 4 };
    let start_ptr = start + ptr.saturating_sub(1);

    if ptr < len as u8 as usize && start_ptr + entry_len <= start + len {
        let mut off = start_ptr;
        if with_route {
            scratch[off..off + 4].copy_from_slice(&ctx.local_addr.octets());
            off += 4;
        }
        checksum::write_u32(scratch, off, ctx.now);
        scratch[start + 2] = (ptr + entry_len) as u8;
    } else {
        let bumped = (overflow + 1).min(15);
        scratch[start + 3] = (bumped << 4) | flag;
    }

    Ok(start + len)
}

/// Word-pads `opts` with option 0 (End of List) up to a multiple of 4
/// bytes.
pub fn pad_to_word(opts: &mut ArrayVec<u8, MAX_OPTIONS_LEN>) {
    while opts.len() % 4 != 0 {
        opts.push(OPT_END_OF_LIST);
    }
}
