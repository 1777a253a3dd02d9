// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! IPv4 header representation and wire encode/decode primitives.
//!
//! A plain struct plus `new`/`serialize`, generalized to variable-length
//! options (20..=60 bytes) rather than a fixed 20-byte-only header.
//! Field-by-field *validation* lives in `validate.rs`, not here — this
//! module only knows how to lay bytes out and read them back for an
//! already-trusted header.

use crate::protocols::checksum;
use crate::protocols::ipv4::types::FlagsFragOffset;
use ::std::net::Ipv4Addr;

/// Minimum IPv4 header length, in bytes (no options).
pub const IPV4_MIN_HDR_LEN: u8 = 20;
/// Maximum IPv4 header length, in bytes (IHL field maxes out at 15 words).
pub const IPV4_MAX_HDR_LEN: u8 = 60;
/// IPv4 version number.
pub const IPV4_VERSION: u8 = 4;
/// Default time-to-live used when the caller asks for "the default".
pub const DEFAULT_UNICAST_TTL: u8 = 128;
/// Default time-to-live for multicast destinations.
pub const DEFAULT_MULTICAST_TTL: u8 = 1;

/// A decoded (or about-to-be-encoded) IPv4 header, excluding options —
/// options are carried separately as a byte block (see `options.rs`)
/// because encode/decode of option contents has entirely different rules
/// from the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Internet Header Length, in 32-bit words (5..=15).
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_frag_offset: FlagsFragOffset,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    /// Builds a header for transmission with sane unicast defaults,
    /// generalized with a caller-supplied option length.
    pub fn new(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, protocol: u8, opt_len: u8) -> Self {
        Self {
            version: IPV4_VERSION,
            ihl: (IPV4_MIN_HDR_LEN + opt_len) / 4,
            tos: 0,
            total_length: (IPV4_MIN_HDR_LEN + opt_len) as u16,
            identification: 0,
            flags_frag_offset: FlagsFragOffset {
                reserved: false,
                dont_fragment: false,
                more_fragments: false,
                fragment_offset: 0,
            },
            ttl: DEFAULT_UNICAST_TTL,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
        }
    }

    pub fn hdr_len(&self) -> u8 {
        self.ihl * 4
    }

    /// Serializes the fixed header plus `options` (already in wire order,
    /// word-padded by the caller) into `buf`, computing and writing the
    /// checksum unless `chk_sum_offload` delegates that to hardware
    /// (`CHK_SUM_OFFLOAD_TX`).
    pub fn serialize(&self, buf: &mut [u8], options: &[u8], chk_sum_offload: bool) {
        let hdr_len = self.hdr_len() as usize;
        assert_eq!(hdr_len, IPV4_MIN_HDR_LEN as usize + options.len());
        assert!(buf.len() >= hdr_len);

        buf[0] = (self.version << 4) | self.ihl;
        buf[1] = self.tos;
        checksum::write_u16(buf, 2, self.total_length);
        checksum::write_u16(buf, 4, self.identification);
        checksum::write_u16(buf, 6, self.flags_frag_offset.encode());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        checksum::write_u16(buf, 10, 0); // zeroed until computed below
        buf[12..16].copy_from_slice(&self.src_addr.octets());
        buf[16..20].copy_from_slice(&self.dst_addr.octets());
        buf[20..hdr_len].copy_from_slice(options);

        if !chk_sum_offload {
            let sum = checksum::checksum16(&buf[..hdr_len]);
            checksum::write_u16(buf, 10, sum);
        }
    }
}
