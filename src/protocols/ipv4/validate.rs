// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Packet validator: decodes and validates one received
//! IPv4 header (and its options) against buffer, interface, and
//! address-table state, in the order spec'd by RFC 791/1122.
//!
//! Every step below is a distinct failure mode so the caller can count a
//! per-reason error metric and, for a handful of them, emit an ICMP error
//! back to the sender. Nothing here mutates the wire bytes of the header
//! before the checksum is checked in step 6 — the checksum must be
//! validated entirely before or entirely after any in-header byte-order
//! conversion, never in between, which is kept by reading
//! tot_len/src/dest into local variables rather than converting them in
//! place.

use crate::protocols::checksum;
use crate::protocols::ipv4::addr_table::{self, AddrTables};
use crate::protocols::ipv4::header::{IPV4_MAX_HDR_LEN, IPV4_MIN_HDR_LEN, IPV4_VERSION};
use crate::protocols::ipv4::options::{self, OptionDecodeCtx};
use crate::protocols::ipv4::types::{FlagsFragOffset, Protocol};
use crate::runtime::fail::{OptionError, ValidateError};
use crate::runtime::memory::{BufferFlags, PacketBuffer, ProtocolHdrType, LOCAL_HOST};
use crate::runtime::network::config::Ipv4Config;
use ::std::convert::TryFrom;
use ::std::net::Ipv4Addr;

/// Everything the validator needs besides the buffer itself.
pub struct ValidateCtx<'a> {
    pub addr_tables: &'a AddrTables,
    pub cfg: &'a Ipv4Config,
    /// This host's own address, used to extend Loose-SR/Record-Route/
    /// Timestamp options. Typically the destination address once
    /// it is known to be one of ours.
    pub now: u32,
}

/// A validation failure. Most steps produce a plain [`ValidateError`];
/// option decoding additionally carries the byte offset (relative to the
/// start of the IP header) a Parameter Problem reply should point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateFailure {
    Hdr(ValidateError),
    Opt(OptionError, u8),
}

impl From<ValidateError> for ValidateFailure {
    fn from(e: ValidateError) -> Self {
        ValidateFailure::Hdr(e)
    }
}

/// Validates and decodes the IPv4 header at `buf.ip_hdr_ix`, in place.
/// On success, `buf`'s cached fields (`ip_tot_len`, `ip_hdr_len`, ...) and
/// header-offset cursors are populated and `data_len` has been truncated
/// to the header + payload. On failure, `buf` is left exactly as received
/// except for whatever fields the successful prefix of steps already set
/// — the caller discards the buffer either way.
pub fn validate(buf: &mut PacketBuffer, ctx: ValidateCtx) -> Result<(), ValidateFailure> {
    // Step 1: buffer-shape preconditions.
    if buf.data_len == 0 {
        return Err(ValidateError::NotReceiveBuffer.into());
    }
    let ix = buf.ip_hdr_ix.ok_or(ValidateError::NoIpHeader)?;
    if buf.protocol_hdr_type != ProtocolHdrType::Ipv4 {
        return Err(ValidateError::WrongProtocolHdrType.into());
    }
    if buf.data_len < ix + IPV4_MIN_HDR_LEN as usize {
        return Err(ValidateError::InvalidDataLen.into());
    }

    // Step 2: read tot_len/src/dest in host order without mutating the
    // wire bytes (the checksum in step 6 still sees the untouched header).
    let tot_len = checksum::read_u16(&buf.data, ix + 2);
    let src = Ipv4Addr::from(checksum::read_u32(&buf.data, ix + 12));
    let dest = Ipv4Addr::from(checksum::read_u32(&buf.data, ix + 16));

    // Step 3: version.
    let version = buf.data[ix] >> 4;
    if version != IPV4_VERSION {
        return Err(ValidateError::InvalidVersion.into());
    }

    // Step 4: header length.
    let hdr_len = (buf.data[ix] & 0x0f) * 4;
    if hdr_len < IPV4_MIN_HDR_LEN || hdr_len > IPV4_MAX_HDR_LEN {
        return Err(ValidateError::InvalidHdrLen.into());
    }

    // Step 5: total length.
    if (tot_len as usize) < hdr_len as usize || (tot_len as usize) > buf.data_len - ix {
        return Err(ValidateError::InvalidTotLen.into());
    }
    buf.data_len = ix + tot_len as usize;

    // Step 6: checksum, over the untouched wire header.
    if !ctx.cfg.chk_sum_offload_rx && !checksum::verify16(&buf.data[ix..ix + hdr_len as usize]) {
        return Err(ValidateError::InvalidChkSum.into());
    }

    // Step 7: ID, flags + fragment offset.
    let id = checksum::read_u16(&buf.data, ix + 4);
    let flags_frag_raw = checksum::read_u16(&buf.data, ix + 6);
    let flags = FlagsFragOffset::decode(flags_frag_raw);
    if flags.reserved {
        return Err(ValidateError::InvalidFlag.into());
    }
    let data_len_after_hdr = tot_len as usize - hdr_len as usize;
    if flags.dont_fragment && (flags.more_fragments || flags.fragment_offset != 0) {
        return Err(ValidateError::InvalidFlag.into());
    }
    if flags.more_fragments && data_len_after_hdr % 8 != 0 {
        return Err(ValidateError::InvalidFrag.into());
    }

    // Step 8: protocol.
    let protocol_byte = buf.data[ix + 9];
    let protocol = Protocol::try_from(protocol_byte).map_err(ValidateFailure::from)?;

    // Step 9: options.
    let opt_len = hdr_len as usize - IPV4_MIN_HDR_LEN as usize;
    if opt_len > 0 {
        let opt_ctx = OptionDecodeCtx {
            local_addr: dest,
            now: ctx.now,
        };
        let decoded_opts = options::decode(
            &buf.data[ix + IPV4_MIN_HDR_LEN as usize..ix + hdr_len as usize],
            opt_ctx,
        );
        match decoded_opts {
            Ok(decoded) => {
                buf.data[ix + IPV4_MIN_HDR_LEN as usize..ix + hdr_len as usize]
                    .copy_from_slice(&decoded);
            }
            Err((e, offset)) => {
                return Err(ValidateFailure::Opt(e, IPV4_MIN_HDR_LEN + offset as u8));
            }
        }
    }

    // Step 10: source address.
    validate_source(buf.flags, src)?;

    // Step 11/12: destination address + broadcast/multicast consistency.
    let dest_class = classify_dest(ctx.addr_tables, buf.if_nbr, dest)?;
    check_broadcast_consistency(buf.flags, dest, dest_class)?;
    check_remote_loopback_consistency(buf.if_nbr, buf.flags, dest_class)?;

    // Header is now trusted; cache decoded fields.
    buf.ip_tot_len = tot_len;
    buf.ip_hdr_len = hdr_len;
    buf.ip_data_len = data_len_after_hdr as u16;
    buf.ip_datagram_len = tot_len;
    buf.ip_id = id;
    buf.ip_flags_frag_offset = flags_frag_raw;
    buf.ip_addr_src = src;
    buf.ip_addr_dest = dest;

    // Step 13: protocol-header indexing.
    let hdr_type = match protocol {
        Protocol::Icmpv4 => ProtocolHdrType::Icmpv4,
        Protocol::Igmp => ProtocolHdrType::Igmp,
        Protocol::Udp => ProtocolHdrType::Udpv4,
        Protocol::Tcp => ProtocolHdrType::Tcpv4,
    };
    buf.protocol_hdr_type = hdr_type;
    buf.protocol_hdr_type_net_sub = if opt_len > 0 {
        ProtocolHdrType::Ipv4Opt
    } else {
        ProtocolHdrType::Ipv4
    };
    let payload_ix = ix + hdr_len as usize;
    match hdr_type {
        ProtocolHdrType::Icmpv4 => buf.icmp_ix = Some(payload_ix),
        ProtocolHdrType::Igmp => buf.igmp_ix = Some(payload_ix),
        ProtocolHdrType::Udpv4 | ProtocolHdrType::Tcpv4 => buf.transport_ix = Some(payload_ix),
        _ => unreachable!("hdr_type is one of the four matched above"),
    }
    buf.data_len = data_len_after_hdr;

    Ok(())
}

/// Step 10: reject a source address RFC 1122 says a received datagram may
/// never carry.
fn validate_source(flags: BufferFlags, src: Ipv4Addr) -> Result<(), ValidateFailure> {
    if src == Ipv4Addr::UNSPECIFIED {
        return if flags.has(BufferFlags::RX_REMOTE) {
            Err(ValidateError::InvalidAddrSrc.into())
        } else {
            Ok(())
        };
    }
    if src == Ipv4Addr::BROADCAST {
        return Err(ValidateError::InvalidAddrSrc.into());
    }
    if src.octets()[0] == 127 {
        return if flags.has(BufferFlags::RX_REMOTE) {
            Err(ValidateError::InvalidAddrSrc.into())
        } else {
            Ok(())
        };
    }
    if src.is_multicast() {
        return Err(ValidateError::InvalidAddrSrc.into());
    }
    if !addr_table::is_valid_host_addr(src) {
        return Err(ValidateError::InvalidAddrSrc.into());
    }
    Ok(())
}

/// The category a destination address falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestClass {
    ConfiguredHost,
    Multicast,
    Loopback,
    LimitedBroadcast,
    ClassDirectedBroadcast,
    SubnetDirectedBroadcast,
}

fn classify_dest(
    addr_tables: &AddrTables,
    if_nbr: u8,
    dest: Ipv4Addr,
) -> Result<DestClass, ValidateFailure> {
    if addr_tables.lookup_on_if(if_nbr, dest).is_some() {
        return Ok(DestClass::ConfiguredHost);
    }
    if dest.is_multicast() {
        return Ok(DestClass::Multicast);
    }
    if dest.octets()[0] == 127 {
        if if_nbr == LOCAL_HOST {
            return Ok(DestClass::Loopback);
        }
        return Err(ValidateError::InvalidAddrDest.into());
    }
    if dest == Ipv4Addr::BROADCAST {
        return Ok(DestClass::LimitedBroadcast);
    }
    if addr_table::classful_broadcast(dest) == Some(dest) {
        return Ok(DestClass::ClassDirectedBroadcast);
    }
    if addr_tables
        .get_all(if_nbr)
        .iter()
        .any(|e| e.is_directed_broadcast(dest))
    {
        return Ok(DestClass::SubnetDirectedBroadcast);
    }
    Err(ValidateError::InvalidAddrDest.into())
}

/// Step 12: the link layer's broadcast/multicast flags must agree with
/// what the IP destination actually is.
fn check_broadcast_consistency(
    flags: BufferFlags,
    dest: Ipv4Addr,
    class: DestClass,
) -> Result<(), ValidateFailure> {
    let is_ip_broadcast = matches!(
        class,
        DestClass::LimitedBroadcast | DestClass::ClassDirectedBroadcast | DestClass::SubnetDirectedBroadcast
    );
    let is_ip_multicast = dest.is_multicast();
    if is_ip_broadcast != flags.has(BufferFlags::RX_BROADCAST) {
        return Err(ValidateError::InvalidAddrBroadcast.into());
    }
    if is_ip_multicast != flags.has(BufferFlags::RX_MULTICAST) {
        return Err(ValidateError::InvalidAddrBroadcast.into());
    }
    Ok(())
}

/// `RX_REMOTE` must agree with the receiving interface's identity: remote
/// packets never arrive on loopback, and a loopback destination is only
/// legal via the loopback interface (already enforced in `classify_dest`,
/// repeated here against the flag rather than the interface number alone).
fn check_remote_loopback_consistency(
    if_nbr: u8,
    flags: BufferFlags,
    class: DestClass,
) -> Result<(), ValidateFailure> {
    if if_nbr == LOCAL_HOST && flags.has(BufferFlags::RX_REMOTE) {
        return Err(ValidateError::InvalidAddrDest.into());
    }
    if class == DestClass::Loopback && if_nbr != LOCAL_HOST {
        return Err(ValidateError::InvalidAddrDest.into());
    }
    Ok(())
}
