// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Minimal ICMPv4 error sender (RFC 792).
//!
//! Only the three error messages the validator and reassembly engine
//! themselves depend on are implemented: Destination Unreachable
//! (Protocol), Parameter Problem, and Time Exceeded (Fragment Reassembly).
//! A general ICMP receive path (echo reply, redirect, ...) is out of
//! scope; [`receive`] exists only to satisfy [`DemuxTarget`] and logs
//! anything it is handed.

use crate::protocols::ipv4::addr_table::AddrTables;
use crate::protocols::ipv4::demux::DemuxTarget;
use crate::protocols::ipv4::transmit::{self, IdCounter, TxFlags, TTL_USE_DEFAULT};
use crate::protocols::ipv4::types::Protocol;
use crate::runtime::fail::Error;
use crate::runtime::memory::PacketBuffer;
use crate::runtime::network::config::Ipv4Config;
use crate::runtime::network::NetworkRuntime;
use ::arrayvec::ArrayVec;

const TYPE_DEST_UNREACHABLE: u8 = 3;
const CODE_PROTOCOL_UNREACHABLE: u8 = 2;
const TYPE_TIME_EXCEEDED: u8 = 11;
const CODE_FRAG_REASM_TIME_EXCEEDED: u8 = 1;
const TYPE_PARAMETER_PROBLEM: u8 = 12;
const CODE_POINTER_INDICATES_ERROR: u8 = 0;

/// Max ICMP error payload: 8-byte ICMP header + 60-byte IP header (with
/// options) + 8 bytes of the original datagram's data.
const MAX_ERR_LEN: usize = 8 + 60 + 8;

fn original_ip_and_data(original: &PacketBuffer) -> ArrayVec<u8, { 60 + 8 }> {
    let ix = original.ip_hdr_ix.unwrap_or(0);
    let hdr_len = original.ip_hdr_len.max(20) as usize;
    let end = original.data.len().min(ix + hdr_len + 8);
    let mut out = ArrayVec::new();
    out.try_extend_from_slice(&original.data[ix..end]).ok();
    out
}

fn build_and_send(
    addr_tables: &AddrTables,
    rt: &mut dyn NetworkRuntime,
    id_counter: &IdCounter,
    cfg: &Ipv4Config,
    if_nbr: u8,
    icmp_type: u8,
    icmp_code: u8,
    word4: u32,
    original: &PacketBuffer,
) {
    let embedded = original_ip_and_data(original);
    let mut msg: ArrayVec<u8, MAX_ERR_LEN> = ArrayVec::new();
    msg.push(icmp_type);
    msg.push(icmp_code);
    msg.push(0); // checksum high byte, filled below
    msg.push(0); // checksum low byte
    msg.try_extend_from_slice(&word4.to_be_bytes()).ok();
    msg.try_extend_from_slice(&embedded).ok();

    let sum = crate::protocols::checksum::checksum16(&msg);
    msg[2] = (sum >> 8) as u8;
    msg[3] = (sum & 0xff) as u8;

    let src = addr_tables
        .get_source_for(original.ip_addr_src)
        .unwrap_or(original.ip_addr_dest);

    if let Err(e) = transmit::tx(
        addr_tables,
        rt,
        id_counter,
        cfg,
        if_nbr,
        Protocol::Icmpv4,
        src,
        original.ip_addr_src,
        0,
        TTL_USE_DEFAULT,
        TxFlags::empty(),
        &[],
        &msg,
    ) {
        log::warn!("failed to send ICMPv4 error {}/{}: {:?}", icmp_type, icmp_code, e);
    }
}

/// Sends Destination Unreachable (Protocol), for an IP datagram whose
/// protocol field names no compiled-in upper-layer receiver.
pub fn send_dest_unreachable_protocol(
    addr_tables: &AddrTables,
    rt: &mut dyn NetworkRuntime,
    id_counter: &IdCounter,
    cfg: &Ipv4Config,
    if_nbr: u8,
    original: &PacketBuffer,
) {
    build_and_send(
        addr_tables,
        rt,
        id_counter,
        cfg,
        if_nbr,
        TYPE_DEST_UNREACHABLE,
        CODE_PROTOCOL_UNREACHABLE,
        0,
        original,
    );
}

/// Sends Parameter Problem, pointing at `pointer` (the byte offset within
/// the IP header/options the validator rejected).
pub fn send_parameter_problem(
    addr_tables: &AddrTables,
    rt: &mut dyn NetworkRuntime,
    id_counter: &IdCounter,
    cfg: &Ipv4Config,
    if_nbr: u8,
    pointer: u8,
    original: &PacketBuffer,
) {
    let word4 = (pointer as u32) << 24;
    build_and_send(
        addr_tables,
        rt,
        id_counter,
        cfg,
        if_nbr,
        TYPE_PARAMETER_PROBLEM,
        CODE_POINTER_INDICATES_ERROR,
        word4,
        original,
    );
}

/// Sends Time Exceeded (Fragment Reassembly), for a reassembly list whose
/// timer fired before completion. `original` is the list's head buffer.
pub fn send_time_exceeded_frag_reassembly(
    addr_tables: &AddrTables,
    rt: &mut dyn NetworkRuntime,
    id_counter: &IdCounter,
    cfg: &Ipv4Config,
    if_nbr: u8,
    original: &PacketBuffer,
) {
    build_and_send(
        addr_tables,
        rt,
        id_counter,
        cfg,
        if_nbr,
        TYPE_TIME_EXCEEDED,
        CODE_FRAG_REASM_TIME_EXCEEDED,
        0,
        original,
    );
}

/// Stand-in receive entry so ICMPv4 can sit in the [`DemuxTarget`] table.
/// Echo request/reply and other informational messages are out of scope.
pub struct Icmpv4Target;

impl DemuxTarget for Icmpv4Target {
    fn receive(&mut self, buf: PacketBuffer) -> Result<(), Error> {
        log::debug!("icmpv4: received message, no handler installed ({} bytes)", buf.data_len);
        Ok(())
    }
}
