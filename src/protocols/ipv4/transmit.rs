// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Transmit preparation: argument validation, option
//! emission, header synthesis, checksum, MTU check, and route selection
//! down to a driver transmit primitive.

use crate::protocols::checksum;
use crate::protocols::ipv4::addr_table::AddrTables;
use crate::protocols::ipv4::header::{Ipv4Header, DEFAULT_MULTICAST_TTL, DEFAULT_UNICAST_TTL, IPV4_MIN_HDR_LEN};
use crate::protocols::ipv4::options::{self, MAX_OPTIONS_LEN};
use crate::protocols::ipv4::types::{FlagsFragOffset, Protocol};
use crate::runtime::fail::TxError;
use crate::runtime::memory::PacketBuffer;
use crate::runtime::network::config::Ipv4Config;
use crate::runtime::network::NetworkRuntime;
use crate::runtime::sync::CriticalSection;
use ::arrayvec::ArrayVec;
use ::std::cell::Cell;
use ::std::net::Ipv4Addr;

/// `TTL=0` sentinel meaning "substitute the protocol default".
pub const TTL_USE_DEFAULT: u8 = 0;

/// Transmit-time flag bits. Only `DONT_FRAG` is meaningful since this
/// engine never performs transmit-side fragmentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxFlags(u8);

impl TxFlags {
    pub const DONT_FRAG: u8 = 1 << 0;

    pub fn empty() -> Self {
        TxFlags(0)
    }

    pub fn with(mut self, bit: u8) -> Self {
        self.0 |= bit;
        self
    }

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// Monotonically increasing IPv4 identification counter, process-wide,
/// guarded by a short critical section rather than by the network lock
/// (it may be bumped from a retransmit path re-entered outside a normal
/// configuration call).
#[derive(Default)]
pub struct IdCounter(Cell<u16>);

impl IdCounter {
    pub fn new() -> Self {
        Self(Cell::new(0))
    }

    pub fn next(&self) -> u16 {
        CriticalSection::enter(|| {
            let id = self.0.get();
            self.0.set(id.wrapping_add(1));
            id
        })
    }
}

/// Where a prepared datagram is actually sent, per the route-selection
/// table. Multicast and broadcast both go out the sending interface; the
/// distinction is carried for the driver's link-layer destination-address
/// framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    LocalHost,
    Broadcast { if_nbr: u8 },
    Multicast { if_nbr: u8 },
    HostThisNet { if_nbr: u8 },
    DfltGateway { if_nbr: u8, gateway: Ipv4Addr },
}

/// Picks where `dest` should actually go, given that `src` is configured
/// on `if_nbr`.
pub fn select_route(
    addr_tables: &AddrTables,
    if_nbr: u8,
    src: Ipv4Addr,
    dest: Ipv4Addr,
) -> Result<RouteDecision, TxError> {
    if addr_tables.lookup_any(dest).is_some() {
        return Ok(RouteDecision::LocalHost);
    }
    if dest.octets()[0] == 127 {
        return Ok(RouteDecision::LocalHost);
    }
    let is_link_local = |a: Ipv4Addr| a.octets()[0] == 169 && a.octets()[1] == 254;
    if is_link_local(dest) || is_link_local(src) {
        if dest == Ipv4Addr::new(169, 254, 255, 255) {
            return Ok(RouteDecision::Broadcast { if_nbr });
        }
        return Ok(RouteDecision::HostThisNet { if_nbr });
    }
    if dest == Ipv4Addr::BROADCAST {
        return Ok(RouteDecision::Broadcast { if_nbr });
    }
    if dest.octets()[0] >= 224 && dest.octets()[0] <= 239 {
        return Ok(RouteDecision::Multicast { if_nbr });
    }
    if let Some(entry) = addr_tables.lookup_on_if(if_nbr, src) {
        if u32::from(dest) & u32::from(entry.mask) == u32::from(entry.subnet_net) {
            if entry.is_directed_broadcast(dest) {
                return Ok(RouteDecision::Broadcast { if_nbr });
            }
            return Ok(RouteDecision::HostThisNet { if_nbr });
        }
        if entry.dflt_gateway != Ipv4Addr::UNSPECIFIED {
            return Ok(RouteDecision::DfltGateway {
                if_nbr,
                gateway: entry.dflt_gateway,
            });
        }
    }
    Err(TxError::TxDestInvalid)
}

/// Counts Route/Timestamp option occurrences in an already-encoded option
/// block, rejecting more than one of either per packet.
fn check_opts_single_route_and_timestamp(opts: &[u8]) -> Result<(), TxError> {
    let mut seen_route = false;
    let mut seen_timestamp = false;
    let mut cursor = 0usize;
    while cursor < opts.len() {
        match opts[cursor] {
            options::OPT_END_OF_LIST => break,
            options::OPT_NOP => cursor += 1,
            t @ (options::OPT_LOOSE_SR | options::OPT_STRICT_SR | options::OPT_RECORD_ROUTE) => {
                if seen_route {
                    return Err(TxError::InvalidOptCfg);
                }
                seen_route = true;
                let len = *opts.get(cursor + 1).ok_or(TxError::InvalidOptLen)? as usize;
                let _ = t;
                cursor += len.max(1);
            }
            options::OPT_TIMESTAMP => {
                if seen_timestamp {
                    return Err(TxError::InvalidOptCfg);
                }
                seen_timestamp = true;
                let len = *opts.get(cursor + 1).ok_or(TxError::InvalidOptLen)? as usize;
                cursor += len.max(1);
            }
            _ => {
                let len = *opts.get(cursor + 1).ok_or(TxError::InvalidOptLen)? as usize;
                cursor += len.max(1);
            }
        }
    }
    Ok(())
}

/// Builds and hands a fully-prepared outbound datagram to the driver.
///
/// `ttl` of [`TTL_USE_DEFAULT`] substitutes the protocol default (unicast
/// 128, multicast 1) before any validation runs, per the sentinel-before-
/// validation design. `opts` is an already wire-encoded, not yet
/// word-padded option block.
#[allow(clippy::too_many_arguments)]
pub fn tx(
    addr_tables: &AddrTables,
    rt: &mut dyn NetworkRuntime,
    id_counter: &IdCounter,
    cfg: &Ipv4Config,
    if_nbr: u8,
    protocol: Protocol,
    src: Ipv4Addr,
    dest: Ipv4Addr,
    tos: u8,
    ttl: u8,
    flags: TxFlags,
    opts: &[u8],
    payload: &[u8],
) -> Result<(), TxError> {
    if tos & 0x03 != 0 {
        return Err(TxError::InvalidTos);
    }
    if flags.0 & !TxFlags::DONT_FRAG != 0 {
        return Err(TxError::InvalidFlag);
    }

    let dest_class_d = dest.octets()[0] >= 224 && dest.octets()[0] <= 239;
    let ttl = match ttl {
        TTL_USE_DEFAULT if dest_class_d => DEFAULT_MULTICAST_TTL,
        TTL_USE_DEFAULT => DEFAULT_UNICAST_TTL,
        t => t,
    };
    if ttl == 0 {
        return Err(TxError::InvalidTtl);
    }

    if addr_tables.lookup_on_if(if_nbr, src).is_none()
        && src != Ipv4Addr::UNSPECIFIED
        && !(src.octets()[0] == 127)
    {
        return Err(TxError::InvalidAddrSrc);
    }

    if opts.len() > MAX_OPTIONS_LEN {
        return Err(TxError::InvalidOptLen);
    }
    check_opts_single_route_and_timestamp(opts)?;
    let mut padded: ArrayVec<u8, MAX_OPTIONS_LEN> = ArrayVec::new();
    padded.try_extend_from_slice(opts).map_err(|_| TxError::InvalidOptLen)?;
    options::pad_to_word(&mut padded);

    let route = select_route(addr_tables, if_nbr, src, dest)?;

    let hdr_len = IPV4_MIN_HDR_LEN as usize + padded.len();
    if hdr_len + payload.len() > rt.mtu(if_nbr) as usize {
        return Err(TxError::InvalidFrag);
    }

    let mut hdr = Ipv4Header::new(src, dest, protocol.into(), padded.len() as u8);
    hdr.tos = tos;
    hdr.ttl = ttl;
    hdr.identification = id_counter.next();
    hdr.total_length = (hdr_len + payload.len()) as u16;
    hdr.flags_frag_offset = FlagsFragOffset {
        reserved: false,
        dont_fragment: flags.has(TxFlags::DONT_FRAG),
        more_fragments: false,
        fragment_offset: 0,
    };

    let mut buf = PacketBuffer::default();
    hdr.serialize(&mut buf.data[..hdr_len], &padded, cfg.chk_sum_offload_tx);
    buf.data[hdr_len..hdr_len + payload.len()].copy_from_slice(payload);
    buf.data_len = hdr_len + payload.len();
    buf.tot_len = buf.data_len;
    buf.ip_hdr_ix = Some(0);
    buf.ip_hdr_len = hdr_len as u8;
    buf.ip_addr_src = src;
    buf.ip_addr_dest = dest;
    buf.if_nbr_tx = if_nbr;
    buf.ip_addr_next_route = match route {
        RouteDecision::LocalHost => Ipv4Addr::LOCALHOST,
        RouteDecision::Broadcast { .. } => Ipv4Addr::BROADCAST,
        RouteDecision::Multicast { .. } => dest,
        RouteDecision::HostThisNet { .. } => dest,
        RouteDecision::DfltGateway { gateway, .. } => gateway,
    };

    rt.transmit(buf);
    Ok(())
}

/// Rebuilds and resends an already-prepared header with a fresh
/// identification value (RFC 1122 §3.2.1.5), recomputing the checksum.
pub fn retx(id_counter: &IdCounter, cfg: &Ipv4Config, buf: &mut PacketBuffer) {
    let hdr_len = buf.ip_hdr_len as usize;
    checksum::write_u16(&mut buf.data[..hdr_len], 4, id_counter.next());
    if !cfg.chk_sum_offload_tx {
        checksum::write_u16(&mut buf.data[..hdr_len], 10, 0);
        let sum = checksum::checksum16(&buf.data[..hdr_len]);
        checksum::write_u16(&mut buf.data[..hdr_len], 10, sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ipv4::addr_table::AddrTables;

    struct FakeRuntime {
        sent: Vec<PacketBuffer>,
        mtu: u16,
    }

    impl NetworkRuntime for FakeRuntime {
        fn transmit(&mut self, buf: PacketBuffer) {
            self.sent.push(buf);
        }
        fn receive(&mut self) -> Vec<PacketBuffer> {
            Vec::new()
        }
        fn mtu(&self, _if_nbr: u8) -> u16 {
            self.mtu
        }
    }

    fn host_with_gateway() -> AddrTables {
        let mut t = AddrTables::new();
        t.cfg_add_static(0, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();
        t
    }

    #[test]
    fn route_selection_matches_the_scenario_table() {
        let t = host_with_gateway();
        let src = Ipv4Addr::new(10, 0, 0, 2);
        assert_eq!(
            select_route(&t, 0, src, Ipv4Addr::new(10, 0, 0, 9)).unwrap(),
            RouteDecision::HostThisNet { if_nbr: 0 }
        );
        assert_eq!(
            select_route(&t, 0, src, Ipv4Addr::new(8, 8, 8, 8)).unwrap(),
            RouteDecision::DfltGateway { if_nbr: 0, gateway: Ipv4Addr::new(10, 0, 0, 1) }
        );
        assert_eq!(
            select_route(&t, 0, src, Ipv4Addr::new(10, 0, 0, 255)).unwrap(),
            RouteDecision::Broadcast { if_nbr: 0 }
        );
        assert_eq!(select_route(&t, 0, src, Ipv4Addr::new(127, 0, 0, 1)).unwrap(), RouteDecision::LocalHost);
    }

    #[test]
    fn tx_builds_a_verifiable_datagram() {
        let t = host_with_gateway();
        let mut rt = FakeRuntime { sent: Vec::new(), mtu: 1500 };
        let ids = IdCounter::new();
        let cfg = Ipv4Config::default();
        tx(
            &t,
            &mut rt,
            &ids,
            &cfg,
            0,
            Protocol::Udp,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 9),
            0,
            TTL_USE_DEFAULT,
            TxFlags::empty(),
            &[],
            b"hello",
        )
        .unwrap();
        assert_eq!(rt.sent.len(), 1);
        let sent = &rt.sent[0];
        assert!(checksum::verify16(sent.ip_header()));
        assert_eq!(sent.ip_addr_next_route, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn mtu_exceeded_is_rejected() {
        let t = host_with_gateway();
        let mut rt = FakeRuntime { sent: Vec::new(), mtu: 20 };
        let ids = IdCounter::new();
        let cfg = Ipv4Config::default();
        let err = tx(
            &t,
            &mut rt,
            &ids,
            &cfg,
            0,
            Protocol::Udp,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 9),
            0,
            TTL_USE_DEFAULT,
            TxFlags::empty(),
            &[],
            b"too much payload for this mtu",
        )
        .unwrap_err();
        assert_eq!(err, TxError::InvalidFrag);
    }
}
