// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Top-level orchestration: the single `rx()`/`tick()`/`tx()` surface that
//! wires the address tables, buffer pool, timer service, validator,
//! reassembly engine, demultiplexer, and transmit path together.
//!
//! There is exactly one of these per interface set — a real deployment
//! runs it from one cooperative network task, polling [`NetworkRuntime`]
//! for received buffers and a tick source for [`Engine::tick`].

use crate::protocols::icmpv4;
use crate::protocols::ipv4::addr_table::{AddrEntry, AddrTables, ConnectionOwner};
use crate::protocols::ipv4::demux::{Demux, DemuxTarget};
use crate::protocols::ipv4::reassembly::{ReassembleOutcome, ReassemblyEngine};
use crate::protocols::ipv4::transmit::{self, IdCounter, TxFlags, TTL_USE_DEFAULT};
use crate::protocols::ipv4::types::Protocol;
use crate::protocols::ipv4::validate::{self, ValidateCtx, ValidateFailure};
use crate::runtime::fail::{AddrCfgError, Error, ValidateError};
use crate::runtime::memory::{BufferPool, PacketBuffer};
use crate::runtime::network::config::Ipv4Config;
use crate::runtime::network::NetworkRuntime;
use crate::runtime::sync::NetLock;
use crate::runtime::timer::TimerService;
use ::std::net::Ipv4Addr;

/// Owns every piece of per-node IPv4 state; generic only over the
/// optional upper-layer receivers, so tests can link without a real
/// TCP/UDP stack.
pub struct Engine {
    addr_tables: AddrTables,
    /// Serializes every configuration-mutating entry point below against
    /// the network task, per §5's "global network lock" — reads (the
    /// validator's and transmit path's own `&AddrTables` borrows) stay
    /// lock-free and go straight at `addr_tables`.
    net_lock: NetLock<()>,
    pool: BufferPool,
    timers: TimerService,
    reassembly: ReassemblyEngine,
    id_counter: IdCounter,
    cfg: Ipv4Config,
    icmpv4: Option<Box<dyn DemuxTarget>>,
    igmp: Option<Box<dyn DemuxTarget>>,
    udp: Option<Box<dyn DemuxTarget>>,
    tcp: Option<Box<dyn DemuxTarget>>,
}

impl Engine {
    pub fn new(cfg: Ipv4Config) -> Self {
        let icmpv4: Option<Box<dyn DemuxTarget>> = if cfg.icmpv4_module_en {
            Some(Box::new(icmpv4::Icmpv4Target))
        } else {
            None
        };
        Self {
            addr_tables: AddrTables::with_max_per_if(cfg.max_per_if),
            net_lock: NetLock::new(()),
            pool: BufferPool::new(),
            timers: TimerService::new(),
            reassembly: ReassemblyEngine::new(),
            id_counter: IdCounter::new(),
            cfg,
            icmpv4,
            igmp: None,
            udp: None,
            tcp: None,
        }
    }

    /// Adds a statically-configured address on `if_nbr`. Serialized against
    /// the network task through the global network lock (§5).
    pub fn cfg_add_static(
        &mut self,
        if_nbr: u8,
        host: Ipv4Addr,
        mask: Ipv4Addr,
        dflt_gateway: Ipv4Addr,
    ) -> Result<(), AddrCfgError> {
        self.net_lock.with(|_| self.addr_tables.cfg_add_static(if_nbr, host, mask, dflt_gateway))
    }

    /// Installs an address negotiated during dynamic configuration.
    pub fn cfg_add_dynamic(
        &mut self,
        if_nbr: u8,
        host: Ipv4Addr,
        mask: Ipv4Addr,
        dflt_gateway: Ipv4Addr,
    ) -> Result<(), AddrCfgError> {
        self.net_lock.with(|_| self.addr_tables.cfg_add_dynamic(if_nbr, host, mask, dflt_gateway))
    }

    /// Begins dynamic address negotiation on `if_nbr`.
    pub fn cfg_dynamic_start(&mut self, if_nbr: u8) -> Result<(), AddrCfgError> {
        self.net_lock.with(|_| self.addr_tables.cfg_dynamic_start(if_nbr))
    }

    /// Aborts dynamic negotiation on `if_nbr`.
    pub fn cfg_dynamic_stop(&mut self, if_nbr: u8) -> Result<(), AddrCfgError> {
        self.net_lock.with(|_| self.addr_tables.cfg_dynamic_stop(if_nbr))
    }

    /// Removes one configured address, closing connections `owner` has
    /// bound to it first.
    pub fn cfg_remove(
        &mut self,
        if_nbr: u8,
        host: Ipv4Addr,
        owner: &dyn ConnectionOwner,
    ) -> Result<(), AddrCfgError> {
        self.net_lock.with(|_| self.addr_tables.cfg_remove(if_nbr, host, owner))
    }

    /// Removes every configured address on `if_nbr`.
    pub fn cfg_remove_all(&mut self, if_nbr: u8, owner: &dyn ConnectionOwner) {
        self.net_lock.with(|_| self.addr_tables.cfg_remove_all(if_nbr, owner))
    }

    /// Configured addresses on `if_nbr`. A plain read, not routed through
    /// the network lock — reads are lock-free per §5.
    pub fn addr_table(&self, if_nbr: u8) -> &[AddrEntry] {
        self.addr_tables.get_all(if_nbr)
    }

    /// Registers (or clears, with `None`) the IGMP demux target.
    pub fn set_igmp_target(&mut self, target: Option<Box<dyn DemuxTarget>>) {
        self.igmp = target;
    }

    /// Registers (or clears, with `None`) the UDP demux target.
    pub fn set_udp_target(&mut self, target: Option<Box<dyn DemuxTarget>>) {
        self.udp = target;
    }

    /// Registers (or clears, with `None`) the TCP demux target.
    pub fn set_tcp_target(&mut self, target: Option<Box<dyn DemuxTarget>>) {
        self.tcp = target;
    }

    /// Drains `rt`, validating, reassembling, and demultiplexing every
    /// buffer the driver has received since the last poll. Validation and
    /// reassembly failures are logged and the offending buffer (or list)
    /// is dropped; they never abort the batch.
    pub fn rx(&mut self, rt: &mut dyn NetworkRuntime, now: u64) {
        for buf in rt.receive() {
            self.rx_one(rt, buf, now);
        }
    }

    fn rx_one(&mut self, rt: &mut dyn NetworkRuntime, mut buf: PacketBuffer, now: u64) {
        let if_nbr = buf.if_nbr;
        let ctx = ValidateCtx {
            addr_tables: &self.addr_tables,
            cfg: &self.cfg,
            now,
        };
        if let Err(failure) = validate::validate(&mut buf, ctx) {
            self.handle_validate_failure(rt, if_nbr, &buf, failure);
            return;
        }

        let timeout_ticks = self.cfg.frag_reasm_timeout_sec as u64;
        let reassembled = self
            .reassembly
            .reassemble(&mut self.pool, &mut self.timers, buf, now, timeout_ticks);

        let complete = match reassembled {
            ReassembleOutcome::NonFragment(buf) => buf,
            ReassembleOutcome::Complete(buf) => buf,
            ReassembleOutcome::InProgress => return,
            ReassembleOutcome::Discard(e) => {
                log::warn!("reassembly: discarding on if {}: {:?}", if_nbr, e);
                return;
            }
        };

        self.demux(complete).unwrap_or_else(|e| {
            log::warn!("demux: dropping buffer on if {}: {:?}", if_nbr, e);
        });
    }

    fn handle_validate_failure(
        &mut self,
        rt: &mut dyn NetworkRuntime,
        if_nbr: u8,
        buf: &PacketBuffer,
        failure: ValidateFailure,
    ) {
        log::debug!("validate: rejecting buffer on if {}: {:?}", if_nbr, failure);
        match failure {
            ValidateFailure::Hdr(ValidateError::InvalidProtocol) => {
                icmpv4::send_dest_unreachable_protocol(&self.addr_tables, rt, &self.id_counter, &self.cfg, if_nbr, buf);
            }
            ValidateFailure::Opt(_, pointer) => {
                icmpv4::send_parameter_problem(&self.addr_tables, rt, &self.id_counter, &self.cfg, if_nbr, pointer, buf);
            }
            _ => {}
        }
    }

    fn demux(&mut self, buf: PacketBuffer) -> Result<(), Error> {
        let protocol = match buf.protocol_hdr_type {
            crate::runtime::memory::ProtocolHdrType::Icmpv4 => Protocol::Icmpv4,
            crate::runtime::memory::ProtocolHdrType::Igmp => Protocol::Igmp,
            crate::runtime::memory::ProtocolHdrType::Udpv4 => Protocol::Udp,
            crate::runtime::memory::ProtocolHdrType::Tcpv4 => Protocol::Tcp,
            other => {
                log::warn!("demux: buffer has no upper-layer protocol tag ({:?})", other);
                return Ok(());
            }
        };
        let mut demux = Demux::new(
            self.icmpv4.as_deref_mut(),
            self.igmp.as_deref_mut(),
            self.udp.as_deref_mut(),
            self.tcp.as_deref_mut(),
        );
        demux.dispatch(protocol, buf)
    }

    /// Advances reassembly-timeout bookkeeping, emitting ICMP Time
    /// Exceeded (Fragment Reassembly) for every list that expired before
    /// completion, per RFC 792.
    pub fn tick(&mut self, rt: &mut dyn NetworkRuntime, if_nbr: u8, now: u64) {
        let addr_tables = &self.addr_tables;
        let id_counter = &self.id_counter;
        let cfg = &self.cfg;
        self.reassembly.process_timeouts(&mut self.pool, &mut self.timers, now, |head| {
            icmpv4::send_time_exceeded_frag_reassembly(addr_tables, rt, id_counter, cfg, if_nbr, head);
        });
    }

    /// Transmit-preparation entry point, forwarding to
    /// [`transmit::tx`] with this engine's address tables, id counter, and
    /// configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn tx(
        &self,
        rt: &mut dyn NetworkRuntime,
        if_nbr: u8,
        protocol: Protocol,
        src: Ipv4Addr,
        dest: Ipv4Addr,
        tos: u8,
        ttl: u8,
        flags: TxFlags,
        opts: &[u8],
        payload: &[u8],
    ) -> Result<(), Error> {
        transmit::tx(
            &self.addr_tables,
            rt,
            &self.id_counter,
            &self.cfg,
            if_nbr,
            protocol,
            src,
            dest,
            tos,
            ttl,
            flags,
            opts,
            payload,
        )
        .map_err(Error::from)
    }

    /// Transmits with the default TTL for `dest`'s class and no flags —
    /// the common case most callers want.
    pub fn tx_default(
        &self,
        rt: &mut dyn NetworkRuntime,
        if_nbr: u8,
        protocol: Protocol,
        src: Ipv4Addr,
        dest: Ipv4Addr,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.tx(rt, if_nbr, protocol, src, dest, 0, TTL_USE_DEFAULT, TxFlags::empty(), &[], payload)
    }

    pub fn cfg(&self) -> &Ipv4Config {
        &self.cfg
    }
}
