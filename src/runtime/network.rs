// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Driver and upper-layer contracts.
//!
//! "How packets get in and out" splits into two traits: [`NetworkRuntime`]
//! is the narrow surface the IPv4 engine itself calls (deliver a buffer,
//! accept a buffer for transmission), and [`LinkDriver`] is the wider
//! MII/PHY/multicast-membership surface a concrete Ethernet driver
//! implements. The engine never calls `LinkDriver` methods directly; the
//! trait exists only so a driver can be written against one contract and
//! swapped freely. `LinkDriver` carries no required behavior beyond its
//! method signatures — the engine does not second-guess what a driver does
//! internally.

use crate::runtime::fail::Error;
use crate::runtime::memory::PacketBuffer;

/// The surface the IPv4 engine actually calls to move bytes on and off the
/// wire. A concrete implementation owns the hardware queues; the engine only
/// ever sees buffers.
pub trait NetworkRuntime {
    /// Hands a fully-prepared outbound buffer (header already built, route
    /// already selected) to the link layer.
    fn transmit(&mut self, buf: PacketBuffer);

    /// Drains any buffers the link layer has received since the last poll.
    /// The driver is expected to have already set `ip_hdr_ix`, stripped the
    /// link-layer CRC, and populated `RX_BROADCAST`/`RX_MULTICAST` from the
    /// link layer before handing a buffer here.
    fn receive(&mut self) -> Vec<PacketBuffer>;

    /// The interface's transmit MTU, used by the transmit-preparation MTU
    /// check.
    fn mtu(&self, if_nbr: u8) -> u16;
}

/// The wider device-driver contract (init/start/stop/rx/tx/add_mcast/
/// remove_mcast/isr/io_ctl/mii_rd/mii_wr). The engine does not call these;
/// they exist to document the contract a driver template implements,
/// matching the original C source's `net_dev_ether_template`.
pub trait LinkDriver {
    fn init(&mut self, if_nbr: u8) -> Result<(), Error>;
    fn start(&mut self, if_nbr: u8) -> Result<(), Error>;
    fn stop(&mut self, if_nbr: u8) -> Result<(), Error>;
    fn add_mcast(&mut self, if_nbr: u8, group: ::std::net::Ipv4Addr) -> Result<(), Error>;
    fn remove_mcast(&mut self, if_nbr: u8, group: ::std::net::Ipv4Addr) -> Result<(), Error>;
    fn isr(&mut self, if_nbr: u8);
    fn io_ctl(&mut self, if_nbr: u8, opt: u32, data: &mut [u8]) -> Result<(), Error>;
    fn mii_rd(&mut self, if_nbr: u8, phy_addr: u8, reg_addr: u8) -> u16;
    fn mii_wr(&mut self, if_nbr: u8, phy_addr: u8, reg_addr: u8, data: u16);
}

/// Configuration surface, grouped the way `ArpConfig`/`TcpConfig`/
/// `UdpConfig` are grouped elsewhere: one struct per protocol layer plus a
/// handful of named constants for its tunable bounds.
pub mod config {
    /// Lower/upper bound, in seconds, for the fragment reassembly timeout.
    pub const FRAG_REASM_TIMEOUT_MIN_SEC: u8 = 1;
    pub const FRAG_REASM_TIMEOUT_MAX_SEC: u8 = 255;
    pub const FRAG_REASM_TIMEOUT_DEFAULT_SEC: u8 = 15;

    #[derive(Debug, Clone, Copy)]
    pub struct Ipv4Config {
        /// Maximum configured addresses per interface (address table size).
        pub max_per_if: usize,
        /// Per-list reassembly deadline, in seconds.
        pub frag_reasm_timeout_sec: u8,
        /// Skip software checksum validation on receive (hardware offload).
        pub chk_sum_offload_rx: bool,
        /// Skip software checksum computation on transmit (hardware offload).
        pub chk_sum_offload_tx: bool,
        /// Compile-time inclusion of optional demux targets.
        pub mcast_module_en: bool,
        pub igmp_module_en: bool,
        pub tcp_module_en: bool,
        pub icmpv4_module_en: bool,
    }

    impl Ipv4Config {
        pub fn new(max_per_if: usize, frag_reasm_timeout_sec: u8) -> Self {
            assert!(frag_reasm_timeout_sec >= FRAG_REASM_TIMEOUT_MIN_SEC);
            assert!(frag_reasm_timeout_sec <= FRAG_REASM_TIMEOUT_MAX_SEC);
            Self {
                max_per_if,
                frag_reasm_timeout_sec,
                chk_sum_offload_rx: false,
                chk_sum_offload_tx: false,
                mcast_module_en: true,
                igmp_module_en: true,
                tcp_module_en: true,
                icmpv4_module_en: true,
            }
        }
    }

    impl Default for Ipv4Config {
        fn default() -> Self {
            Self::new(4, FRAG_REASM_TIMEOUT_DEFAULT_SEC)
        }
    }
}
