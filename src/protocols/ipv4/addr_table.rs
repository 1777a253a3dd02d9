// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-interface IPv4 address tables: configured addresses, masks,
//! gateways, and the static/dynamic configuration state machine.
//!
//! Transport layers close their connections bound to a removed address
//! through the [`ConnectionOwner`] callback injected at construction,
//! since TCP/UDP connection tables live outside this crate.

use crate::runtime::fail::AddrCfgError;
use ::arrayvec::ArrayVec;
use ::std::net::Ipv4Addr;

/// One configured address record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub host: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// Inverse of `mask`: the host-portion bits.
    pub mask_host: Ipv4Addr,
    /// `host & mask`.
    pub subnet_net: Ipv4Addr,
    pub dflt_gateway: Ipv4Addr,
}

impl AddrEntry {
    fn new(host: Ipv4Addr, mask: Ipv4Addr, dflt_gateway: Ipv4Addr) -> Self {
        let host_bits = u32::from(host);
        let mask_bits = u32::from(mask);
        Self {
            host,
            mask,
            mask_host: Ipv4Addr::from(!mask_bits),
            subnet_net: Ipv4Addr::from(host_bits & mask_bits),
            dflt_gateway,
        }
    }

    /// True iff `addr` is the all-ones host address within this entry's
    /// subnet (RFC 950 directed broadcast).
    pub fn is_directed_broadcast(&self, addr: Ipv4Addr) -> bool {
        let mask_bits = u32::from(self.mask);
        let addr_bits = u32::from(addr);
        addr_bits & mask_bits == u32::from(self.subnet_net) && addr_bits & !mask_bits == !mask_bits
    }
}

/// Per-interface configuration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrCfgState {
    None,
    Static,
    Dynamic,
    DynamicInit,
}

impl Default for AddrCfgState {
    fn default() -> Self {
        AddrCfgState::None
    }
}

/// Callback a transport layer registers so `cfg_remove`/`cfg_remove_all` can
/// tear down connections bound to an address before it disappears.
pub trait ConnectionOwner {
    fn close_bound(&self, addr: Ipv4Addr);
}

const MAX_PER_IF: usize = 4;
const MAX_INTERFACES: usize = 4;

struct IfTable {
    entries: ArrayVec<AddrEntry, MAX_PER_IF>,
    state: AddrCfgState,
    protocol_conflict: bool,
}

impl Default for IfTable {
    fn default() -> Self {
        Self {
            entries: ArrayVec::new(),
            state: AddrCfgState::None,
            protocol_conflict: false,
        }
    }
}

/// All interfaces' address tables, plus the single global
/// "one interface may be mid dynamic-negotiation" latch.
pub struct AddrTables {
    tables: [IfTable; MAX_INTERFACES],
    dynamic_init_owner: Option<u8>,
    /// Runtime cap on configured addresses per interface
    /// (`Ipv4Config::max_per_if`), bounded above by the `ArrayVec`'s
    /// compile-time capacity (`MAX_PER_IF`).
    max_per_if: usize,
}

impl Default for AddrTables {
    fn default() -> Self {
        Self {
            tables: Default::default(),
            dynamic_init_owner: None,
            max_per_if: MAX_PER_IF,
        }
    }
}

impl AddrTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table set honoring `Ipv4Config::max_per_if` as the per-
    /// interface address cap. Clamped to the `ArrayVec`'s own compile-time
    /// capacity, which is the hard upper bound no configuration can exceed.
    pub fn with_max_per_if(max_per_if: usize) -> Self {
        Self {
            max_per_if: max_per_if.min(MAX_PER_IF),
            ..Self::default()
        }
    }

    fn table(&self, if_nbr: u8) -> &IfTable {
        &self.tables[if_nbr as usize]
    }

    fn table_mut(&mut self, if_nbr: u8) -> &mut IfTable {
        &mut self.tables[if_nbr as usize]
    }

    /// Adds a statically-configured address. Rejects a host already
    /// configured anywhere, a full table, an invalid host/mask/gateway, or
    /// an interface mid dynamic negotiation or already dynamically bound.
    pub fn cfg_add_static(
        &mut self,
        if_nbr: u8,
        host: Ipv4Addr,
        mask: Ipv4Addr,
        dflt_gateway: Ipv4Addr,
    ) -> Result<(), AddrCfgError> {
        match self.table(if_nbr).state {
            AddrCfgState::None | AddrCfgState::Static => {}
            AddrCfgState::Dynamic | AddrCfgState::DynamicInit => {
                return Err(AddrCfgError::AddrCfgState)
            }
        }
        self.validate_new_entry(host, mask, dflt_gateway)?;

        let max_per_if = self.max_per_if;
        let t = self.table_mut(if_nbr);
        if t.entries.len() >= max_per_if {
            return Err(AddrCfgError::AddrTblFull);
        }
        t.entries.push(AddrEntry::new(host, mask, dflt_gateway));
        t.state = AddrCfgState::Static;
        Ok(())
    }

    /// Installs the address negotiated during dynamic configuration.
    /// Only legal from `DynamicInit`; a `Dynamic` interface already has its
    /// one entry.
    pub fn cfg_add_dynamic(
        &mut self,
        if_nbr: u8,
        host: Ipv4Addr,
        mask: Ipv4Addr,
        dflt_gateway: Ipv4Addr,
    ) -> Result<(), AddrCfgError> {
        if self.table(if_nbr).state != AddrCfgState::DynamicInit {
            return Err(AddrCfgError::AddrCfgState);
        }
        self.validate_new_entry(host, mask, dflt_gateway)?;

        let t = self.table_mut(if_nbr);
        t.entries.push(AddrEntry::new(host, mask, dflt_gateway));
        t.state = AddrCfgState::Dynamic;
        Ok(())
    }

    /// Begins dynamic address negotiation: clears any existing entries and
    /// claims the one global `DynamicInit` slot. Idempotent while already
    /// `DynamicInit` on the same interface.
    pub fn cfg_dynamic_start(&mut self, if_nbr: u8) -> Result<(), AddrCfgError> {
        match self.table(if_nbr).state {
            AddrCfgState::DynamicInit => return Ok(()),
            AddrCfgState::None | AddrCfgState::Static | AddrCfgState::Dynamic => {}
        }
        if let Some(owner) = self.dynamic_init_owner {
            if owner != if_nbr {
                return Err(AddrCfgError::AddrCfgInProgress);
            }
        }
        let t = self.table_mut(if_nbr);
        t.entries.clear();
        t.state = AddrCfgState::DynamicInit;
        self.dynamic_init_owner = Some(if_nbr);
        Ok(())
    }

    /// Aborts dynamic negotiation, returning the interface to `Static`
    /// (empty) state. Only legal from `DynamicInit`.
    pub fn cfg_dynamic_stop(&mut self, if_nbr: u8) -> Result<(), AddrCfgError> {
        if self.table(if_nbr).state != AddrCfgState::DynamicInit {
            return Err(AddrCfgError::AddrCfgState);
        }
        let t = self.table_mut(if_nbr);
        t.entries.clear();
        t.state = AddrCfgState::Static;
        if self.dynamic_init_owner == Some(if_nbr) {
            self.dynamic_init_owner = None;
        }
        Ok(())
    }

    /// Removes one configured address, closing every transport connection
    /// bound to it first.
    pub fn cfg_remove(
        &mut self,
        if_nbr: u8,
        host: Ipv4Addr,
        owner: &dyn ConnectionOwner,
    ) -> Result<(), AddrCfgError> {
        let t = self.table_mut(if_nbr);
        let pos = t
            .entries
            .iter()
            .position(|e| e.host == host)
            .ok_or(AddrCfgError::AddrNotFound)?;
        owner.close_bound(host);
        t.entries.remove(pos);
        t.state = match t.state {
            AddrCfgState::Dynamic => AddrCfgState::Static,
            other => other,
        };
        Ok(())
    }

    /// Removes every configured address on an interface.
    pub fn cfg_remove_all(&mut self, if_nbr: u8, owner: &dyn ConnectionOwner) {
        let t = self.table_mut(if_nbr);
        for e in t.entries.drain(..) {
            owner.close_bound(e.host);
        }
        if t.state == AddrCfgState::Dynamic {
            t.state = AddrCfgState::Static;
        }
    }

    pub fn lookup_on_if(&self, if_nbr: u8, host: Ipv4Addr) -> Option<&AddrEntry> {
        self.table(if_nbr).entries.iter().find(|e| e.host == host)
    }

    pub fn lookup_any(&self, host: Ipv4Addr) -> Option<(u8, &AddrEntry)> {
        self.tables
            .iter()
            .enumerate()
            .find_map(|(if_nbr, t)| t.entries.iter().find(|e| e.host == host).map(|e| (if_nbr as u8, e)))
    }

    pub fn get_all(&self, if_nbr: u8) -> &[AddrEntry] {
        &self.table(if_nbr).entries
    }

    /// Finds the address whose subnet contains `remote`, or failing that,
    /// the first address of an interface holding a default gateway.
    pub fn get_source_for(&self, remote: Ipv4Addr) -> Option<Ipv4Addr> {
        let remote_bits = u32::from(remote);
        for t in &self.tables {
            for e in &t.entries {
                if remote_bits & u32::from(e.mask) == u32::from(e.subnet_net) {
                    return Some(e.host);
                }
            }
        }
        for t in &self.tables {
            if t.entries.iter().any(|e| e.dflt_gateway != Ipv4Addr::UNSPECIFIED) {
                return t.entries.first().map(|e| e.host);
            }
        }
        None
    }

    /// Sets or clears the protocol-conflict latch for an interface (raised
    /// by ARP when another host answers for one of our addresses).
    pub fn set_protocol_conflict(&mut self, if_nbr: u8, conflict: bool) {
        self.table_mut(if_nbr).protocol_conflict = conflict;
    }

    pub fn protocol_conflict(&self, if_nbr: u8) -> bool {
        self.table(if_nbr).protocol_conflict
    }

    fn validate_new_entry(
        &self,
        host: Ipv4Addr,
        mask: Ipv4Addr,
        dflt_gateway: Ipv4Addr,
    ) -> Result<(), AddrCfgError> {
        if !is_valid_host_addr(host) {
            return Err(AddrCfgError::InvalidAddrHost);
        }
        if !is_valid_mask(host, mask) {
            return Err(AddrCfgError::InvalidAddrHost);
        }
        if dflt_gateway != Ipv4Addr::UNSPECIFIED {
            if !is_valid_host_addr(dflt_gateway) {
                return Err(AddrCfgError::InvalidAddrGateway);
            }
            let mask_bits = u32::from(mask);
            if u32::from(host) & mask_bits != u32::from(dflt_gateway) & mask_bits {
                return Err(AddrCfgError::InvalidAddrGateway);
            }
        }
        if self.lookup_any(host).is_some() {
            return Err(AddrCfgError::AddrCfgInUse);
        }
        Ok(())
    }
}

/// Classful network-portion length, in bits, for a class A/B/C address.
/// Returns `None` for class D/E addresses, which have no classful network
/// portion to speak of.
fn classful_prefix_len(addr: Ipv4Addr) -> Option<u32> {
    let first = addr.octets()[0];
    match first {
        1..=126 => Some(8),
        128..=191 => Some(16),
        192..=223 => Some(24),
        _ => None,
    }
}

/// The classful (no-subnet-information) directed-broadcast address for
/// `addr`'s class A/B/C network, or `None` for class D/E. Used when
/// validating a received datagram's destination against an interface that
/// has not been told which subnet mask a remote peer is using.
pub(crate) fn classful_broadcast(addr: Ipv4Addr) -> Option<Ipv4Addr> {
    let prefix = classful_prefix_len(addr)?;
    let mask = if prefix == 32 { !0u32 } else { !0u32 << (32 - prefix) };
    Some(Ipv4Addr::from(u32::from(addr) | !mask))
}

/// Host-address validity (RFC 1122 §3.2.1.3, RFC 3927, RFC 1112).
pub fn is_valid_host_addr(addr: Ipv4Addr) -> bool {
    if addr == Ipv4Addr::UNSPECIFIED || addr == Ipv4Addr::BROADCAST {
        return false;
    }
    if addr.octets()[0] == 127 {
        return false;
    }
    if addr.octets()[0] == 169 && addr.octets()[1] == 254 {
        let last = addr.octets()[2];
        if !(1..=254).contains(&last) {
            return false;
        }
    }
    if addr.is_multicast() {
        return false;
    }
    match classful_prefix_len(addr) {
        Some(prefix) => {
            let host_bits = 32 - prefix;
            let mask = if host_bits == 32 { 0 } else { !0u32 << host_bits };
            let host_part = u32::from(addr) & !mask;
            host_part != 0 && host_part != !mask
        }
        None => false,
    }
}

/// Subnet-mask validity: a contiguous prefix of 2..=30 bits that covers at
/// least the classful network portion of `addr`.
pub fn is_valid_mask(addr: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask_bits = u32::from(mask);
    let ones = mask_bits.count_ones();
    if !(2..=30).contains(&ones) {
        return false;
    }
    // reject non-contiguous masks (a 0 bit followed by a 1 bit)
    if mask_bits != (!0u32 << (32 - ones)) {
        return false;
    }
    match classful_prefix_len(addr) {
        Some(classful) => ones >= classful,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopOwner;
    impl ConnectionOwner for NoopOwner {
        fn close_bound(&self, _addr: Ipv4Addr) {}
    }

    #[test]
    fn add_static_then_duplicate_host_is_rejected() {
        let mut t = AddrTables::new();
        t.cfg_add_static(0, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED)
            .unwrap();
        let err = t
            .cfg_add_static(1, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED)
            .unwrap_err();
        assert_eq!(err, AddrCfgError::AddrCfgInUse);
    }

    #[test]
    fn gateway_outside_subnet_is_rejected() {
        let mut t = AddrTables::new();
        let err = t
            .cfg_add_static(0, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::new(192, 168, 1, 1))
            .unwrap_err();
        assert_eq!(err, AddrCfgError::InvalidAddrGateway);
    }

    #[test]
    fn dynamic_negotiation_round_trip() {
        let mut t = AddrTables::new();
        t.cfg_dynamic_start(0).unwrap();
        assert_eq!(t.table(0).state, AddrCfgState::DynamicInit);
        t.cfg_add_dynamic(0, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED)
            .unwrap();
        assert_eq!(t.table(0).state, AddrCfgState::Dynamic);
        assert!(t.cfg_add_static(0, Ipv4Addr::new(10, 0, 0, 6), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED).is_err());
    }

    #[test]
    fn only_one_interface_may_be_dynamic_init_at_a_time() {
        let mut t = AddrTables::new();
        t.cfg_dynamic_start(0).unwrap();
        let err = t.cfg_dynamic_start(1).unwrap_err();
        assert_eq!(err, AddrCfgError::AddrCfgInProgress);
    }

    #[test]
    fn remove_closes_bound_connections() {
        let mut t = AddrTables::new();
        let host = Ipv4Addr::new(10, 0, 0, 2);
        t.cfg_add_static(0, host, Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED).unwrap();
        t.cfg_remove(0, host, &NoopOwner).unwrap();
        assert!(t.lookup_on_if(0, host).is_none());
        assert_eq!(t.cfg_remove(0, host, &NoopOwner).unwrap_err(), AddrCfgError::AddrNotFound);
    }

    #[test]
    fn configured_max_per_if_is_enforced_below_the_arrayvec_capacity() {
        let mut t = AddrTables::with_max_per_if(1);
        t.cfg_add_static(0, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED)
            .unwrap();
        let err = t
            .cfg_add_static(0, Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED)
            .unwrap_err();
        assert_eq!(err, AddrCfgError::AddrTblFull);
    }

    #[test]
    fn link_local_addresses_outside_dhcp_range_are_invalid() {
        assert!(!is_valid_host_addr(Ipv4Addr::new(169, 254, 255, 10)));
        assert!(is_valid_host_addr(Ipv4Addr::new(169, 254, 1, 1)));
    }

    #[test]
    fn all_zero_or_all_one_host_portion_is_invalid() {
        assert!(!is_valid_host_addr(Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!is_valid_host_addr(Ipv4Addr::new(10, 255, 255, 255)));
        assert!(is_valid_host_addr(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn directed_broadcast_is_detected() {
        let entry = AddrEntry::new(Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::UNSPECIFIED);
        assert!(entry.is_directed_broadcast(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!entry.is_directed_broadcast(Ipv4Addr::new(192, 168, 1, 6)));
    }

    #[test]
    fn get_source_for_falls_back_to_gateway_interface() {
        let mut t = AddrTables::new();
        t.cfg_add_static(0, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();
        assert_eq!(t.get_source_for(Ipv4Addr::new(10, 0, 0, 9)), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(t.get_source_for(Ipv4Addr::new(8, 8, 8, 8)), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
