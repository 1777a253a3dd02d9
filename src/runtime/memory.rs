// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Packet buffer model.
//!
//! A buffer additionally carries reassembly linkage (`prev_list`/
//! `next_list`/`prev_frag`/`next_frag`) and a timer back-reference, and the
//! reassembly engine must be able to move a buffer between lists without
//! moving its bytes. Rather than intrusive pointers (the original C source's
//! approach), every buffer gets a stable handle into an arena (`BufferPool`),
//! which is how a fragment can be relinked into a different list in O(1)
//! without invalidating anyone else's reference to it.

use crate::runtime::timer::TimerHandle;
use ::std::net::Ipv4Addr;

/// Sentinel interface identifier for loopback traffic.
pub const LOCAL_HOST: u8 = 0xff;

/// Maximum octets of IP content (data + options) that one buffer can carry.
/// This is a build-time capacity, not a protocol limit; a 1500-byte Ethernet
/// MTU plus slack for reassembly of jumbo-ish test payloads comfortably fits.
pub const MAX_BUFFER_SIZE: usize = 2048;

/// Stable handle into a [`BufferPool`]. Carries a generation counter so a
/// handle to a freed-and-reused slot is detected rather than aliasing into
/// unrelated data — a late-firing timer must never reach a freed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

/// Decoded protocol tag for a buffer's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolHdrType {
    None,
    Ipv4,
    Ipv4Opt,
    Icmpv4,
    Igmp,
    Udpv4,
    Tcpv4,
}

impl Default for ProtocolHdrType {
    fn default() -> Self {
        ProtocolHdrType::None
    }
}

/// Per-buffer flag bits. Plain bitset rather than a `bitflags` type:
/// the field set is small, fixed, and never grows past one byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u8);

impl BufferFlags {
    pub const RX_BROADCAST: u8 = 1 << 0;
    pub const RX_MULTICAST: u8 = 1 << 1;
    pub const RX_REMOTE: u8 = 1 << 2;
    pub const TX_BROADCAST: u8 = 1 << 3;
    pub const TX_MULTICAST: u8 = 1 << 4;

    pub fn empty() -> Self {
        BufferFlags(0)
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// A received or about-to-be-transmitted IPv4 datagram, plus all metadata
/// the core attaches to it on the way through validate/reassemble/demux/tx.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    /// Contiguous byte payload. Fixed capacity at allocation.
    pub data: [u8; MAX_BUFFER_SIZE],
    /// Current logical length of `data`.
    pub data_len: usize,
    /// Total length across the buffer chain, if this buffer heads one.
    pub tot_len: usize,

    pub ip_hdr_ix: Option<usize>,
    pub icmp_ix: Option<usize>,
    pub igmp_ix: Option<usize>,
    pub transport_ix: Option<usize>,

    pub ip_tot_len: u16,
    pub ip_hdr_len: u8,
    pub ip_data_len: u16,
    pub ip_datagram_len: u16,
    pub ip_id: u16,
    pub ip_flags_frag_offset: u16,
    pub ip_addr_src: Ipv4Addr,
    pub ip_addr_dest: Ipv4Addr,
    pub ip_addr_next_route: Ipv4Addr,
    pub ip_frag_size_tot: Option<u32>,
    pub ip_frag_size_cur: u32,

    pub protocol_hdr_type: ProtocolHdrType,
    pub protocol_hdr_type_net_sub: ProtocolHdrType,

    pub prev_list: Option<BufferHandle>,
    pub next_list: Option<BufferHandle>,
    pub prev_frag: Option<BufferHandle>,
    pub next_frag: Option<BufferHandle>,

    pub timer: Option<TimerHandle>,

    pub flags: BufferFlags,
    pub if_nbr: u8,
    pub if_nbr_tx: u8,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self {
            data: [0u8; MAX_BUFFER_SIZE],
            data_len: 0,
            tot_len: 0,
            ip_hdr_ix: None,
            icmp_ix: None,
            igmp_ix: None,
            transport_ix: None,
            ip_tot_len: 0,
            ip_hdr_len: 0,
            ip_data_len: 0,
            ip_datagram_len: 0,
            ip_id: 0,
            ip_flags_frag_offset: 0,
            ip_addr_src: Ipv4Addr::UNSPECIFIED,
            ip_addr_dest: Ipv4Addr::UNSPECIFIED,
            ip_addr_next_route: Ipv4Addr::UNSPECIFIED,
            ip_frag_size_tot: None,
            ip_frag_size_cur: 0,
            protocol_hdr_type: ProtocolHdrType::None,
            protocol_hdr_type_net_sub: ProtocolHdrType::None,
            prev_list: None,
            next_list: None,
            prev_frag: None,
            next_frag: None,
            timer: None,
            flags: BufferFlags::empty(),
            if_nbr: 0,
            if_nbr_tx: 0,
        }
    }
}

impl PacketBuffer {
    /// Builds a buffer from a received wire image, truncating (never
    /// panicking) if the caller handed us more than fits in one buffer.
    pub fn from_wire(if_nbr: u8, wire: &[u8]) -> Self {
        let mut buf = Self::default();
        let n = wire.len().min(MAX_BUFFER_SIZE);
        buf.data[..n].copy_from_slice(&wire[..n]);
        buf.data_len = n;
        buf.tot_len = n;
        buf.ip_hdr_ix = Some(0);
        buf.protocol_hdr_type = ProtocolHdrType::Ipv4;
        buf.if_nbr = if_nbr;
        buf
    }

    /// The IP header slice, valid once `ip_hdr_ix` and `ip_hdr_len` are set.
    pub fn ip_header(&self) -> &[u8] {
        let start = self.ip_hdr_ix.expect("ip_hdr_ix not set");
        &self.data[start..start + self.ip_hdr_len as usize]
    }

    /// The datagram content following the (already-stripped) IP header.
    pub fn ip_payload(&self) -> &[u8] {
        let start = self.ip_hdr_ix.expect("ip_hdr_ix not set") + self.ip_hdr_len as usize;
        &self.data[start..start + self.data_len]
    }
}

/// Arena of [`PacketBuffer`]s addressed by [`BufferHandle`]. Exclusive
/// ownership is a convention enforced by callers: a handle is moved out of
/// one subsystem's bookkeeping before being handed to the next, never
/// copied while "live" in two owners at once.
#[derive(Debug, Default)]
pub struct BufferPool {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

#[derive(Debug)]
enum Slot {
    Occupied { generation: u32, buf: PacketBuffer },
    Free { generation: u32 },
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Inserts a buffer into the arena, returning a stable handle to it.
    pub fn insert(&mut self, buf: PacketBuffer) -> BufferHandle {
        if let Some(index) = self.free_list.pop() {
            let generation = match &self.slots[index as usize] {
                Slot::Free { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list pointed at occupied slot"),
            };
            self.slots[index as usize] = Slot::Occupied { generation, buf };
            BufferHandle { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { generation: 0, buf });
            BufferHandle { index, generation: 0 }
        }
    }

    /// Removes and returns the buffer a handle refers to. Returns `None` if
    /// the handle is stale (already freed), which a correctly-operating
    /// engine should never observe but which is still defended against, so
    /// a late-firing timer can never reach freed memory.
    pub fn remove(&mut self, handle: BufferHandle) -> Option<PacketBuffer> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let next_gen = generation.wrapping_add(1);
                let old = std::mem::replace(slot, Slot::Free { generation: next_gen });
                self.free_list.push(handle.index);
                match old {
                    Slot::Occupied { buf, .. } => Some(buf),
                    Slot::Free { .. } => None,
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&PacketBuffer> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, buf } if *generation == handle.generation => Some(buf),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> Option<&mut PacketBuffer> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, buf } if *generation == handle.generation => Some(buf),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut pool = BufferPool::new();
        let h = pool.insert(PacketBuffer::default());
        assert!(pool.get(h).is_some());
        let buf = pool.remove(h).unwrap();
        assert_eq!(buf.data_len, 0);
        assert!(pool.get(h).is_none());
    }

    #[test]
    fn stale_handle_after_reuse_is_rejected() {
        let mut pool = BufferPool::new();
        let h1 = pool.insert(PacketBuffer::default());
        pool.remove(h1).unwrap();
        let h2 = pool.insert(PacketBuffer::default());
        assert_ne!(h1, h2);
        assert!(pool.get(h1).is_none());
        assert!(pool.get(h2).is_some());
    }
}
