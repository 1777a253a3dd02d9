// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Demultiplexer: dispatches a validated, reassembled
//! datagram to its upper-layer protocol by the preserved protocol value.

use crate::protocols::ipv4::types::Protocol;
use crate::runtime::fail::Error;
use crate::runtime::memory::PacketBuffer;

/// The single receive entry point every upper-layer protocol exposes to
/// the core. `buf.data_len` excludes the IP header; header cursors
/// (`icmp_ix`/`igmp_ix`/`transport_ix`) are already populated.
pub trait DemuxTarget {
    fn receive(&mut self, buf: PacketBuffer) -> Result<(), Error>;
}

/// Trait-object table of the four demux targets, so the core links and is
/// testable without pulling in full TCP/UDP stacks. A `None` slot means
/// the corresponding module was compiled out (`*_MODULE_EN = false`).
pub struct Demux<'a> {
    icmpv4: Option<&'a mut dyn DemuxTarget>,
    igmp: Option<&'a mut dyn DemuxTarget>,
    udp: Option<&'a mut dyn DemuxTarget>,
    tcp: Option<&'a mut dyn DemuxTarget>,
}

impl<'a> Demux<'a> {
    pub fn new(
        icmpv4: Option<&'a mut dyn DemuxTarget>,
        igmp: Option<&'a mut dyn DemuxTarget>,
        udp: Option<&'a mut dyn DemuxTarget>,
        tcp: Option<&'a mut dyn DemuxTarget>,
    ) -> Self {
        Self { icmpv4, igmp, udp, tcp }
    }

    /// Dispatches `buf` to the target registered for `protocol`. A missing
    /// target (module compiled out) drops the datagram with a log line
    /// rather than panicking — the validator already rejects protocol
    /// values with no possible target.
    pub fn dispatch(&mut self, protocol: Protocol, buf: PacketBuffer) -> Result<(), Error> {
        let target = match protocol {
            Protocol::Icmpv4 => self.icmpv4.as_deref_mut(),
            Protocol::Igmp => self.igmp.as_deref_mut(),
            Protocol::Udp => self.udp.as_deref_mut(),
            Protocol::Tcp => self.tcp.as_deref_mut(),
        };
        match target {
            Some(t) => t.receive(buf),
            None => {
                log::debug!("demux: no target registered for {:?}, dropping", protocol);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTarget {
        received: usize,
    }

    impl DemuxTarget for CountingTarget {
        fn receive(&mut self, _buf: PacketBuffer) -> Result<(), Error> {
            self.received += 1;
            Ok(())
        }
    }

    #[test]
    fn dispatches_to_the_matching_protocol_target() {
        let mut udp = CountingTarget { received: 0 };
        let mut demux = Demux::new(None, None, Some(&mut udp), None);
        demux.dispatch(Protocol::Udp, PacketBuffer::default()).unwrap();
        assert_eq!(udp.received, 1);
    }

    #[test]
    fn missing_target_drops_without_error() {
        let mut demux = Demux::new(None, None, None, None);
        assert!(demux.dispatch(Protocol::Tcp, PacketBuffer::default()).is_ok());
    }
}
