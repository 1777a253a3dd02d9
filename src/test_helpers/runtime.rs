// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! An in-process [`NetworkRuntime`] wired to a sibling runtime through
//! `crossbeam_channel` queues, standing in for a driver in unit and
//! integration tests: anything transmitted on one end shows up on the
//! other end's next [`receive`](NetworkRuntime::receive).
//!
//! The channels carry serialized wire bytes, not live [`PacketBuffer`]s —
//! `transmit` puts the prepared frame "on the wire" and `receive`
//! reconstructs it with [`PacketBuffer::from_wire`], exactly as a real
//! driver would. Passing the buffer through verbatim would leak
//! transmit-side-only state (`if_nbr_tx`, an unset `protocol_hdr_type`)
//! into the receive path instead of exercising it.

use crate::runtime::memory::PacketBuffer;
use crate::runtime::network::NetworkRuntime;
use ::crossbeam_channel::{Receiver, Sender};

pub struct TestRuntime {
    mtu: u16,
    if_nbr: u8,
    incoming: Receiver<Vec<u8>>,
    outgoing: Sender<Vec<u8>>,
}

impl TestRuntime {
    /// Builds two runtimes wired back to back: anything `a` transmits
    /// shows up in `b`'s next `receive()`, and vice versa. Both sides
    /// reconstruct received buffers tagged with `if_nbr`.
    pub fn new_pair(mtu: u16, if_nbr: u8) -> (Self, Self) {
        let (a_to_b_tx, a_to_b_rx) = ::crossbeam_channel::unbounded();
        let (b_to_a_tx, b_to_a_rx) = ::crossbeam_channel::unbounded();
        let a = Self {
            mtu,
            if_nbr,
            incoming: b_to_a_rx,
            outgoing: a_to_b_tx,
        };
        let b = Self {
            mtu,
            if_nbr,
            incoming: a_to_b_rx,
            outgoing: b_to_a_tx,
        };
        (a, b)
    }

    /// A runtime with no peer; `rx` collects whatever it transmits, for
    /// tests that only want to inspect the raw wire bytes sent out.
    pub fn new_solo(mtu: u16, if_nbr: u8) -> (Self, Receiver<Vec<u8>>) {
        let (_tx, incoming) = ::crossbeam_channel::unbounded();
        let (outgoing, rx) = ::crossbeam_channel::unbounded();
        (Self { mtu, if_nbr, incoming, outgoing }, rx)
    }
}

impl NetworkRuntime for TestRuntime {
    fn transmit(&mut self, buf: PacketBuffer) {
        self.outgoing
            .try_send(buf.data[..buf.data_len].to_vec())
            .expect("test runtime channel should never be full or disconnected");
    }

    fn receive(&mut self) -> Vec<PacketBuffer> {
        self.incoming
            .try_iter()
            .map(|wire| PacketBuffer::from_wire(self.if_nbr, &wire))
            .collect()
    }

    fn mtu(&self, _if_nbr: u8) -> u16 {
        self.mtu
    }
}
