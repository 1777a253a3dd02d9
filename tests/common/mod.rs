// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::ipv4stack::runtime::memory::PacketBuffer;
use ::ipv4stack::runtime::network::NetworkRuntime;

/// A `NetworkRuntime` whose `receive()` drains a preloaded inbox once and
/// whose `transmit()` appends to an outbox the test can inspect
/// afterwards. Simpler than [`ipv4stack::test_helpers::TestRuntime`]'s
/// channel pair for tests that only need to feed a handful of buffers
/// through one side and inspect exactly what came out the other.
pub struct FeedRuntime {
    pub inbox: Vec<PacketBuffer>,
    pub outbox: Vec<PacketBuffer>,
    pub mtu: u16,
}

impl FeedRuntime {
    pub fn new(mtu: u16) -> Self {
        Self {
            inbox: Vec::new(),
            outbox: Vec::new(),
            mtu,
        }
    }
}

impl NetworkRuntime for FeedRuntime {
    fn transmit(&mut self, buf: PacketBuffer) {
        self.outbox.push(buf);
    }

    fn receive(&mut self) -> Vec<PacketBuffer> {
        ::std::mem::take(&mut self.inbox)
    }

    fn mtu(&self, _if_nbr: u8) -> u16 {
        self.mtu
    }
}
