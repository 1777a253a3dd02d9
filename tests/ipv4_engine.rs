// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

use ::ipv4stack::protocols::ipv4::demux::DemuxTarget;
use ::ipv4stack::protocols::ipv4::header::Ipv4Header;
use ::ipv4stack::protocols::ipv4::transmit::TxFlags;
use ::ipv4stack::protocols::ipv4::types::{FlagsFragOffset, Protocol};
use ::ipv4stack::runtime::fail::Error;
use ::ipv4stack::runtime::memory::{BufferFlags, PacketBuffer};
use ::ipv4stack::runtime::network::NetworkRuntime;
use ::ipv4stack::test_helpers::{self, new_alice, new_bob, ALICE_IPV4, BOB_IPV4, IF_NBR, SUBNET_MASK};
use ::std::cell::RefCell;
use ::std::net::Ipv4Addr;
use ::std::rc::Rc;

use common::FeedRuntime;

const UDP: u8 = 17;

/// Records every buffer handed to it, so tests can assert what made it
/// through validate/reassemble/demux.
#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<PacketBuffer>>>);

impl DemuxTarget for Recorder {
    fn receive(&mut self, buf: PacketBuffer) -> Result<(), Error> {
        self.0.borrow_mut().push(buf);
        Ok(())
    }
}

fn fragment_wire(
    src: Ipv4Addr,
    dest: Ipv4Addr,
    id: u16,
    offset_words: u16,
    more_fragments: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut hdr = Ipv4Header::new(src, dest, UDP, 0);
    hdr.identification = id;
    hdr.flags_frag_offset = FlagsFragOffset {
        reserved: false,
        dont_fragment: false,
        more_fragments,
        fragment_offset: offset_words,
    };
    hdr.total_length = (20 + payload.len()) as u16;
    let mut wire = vec![0u8; 20 + payload.len()];
    hdr.serialize(&mut wire[..20], &[], false);
    wire[20..].copy_from_slice(payload);
    wire
}

fn fragment_buffer(wire: Vec<u8>) -> PacketBuffer {
    PacketBuffer::from_wire(IF_NBR, &wire)
}

/// Scenario 1: a non-fragment datagram passes straight through to demux.
#[test]
fn non_fragment_datagram_is_demuxed_without_reassembly() {
    let mut alice = new_alice();
    let mut bob = new_bob();
    let (mut alice_rt, mut bob_rt) = test_helpers::TestRuntime::new_pair(1500, IF_NBR);
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    alice
        .tx_default(&mut alice_rt, IF_NBR, Protocol::Udp, ALICE_IPV4, BOB_IPV4, b"hello")
        .expect("transmit should succeed");
    bob.rx(&mut bob_rt, 0);

    let received = recorder.0.borrow();
    assert_eq!(received.len(), 1);
    let ix = received[0].transport_ix.unwrap();
    assert_eq!(&received[0].data[ix..ix + 5], b"hello");
}

/// Scenario 2: two in-order fragments reassemble into one datagram.
#[test]
fn two_fragment_in_order_reassembly_completes() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(fragment_buffer(fragment_wire(
        ALICE_IPV4,
        BOB_IPV4,
        1,
        0,
        true,
        &[0xaa; 16],
    )));
    bob.rx(&mut rt, 0);
    assert!(recorder.0.borrow().is_empty());

    let mut rt2 = FeedRuntime::new(1500);
    rt2.inbox.push(fragment_buffer(fragment_wire(
        ALICE_IPV4,
        BOB_IPV4,
        1,
        2,
        false,
        &[0xbb; 8],
    )));
    bob.rx(&mut rt2, 1);

    let received = recorder.0.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data_len, 24);
}

/// Scenario 3: the second fragment arrives first; the later, lower-offset
/// fragment must still complete the list once it arrives.
#[test]
fn out_of_order_fragments_still_complete() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(fragment_buffer(fragment_wire(
        ALICE_IPV4,
        BOB_IPV4,
        2,
        2,
        false,
        &[0xbb; 8],
    )));
    bob.rx(&mut rt, 0);
    assert!(recorder.0.borrow().is_empty());

    let mut rt2 = FeedRuntime::new(1500);
    rt2.inbox.push(fragment_buffer(fragment_wire(
        ALICE_IPV4,
        BOB_IPV4,
        2,
        0,
        true,
        &[0xaa; 16],
    )));
    bob.rx(&mut rt2, 1);

    let received = recorder.0.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data_len, 24);
}

/// Scenario 4: an overlapping fragment discards the entire list; the
/// final non-overlapping fragment never completes a datagram.
#[test]
fn overlapping_fragment_discards_the_list() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(fragment_buffer(fragment_wire(ALICE_IPV4, BOB_IPV4, 3, 0, true, &[0x11; 16])));
    bob.rx(&mut rt, 0);

    let mut rt2 = FeedRuntime::new(1500);
    rt2.inbox.push(fragment_buffer(fragment_wire(ALICE_IPV4, BOB_IPV4, 3, 2, true, &[0x22; 16])));
    bob.rx(&mut rt2, 0);

    // Offset 1 (byte 8) overlaps the second fragment's [16, 32) range.
    let mut rt3 = FeedRuntime::new(1500);
    rt3.inbox.push(fragment_buffer(fragment_wire(ALICE_IPV4, BOB_IPV4, 3, 1, false, &[0x33; 16])));
    bob.rx(&mut rt3, 0);

    assert!(recorder.0.borrow().is_empty());
}

/// Scenario 5: a byte-for-byte duplicate fragment is dropped silently,
/// without poisoning the rest of the list.
#[test]
fn duplicate_fragment_is_dropped_and_list_still_completes() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(fragment_buffer(fragment_wire(ALICE_IPV4, BOB_IPV4, 4, 0, true, &[0x55; 16])));
    bob.rx(&mut rt, 0);

    let mut rt_dup = FeedRuntime::new(1500);
    rt_dup
        .inbox
        .push(fragment_buffer(fragment_wire(ALICE_IPV4, BOB_IPV4, 4, 0, true, &[0x55; 16])));
    bob.rx(&mut rt_dup, 0);
    assert!(recorder.0.borrow().is_empty());

    let mut rt_last = FeedRuntime::new(1500);
    rt_last
        .inbox
        .push(fragment_buffer(fragment_wire(ALICE_IPV4, BOB_IPV4, 4, 2, false, &[0x66; 8])));
    bob.rx(&mut rt_last, 0);

    assert_eq!(recorder.0.borrow().len(), 1);
}

/// Scenario 6: a reassembly list that never completes emits ICMP Time
/// Exceeded (Fragment Reassembly) once its timeout elapses.
#[test]
fn reassembly_timeout_emits_icmp_time_exceeded() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let timeout = bob.cfg().frag_reasm_timeout_sec as u64;
    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(fragment_buffer(fragment_wire(ALICE_IPV4, BOB_IPV4, 5, 0, true, &[0x77; 16])));
    bob.rx(&mut rt, 0);

    bob.tick(&mut rt, IF_NBR, timeout);

    assert!(recorder.0.borrow().is_empty());
    assert_eq!(rt.outbox.len(), 1);
    let icmp = &rt.outbox[0];
    let ix = icmp.ip_hdr_ix.unwrap() + icmp.ip_hdr_len as usize;
    assert_eq!(icmp.data[ix], 11); // Time Exceeded
    assert_eq!(icmp.data[ix + 1], 1); // Fragment Reassembly
}

/// Scenario 7: a datagram with a corrupted header checksum never reaches
/// the demultiplexer.
#[test]
fn bad_checksum_is_rejected() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let mut wire = fragment_wire(ALICE_IPV4, BOB_IPV4, 6, 0, false, b"payload!");
    wire[10] ^= 0xff;
    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(fragment_buffer(wire));
    bob.rx(&mut rt, 0);

    assert!(recorder.0.borrow().is_empty());
}

/// Scenario 8: a directed broadcast datagram is accepted when the driver
/// has tagged it with `RX_BROADCAST`.
#[test]
fn directed_broadcast_with_flag_is_accepted() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let broadcast = Ipv4Addr::new(192, 168, 1, 255);
    let wire = fragment_wire(Ipv4Addr::new(192, 168, 1, 50), broadcast, 7, 0, false, b"bcast!!!");
    let mut buf = fragment_buffer(wire);
    buf.flags.set(BufferFlags::RX_BROADCAST);
    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(buf);
    bob.rx(&mut rt, 0);

    assert_eq!(recorder.0.borrow().len(), 1);
}

/// Scenario 9: the same directed-broadcast destination is rejected when
/// the driver did not tag the buffer as link-layer broadcast.
#[test]
fn directed_broadcast_without_flag_is_rejected() {
    let mut bob = new_bob();
    let recorder = Recorder::default();
    bob.set_udp_target(Some(Box::new(recorder.clone())));

    let broadcast = Ipv4Addr::new(192, 168, 1, 255);
    let wire = fragment_wire(Ipv4Addr::new(192, 168, 1, 50), broadcast, 8, 0, false, b"bcast!!!");
    let buf = fragment_buffer(wire);
    let mut rt = FeedRuntime::new(1500);
    rt.inbox.push(buf);
    bob.rx(&mut rt, 0);

    assert!(recorder.0.borrow().is_empty());
}

/// Scenario 10: transmit-side route selection covers every entry in the
/// route table (local host, same-subnet host, directed broadcast,
/// multicast, default gateway).
#[test]
fn transmit_route_selection_matches_the_scenario_table() {
    let mut alice = new_alice();
    alice
        .cfg_add_static(IF_NBR, Ipv4Addr::new(192, 168, 1, 9), SUBNET_MASK, Ipv4Addr::new(192, 168, 1, 254))
        .expect("second address should configure cleanly");

    let mut rt = FeedRuntime::new(1500);

    // Local host: destination is one of this engine's own addresses.
    alice
        .tx_default(&mut rt, IF_NBR, Protocol::Udp, ALICE_IPV4, Ipv4Addr::new(192, 168, 1, 9), b"x")
        .unwrap();
    assert_eq!(rt.outbox.pop().unwrap().ip_addr_next_route, Ipv4Addr::LOCALHOST);

    // Same-subnet host.
    alice
        .tx_default(&mut rt, IF_NBR, Protocol::Udp, ALICE_IPV4, Ipv4Addr::new(192, 168, 1, 50), b"x")
        .unwrap();
    assert_eq!(rt.outbox.pop().unwrap().ip_addr_next_route, Ipv4Addr::new(192, 168, 1, 50));

    // Directed broadcast.
    alice
        .tx_default(&mut rt, IF_NBR, Protocol::Udp, ALICE_IPV4, Ipv4Addr::new(192, 168, 1, 255), b"x")
        .unwrap();
    assert_eq!(rt.outbox.pop().unwrap().ip_addr_next_route, Ipv4Addr::BROADCAST);

    // Multicast.
    alice
        .tx_default(&mut rt, IF_NBR, Protocol::Udp, ALICE_IPV4, Ipv4Addr::new(224, 0, 0, 1), b"x")
        .unwrap();
    assert_eq!(rt.outbox.pop().unwrap().ip_addr_next_route, Ipv4Addr::new(224, 0, 0, 1));

    // Off-subnet, routed through the default gateway.
    let tx = alice.tx(
        &mut rt,
        IF_NBR,
        Protocol::Udp,
        ALICE_IPV4,
        Ipv4Addr::new(10, 0, 0, 5),
        0,
        64,
        TxFlags::empty(),
        &[],
        b"x",
    );
    assert!(tx.is_err(), "alice's own address has no gateway configured");

    // Off-subnet, from the address that does carry a default gateway.
    alice
        .tx_default(
            &mut rt,
            IF_NBR,
            Protocol::Udp,
            Ipv4Addr::new(192, 168, 1, 9),
            Ipv4Addr::new(10, 0, 0, 5),
            b"x",
        )
        .unwrap();
    assert_eq!(rt.outbox.pop().unwrap().ip_addr_next_route, Ipv4Addr::new(192, 168, 1, 254));
}
