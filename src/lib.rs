// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Embedded IPv4 reassembly, validation, and transmit-preparation engine.
//!
//! This crate implements the receive-side half of an IPv4 stack —
//! address-table lookup, header/option validation (RFC 791/1122), list-
//! of-lists fragment reassembly, and demultiplexing to upper-layer
//! protocols — plus transmit-side argument validation and route
//! selection. It does not implement ARP, ICMP echo, IGMP group
//! membership, or any transport protocol; those sit behind the
//! [`protocols::ipv4::demux::DemuxTarget`] seam.

pub mod engine;
pub mod protocols;
pub mod runtime;
pub mod test_helpers;

pub use engine::Engine;
