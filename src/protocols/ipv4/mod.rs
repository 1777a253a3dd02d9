// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! IPv4: address tables, buffer/datagram types, options, header
//! encode/decode, the validator, the reassembly engine, the
//! demultiplexer, and transmit preparation — each in its own module.

pub mod addr_table;
pub mod demux;
pub mod header;
pub mod options;
pub mod reassembly;
pub mod transmit;
pub mod types;
pub mod validate;
