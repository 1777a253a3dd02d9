// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod checksum;
pub mod icmpv4;
pub mod ipv4;
