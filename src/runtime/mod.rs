// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! External collaborators the IPv4 core is generic over: buffers, timers,
//! the driver/runtime contract, the error taxonomy, and the concurrency
//! markers.

pub mod fail;
pub mod memory;
pub mod network;
pub mod sync;
pub mod timer;
