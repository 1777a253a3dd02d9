// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fixture hosts shared by unit and integration tests: named IPv4
//! addresses and builder functions that return an [`Engine`] with its
//! address already configured, paired with a [`TestRuntime`].

pub mod runtime;

pub use self::runtime::TestRuntime;
pub use crate::engine::Engine;

use crate::runtime::network::config::Ipv4Config;
use ::std::net::Ipv4Addr;

/// Interface number every fixture host configures its address on.
pub const IF_NBR: u8 = 0;
pub const SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const DEFAULT_MTU: u16 = 1500;

pub const ALICE_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const BOB_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
pub const CARRIE_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 3);
pub const JUAN_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 69);

fn new_host(addr: Ipv4Addr) -> Engine {
    let _ = ::env_logger::builder().is_test(true).try_init();
    let mut engine = Engine::new(Ipv4Config::default());
    engine
        .cfg_add_static(IF_NBR, addr, SUBNET_MASK, Ipv4Addr::UNSPECIFIED)
        .expect("fixture address configuration must succeed");
    engine
}

pub fn new_alice() -> Engine {
    new_host(ALICE_IPV4)
}

pub fn new_bob() -> Engine {
    new_host(BOB_IPV4)
}

pub fn new_carrie() -> Engine {
    new_host(CARRIE_IPV4)
}

pub fn new_juan() -> Engine {
    new_host(JUAN_IPV4)
}
