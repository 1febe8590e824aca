//! Test utility functions.

#![allow(dead_code)]

use std::future::Future;

use lvol_engine::{
    bdev::BdevBsDev,
    bs::BsDev,
    core::{Bdev, EngineEnvironment, Reactor, Reactors},
};

/// bring up the engine with the given number of reactors; only the first
/// call in a test binary takes effect
pub fn test_init(reactor_count: u32) {
    EngineEnvironment {
        reactor_count,
        log_level: "info".into(),
    }
    .init();
}

/// run a future to completion on the master reactor
pub fn run<F, R>(future: F) -> R
where
    F: Future<Output = R> + 'static,
    R: 'static,
{
    Reactor::block_on(future).expect("future was aborted")
}

/// drain every reactor queue
pub fn settle() {
    Reactors::poll_until_idle();
}

/// a read-write blobstore device over the named bdev, claiming it
pub fn pool_dev(name: &str) -> Box<dyn BsDev> {
    Box::new(
        BdevBsDev::create(name, true, Some("lvs")).expect("open pool bdev"),
    )
}

/// write `data` to the bdev at the given block offset
pub async fn fill_bdev(bdev: &Bdev, offset_blocks: u64, data: &[u8]) {
    let desc = bdev.open(true).expect("open for write");
    let ch = desc.get_io_channel().expect("io channel");
    let num_blocks = data.len() as u64 / bdev.block_len() as u64;
    ch.write_blocks(data, offset_blocks, num_blocks)
        .await
        .expect("write");
}
