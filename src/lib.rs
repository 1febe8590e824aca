#[macro_use]
extern crate tracing;
extern crate nix;
extern crate snafu;

pub mod bdev;
pub mod bs;
pub mod core;
pub mod logger;
pub mod lvs;
