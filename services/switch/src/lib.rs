// Library surface of the switch daemon, split out so integration tests
// can drive the real transport in-process.
pub mod config;
pub mod observability;
pub mod transport;
