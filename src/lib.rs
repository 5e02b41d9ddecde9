pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod init;
pub mod model;
pub mod msg;
pub mod sync;
pub mod transport;
