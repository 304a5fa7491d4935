pub mod access_log;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod control;
pub mod error;
pub mod http1;
pub mod http2;
pub mod istream;
pub mod processor;
pub mod resource;
pub mod server;
pub mod session;
pub mod socket;
pub mod stats;
pub mod stock;
pub mod tls;
pub mod translation;
pub mod widget;
