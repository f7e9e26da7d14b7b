//! ftpd library
//!
//! FTP/FTPS server built around a per-connection protocol engine: byte
//! pipes with a swappable TLS adapter, a pipelined command collector, a
//! middleware dispatch chain and an ordered server command queue.

pub mod adapter;
pub mod cli;
pub mod collector;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod handlers;
pub mod keepalive;
pub mod localization;
pub mod login;
pub mod pipe;
pub mod protocol;
pub mod response;
pub mod server;
pub mod server_command;
pub mod stats;
pub mod tls;
pub mod xferlog;
