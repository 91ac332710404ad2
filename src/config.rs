//! CLI parsing and the protocol's compile-time constants.
//!
//! The wire protocol's limits (worker count, max command size, max cip
//! size, oversized-command threshold) are specified as compile-time
//! constants, not runtime configuration — they're grouped here, alongside
//! the `clap`-derived CLI, purely so every knob lives in one place, the way
//! the pack's other server binaries (`kevinboulain-sin`,
//! `SleepingPills-bushhammer/server`) group their startup config.

use std::path::PathBuf;

use clap::Parser;

/// Number of pre-spawned workers in the pool.
pub const WORKER_COUNT: usize = 4;

/// Oversized-command defense threshold.
pub const OVERSIZED_THRESHOLD: u32 = 5;

/// Max command length after frame decoding, in bytes.
pub const CMD_MAX_LEN: u32 = 300;

/// Max cip text length, in bytes.
pub const CIP_MAX_LEN: usize = 280;

/// Default on-disk user file.
pub const DEFAULT_USERS_FILE: &str = "./users.txt";

/// TCP keepalive parameters for the listening socket.
pub const KEEPALIVE_IDLE_SECS: u64 = 10;
pub const KEEPALIVE_INTERVAL_SECS: u64 = 10;
pub const KEEPALIVE_RETRIES: u32 = 6;

/// Listen backlog.
pub const LISTEN_BACKLOG: u32 = 10;

/// A small, `Copy` bundle of the limits `connection.rs` needs per request,
/// threaded through instead of reaching for the constants directly so
/// tests can exercise tighter limits without touching global state.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_frame_len: u32,
    pub cmd_max_len: u32,
    pub cip_max_len: usize,
    pub oversized_threshold: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_frame_len: crate::frame::DEFAULT_MAX_FRAME_LEN,
            cmd_max_len: CMD_MAX_LEN,
            cip_max_len: CIP_MAX_LEN,
            oversized_threshold: OVERSIZED_THRESHOLD,
        }
    }
}

/// `server <host> <port>`, with test/ops overrides that the
/// original's compile-time constants didn't allow for.
#[derive(Parser, Debug)]
#[command(name = "cips-server", about = "Multi-client cips messaging server")]
pub struct Args {
    /// Address to bind the listening socket to.
    pub host: String,

    /// Port to bind the listening socket to.
    pub port: u16,

    /// Path to the append-only user file.
    #[arg(long, default_value = DEFAULT_USERS_FILE)]
    pub users_file: PathBuf,

    /// Override the worker pool size (compile-time default: 4).
    #[arg(long, default_value_t = WORKER_COUNT)]
    pub workers: usize,
}
