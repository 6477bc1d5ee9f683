/*!
Configuration for a snapshot export run.
*/

use std::net::SocketAddr;
use std::time::Duration;

/// Everything a [`crate::client::Client`] needs to know.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the primary to replicate from.
    pub addr: SocketAddr,
    /// Password, empty for no authentication.
    pub password: String,
    /// Replication ID to offer in PSYNC; `?` requests a full sync.
    pub repl_id: String,
    /// Replication offset to offer in PSYNC; -1 requests a full sync.
    pub repl_offset: i64,
    /// Socket read timeout; `None` never times out.
    pub read_timeout: Option<Duration>,
    /// Socket write timeout; `None` never times out.
    pub write_timeout: Option<Duration>,
    /// Report every decoded key through `on_entry`.
    pub emit_entries: bool,
    /// Translate decoded keys into replay commands through `on_command`.
    pub emit_commands: bool,
    /// Forward the snapshot bytes unparsed through `on_raw_bytes`. No
    /// semantic framing is promised in this mode.
    pub emit_raw_bytes: bool,
    /// Ceiling on primitive elements per replay command.
    pub max_elements_per_command: usize,
    /// Soft ceiling on argument bytes per replay command.
    pub max_bytes_per_command: usize,
    /// Token-bucket cap on the inbound byte rate, 0 for unlimited.
    pub rate_limit_bytes_per_second: u64,
}

impl Config {
    /// A full-sync configuration with the usual defaults.
    pub fn new(addr: SocketAddr) -> Config {
        Config {
            addr,
            password: String::new(),
            repl_id: String::from("?"),
            repl_offset: -1,
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: Some(Duration::from_secs(60)),
            emit_entries: true,
            emit_commands: false,
            emit_raw_bytes: false,
            max_elements_per_command: 1000,
            max_bytes_per_command: 64 * 1024,
            rate_limit_bytes_per_second: 0,
        }
    }
}
