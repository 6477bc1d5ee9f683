/*!
Bulk export of a live Valkey/Redis dataset without a server restart and
without a disk-resident dump file.

The crate speaks the PSYNC replication handshake, receives the full snapshot
the primary streams back, and decodes the binary dump format into structured
events: one [`rdb::KeyValue`] per key, optionally translated into replay
commands by [`cmd::CommandSplitter`].

Decoding covers every dump layout a current server emits, across the three
generations of compact container formats (ziplist, zipmap and intset;
quicklist; listpack), the integer and LZF string specialisations, expiry and
database-selection sidebands, structural skipping of stream values, and
name-only notification of module values.

Implement [`SnapshotListener`] and hand it to a [`client::Client`] to consume
a live server, or feed any byte source to [`rdb::parse`] directly.
*/

pub mod client;
pub mod cmd;
pub mod config;
pub mod crc64;
mod error;
pub mod io;
pub mod lzf;
pub mod packed;
pub mod rdb;
pub mod reader;
pub mod resp;

pub use error::{Error, Result};

use cmd::CommandEvent;
use rdb::KeyValue;

/// Receives everything a snapshot run produces, on the thread that parses.
///
/// Every method has a default no-op body, so implementations only pick the
/// events they care about.
pub trait SnapshotListener {
    /// The snapshot header was read; `rdb_version` is the dump format
    /// version the primary wrote.
    fn on_start(&mut self, rdb_version: u32) {
        let _ = rdb_version;
    }

    /// A database-selection opcode switched the current db.
    fn on_db_select(&mut self, db: i64) {
        let _ = db;
    }

    /// One key was decoded. Only called when entry emission is enabled.
    fn on_entry(&mut self, entry: &KeyValue) {
        let _ = entry;
    }

    /// One replay command was produced. Only called when command emission is
    /// enabled.
    fn on_command(&mut self, event: &CommandEvent) {
        let _ = event;
    }

    /// A chunk of unparsed snapshot bytes, in raw passthrough mode only.
    /// Chunk boundaries carry no semantic meaning.
    fn on_raw_bytes(&mut self, data: &[u8], offset: u64) {
        let _ = (data, offset);
    }

    /// The end opcode was reached. The trailing checksum is handed over
    /// without being verified.
    fn on_end(&mut self, checksum: [u8; 8], total_keys: u64) {
        let _ = (checksum, total_keys);
    }

    /// Decoding failed; the error is also returned to the caller. The stream
    /// position is lost, no further events will follow.
    fn on_error(&mut self, err: &Error) {
        let _ = err;
    }
}

/// A listener that ignores everything.
pub struct NoOpListener;

impl SnapshotListener for NoOpListener {}

/// A source of snapshots, driven to completion by the calling thread.
pub trait SnapshotClient {
    /// Blocks until the snapshot has been fully consumed or an error ends
    /// the run.
    fn run(&mut self) -> Result<()>;
}

/// Lossy UTF-8 view of a byte string, for logs and diagnostics.
pub fn to_string(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}
