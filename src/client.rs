/*!
The PSYNC replication client.

Connects to a primary, walks through the handshake and hands the snapshot
payload to the decoder (or, in raw mode, straight to the listener).

# Example

```no_run
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use valkey_snap::client;
use valkey_snap::config::Config;
use valkey_snap::{NoOpListener, SnapshotClient};

let config = Config::new("127.0.0.1:6379".parse().unwrap());
let running = Arc::new(AtomicBool::new(true));
let mut client = client::new(config, running);
client.set_listener(Rc::new(RefCell::new(NoOpListener)));
client.run()?;
# Ok::<(), valkey_snap::Error>(())
```
*/

use std::cell::RefCell;
use std::io::{BufReader, Read};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use byteorder::ReadBytesExt;
use log::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::{self as wire, RateLimitReader, SentinelReader};
use crate::rdb::{self, ParseOptions};
use crate::reader::ByteReader;
use crate::resp::{Resp, RespDecode, DOLLAR, LF};
use crate::{NoOpListener, SnapshotClient, SnapshotListener};

const RETRY_DELAY: Duration = Duration::from_secs(5);
const RAW_CHUNK: usize = 64 * 1024;

/// Exports one snapshot from a single primary.
pub struct Client {
    pub config: Config,
    conn: Option<Conn>,
    listener: Rc<RefCell<dyn SnapshotListener>>,
    running: Arc<AtomicBool>,
}

struct Conn {
    reader: Box<dyn Read>,
    writer: TcpStream,
}

/// How the primary frames the snapshot payload.
enum RdbPayload {
    Sized(u64),
    Diskless(Vec<u8>),
}

enum SyncOutcome {
    Done,
    Retry,
}

/// Creates a client. The `running` flag is read between retries so another
/// thread can wind the client down.
pub fn new(config: Config, running: Arc<AtomicBool>) -> Client {
    Client {
        config,
        conn: None,
        listener: Rc::new(RefCell::new(NoOpListener)),
        running,
    }
}

impl Client {
    pub fn set_listener(&mut self, listener: Rc<RefCell<dyn SnapshotListener>>) {
        self.listener = listener;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn connect(&mut self) -> Result<()> {
        let stream = TcpStream::connect(self.config.addr)?;
        stream.set_read_timeout(self.config.read_timeout)?;
        stream.set_write_timeout(self.config.write_timeout)?;
        info!("connected to {}", self.config.addr);

        let buffered = BufReader::with_capacity(64 * 1024, stream.try_clone()?);
        let reader: Box<dyn Read> = if self.config.rate_limit_bytes_per_second > 0 {
            Box::new(RateLimitReader::new(buffered, self.config.rate_limit_bytes_per_second))
        } else {
            Box::new(buffered)
        };
        self.conn = Some(Conn { reader, writer: stream });
        Ok(())
    }

    fn conn(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("client not connected")
    }

    fn auth(&mut self) -> Result<()> {
        if self.config.password.is_empty() {
            return Ok(());
        }
        let password = self.config.password.clone();
        let conn = self.conn();
        wire::send(&mut conn.writer, b"AUTH", &[password.as_bytes()])?;
        expect_ok(conn.reader.decode_resp()?, "AUTH")?;
        info!("authenticated");
        Ok(())
    }

    fn ping(&mut self) -> Result<()> {
        let conn = self.conn();
        wire::send(&mut conn.writer, b"PING", &[])?;
        match conn.reader.decode_resp()? {
            Resp::Simple(s) if s == "PONG" => Ok(()),
            Resp::Bulk(b) if b == b"PONG" => Ok(()),
            Resp::Error(msg) => Err(Error::Handshake(format!("PING failed: {}", msg))),
            other => Err(Error::Handshake(format!("unexpected PING reply: {:?}", other))),
        }
    }

    /// Announces the local port and the capabilities a replica is expected
    /// to declare before PSYNC.
    fn send_replconf(&mut self) -> Result<()> {
        let conn = self.conn();
        let port = conn.writer.local_addr()?.port().to_string();
        wire::send(&mut conn.writer, b"REPLCONF", &[b"listening-port", port.as_bytes()])?;
        expect_ok(conn.reader.decode_resp()?, "REPLCONF listening-port")?;
        wire::send(&mut conn.writer, b"REPLCONF", &[b"capa", b"eof", b"capa", b"psync2"])?;
        expect_ok(conn.reader.decode_resp()?, "REPLCONF capa")?;
        Ok(())
    }

    fn try_sync(&mut self) -> Result<SyncOutcome> {
        let repl_id = self.config.repl_id.clone();
        let repl_offset = self.config.repl_offset.to_string();
        let conn = self.conn();
        wire::send(&mut conn.writer, b"PSYNC", &[repl_id.as_bytes(), repl_offset.as_bytes()])?;

        match conn.reader.decode_resp()? {
            Resp::Simple(line) if line.starts_with("FULLRESYNC") => {
                let mut parts = line.split_whitespace();
                let id = parts
                    .nth(1)
                    .ok_or_else(|| Error::Handshake(format!("malformed reply '{}'", line)))?;
                let offset = parts
                    .next()
                    .and_then(|o| o.parse::<i64>().ok())
                    .ok_or_else(|| Error::Handshake(format!("malformed reply '{}'", line)))?;
                self.config.repl_id = id.to_string();
                self.config.repl_offset = offset;
                info!("full resync granted, replid={} offset={}", id, offset);
                self.read_snapshot()?;
                Ok(SyncOutcome::Done)
            }
            Resp::Simple(line) if line.starts_with("CONTINUE") => {
                if let Some(id) = line.split_whitespace().nth(1) {
                    self.config.repl_id = id.to_string();
                }
                info!("partial resync acknowledged, no snapshot will follow");
                Ok(SyncOutcome::Done)
            }
            Resp::Error(msg) if msg.starts_with("NOMASTERLINK") || msg.starts_with("LOADING") => {
                warn!("primary not ready: {}", msg);
                Ok(SyncOutcome::Retry)
            }
            Resp::Error(msg) if msg.contains("unknown command") => {
                info!("PSYNC not supported, falling back to SYNC");
                let conn = self.conn();
                wire::send(&mut conn.writer, b"SYNC", &[])?;
                self.read_snapshot()?;
                Ok(SyncOutcome::Done)
            }
            Resp::Error(msg) => Err(Error::Handshake(format!("PSYNC failed: {}", msg))),
            other => Err(Error::Handshake(format!("unexpected PSYNC reply: {:?}", other))),
        }
    }

    fn read_snapshot(&mut self) -> Result<()> {
        let config = self.config.clone();
        let listener = self.listener.clone();
        let conn = self.conn();
        let mut listener = listener.borrow_mut();
        match read_rdb_header(conn.reader.as_mut())? {
            RdbPayload::Sized(size) => {
                info!("snapshot payload is {} bytes", size);
                let bounded = conn.reader.as_mut().take(size);
                consume(bounded, &config, &mut *listener)
            }
            RdbPayload::Diskless(sentinel) => {
                info!("diskless snapshot, delimited by an EOF sentinel");
                let delimited = SentinelReader::new(conn.reader.as_mut(), sentinel);
                consume(delimited, &config, &mut *listener)
            }
        }
    }

    fn replicate(&mut self) -> Result<()> {
        self.connect()?;
        self.auth()?;
        self.ping()?;
        self.send_replconf()?;
        while self.is_running() {
            match self.try_sync()? {
                SyncOutcome::Done => return Ok(()),
                SyncOutcome::Retry => sleep(RETRY_DELAY),
            }
        }
        Ok(())
    }
}

impl SnapshotClient for Client {
    fn run(&mut self) -> Result<()> {
        self.replicate()
    }
}

fn consume<R: Read>(
    source: R,
    config: &Config,
    listener: &mut dyn SnapshotListener,
) -> Result<()> {
    if config.emit_raw_bytes {
        let mut source = source;
        let mut buf = vec![0u8; RAW_CHUNK];
        let mut offset = 0u64;
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            listener.on_raw_bytes(&buf[..n], offset);
            offset += n as u64;
        }
        listener.on_end([0u8; 8], 0);
        Ok(())
    } else {
        let mut reader = ByteReader::new(source);
        rdb::parse(&mut reader, &ParseOptions::from(config), listener)
    }
}

/// Reads the `$` line that introduces the snapshot payload. A numeric size
/// yields a bounded payload; `EOF:<sentinel>` announces diskless delivery.
fn read_rdb_header(reader: &mut dyn Read) -> Result<RdbPayload> {
    let mut first = reader.read_u8()?;
    // keepalive newlines may precede the payload while the dump is prepared
    while first == LF {
        first = reader.read_u8()?;
    }
    if first != DOLLAR {
        return Err(Error::Handshake(format!(
            "expected a bulk prefix for the snapshot, got 0x{:02X}",
            first
        )));
    }
    let line = reader.decode_line()?;
    if let Some(sentinel) = line.strip_prefix("EOF:") {
        if sentinel.len() != 40 {
            return Err(Error::Handshake(format!(
                "EOF sentinel must be 40 bytes, got {}",
                sentinel.len()
            )));
        }
        return Ok(RdbPayload::Diskless(sentinel.as_bytes().to_vec()));
    }
    line.parse::<u64>()
        .map(RdbPayload::Sized)
        .map_err(|_| Error::Handshake(format!("unparseable snapshot size '{}'", line)))
}

fn expect_ok(reply: Resp, what: &str) -> Result<()> {
    match reply {
        Resp::Simple(s) if s == "OK" => Ok(()),
        Resp::Error(msg) => Err(Error::Handshake(format!("{} failed: {}", what, msg))),
        other => Err(Error::Handshake(format!("{} unexpected reply: {:?}", what, other))),
    }
}
