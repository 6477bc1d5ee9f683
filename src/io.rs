/*!
Byte-source plumbing around the decoder: the RESP command writer used during
the handshake, the token-bucket rate limiter and the sentinel-delimited
reader for diskless snapshots.
*/

use std::collections::VecDeque;
use std::io::{self, BufWriter, Read, Write};
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::info;

use crate::resp::{CR, DOLLAR, LF, STAR};

/// Writes one command as a RESP array and flushes it.
pub(crate) fn send<T: Write>(output: &mut T, command: &[u8], args: &[&[u8]]) -> io::Result<()> {
    let mut writer = BufWriter::new(output);
    writer.write_all(&[STAR])?;
    writer.write_all((args.len() + 1).to_string().as_bytes())?;
    writer.write_all(&[CR, LF, DOLLAR])?;
    writer.write_all(command.len().to_string().as_bytes())?;
    writer.write_all(&[CR, LF])?;
    writer.write_all(command)?;
    writer.write_all(&[CR, LF])?;
    for arg in args {
        writer.write_all(&[DOLLAR])?;
        writer.write_all(arg.len().to_string().as_bytes())?;
        writer.write_all(&[CR, LF])?;
        writer.write_all(arg)?;
        writer.write_all(&[CR, LF])?;
    }
    writer.flush()
}

/// Token-bucket throttle over a blocking byte source.
///
/// Tokens refill at the configured byte rate with a burst of at most one
/// second's worth; reads block until at least one token is available. A rate
/// of zero disables the throttle entirely.
pub struct RateLimitReader<R: Read> {
    inner: R,
    bytes_per_second: u64,
    available: u64,
    max_tokens: u64,
    last_refill: Instant,
}

impl<R: Read> RateLimitReader<R> {
    pub fn new(inner: R, bytes_per_second: u64) -> RateLimitReader<R> {
        if bytes_per_second > 0 {
            info!("rate limiting reads to {} bytes/sec", bytes_per_second);
        }
        RateLimitReader {
            inner,
            bytes_per_second,
            available: bytes_per_second,
            max_tokens: bytes_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed();
        let tokens = (elapsed.as_nanos() * self.bytes_per_second as u128 / 1_000_000_000) as u64;
        if tokens > 0 {
            self.available = (self.available + tokens).min(self.max_tokens);
            self.last_refill = Instant::now();
        }
    }

    fn acquire(&mut self, requested: usize) -> usize {
        self.refill();
        while self.available == 0 {
            let needed = (requested as u64).min(self.max_tokens).max(1);
            let nanos = needed * 1_000_000_000 / self.bytes_per_second;
            sleep(Duration::from_nanos(nanos.max(1)));
            self.refill();
        }
        let acquired = (requested as u64).min(self.available);
        self.available -= acquired;
        acquired as usize
    }
}

impl<R: Read> Read for RateLimitReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.bytes_per_second == 0 || buf.is_empty() {
            return self.inner.read(buf);
        }
        let allowed = self.acquire(buf.len());
        self.inner.read(&mut buf[..allowed])
    }
}

/// Reader for diskless snapshots: yields bytes until the 40-byte sentinel
/// announced in the `$EOF:` prefix appears, then reports end of stream.
///
/// The sentinel itself is consumed and never handed to the caller. A source
/// that dries up before the sentinel fails with `UnexpectedEof`.
pub struct SentinelReader<R: Read> {
    inner: R,
    sentinel: Vec<u8>,
    window: VecDeque<u8>,
    primed: bool,
    done: bool,
}

impl<R: Read> SentinelReader<R> {
    pub fn new(inner: R, sentinel: Vec<u8>) -> SentinelReader<R> {
        let capacity = sentinel.len();
        SentinelReader {
            inner,
            sentinel,
            window: VecDeque::with_capacity(capacity),
            primed: false,
            done: false,
        }
    }

    fn window_matches(&self) -> bool {
        self.window.len() == self.sentinel.len()
            && self.window.iter().eq(self.sentinel.iter())
    }

    fn read_one(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.inner.read_exact(&mut byte).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before the EOF sentinel",
                )
            } else {
                err
            }
        })?;
        Ok(byte[0])
    }
}

impl<R: Read> Read for SentinelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if !self.primed {
            // lag behind the source by one sentinel length
            for _ in 0..self.sentinel.len() {
                let byte = self.read_one()?;
                self.window.push_back(byte);
            }
            self.primed = true;
        }
        let mut count = 0;
        while count < buf.len() {
            if self.window_matches() {
                self.done = true;
                break;
            }
            buf[count] = self.window.pop_front().expect("lag window underflow");
            count += 1;
            let byte = self.read_one()?;
            self.window.push_back(byte);
        }
        Ok(count)
    }
}
