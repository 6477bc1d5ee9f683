/*!
Turns decoded entries into replay-ready commands.

Large collections are chunked so no single command exceeds the configured
element or byte ceilings; an expiry is appended as a trailing `PEXPIREAT`.
*/

use std::fmt;

use crate::rdb::{KeyValue, Value};

/// A replay command: an uppercase verb and its binary arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str, args: Vec<Vec<u8>>) -> Command {
        Command { name: name.to_uppercase(), args }
    }

    /// Serialises the command as a RESP array, ready to send to a server.
    pub fn to_resp(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("*{}\r\n", self.args.len() + 1).as_bytes());
        out.extend_from_slice(format!("${}\r\n", self.name.len()).as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// One command produced from a decoded entry, with its position in the
/// sequence the entry expanded to.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    pub command: Command,
    /// The key the command was generated from.
    pub source_key: Vec<u8>,
    pub db: i64,
    /// 1-based position within the commands for this key.
    pub seq: usize,
    /// Number of commands this key expanded to, the expiry included.
    pub total: usize,
}

impl CommandEvent {
    pub fn is_first(&self) -> bool {
        self.seq == 1
    }

    pub fn is_last(&self) -> bool {
        self.seq == self.total
    }

    pub fn is_chunked(&self) -> bool {
        self.total > 1
    }
}

/// Stateless splitter from entries to command sequences.
pub struct CommandSplitter {
    max_elements: usize,
    max_bytes: usize,
}

impl CommandSplitter {
    pub fn new(max_elements: usize, max_bytes: usize) -> CommandSplitter {
        CommandSplitter {
            max_elements: max_elements.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Expands one entry into replay commands. Empty collections produce
    /// nothing, streams and modules cannot be reconstructed and produce
    /// nothing either.
    pub fn split(&self, entry: &KeyValue, mut emit: impl FnMut(CommandEvent)) {
        match &entry.value {
            Value::String(value) => {
                let total = if entry.has_expiration() { 2 } else { 1 };
                self.emit_event(
                    entry,
                    Command::new("SET", vec![entry.key.clone(), value.clone()]),
                    1,
                    total,
                    &mut emit,
                );
                self.emit_expire(entry, total, &mut emit);
            }
            Value::List(items) => {
                self.split_flat(entry, "RPUSH", items, &mut emit);
            }
            Value::Set(members) => {
                self.split_flat(entry, "SADD", members, &mut emit);
            }
            Value::SortedSet(entries) => {
                let pairs: Vec<[Vec<u8>; 2]> = entries
                    .iter()
                    .map(|e| [format_score(e.score), e.member.clone()])
                    .collect();
                self.split_pairs(entry, "ZADD", pairs, &mut emit);
            }
            Value::Hash(fields) => {
                let pairs: Vec<[Vec<u8>; 2]> = fields
                    .iter()
                    .map(|f| [f.name.clone(), f.value.clone()])
                    .collect();
                self.split_pairs(entry, "HSET", pairs, &mut emit);
            }
            Value::Stream | Value::Module(_) => {}
        }
    }

    fn split_flat(
        &self,
        entry: &KeyValue,
        verb: &str,
        items: &[Vec<u8>],
        emit: &mut impl FnMut(CommandEvent),
    ) {
        if items.is_empty() {
            return;
        }
        let chunks = chunk(items, self.max_elements, self.max_bytes, |item| item.len());
        let total = chunks.len() + entry.has_expiration() as usize;
        for (index, chunk) in chunks.iter().enumerate() {
            let mut args = Vec::with_capacity(chunk.len() + 1);
            args.push(entry.key.clone());
            args.extend(chunk.iter().cloned());
            self.emit_event(entry, Command::new(verb, args), index + 1, total, emit);
        }
        self.emit_expire(entry, total, emit);
    }

    fn split_pairs(
        &self,
        entry: &KeyValue,
        verb: &str,
        pairs: Vec<[Vec<u8>; 2]>,
        emit: &mut impl FnMut(CommandEvent),
    ) {
        if pairs.is_empty() {
            return;
        }
        // each pair consumes two of the element budget
        let pairs_per_command = (self.max_elements / 2).max(1);
        let chunks = chunk(&pairs, pairs_per_command, self.max_bytes, |pair| {
            pair[0].len() + pair[1].len()
        });
        let total = chunks.len() + entry.has_expiration() as usize;
        for (index, chunk) in chunks.iter().enumerate() {
            let mut args = Vec::with_capacity(chunk.len() * 2 + 1);
            args.push(entry.key.clone());
            for pair in chunk.iter() {
                args.push(pair[0].clone());
                args.push(pair[1].clone());
            }
            self.emit_event(entry, Command::new(verb, args), index + 1, total, emit);
        }
        self.emit_expire(entry, total, emit);
    }

    fn emit_event(
        &self,
        entry: &KeyValue,
        command: Command,
        seq: usize,
        total: usize,
        emit: &mut impl FnMut(CommandEvent),
    ) {
        emit(CommandEvent {
            command,
            source_key: entry.key.clone(),
            db: entry.db,
            seq,
            total,
        });
    }

    fn emit_expire(&self, entry: &KeyValue, total: usize, emit: &mut impl FnMut(CommandEvent)) {
        if !entry.has_expiration() {
            return;
        }
        let command = Command::new(
            "PEXPIREAT",
            vec![entry.key.clone(), entry.expire_at_ms.to_string().into_bytes()],
        );
        self.emit_event(entry, command, total, total, emit);
    }
}

/// Greedy chunking under an item ceiling and a soft byte ceiling: a new chunk
/// starts when adding the next item would exceed either and the current chunk
/// is non-empty.
fn chunk<T, F: Fn(&T) -> usize>(
    items: &[T],
    max_items: usize,
    max_bytes: usize,
    weigh: F,
) -> Vec<&[T]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0;
    for (index, item) in items.iter().enumerate() {
        let weight = weigh(item);
        if index > start && (index - start >= max_items || bytes + weight > max_bytes) {
            chunks.push(&items[start..index]);
            start = index;
            bytes = 0;
        }
        bytes += weight;
    }
    if start < items.len() {
        chunks.push(&items[start..]);
    }
    chunks
}

/// Renders a score the way a server expects it back: `+inf`, `-inf` and
/// `nan` pass through, whole numbers drop the fraction.
pub fn format_score(score: f64) -> Vec<u8> {
    if score == f64::INFINITY {
        b"+inf".to_vec()
    } else if score == f64::NEG_INFINITY {
        b"-inf".to_vec()
    } else if score.is_nan() {
        b"nan".to_vec()
    } else if score == score.trunc() && score >= i64::MIN as f64 && score < i64::MAX as f64 {
        (score as i64).to_string().into_bytes()
    } else {
        score.to_string().into_bytes()
    }
}
