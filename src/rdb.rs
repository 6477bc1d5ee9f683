/*!
The snapshot decoder: the opcode-dispatch main loop over an RDB stream and
the per-type value decoders.

Every key in the stream becomes one [`KeyValue`] handed to the listener.
Packed container blobs are folded into their enclosing variant and never
surfaced on their own.
*/

use std::io::Read;

use log::{debug, warn};

use crate::cmd::CommandSplitter;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::packed;
use crate::reader::ByteReader;
use crate::SnapshotListener;

const MAGIC: &[u8] = b"REDIS";
const RDB_VERSION_MIN: u32 = 1;
const RDB_VERSION_MAX: u32 = 11;

// sideband opcodes
const RDB_OPCODE_MODULE_AUX: u8 = 247;
const RDB_OPCODE_IDLE: u8 = 248;
const RDB_OPCODE_FREQ: u8 = 249;
const RDB_OPCODE_AUX: u8 = 250;
const RDB_OPCODE_RESIZEDB: u8 = 251;
const RDB_OPCODE_EXPIRETIME_MS: u8 = 252;
const RDB_OPCODE_EXPIRETIME: u8 = 253;
const RDB_OPCODE_SELECTDB: u8 = 254;
const RDB_OPCODE_EOF: u8 = 255;

// value types
const RDB_TYPE_STRING: u8 = 0;
const RDB_TYPE_LIST: u8 = 1;
const RDB_TYPE_SET: u8 = 2;
const RDB_TYPE_ZSET: u8 = 3;
const RDB_TYPE_HASH: u8 = 4;
const RDB_TYPE_ZSET_2: u8 = 5;
const RDB_TYPE_MODULE: u8 = 6;
const RDB_TYPE_MODULE_2: u8 = 7;
const RDB_TYPE_HASH_ZIPMAP: u8 = 9;
const RDB_TYPE_LIST_ZIPLIST: u8 = 10;
const RDB_TYPE_SET_INTSET: u8 = 11;
const RDB_TYPE_ZSET_ZIPLIST: u8 = 12;
const RDB_TYPE_HASH_ZIPLIST: u8 = 13;
const RDB_TYPE_LIST_QUICKLIST: u8 = 14;
const RDB_TYPE_STREAM_LISTPACKS: u8 = 15;
const RDB_TYPE_HASH_LISTPACK: u8 = 16;
const RDB_TYPE_ZSET_LISTPACK: u8 = 17;
const RDB_TYPE_LIST_QUICKLIST_2: u8 = 18;
const RDB_TYPE_STREAM_LISTPACKS_2: u8 = 19;
const RDB_TYPE_SET_LISTPACK: u8 = 20;
const RDB_TYPE_STREAM_LISTPACKS_3: u8 = 21;

// quicklist v2 node containers
const QUICKLIST_NODE_PLAIN: i64 = 1;
const QUICKLIST_NODE_PACKED: i64 = 2;

// module record framing
const RDB_MODULE_OPCODE_EOF: i64 = 0;
const RDB_MODULE_OPCODE_SINT: i64 = 1;
const RDB_MODULE_OPCODE_UINT: i64 = 2;
const RDB_MODULE_OPCODE_FLOAT: i64 = 3;
const RDB_MODULE_OPCODE_DOUBLE: i64 = 4;
const RDB_MODULE_OPCODE_STRING: i64 = 5;

pub const MODULE_SET: [char; 64] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l',
    'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9', '-', '_',
];

/// One member of a sorted set, in source-file order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: Vec<u8>,
    pub score: f64,
}

/// One field of a hash, in source-file order.
#[derive(Debug, Clone, PartialEq)]
pub struct HashField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// The decoded payload of one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Vec<u8>),
    List(Vec<Vec<u8>>),
    Set(Vec<Vec<u8>>),
    SortedSet(Vec<ScoredMember>),
    Hash(Vec<HashField>),
    /// Stream data is structurally consumed but not reconstructed.
    Stream,
    /// Module values cannot be materialised without the module itself; only
    /// the decoded module name is reported.
    Module(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "STRING",
            Value::List(_) => "LIST",
            Value::Set(_) => "SET",
            Value::SortedSet(_) => "ZSET",
            Value::Hash(_) => "HASH",
            Value::Stream => "STREAM",
            Value::Module(_) => "MODULE",
        }
    }
}

/// One decoded key with the sideband state that applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    /// Database the key lives in, carried from the last select opcode.
    pub db: i64,
    /// Absolute expiry in Unix milliseconds, -1 when the key never expires.
    pub expire_at_ms: i64,
    pub value: Value,
}

impl KeyValue {
    pub fn has_expiration(&self) -> bool {
        self.expire_at_ms > 0
    }
}

/// What the stream loop should emit for each decoded key.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub emit_entries: bool,
    pub emit_commands: bool,
    pub max_elements_per_command: usize,
    pub max_bytes_per_command: usize,
}

impl Default for ParseOptions {
    fn default() -> ParseOptions {
        ParseOptions {
            emit_entries: true,
            emit_commands: false,
            max_elements_per_command: 1000,
            max_bytes_per_command: 64 * 1024,
        }
    }
}

impl From<&Config> for ParseOptions {
    fn from(config: &Config) -> ParseOptions {
        ParseOptions {
            emit_entries: config.emit_entries,
            emit_commands: config.emit_commands,
            max_elements_per_command: config.max_elements_per_command,
            max_bytes_per_command: config.max_bytes_per_command,
        }
    }
}

/// Decodes a complete RDB stream, reporting every key to the listener.
///
/// Failures are fatal for the call: the stream is not self-framing, so the
/// loop never tries to resynchronise. The error is reported through
/// [`SnapshotListener::on_error`] and then returned.
pub fn parse<R: Read>(
    input: &mut ByteReader<R>,
    opts: &ParseOptions,
    listener: &mut dyn SnapshotListener,
) -> Result<()> {
    match parse_stream(input, opts, listener) {
        Ok(()) => Ok(()),
        Err(err) => {
            listener.on_error(&err);
            Err(err)
        }
    }
}

fn parse_stream<R: Read>(
    input: &mut ByteReader<R>,
    opts: &ParseOptions,
    listener: &mut dyn SnapshotListener,
) -> Result<()> {
    let magic = input.read_exact(5)?;
    if magic != MAGIC {
        return Err(Error::CorruptedHeader {
            detail: format!("bad magic {:?}", String::from_utf8_lossy(&magic)),
        });
    }
    let version_bytes = input.read_exact(4)?;
    let version_text = String::from_utf8_lossy(&version_bytes).into_owned();
    let version: u32 = version_text.parse().map_err(|_| Error::CorruptedHeader {
        detail: format!("unparseable version '{}'", version_text),
    })?;
    if !(RDB_VERSION_MIN..=RDB_VERSION_MAX).contains(&version) {
        warn!(
            "RDB version {} outside the supported range {}-{}, decoding anyway",
            version, RDB_VERSION_MIN, RDB_VERSION_MAX
        );
    }
    listener.on_start(version);

    let splitter = CommandSplitter::new(opts.max_elements_per_command, opts.max_bytes_per_command);
    let mut current_db: i64 = 0;
    let mut expire_at_ms: i64 = -1;
    let mut total_keys: u64 = 0;

    loop {
        let opcode = input.read_u8()?;
        match opcode {
            RDB_OPCODE_EOF => {
                if expire_at_ms != -1 {
                    return Err(dangling_expiry(input));
                }
                let trailer = input.read_exact(8)?;
                let mut checksum = [0u8; 8];
                checksum.copy_from_slice(&trailer);
                listener.on_end(checksum, total_keys);
                return Ok(());
            }
            RDB_OPCODE_SELECTDB => {
                if expire_at_ms != -1 {
                    return Err(dangling_expiry(input));
                }
                let (db, _) = input.read_length()?;
                current_db = db;
                debug!("selected db {}", db);
                listener.on_db_select(db);
            }
            RDB_OPCODE_EXPIRETIME => {
                if expire_at_ms != -1 {
                    return Err(dangling_expiry(input));
                }
                expire_at_ms = input.read_u32_le()? as i64 * 1000;
            }
            RDB_OPCODE_EXPIRETIME_MS => {
                if expire_at_ms != -1 {
                    return Err(dangling_expiry(input));
                }
                expire_at_ms = input.read_i64_le()?;
            }
            RDB_OPCODE_RESIZEDB => {
                let (db_size, _) = input.read_length()?;
                let (expires_size, _) = input.read_length()?;
                debug!("db holds {} keys, {} with expiry", db_size, expires_size);
            }
            RDB_OPCODE_AUX => {
                let name = input.read_string()?;
                let value = input.read_string()?;
                debug!(
                    "aux {}={}",
                    String::from_utf8_lossy(&name),
                    String::from_utf8_lossy(&value)
                );
            }
            RDB_OPCODE_FREQ => {
                input.read_u8()?;
            }
            RDB_OPCODE_IDLE => {
                input.read_length()?;
            }
            RDB_OPCODE_MODULE_AUX => {
                skip_module_aux(input)?;
            }
            value_type => {
                let key = input.read_string()?;
                let value = read_value(input, value_type)?;
                let entry = KeyValue { key, db: current_db, expire_at_ms, value };
                total_keys += 1;
                if opts.emit_entries {
                    listener.on_entry(&entry);
                }
                if opts.emit_commands {
                    splitter.split(&entry, |event| listener.on_command(&event));
                }
                expire_at_ms = -1;
            }
        }
    }
}

fn dangling_expiry<R: Read>(input: &ByteReader<R>) -> Error {
    Error::CorruptedEncoding {
        offset: input.offset(),
        detail: "expiry opcode without a following key-value".to_string(),
    }
}

fn read_value<R: Read>(input: &mut ByteReader<R>, value_type: u8) -> Result<Value> {
    match value_type {
        RDB_TYPE_STRING => Ok(Value::String(input.read_string()?)),
        RDB_TYPE_LIST | RDB_TYPE_SET => {
            let (count, _) = input.read_length()?;
            let mut items = Vec::with_capacity(count.clamp(0, 10_000) as usize);
            for _ in 0..count {
                items.push(input.read_string()?);
            }
            if value_type == RDB_TYPE_LIST {
                Ok(Value::List(items))
            } else {
                Ok(Value::Set(items))
            }
        }
        RDB_TYPE_ZSET | RDB_TYPE_ZSET_2 => {
            let (count, _) = input.read_length()?;
            let mut entries = Vec::with_capacity(count.clamp(0, 10_000) as usize);
            for _ in 0..count {
                let member = input.read_string()?;
                let score = if value_type == RDB_TYPE_ZSET_2 {
                    input.read_f64_le()?
                } else {
                    input.read_double()?
                };
                entries.push(ScoredMember { member, score });
            }
            Ok(Value::SortedSet(entries))
        }
        RDB_TYPE_HASH => {
            let (count, _) = input.read_length()?;
            let mut fields = Vec::with_capacity(count.clamp(0, 10_000) as usize);
            for _ in 0..count {
                let name = input.read_string()?;
                let value = input.read_string()?;
                fields.push(HashField { name, value });
            }
            Ok(Value::Hash(fields))
        }
        RDB_TYPE_HASH_ZIPMAP => {
            let blob = input.read_string()?;
            let fields = packed::zipmap_fields(&blob)?
                .into_iter()
                .map(|(name, value)| HashField { name, value })
                .collect();
            Ok(Value::Hash(fields))
        }
        RDB_TYPE_LIST_ZIPLIST => {
            let blob = input.read_string()?;
            Ok(Value::List(packed::ziplist_entries(&blob)?))
        }
        RDB_TYPE_SET_INTSET => {
            let blob = input.read_string()?;
            Ok(Value::Set(packed::intset_members(&blob)?))
        }
        RDB_TYPE_ZSET_ZIPLIST => {
            let blob = input.read_string()?;
            let entries = packed::ziplist_entries(&blob)?;
            Ok(Value::SortedSet(pair_scores(entries, input.offset())?))
        }
        RDB_TYPE_HASH_ZIPLIST => {
            let blob = input.read_string()?;
            let entries = packed::ziplist_entries(&blob)?;
            Ok(Value::Hash(pair_fields(entries, input.offset())?))
        }
        RDB_TYPE_LIST_QUICKLIST => {
            let (nodes, _) = input.read_length()?;
            let mut items = Vec::new();
            for _ in 0..nodes {
                let blob = input.read_string()?;
                items.extend(packed::ziplist_entries(&blob)?);
            }
            Ok(Value::List(items))
        }
        RDB_TYPE_LIST_QUICKLIST_2 => {
            let (nodes, _) = input.read_length()?;
            let mut items = Vec::new();
            for _ in 0..nodes {
                let (container, _) = input.read_length()?;
                let data = input.read_string()?;
                match container {
                    QUICKLIST_NODE_PLAIN => items.push(data),
                    QUICKLIST_NODE_PACKED => items.extend(packed::listpack_entries(&data)?),
                    _ => {
                        return Err(Error::CorruptedEncoding {
                            offset: input.offset(),
                            detail: format!("unknown quicklist node container {}", container),
                        });
                    }
                }
            }
            Ok(Value::List(items))
        }
        RDB_TYPE_HASH_LISTPACK => {
            let blob = input.read_string()?;
            let entries = packed::listpack_entries(&blob)?;
            Ok(Value::Hash(pair_fields(entries, input.offset())?))
        }
        RDB_TYPE_ZSET_LISTPACK => {
            let blob = input.read_string()?;
            let entries = packed::listpack_entries(&blob)?;
            Ok(Value::SortedSet(pair_scores(entries, input.offset())?))
        }
        RDB_TYPE_SET_LISTPACK => {
            let blob = input.read_string()?;
            Ok(Value::Set(packed::listpack_entries(&blob)?))
        }
        RDB_TYPE_STREAM_LISTPACKS | RDB_TYPE_STREAM_LISTPACKS_2 | RDB_TYPE_STREAM_LISTPACKS_3 => {
            skip_stream(input, value_type)?;
            Ok(Value::Stream)
        }
        RDB_TYPE_MODULE | RDB_TYPE_MODULE_2 => read_module(input, value_type),
        _ => Err(Error::CorruptedEncoding {
            offset: input.offset(),
            detail: format!("unknown value type {}", value_type),
        }),
    }
}

fn pair_fields(entries: Vec<Vec<u8>>, offset: u64) -> Result<Vec<HashField>> {
    if entries.len() % 2 != 0 {
        return Err(Error::CorruptedEncoding {
            offset,
            detail: "odd number of packed hash elements".to_string(),
        });
    }
    let mut fields = Vec::with_capacity(entries.len() / 2);
    let mut iter = entries.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        fields.push(HashField { name, value });
    }
    Ok(fields)
}

fn pair_scores(entries: Vec<Vec<u8>>, offset: u64) -> Result<Vec<ScoredMember>> {
    if entries.len() % 2 != 0 {
        return Err(Error::CorruptedEncoding {
            offset,
            detail: "odd number of packed sorted set elements".to_string(),
        });
    }
    let mut scored = Vec::with_capacity(entries.len() / 2);
    let mut iter = entries.into_iter();
    while let (Some(member), Some(score_bytes)) = (iter.next(), iter.next()) {
        let text = String::from_utf8_lossy(&score_bytes).into_owned();
        let score = text.parse::<f64>().map_err(|_| Error::CorruptedEncoding {
            offset,
            detail: format!("unparseable packed score '{}'", text),
        })?;
        scored.push(ScoredMember { member, score });
    }
    Ok(scored)
}

/// Advances the cursor over a stream value without reconstructing it.
fn skip_stream<R: Read>(input: &mut ByteReader<R>, value_type: u8) -> Result<()> {
    let v2 = matches!(value_type, RDB_TYPE_STREAM_LISTPACKS_2 | RDB_TYPE_STREAM_LISTPACKS_3);
    let v3 = value_type == RDB_TYPE_STREAM_LISTPACKS_3;

    let (masters, _) = input.read_length()?;
    for _ in 0..masters {
        input.read_string()?; // master entry id
        input.read_string()?; // entry listpack
    }

    input.read_length()?; // length
    input.read_length()?; // last id ms
    input.read_length()?; // last id seq
    if v2 {
        input.read_length()?; // first id ms
        input.read_length()?; // first id seq
        input.read_length()?; // max deleted id ms
        input.read_length()?; // max deleted id seq
        input.read_length()?; // entries added
    }

    let (groups, _) = input.read_length()?;
    for _ in 0..groups {
        input.read_string()?; // group name
        input.read_length()?; // last delivered ms
        input.read_length()?; // last delivered seq
        if v2 {
            input.read_length()?; // entries read
        }

        let (pel, _) = input.read_length()?;
        for _ in 0..pel {
            input.skip(16)?; // stream id
            input.skip(8)?; // delivery time
            input.read_length()?; // delivery count
        }

        let (consumers, _) = input.read_length()?;
        for _ in 0..consumers {
            input.read_string()?; // consumer name
            input.skip(8)?; // seen time
            if v3 {
                input.read_length()?; // active time
            }
            let (consumer_pel, _) = input.read_length()?;
            for _ in 0..consumer_pel {
                input.skip(16)?; // stream id only, the global PEL has the rest
            }
        }
    }
    Ok(())
}

fn read_module<R: Read>(input: &mut ByteReader<R>, value_type: u8) -> Result<Value> {
    let (module_id, _) = input.read_length()?;
    let name = module_name(module_id);
    if value_type == RDB_TYPE_MODULE {
        // no record framing, so the payload size cannot be inferred
        return Err(Error::UnsupportedType { module: name, value_type });
    }
    skip_module_records(input, &name)?;
    Ok(Value::Module(name))
}

/// Decodes the nine-character module name packed into the top 54 bits of the
/// module id; the low 10 bits carry the module version.
pub fn module_name(module_id: i64) -> String {
    let id = module_id as u64;
    let mut name = String::with_capacity(9);
    for i in 0..9 {
        let shift = 10 + (8 - i) * 6;
        name.push(MODULE_SET[((id >> shift) & 63) as usize]);
    }
    name
}

fn skip_module_records<R: Read>(input: &mut ByteReader<R>, module: &str) -> Result<()> {
    loop {
        let (opcode, _) = input.read_length()?;
        match opcode {
            RDB_MODULE_OPCODE_EOF => return Ok(()),
            RDB_MODULE_OPCODE_SINT | RDB_MODULE_OPCODE_UINT => {
                input.read_length()?;
            }
            RDB_MODULE_OPCODE_FLOAT | RDB_MODULE_OPCODE_DOUBLE => {
                input.skip(8)?;
            }
            RDB_MODULE_OPCODE_STRING => {
                input.read_string()?;
            }
            _ => {
                return Err(Error::UnsupportedModule { module: module.to_string(), opcode });
            }
        }
    }
}

fn skip_module_aux<R: Read>(input: &mut ByteReader<R>) -> Result<()> {
    let (module_id, _) = input.read_length()?;
    let name = module_name(module_id);
    input.read_length()?; // when
    skip_module_records(input, &name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_id(name: &str, version: u64) -> i64 {
        let mut id: u64 = 0;
        for (i, ch) in name.chars().enumerate() {
            let idx = MODULE_SET.iter().position(|&c| c == ch).unwrap() as u64;
            id |= idx << (10 + (8 - i) * 6);
        }
        (id | (version & 1023)) as i64
    }

    #[test]
    fn module_name_round_trips() {
        assert_eq!(module_name(module_id("graph-v42", 7)), "graph-v42");
        assert_eq!(module_name(module_id("JSON_doc1", 1023)), "JSON_doc1");
    }

    #[test]
    fn odd_packed_pairs_fail() {
        assert!(matches!(
            pair_fields(vec![b"lonely".to_vec()], 0),
            Err(Error::CorruptedEncoding { .. })
        ));
        assert!(matches!(
            pair_scores(vec![b"a".to_vec(), b"1".to_vec(), b"b".to_vec()], 0),
            Err(Error::CorruptedEncoding { .. })
        ));
    }

    #[test]
    fn packed_scores_accept_specials() {
        let entries = vec![
            b"a".to_vec(),
            b"100".to_vec(),
            b"b".to_vec(),
            b"3.25".to_vec(),
            b"c".to_vec(),
            b"inf".to_vec(),
        ];
        let scored = pair_scores(entries, 0).unwrap();
        assert_eq!(scored[0].score, 100.0);
        assert_eq!(scored[1].score, 3.25);
        assert_eq!(scored[2].score, f64::INFINITY);
    }
}
