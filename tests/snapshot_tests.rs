//! End-to-end decoding of hand-assembled RDB streams.

use std::io::Cursor;

use valkey_snap::cmd::CommandEvent;
use valkey_snap::rdb::{self, HashField, KeyValue, ParseOptions, ScoredMember, Value, MODULE_SET};
use valkey_snap::reader::ByteReader;
use valkey_snap::{Error, SnapshotListener};

#[derive(Default)]
struct Recorder {
    started: Option<u32>,
    db_selects: Vec<i64>,
    entries: Vec<KeyValue>,
    commands: Vec<CommandEvent>,
    end: Option<([u8; 8], u64)>,
    errors: Vec<String>,
}

impl SnapshotListener for Recorder {
    fn on_start(&mut self, rdb_version: u32) {
        self.started = Some(rdb_version);
    }

    fn on_db_select(&mut self, db: i64) {
        self.db_selects.push(db);
    }

    fn on_entry(&mut self, entry: &KeyValue) {
        self.entries.push(entry.clone());
    }

    fn on_command(&mut self, event: &CommandEvent) {
        self.commands.push(event.clone());
    }

    fn on_end(&mut self, checksum: [u8; 8], total_keys: u64) {
        self.end = Some((checksum, total_keys));
    }

    fn on_error(&mut self, err: &Error) {
        self.errors.push(err.to_string());
    }
}

fn both_modes() -> ParseOptions {
    ParseOptions { emit_commands: true, ..ParseOptions::default() }
}

fn run(stream: &[u8], opts: &ParseOptions) -> (Recorder, valkey_snap::Result<()>, u64) {
    let mut reader = ByteReader::new(Cursor::new(stream.to_vec()));
    let mut recorder = Recorder::default();
    let result = rdb::parse(&mut reader, opts, &mut recorder);
    let offset = reader.offset();
    (recorder, result, offset)
}

/// Wraps a record body in the magic, version, end opcode and a zeroed
/// checksum trailer.
fn rdb_stream(body: &[u8]) -> Vec<u8> {
    let mut stream = b"REDIS0011".to_vec();
    stream.extend_from_slice(body);
    stream.push(0xFF);
    stream.extend_from_slice(&[0u8; 8]);
    stream
}

fn len_prefix(n: usize) -> Vec<u8> {
    if n < 64 {
        vec![n as u8]
    } else if n < 16384 {
        vec![0x40 | (n >> 8) as u8, (n & 0xFF) as u8]
    } else {
        let mut v = vec![0x80];
        v.extend_from_slice(&(n as u32).to_be_bytes());
        v
    }
}

fn enc_str(s: &[u8]) -> Vec<u8> {
    let mut v = len_prefix(s.len());
    v.extend_from_slice(s);
    v
}

fn command_text(event: &CommandEvent) -> String {
    event.command.to_string()
}

#[test]
fn string_without_ttl() {
    let mut body = vec![0x00];
    body.extend(enc_str(b"hello"));
    body.extend(enc_str(b"world"));
    let (rec, result, _) = run(&rdb_stream(&body), &both_modes());

    result.unwrap();
    assert_eq!(rec.started, Some(11));
    assert_eq!(
        rec.entries,
        vec![KeyValue {
            key: b"hello".to_vec(),
            db: 0,
            expire_at_ms: -1,
            value: Value::String(b"world".to_vec()),
        }]
    );
    assert_eq!(rec.end.unwrap().1, 1);
    assert_eq!(rec.commands.len(), 1);
    assert_eq!(command_text(&rec.commands[0]), "SET hello world");
    assert_eq!((rec.commands[0].seq, rec.commands[0].total), (1, 1));
}

#[test]
fn string_with_millisecond_ttl() {
    let mut body = vec![0xFC, 0x80, 0xF0, 0xFA, 0x02, 0x00, 0x00, 0x00, 0x00];
    body.push(0x00);
    body.extend(enc_str(b"hello"));
    body.extend(enc_str(b"world"));
    let (rec, result, _) = run(&rdb_stream(&body), &both_modes());

    result.unwrap();
    assert_eq!(rec.entries[0].expire_at_ms, 50_000_000);
    assert!(rec.entries[0].has_expiration());
    let texts: Vec<String> = rec.commands.iter().map(command_text).collect();
    assert_eq!(texts, vec!["SET hello world", "PEXPIREAT hello 50000000"]);
    let seqs: Vec<(usize, usize)> = rec.commands.iter().map(|c| (c.seq, c.total)).collect();
    assert_eq!(seqs, vec![(1, 2), (2, 2)]);
}

#[test]
fn second_resolution_ttl_scales_to_millis() {
    let mut body = vec![0xFD];
    body.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    body.push(0x00);
    body.extend(enc_str(b"k"));
    body.extend(enc_str(b"v"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries[0].expire_at_ms, 1_700_000_000_000);
}

#[test]
fn ttl_binds_only_to_the_next_entry() {
    let mut body = vec![0xFC];
    body.extend_from_slice(&12345i64.to_le_bytes());
    body.push(0x00);
    body.extend(enc_str(b"first"));
    body.extend(enc_str(b"v"));
    body.push(0x00);
    body.extend(enc_str(b"second"));
    body.extend(enc_str(b"v"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries[0].expire_at_ms, 12345);
    assert_eq!(rec.entries[1].expire_at_ms, -1);
}

#[test]
fn quicklist_v2_with_packed_node() {
    // one packed node holding the 7-bit integers 1, 2, 3
    let mut listpack = vec![0u8; 4];
    listpack.extend_from_slice(&3u16.to_le_bytes());
    for i in 1u8..=3 {
        listpack.push(i); // element
        listpack.push(0); // backlen
    }
    listpack.push(0xFF);

    let mut body = vec![0x12];
    body.extend(enc_str(b"list"));
    body.extend(len_prefix(1));
    body.extend(len_prefix(2));
    body.extend(enc_str(&listpack));
    let (rec, result, _) = run(&rdb_stream(&body), &both_modes());

    result.unwrap();
    assert_eq!(
        rec.entries[0].value,
        Value::List(vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()])
    );
    assert_eq!(command_text(&rec.commands[0]), "RPUSH list 1 2 3");
}

#[test]
fn quicklist_v2_with_plain_node() {
    let mut body = vec![0x12];
    body.extend(enc_str(b"list"));
    body.extend(len_prefix(1));
    body.extend(len_prefix(1));
    body.extend(enc_str(b"plain-node"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries[0].value, Value::List(vec![b"plain-node".to_vec()]));
}

#[test]
fn legacy_sorted_set_with_ascii_scores() {
    let mut body = vec![0x03];
    body.extend(enc_str(b"k"));
    body.extend(len_prefix(2));
    body.extend(enc_str(b"a"));
    body.extend([3, b'1', b'0', b'0']); // score "100"
    body.extend(enc_str(b"b"));
    body.push(255); // negative infinity sentinel
    let (rec, result, _) = run(&rdb_stream(&body), &both_modes());

    result.unwrap();
    assert_eq!(
        rec.entries[0].value,
        Value::SortedSet(vec![
            ScoredMember { member: b"a".to_vec(), score: 100.0 },
            ScoredMember { member: b"b".to_vec(), score: f64::NEG_INFINITY },
        ])
    );
    assert_eq!(command_text(&rec.commands[0]), "ZADD k 100 a -inf b");
}

#[test]
fn binary_double_sorted_set() {
    let mut body = vec![0x05];
    body.extend(enc_str(b"k"));
    body.extend(len_prefix(1));
    body.extend(enc_str(b"member"));
    body.extend_from_slice(&3.25f64.to_le_bytes());
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(
        rec.entries[0].value,
        Value::SortedSet(vec![ScoredMember { member: b"member".to_vec(), score: 3.25 }])
    );
}

#[test]
fn lzf_compressed_string_value() {
    let mut body = vec![0x00];
    body.extend(enc_str(b"abc"));
    // special tag 3, then compressed and uncompressed lengths
    body.extend([0xC3, 0x05, 0x0A, 0x00, b'A', 0xE0, 0x00, 0x00]);
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries[0].value, Value::String(b"AAAAAAAAAA".to_vec()));
}

#[test]
fn large_set_chunks_into_three_commands() {
    let members: Vec<Vec<u8>> = (0..2500).map(|i| format!("m{}", i).into_bytes()).collect();
    let mut body = vec![0x02];
    body.extend(enc_str(b"big"));
    body.extend(len_prefix(members.len()));
    for member in &members {
        body.extend(enc_str(member));
    }
    let (rec, result, _) = run(&rdb_stream(&body), &both_modes());

    result.unwrap();
    assert_eq!(rec.commands.len(), 3);
    let sizes: Vec<usize> = rec.commands.iter().map(|c| c.command.args.len() - 1).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    let seqs: Vec<(usize, usize)> = rec.commands.iter().map(|c| (c.seq, c.total)).collect();
    assert_eq!(seqs, vec![(1, 3), (2, 3), (3, 3)]);
    let rejoined: Vec<Vec<u8>> = rec
        .commands
        .iter()
        .flat_map(|c| c.command.args[1..].to_vec())
        .collect();
    assert_eq!(rejoined, members);
}

#[test]
fn db_selection_partitions_the_stream() {
    let mut body = Vec::new();
    body.push(0x00);
    body.extend(enc_str(b"in-db0"));
    body.extend(enc_str(b"v"));
    body.extend([0xFE, 0x05]); // select db 5
    body.push(0x00);
    body.extend(enc_str(b"in-db5"));
    body.extend(enc_str(b"v"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.db_selects, vec![5]);
    assert_eq!(rec.entries[0].db, 0);
    assert_eq!(rec.entries[1].db, 5);
}

#[test]
fn sidebands_are_consumed_silently() {
    let mut body = Vec::new();
    body.push(0xFA); // aux field
    body.extend(enc_str(b"redis-ver"));
    body.extend(enc_str(b"7.2.0"));
    body.extend([0xFB, 0x02, 0x00]); // resizedb
    body.extend([0xF9, 0x07]); // lfu frequency
    body.extend([0xF8, 0x10]); // lru idle
    body.push(0x00);
    body.extend(enc_str(b"k"));
    body.extend(enc_str(b"v"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries.len(), 1);
    assert_eq!(rec.end.unwrap().1, 1);
}

#[test]
fn hash_from_ziplist_blob() {
    let mut ziplist = vec![0u8; 8];
    ziplist.extend_from_slice(&4u16.to_le_bytes());
    for piece in [&b"a"[..], b"aa", b"aaaaa", b"aaaaaaaaaaaaaa"] {
        ziplist.push(0); // prevlen
        ziplist.push(piece.len() as u8);
        ziplist.extend_from_slice(piece);
    }
    ziplist.push(0xFF);

    let mut body = vec![0x0D];
    body.extend(enc_str(b"zipmap_compresses_easily"));
    body.extend(enc_str(&ziplist));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(
        rec.entries[0].value,
        Value::Hash(vec![
            HashField { name: b"a".to_vec(), value: b"aa".to_vec() },
            HashField { name: b"aaaaa".to_vec(), value: b"aaaaaaaaaaaaaa".to_vec() },
        ])
    );
}

#[test]
fn set_from_intset_blob() {
    let mut intset = Vec::new();
    intset.extend_from_slice(&2u32.to_le_bytes());
    intset.extend_from_slice(&3u32.to_le_bytes());
    for v in [32766i16, 32765, 32764] {
        intset.extend_from_slice(&v.to_le_bytes());
    }
    let mut body = vec![0x0B];
    body.extend(enc_str(b"intset_16"));
    body.extend(enc_str(&intset));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(
        rec.entries[0].value,
        Value::Set(vec![b"32766".to_vec(), b"32765".to_vec(), b"32764".to_vec()])
    );
}

#[test]
fn empty_collection_parses_and_emits_no_commands() {
    let mut body = vec![0x01];
    body.extend(enc_str(b"empty"));
    body.extend(len_prefix(0));
    let (rec, result, _) = run(&rdb_stream(&body), &both_modes());

    result.unwrap();
    assert_eq!(rec.entries[0].value, Value::List(Vec::new()));
    assert!(rec.commands.is_empty());
}

#[test]
fn stream_value_is_skipped_structurally() {
    let mut body = vec![0x0F];
    body.extend(enc_str(b"events"));
    body.extend(len_prefix(0)); // no master entries
    body.extend(len_prefix(0)); // length
    body.extend(len_prefix(0)); // last id ms
    body.extend(len_prefix(0)); // last id seq
    body.extend(len_prefix(0)); // no consumer groups
    // the cursor must land exactly on the next opcode
    body.push(0x00);
    body.extend(enc_str(b"after"));
    body.extend(enc_str(b"v"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries[0].value, Value::Stream);
    assert_eq!(rec.entries[1].key, b"after".to_vec());
    assert_eq!(rec.end.unwrap().1, 2);
}

#[test]
fn stream_v2_with_groups_and_pending_entries() {
    let mut body = vec![0x13];
    body.extend(enc_str(b"events"));
    body.extend(len_prefix(1)); // one master entry
    body.extend(enc_str(&[0u8; 16])); // master id
    body.extend(enc_str(b"opaque-listpack-bytes"));
    for _ in 0..3 {
        body.extend(len_prefix(0)); // length, last id
    }
    for _ in 0..5 {
        body.extend(len_prefix(0)); // first id, max deleted id, entries added
    }
    body.extend(len_prefix(1)); // one group
    body.extend(enc_str(b"g"));
    body.extend(len_prefix(0)); // last delivered ms
    body.extend(len_prefix(0)); // last delivered seq
    body.extend(len_prefix(0)); // entries read
    body.extend(len_prefix(1)); // one pending entry
    body.extend([0u8; 16]); // id
    body.extend([0u8; 8]); // delivery time
    body.extend(len_prefix(3)); // delivery count
    body.extend(len_prefix(1)); // one consumer
    body.extend(enc_str(b"c"));
    body.extend([0u8; 8]); // seen time
    body.extend(len_prefix(1)); // consumer PEL
    body.extend([0u8; 16]);
    body.push(0x00);
    body.extend(enc_str(b"after"));
    body.extend(enc_str(b"v"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries[0].value, Value::Stream);
    assert_eq!(rec.entries[1].key, b"after".to_vec());
}

fn module_id(name: &str, version: u64) -> i64 {
    let mut id: u64 = 0;
    for (i, ch) in name.chars().enumerate() {
        let idx = MODULE_SET.iter().position(|&c| c == ch).unwrap() as u64;
        id |= idx << (10 + (8 - i) * 6);
    }
    (id | (version & 1023)) as i64
}

fn enc_len64(value: i64) -> Vec<u8> {
    let mut v = vec![0x81];
    v.extend_from_slice(&value.to_le_bytes());
    v
}

#[test]
fn module_v2_value_reports_the_name() {
    let id = module_id("graph-v42", 3);
    let mut body = vec![0x07];
    body.extend(enc_str(b"mkey"));
    body.extend(enc_len64(id));
    // opcode-tagged records: a string, an unsigned int, a double, then EOF
    body.extend(len_prefix(5));
    body.extend(enc_str(b"payload"));
    body.extend(len_prefix(2));
    body.extend(len_prefix(17));
    body.extend(len_prefix(4));
    body.extend_from_slice(&1.5f64.to_le_bytes());
    body.extend(len_prefix(0));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries[0].value, Value::Module("graph-v42".to_string()));
}

#[test]
fn legacy_module_value_is_fatal() {
    let mut body = vec![0x06];
    body.extend(enc_str(b"mkey"));
    body.extend(enc_len64(module_id("graph-v42", 3)));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    assert!(matches!(result, Err(Error::UnsupportedType { .. })));
    assert_eq!(rec.errors.len(), 1);
    assert!(rec.end.is_none());
}

#[test]
fn module_aux_sideband_is_skipped() {
    let mut body = vec![0xF7];
    body.extend(enc_len64(module_id("graph-v42", 3)));
    body.extend(len_prefix(1)); // when
    body.extend(len_prefix(5));
    body.extend(enc_str(b"aux-record"));
    body.extend(len_prefix(0));
    body.push(0x00);
    body.extend(enc_str(b"k"));
    body.extend(enc_str(b"v"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.entries.len(), 1);
}

#[test]
fn unknown_value_type_is_fatal() {
    let mut body = vec![0x63];
    body.extend(enc_str(b"k"));
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    assert!(matches!(result, Err(Error::CorruptedEncoding { .. })));
    assert_eq!(rec.errors.len(), 1);
}

#[test]
fn bad_magic_is_fatal() {
    let mut stream = b"FEDIS0011".to_vec();
    stream.push(0xFF);
    stream.extend_from_slice(&[0u8; 8]);
    let (rec, result, _) = run(&stream, &ParseOptions::default());

    assert!(matches!(result, Err(Error::CorruptedHeader { .. })));
    assert_eq!(rec.errors.len(), 1);
}

#[test]
fn out_of_range_version_still_decodes() {
    let mut stream = b"REDIS0012".to_vec();
    stream.push(0x00);
    stream.extend(enc_str(b"k"));
    stream.extend(enc_str(b"v"));
    stream.push(0xFF);
    stream.extend_from_slice(&[0u8; 8]);
    let (rec, result, _) = run(&stream, &ParseOptions::default());

    result.unwrap();
    assert_eq!(rec.started, Some(12));
    assert_eq!(rec.entries.len(), 1);
}

#[test]
fn expiry_without_entry_is_fatal() {
    let body = vec![0xFC, 0, 0, 0, 0, 0, 0, 0, 0];
    let (rec, result, _) = run(&rdb_stream(&body), &ParseOptions::default());

    assert!(matches!(result, Err(Error::CorruptedEncoding { .. })));
    assert_eq!(rec.errors.len(), 1);
}

#[test]
fn truncated_stream_reports_unexpected_end() {
    let mut stream = b"REDIS0011".to_vec();
    stream.push(0x00);
    stream.extend(enc_str(b"key"));
    stream.extend(len_prefix(10)); // promises ten value bytes
    stream.extend_from_slice(b"only4");
    let (rec, result, _) = run(&stream, &ParseOptions::default());

    assert!(matches!(result, Err(Error::UnexpectedEnd { .. })));
    assert_eq!(rec.errors.len(), 1);
}

#[test]
fn checksum_trailer_reaches_the_listener() {
    let mut stream = b"REDIS0011".to_vec();
    stream.push(0xFF);
    stream.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let (rec, result, offset) = run(&stream, &ParseOptions::default());

    result.unwrap();
    let (checksum, total) = rec.end.unwrap();
    assert_eq!(checksum, [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(total, 0);
    assert_eq!(offset, stream.len() as u64);
}

#[test]
fn parser_consumes_exactly_the_stream() {
    let mut body = vec![0x00];
    body.extend(enc_str(b"hello"));
    body.extend(enc_str(b"world"));
    let stream = rdb_stream(&body);
    let (_, result, offset) = run(&stream, &both_modes());

    result.unwrap();
    assert_eq!(offset, stream.len() as u64);
}

#[test]
fn entry_mode_can_be_disabled() {
    let mut body = vec![0x00];
    body.extend(enc_str(b"k"));
    body.extend(enc_str(b"v"));
    let opts = ParseOptions {
        emit_entries: false,
        emit_commands: true,
        ..ParseOptions::default()
    };
    let (rec, result, _) = run(&rdb_stream(&body), &opts);

    result.unwrap();
    assert!(rec.entries.is_empty());
    assert_eq!(rec.commands.len(), 1);
    // the key still counts even when entries are not emitted
    assert_eq!(rec.end.unwrap().1, 1);
}
