/*!
Error types shared by the snapshot decoder and the replication client.
*/

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while pulling and decoding a snapshot.
///
/// Parse errors are fatal for the call that produced them: the RDB stream is
/// not self-framing, so once the cursor is lost there is no way to resume at
/// the next entry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte source ran dry in the middle of a structure.
    #[error("unexpected end of stream at offset {offset}")]
    UnexpectedEnd { offset: u64 },

    /// Bad magic bytes or an unparseable version field.
    #[error("corrupted snapshot header: {detail}")]
    CorruptedHeader { detail: String },

    /// Unknown opcode, unknown packed-container encoding byte, or a length
    /// prefix that matches no scheme.
    #[error("corrupted encoding at offset {offset}: {detail}")]
    CorruptedEncoding { offset: u64, detail: String },

    /// LZF literal overrun, back-reference underflow, or a decompressed
    /// length that does not match the declared one.
    #[error("corrupted compression: {detail}")]
    CorruptedCompression { detail: String },

    /// Opcode-less module value whose payload size cannot be inferred.
    #[error("module '{module}' (value type {value_type}) cannot be decoded without the module")]
    UnsupportedType { module: String, value_type: u8 },

    /// Module record with a framing opcode this decoder does not know.
    #[error("module '{module}' uses unsupported opcode {opcode}")]
    UnsupportedModule { module: String, opcode: i64 },

    /// A protocol line exceeded the configured ceiling.
    #[error("protocol line exceeds {max} bytes")]
    LineTooLong { max: usize },

    /// Malformed RESP data outside the snapshot payload.
    #[error("invalid protocol data: {0}")]
    Protocol(String),

    /// The server rejected or derailed the replication handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
