/*!
Offset-tracked binary reader plus the RDB length/string/double codecs.
*/

use std::io::{self, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::lzf;

/// Defines related to the dump file format. To store 32 bits lengths for short
/// keys requires a lot of space, so the most significant 2 bits of the first
/// byte select how the length is encoded:
///
/// 00|XXXXXX => the len is the 6 bits of this byte
/// 01|XXXXXX XXXXXXXX => 14 bits, 6 bits + 8 bits of next byte
/// 10|000000 [32 bit integer] => a full 32 bit len in net byte order follows
/// 10|000001 [64 bit integer] => a full 64 bit little-endian len follows
/// 11|OBKIND => a specially encoded object follows; the six bits give the
///              kind of object (see the ENC_* defines)
pub(crate) const RDB_ENCVAL: u8 = 3;
pub(crate) const RDB_6BITLEN: u8 = 0;
pub(crate) const RDB_14BITLEN: u8 = 1;
pub(crate) const RDB_32BITLEN: u8 = 0x80;
pub(crate) const RDB_64BITLEN: u8 = 0x81;

/// 8 bit signed integer
pub(crate) const RDB_ENC_INT8: i64 = 0;
/// 16 bit signed integer
pub(crate) const RDB_ENC_INT16: i64 = 1;
/// 32 bit signed integer
pub(crate) const RDB_ENC_INT32: i64 = 2;
/// string compressed with LZF
pub(crate) const RDB_ENC_LZF: i64 = 3;

/// Binary reader over a forward-only byte source.
///
/// Every read that comes up short fails with [`Error::UnexpectedEnd`]. The
/// offset counts bytes consumed since construction and exists only for
/// diagnostics; no parsing decision depends on it.
pub struct ByteReader<R: Read> {
    input: R,
    offset: u64,
}

impl<R: Read> ByteReader<R> {
    pub fn new(input: R) -> ByteReader<R> {
        ByteReader { input, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn map_err(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEnd { offset: self.offset }
        } else {
            Error::Io(err)
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let v = self.input.read_u8().map_err(|e| self.map_err(e))?;
        self.offset += 1;
        Ok(v)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        let v = self.input.read_i8().map_err(|e| self.map_err(e))?;
        self.offset += 1;
        Ok(v)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let v = self.input.read_u16::<LittleEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 2;
        Ok(v)
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let v = self.input.read_u16::<BigEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 2;
        Ok(v)
    }

    pub fn read_i16_le(&mut self) -> Result<i16> {
        let v = self.input.read_i16::<LittleEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 2;
        Ok(v)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let v = self.input.read_u32::<LittleEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 4;
        Ok(v)
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let v = self.input.read_u32::<BigEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 4;
        Ok(v)
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        let v = self.input.read_i32::<LittleEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 4;
        Ok(v)
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let v = self.input.read_u64::<LittleEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 8;
        Ok(v)
    }

    pub fn read_i64_le(&mut self) -> Result<i64> {
        let v = self.input.read_i64::<LittleEndian>().map_err(|e| self.map_err(e))?;
        self.offset += 8;
        Ok(v)
    }

    /// IEEE-754 double, read as the bit pattern of a little-endian i64.
    pub fn read_f64_le(&mut self) -> Result<f64> {
        let bits = self.read_i64_le()?;
        Ok(f64::from_bits(bits as u64))
    }

    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; n];
        self.input.read_exact(&mut buf).map_err(|e| self.map_err(e))?;
        self.offset += n as u64;
        Ok(buf)
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        let copied = io::copy(&mut self.input.by_ref().take(n), &mut io::sink())
            .map_err(|e| self.map_err(e))?;
        self.offset += copied;
        if copied < n {
            return Err(Error::UnexpectedEnd { offset: self.offset });
        }
        Ok(())
    }

    /// Reads the length prefix of the next piece of data.
    ///
    /// Returns `(length, is_encoded)`. When `is_encoded` is true the value is
    /// not a length but a special string encoding tag and the caller must
    /// dispatch accordingly.
    pub fn read_length(&mut self) -> Result<(i64, bool)> {
        let byte = self.read_u8()?;
        match (byte & 0xC0) >> 6 {
            RDB_ENCVAL => Ok(((byte & 0x3F) as i64, true)),
            RDB_6BITLEN => Ok(((byte & 0x3F) as i64, false)),
            RDB_14BITLEN => {
                let next = self.read_u8()?;
                Ok(((((byte as u16 & 0x3F) << 8) | next as u16) as i64, false))
            }
            _ => {
                if byte == RDB_32BITLEN {
                    Ok((self.read_u32_be()? as i64, false))
                } else if byte == RDB_64BITLEN {
                    Ok((self.read_i64_le()?, false))
                } else {
                    // tolerant reading of 10xxxxxx variants nothing is known
                    // to emit
                    Ok((self.read_u32_be()? as i64, false))
                }
            }
        }
    }

    /// Reads a length-prefixed string, resolving the integer and LZF
    /// specialisations to their byte form.
    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        let (length, is_encoded) = self.read_length()?;
        if is_encoded {
            return match length {
                RDB_ENC_INT8 => Ok(self.read_i8()?.to_string().into_bytes()),
                RDB_ENC_INT16 => Ok(self.read_i16_le()?.to_string().into_bytes()),
                RDB_ENC_INT32 => Ok(self.read_i32_le()?.to_string().into_bytes()),
                RDB_ENC_LZF => {
                    let (compressed_len, _) = self.read_length()?;
                    let (origin_len, _) = self.read_length()?;
                    if compressed_len < 0 || origin_len < 0 {
                        return Err(Error::CorruptedEncoding {
                            offset: self.offset,
                            detail: "negative compressed string length".to_string(),
                        });
                    }
                    let compressed = self.read_exact(compressed_len as usize)?;
                    lzf::decompress(&compressed, origin_len as usize)
                }
                _ => Err(Error::CorruptedEncoding {
                    offset: self.offset,
                    detail: format!("unknown string encoding tag {}", length),
                }),
            };
        }
        if length < 0 {
            return Err(Error::CorruptedEncoding {
                offset: self.offset,
                detail: "negative string length".to_string(),
            });
        }
        self.read_exact(length as usize)
    }

    /// Reads the variable-length ASCII double used by legacy sorted sets.
    ///
    /// Sentinel lengths: 255 is negative infinity, 254 positive infinity,
    /// 253 NaN.
    pub fn read_double(&mut self) -> Result<f64> {
        let len = self.read_u8()?;
        match len {
            255 => Ok(f64::NEG_INFINITY),
            254 => Ok(f64::INFINITY),
            253 => Ok(f64::NAN),
            _ => {
                let buff = self.read_exact(len as usize)?;
                let text = String::from_utf8_lossy(&buff);
                text.parse::<f64>().map_err(|_| Error::CorruptedEncoding {
                    offset: self.offset,
                    detail: format!("unparseable score '{}'", text),
                })
            }
        }
    }
}
