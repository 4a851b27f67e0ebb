use crate::message::{Transaction, Zxid};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Segment files are named by the zxid of their first record:
/// `seg-<epoch:08x>-<counter:016x>`.
const SEGMENT_PREFIX: &str = "seg-";

/// Fixed-size portion of a record payload: epoch + counter + kind.
const PAYLOAD_HEADER: usize = 4 + 8 + 4;

pub fn file_name(first: Zxid) -> String {
    format!(
        "{SEGMENT_PREFIX}{:08x}-{:016x}",
        first.epoch, first.counter
    )
}

pub fn parse_file_name(name: &str) -> Option<Zxid> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?;
    let (epoch, counter) = rest.split_once('-')?;
    Some(Zxid {
        epoch: u32::from_str_radix(epoch, 16).ok()?,
        counter: u64::from_str_radix(counter, 16).ok()?,
    })
}

/// On-disk framing of one record:
/// `{ len: u32, epoch: u32, counter: u64, kind: u32, body, crc32: u32 }`,
/// all integers big-endian. `len` counts the payload (everything between
/// itself and the checksum); the checksum covers the payload only.
pub fn write_record(w: &mut impl Write, txn: &Transaction) -> io::Result<u64> {
    let mut payload = Vec::with_capacity(PAYLOAD_HEADER + txn.body.len());
    payload.write_u32::<BigEndian>(txn.zxid.epoch)?;
    payload.write_u64::<BigEndian>(txn.zxid.counter)?;
    payload.write_u32::<BigEndian>(txn.kind)?;
    payload.extend_from_slice(&txn.body);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);

    w.write_u32::<BigEndian>(payload.len() as u32)?;
    w.write_all(&payload)?;
    w.write_u32::<BigEndian>(hasher.finalize())?;
    Ok(framed_len(txn.body.len()))
}

/// Total bytes a record with a body of `body_len` occupies on disk.
pub fn framed_len(body_len: usize) -> u64 {
    (4 + PAYLOAD_HEADER + body_len + 4) as u64
}

/// One step of a sequential segment scan.
#[derive(Debug)]
pub enum Scanned {
    Record { txn: Transaction, offset: u64 },
    /// Clean end: EOF exactly at a record boundary.
    Eof,
    /// A short or checksum-failing record beginning at `offset`.
    Bad { offset: u64, reason: String },
}

/// Sequential reader over a segment's records, tracking its byte offset.
pub struct SegmentReader<R> {
    r: R,
    offset: u64,
}

impl<R: Read> SegmentReader<R> {
    pub fn new(r: R) -> SegmentReader<R> {
        SegmentReader::with_offset(r, 0)
    }

    /// A reader over a stream already positioned at `offset` of its segment.
    pub fn with_offset(r: R, offset: u64) -> SegmentReader<R> {
        SegmentReader { r, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next(&mut self) -> io::Result<Scanned> {
        let start = self.offset;

        let len = match self.r.read_u32::<BigEndian>() {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(Scanned::Eof),
            Err(err) => return Err(err),
        };
        if (len as usize) < PAYLOAD_HEADER {
            return Ok(Scanned::Bad {
                offset: start,
                reason: format!("record length {len} is shorter than its header"),
            });
        }

        let mut payload = vec![0u8; len as usize];
        if let Err(err) = self.r.read_exact(&mut payload) {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(Scanned::Bad {
                    offset: start,
                    reason: "record is torn at end of file".to_string(),
                });
            }
            return Err(err);
        }
        let crc = match self.r.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Scanned::Bad {
                    offset: start,
                    reason: "record checksum is torn at end of file".to_string(),
                })
            }
            Err(err) => return Err(err),
        };

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Ok(Scanned::Bad {
                offset: start,
                reason: "record checksum mismatch".to_string(),
            });
        }

        let mut cursor = &payload[..];
        let epoch = cursor.read_u32::<BigEndian>()?;
        let counter = cursor.read_u64::<BigEndian>()?;
        let kind = cursor.read_u32::<BigEndian>()?;
        let body = bytes::Bytes::copy_from_slice(cursor);

        self.offset = start + framed_len(body.len());
        Ok(Scanned::Record {
            txn: Transaction {
                zxid: Zxid { epoch, counter },
                kind,
                body,
            },
            offset: start,
        })
    }
}
