//! The append-only, zxid-indexed transaction log.
//!
//! Storage is a directory of segment files named by their first zxid. Each
//! segment is a stream of length-prefixed, checksummed records. Appends are
//! buffered; `sync` makes everything before it durable. A torn record at the
//! tail of the final segment is the expected shape of a crash and is dropped
//! at open; a bad record anywhere else is corruption.

mod segment;

use crate::message::{Transaction, Zxid};
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use segment::{Scanned, SegmentReader};

/// Per-entry index kept in memory: where each record lives on disk.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    zxid: Zxid,
    offset: u64,
}

#[derive(Debug)]
struct Segment {
    first: Zxid,
    path: PathBuf,
    entries: Vec<IndexEntry>,
    /// Byte length of the validated record stream.
    len: u64,
}

impl Segment {
    fn last_zxid(&self) -> Zxid {
        self.entries.last().map(|e| e.zxid).unwrap_or(self.first)
    }
}

#[derive(Debug)]
struct ActiveWriter {
    w: BufWriter<File>,
}

/// Records, across restarts, the point below which history has been
/// retired. `Zxid::NULL` means the log is complete from its beginning.
const FLOOR_FILE: &str = "floor";

#[derive(Debug)]
pub struct Log {
    dir: PathBuf,
    segment_max_bytes: u64,
    segments: Vec<Segment>,
    active: Option<ActiveWriter>,
    floor: Zxid,
}

impl Log {
    /// Opens (creating if absent) the log under `dir`, scanning and
    /// validating every segment. The scan truncates a torn tail of the
    /// final segment in place; anything else that fails validation is
    /// `PersistenceCorruption`.
    pub fn open(dir: impl AsRef<Path>, segment_max_bytes: u64) -> Result<Log> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut named = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(first) = segment::parse_file_name(name) {
                named.push((first, entry.path()));
            }
        }
        named.sort_by_key(|(first, _)| *first);

        let floor = read_floor(&dir.join(FLOOR_FILE))?;
        let mut log = Log {
            dir,
            segment_max_bytes,
            segments: Vec::with_capacity(named.len()),
            active: None,
            floor,
        };

        let mut prior = Zxid::NULL;
        let count = named.len();
        for (index, (first, path)) in named.into_iter().enumerate() {
            let is_last = index + 1 == count;
            let seg = log.scan_segment(first, path, &mut prior, is_last)?;

            // An empty final segment is a crash between roll and first
            // append. Drop it rather than index it.
            if seg.entries.is_empty() {
                if is_last {
                    tracing::warn!(path = %seg.path.display(), "removing empty tail segment");
                    std::fs::remove_file(&seg.path)?;
                    continue;
                }
                return Err(Error::PersistenceCorruption(format!(
                    "segment {} is empty",
                    seg.path.display()
                )));
            }
            log.segments.push(seg);
        }

        if let Some(seg) = log.segments.last() {
            let mut file = OpenOptions::new().write(true).open(&seg.path)?;
            file.seek(SeekFrom::Start(seg.len))?;
            log.active = Some(ActiveWriter {
                w: BufWriter::new(file),
            });
        }
        Ok(log)
    }

    fn scan_segment(
        &self,
        first: Zxid,
        path: PathBuf,
        prior: &mut Zxid,
        is_last: bool,
    ) -> Result<Segment> {
        let file = File::open(&path)?;
        let mut reader = SegmentReader::new(BufReader::new(file));
        let mut entries = Vec::new();

        let truncate_at = loop {
            match reader.next()? {
                Scanned::Record { txn, offset } => {
                    if txn.zxid <= *prior {
                        return Err(Error::PersistenceCorruption(format!(
                            "segment {}: zxid {} does not advance past {}",
                            path.display(),
                            txn.zxid,
                            prior
                        )));
                    }
                    if entries.is_empty() && txn.zxid != first {
                        return Err(Error::PersistenceCorruption(format!(
                            "segment {}: first record {} does not match file name",
                            path.display(),
                            txn.zxid
                        )));
                    }
                    *prior = txn.zxid;
                    entries.push(IndexEntry {
                        zxid: txn.zxid,
                        offset,
                    });
                }
                Scanned::Eof => break None,
                Scanned::Bad { offset, reason } if is_last => {
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        reason,
                        "dropping torn tail of final segment"
                    );
                    break Some(offset);
                }
                Scanned::Bad { offset, reason } => {
                    return Err(Error::PersistenceCorruption(format!(
                        "segment {} at offset {offset}: {reason}",
                        path.display()
                    )));
                }
            }
        };
        let len = reader.offset();

        if let Some(at) = truncate_at {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(at)?;
            file.sync_data()?;
        }

        Ok(Segment {
            first,
            path,
            entries,
            len,
        })
    }

    /// Zxid of the last entry, or `Zxid::NULL` when the log is empty.
    pub fn latest_zxid(&self) -> Zxid {
        self.segments
            .last()
            .map(|s| s.last_zxid())
            .unwrap_or(Zxid::NULL)
    }

    /// Zxid of the first retained entry, or `Zxid::NULL` when empty.
    /// After a `trim` this is the floor below which history is gone.
    pub fn first_zxid(&self) -> Zxid {
        self.segments
            .first()
            .and_then(|s| s.entries.first())
            .map(|e| e.zxid)
            .unwrap_or(Zxid::NULL)
    }

    /// The point below which history may have been retired by `trim`.
    /// `Zxid::NULL` means the log is complete from its beginning, so a
    /// full replay can serve an empty peer.
    pub fn floor(&self) -> Zxid {
        self.floor
    }

    /// Whether `zxid` names an entry currently in the log.
    pub fn contains(&self, zxid: Zxid) -> bool {
        self.find(zxid).is_some()
    }

    /// The greatest entry strictly below `zxid`, if any: the common
    /// ancestor to truncate a divergent peer onto.
    pub fn greatest_below(&self, zxid: Zxid) -> Option<Zxid> {
        for seg in self.segments.iter().rev() {
            let cut = seg.entries.partition_point(|e| e.zxid < zxid);
            if cut > 0 {
                return Some(seg.entries[cut - 1].zxid);
            }
        }
        None
    }

    fn find(&self, zxid: Zxid) -> Option<(usize, usize)> {
        let seg = match self
            .segments
            .binary_search_by_key(&zxid, |s| s.first)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let entry = self.segments[seg]
            .entries
            .binary_search_by_key(&zxid, |e| e.zxid)
            .ok()?;
        Some((seg, entry))
    }

    /// Appends `txn`, which must advance past `latest_zxid`. The write may
    /// buffer; it is durable only after `sync`.
    pub fn append(&mut self, txn: &Transaction) -> Result<()> {
        let latest = self.latest_zxid();
        if txn.zxid <= latest {
            return Err(Error::ProtocolViolation(format!(
                "append of {} does not advance past {}",
                txn.zxid, latest
            )));
        }

        let roll = match self.segments.last() {
            None => true,
            Some(seg) => seg.len >= self.segment_max_bytes,
        };
        if roll {
            self.roll(txn.zxid)?;
        }

        let seg = self.segments.last_mut().expect("roll ensures a segment");
        let active = self.active.as_mut().expect("roll ensures a writer");
        let offset = seg.len;
        let written = segment::write_record(&mut active.w, txn)?;
        seg.entries.push(IndexEntry {
            zxid: txn.zxid,
            offset,
        });
        seg.len += written;
        Ok(())
    }

    fn roll(&mut self, first: Zxid) -> Result<()> {
        if let Some(mut active) = self.active.take() {
            active.w.flush()?;
            active.w.get_ref().sync_data()?;
        }
        let path = self.dir.join(segment::file_name(first));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        self.sync_dir()?;
        tracing::debug!(path = %path.display(), "rolled new log segment");

        self.segments.push(Segment {
            first,
            path,
            entries: Vec::new(),
            len: 0,
        });
        self.active = Some(ActiveWriter {
            w: BufWriter::new(file),
        });
        Ok(())
    }

    /// Flushes and fsyncs all buffered appends. On return every prior
    /// append is durable.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(active) = self.active.as_mut() {
            active.w.flush()?;
            active.w.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Removes every entry with zxid greater than `at`. `at` must be an
    /// entry of the log, or `Zxid::NULL` to empty it entirely.
    pub fn truncate(&mut self, at: Zxid) -> Result<()> {
        if at == self.latest_zxid() {
            // Includes truncate(NULL) of an already-empty log.
            return Ok(());
        }

        let cut = if at.is_null() {
            None
        } else {
            match self.find(at) {
                Some(cut) => Some(cut),
                None => {
                    return Err(Error::ProtocolViolation(format!(
                        "truncate point {at} is not in the log"
                    )))
                }
            }
        };

        // Retire the buffered writer before surgery on the files.
        if let Some(mut active) = self.active.take() {
            active.w.flush()?;
        }

        let keep_segments = match cut {
            None => 0,
            Some((seg, entry)) => {
                let segment = &mut self.segments[seg];
                let next = entry + 1;
                if next < segment.entries.len() {
                    let cut_offset = segment.entries[next].offset;
                    segment.entries.truncate(next);
                    segment.len = cut_offset;
                    let file = OpenOptions::new().write(true).open(&segment.path)?;
                    file.set_len(cut_offset)?;
                    file.sync_data()?;
                }
                seg + 1
            }
        };
        for seg in self.segments.drain(keep_segments..) {
            std::fs::remove_file(&seg.path)?;
        }
        self.sync_dir()?;

        if let Some(seg) = self.segments.last() {
            let mut file = OpenOptions::new().write(true).open(&seg.path)?;
            file.seek(SeekFrom::Start(seg.len))?;
            self.active = Some(ActiveWriter {
                w: BufWriter::new(file),
            });
        }
        tracing::debug!(at = %at, "truncated log");
        Ok(())
    }

    /// Retires whole leading segments whose every entry is below `before`.
    /// The newest segment is always kept, so `latest_zxid` never changes.
    pub fn trim(&mut self, before: Zxid) -> Result<()> {
        let mut removed = 0;
        while self.segments.len() - removed > 1
            && self.segments[removed].last_zxid() < before
        {
            removed += 1;
        }
        if removed == 0 {
            return Ok(());
        }
        for seg in self.segments.drain(..removed) {
            tracing::debug!(path = %seg.path.display(), "retiring trimmed segment");
            std::fs::remove_file(&seg.path)?;
        }
        self.floor = self.first_zxid();
        write_floor(&self.dir, self.floor)?;
        self.sync_dir()?;
        Ok(())
    }

    /// A restartable in-order scan of entries with zxid at or above `from`.
    /// Flushes buffered appends so the scan observes them.
    pub fn iterate(&mut self, from: Zxid) -> Result<LogIter> {
        if let Some(active) = self.active.as_mut() {
            active.w.flush()?;
        }

        let mut plan = Vec::new();
        for seg in &self.segments {
            if seg.last_zxid() < from {
                continue;
            }
            let start = seg
                .entries
                .partition_point(|e| e.zxid < from);
            let offset = match seg.entries.get(start) {
                Some(entry) => entry.offset,
                None => continue,
            };
            plan.push((seg.path.clone(), offset, seg.len));
        }
        Ok(LogIter {
            plan: plan.into_iter(),
            current: None,
        })
    }

    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

fn read_floor(path: &Path) -> Result<Zxid> {
    use byteorder::{BigEndian, ByteOrder};
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == 12 => Ok(Zxid {
            epoch: BigEndian::read_u32(&bytes[..4]),
            counter: BigEndian::read_u64(&bytes[4..]),
        }),
        Ok(bytes) => Err(Error::PersistenceCorruption(format!(
            "floor file {} holds {} bytes, want 12",
            path.display(),
            bytes.len()
        ))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Zxid::NULL),
        Err(err) => Err(err.into()),
    }
}

fn write_floor(dir: &Path, floor: Zxid) -> Result<()> {
    use byteorder::{BigEndian, ByteOrder};
    let mut bytes = [0u8; 12];
    BigEndian::write_u32(&mut bytes[..4], floor.epoch);
    BigEndian::write_u64(&mut bytes[4..], floor.counter);

    let tmp = dir.join(format!("{FLOOR_FILE}.tmp"));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
    }
    std::fs::rename(&tmp, dir.join(FLOOR_FILE))?;
    Ok(())
}

/// Iterator returned by [`Log::iterate`]. Opens segment files lazily.
pub struct LogIter {
    plan: std::vec::IntoIter<(PathBuf, u64, u64)>,
    current: Option<(SegmentReader<BufReader<File>>, u64)>,
}

impl Iterator for LogIter {
    type Item = Result<Transaction>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((reader, limit)) = self.current.as_mut() {
                if reader.offset() < *limit {
                    match reader.next() {
                        Ok(Scanned::Record { txn, .. }) => return Some(Ok(txn)),
                        Ok(Scanned::Eof) => (),
                        Ok(Scanned::Bad { offset, reason }) => {
                            return Some(Err(Error::PersistenceCorruption(format!(
                                "log scan at offset {offset}: {reason}"
                            ))))
                        }
                        Err(err) => return Some(Err(err.into())),
                    }
                }
                self.current = None;
            }

            let (path, offset, limit) = self.plan.next()?;
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(err) => return Some(Err(err.into())),
            };
            if let Err(err) = file.seek(SeekFrom::Start(offset)) {
                return Some(Err(err.into()));
            }
            let reader = SegmentReader::with_offset(BufReader::new(file), offset);
            self.current = Some((reader, limit));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn txn(epoch: u32, counter: u64, body: &str) -> Transaction {
        Transaction::new(
            Zxid::new(epoch, counter),
            0,
            Bytes::copy_from_slice(body.as_bytes()),
        )
    }

    fn collect(log: &mut Log, from: Zxid) -> Vec<Transaction> {
        log.iterate(from)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn append_requires_monotonic_zxids() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();

        log.append(&txn(1, 1, "a")).unwrap();
        log.append(&txn(1, 2, "b")).unwrap();
        assert!(log.append(&txn(1, 2, "dup")).is_err());
        assert!(log.append(&txn(1, 1, "stale")).is_err());
        log.append(&txn(2, 1, "c")).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(2, 1));
    }

    #[test]
    fn sync_then_reopen_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = Log::open(dir.path(), 1 << 20).unwrap();
            log.append(&txn(1, 1, "a")).unwrap();
            log.append(&txn(1, 2, "b")).unwrap();
            log.sync().unwrap();
        }
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(1, 2));
        let entries = collect(&mut log, Zxid::NULL);
        assert_eq!(entries, vec![txn(1, 1, "a"), txn(1, 2, "b")]);
    }

    #[test]
    fn iterate_from_is_inclusive_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        for counter in 1..=5 {
            log.append(&txn(1, counter, "x")).unwrap();
        }

        let from = Zxid::new(1, 3);
        let first: Vec<_> = collect(&mut log, from);
        let again: Vec<_> = collect(&mut log, from);
        assert_eq!(first, again);
        assert_eq!(
            first.iter().map(|t| t.zxid).collect::<Vec<_>>(),
            vec![Zxid::new(1, 3), Zxid::new(1, 4), Zxid::new(1, 5)]
        );

        // A `from` between entries starts at the next entry.
        let mid = collect(&mut log, Zxid::new(1, 0));
        assert_eq!(mid.len(), 5);
    }

    #[test]
    fn rolls_segments_and_scans_across_them() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold: every append rolls a fresh segment.
        let mut log = Log::open(dir.path(), 1).unwrap();
        for counter in 1..=4 {
            log.append(&txn(1, counter, "body")).unwrap();
        }
        log.sync().unwrap();
        assert_eq!(log.segments.len(), 4);

        let entries = collect(&mut log, Zxid::NULL);
        assert_eq!(entries.len(), 4);

        drop(log);
        let mut log = Log::open(dir.path(), 1).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(1, 4));
        assert_eq!(collect(&mut log, Zxid::NULL).len(), 4);
    }

    #[test]
    fn truncate_drops_the_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        for counter in 1..=5 {
            log.append(&txn(1, counter, "x")).unwrap();
        }
        log.sync().unwrap();

        log.truncate(Zxid::new(1, 3)).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(1, 3));

        // Idempotent.
        log.truncate(Zxid::new(1, 3)).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(1, 3));

        // The log continues to accept appends past the cut.
        log.append(&txn(2, 1, "y")).unwrap();
        log.sync().unwrap();

        drop(log);
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(
            collect(&mut log, Zxid::NULL)
                .iter()
                .map(|t| t.zxid)
                .collect::<Vec<_>>(),
            vec![
                Zxid::new(1, 1),
                Zxid::new(1, 2),
                Zxid::new(1, 3),
                Zxid::new(2, 1)
            ]
        );
    }

    #[test]
    fn truncate_to_null_empties_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        log.append(&txn(1, 1, "a")).unwrap();
        log.sync().unwrap();

        log.truncate(Zxid::NULL).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::NULL);
        assert!(collect(&mut log, Zxid::NULL).is_empty());

        log.append(&txn(4, 1, "fresh")).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(4, 1));
    }

    #[test]
    fn truncate_rejects_unknown_points() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        log.append(&txn(1, 1, "a")).unwrap();
        assert!(log.truncate(Zxid::new(9, 9)).is_err());
    }

    #[test]
    fn truncate_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1).unwrap();
        for counter in 1..=4 {
            log.append(&txn(1, counter, "body")).unwrap();
        }
        log.sync().unwrap();

        log.truncate(Zxid::new(1, 2)).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(1, 2));
        assert_eq!(log.segments.len(), 2);
        assert_eq!(collect(&mut log, Zxid::NULL).len(), 2);
    }

    #[test]
    fn torn_tail_is_dropped_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut log = Log::open(dir.path(), 1 << 20).unwrap();
            log.append(&txn(1, 1, "a")).unwrap();
            log.append(&txn(1, 2, "b")).unwrap();
            log.sync().unwrap();
            path = log.segments[0].path.clone();
        }
        // Chop into the middle of the final record.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(1, 1));

        // The tail is reusable after recovery.
        log.append(&txn(1, 2, "b2")).unwrap();
        log.sync().unwrap();
        assert_eq!(collect(&mut log, Zxid::NULL).len(), 2);
    }

    #[test]
    fn corruption_before_the_tail_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let first_path;
        {
            let mut log = Log::open(dir.path(), 1).unwrap();
            log.append(&txn(1, 1, "aaaa")).unwrap();
            log.append(&txn(1, 2, "bbbb")).unwrap();
            log.sync().unwrap();
            first_path = log.segments[0].path.clone();
        }
        // Flip a payload byte in the first (non-final) segment.
        let mut content = std::fs::read(&first_path).unwrap();
        let mid = content.len() / 2;
        content[mid] ^= 0xff;
        std::fs::write(&first_path, content).unwrap();

        match Log::open(dir.path(), 1) {
            Err(Error::PersistenceCorruption(_)) => (),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn trim_retires_leading_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1).unwrap();
        for counter in 1..=4 {
            log.append(&txn(1, counter, "body")).unwrap();
        }
        log.sync().unwrap();

        assert!(log.floor().is_null());
        log.trim(Zxid::new(1, 3)).unwrap();
        assert_eq!(log.first_zxid(), Zxid::new(1, 3));
        assert_eq!(log.floor(), Zxid::new(1, 3));
        assert_eq!(log.latest_zxid(), Zxid::new(1, 4));
        assert!(!log.contains(Zxid::new(1, 2)));
        assert!(log.contains(Zxid::new(1, 3)));

        // Trimming everything still keeps the newest segment.
        log.trim(Zxid::new(9, 9)).unwrap();
        assert_eq!(log.latest_zxid(), Zxid::new(1, 4));

        // The floor survives a restart.
        drop(log);
        let log = Log::open(dir.path(), 1).unwrap();
        assert_eq!(log.floor(), Zxid::new(1, 4));
    }

    #[test]
    fn greatest_below_finds_the_common_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path(), 1).unwrap();
        for counter in [1, 2, 4] {
            log.append(&txn(1, counter, "x")).unwrap();
        }
        assert_eq!(log.greatest_below(Zxid::new(1, 4)), Some(Zxid::new(1, 2)));
        assert_eq!(log.greatest_below(Zxid::new(1, 3)), Some(Zxid::new(1, 2)));
        assert_eq!(log.greatest_below(Zxid::new(2, 1)), Some(Zxid::new(1, 4)));
        assert_eq!(log.greatest_below(Zxid::new(1, 1)), None);
    }
}
