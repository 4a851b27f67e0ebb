//! Durable state other than the log itself: the two epoch counters, the
//! last-seen cluster configuration, and the lock file which gives one
//! process exclusive ownership of a log directory.
//!
//! Every file replacement is write-tmp, fsync, rename, fsync-directory, so
//! a crash leaves either the old value or the new one.

use crate::log::Log;
use crate::message::{ClusterConfig, Zxid};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const PROPOSED_EPOCH: &str = "ProposedEpoch";
const ACK_EPOCH: &str = "AckEpoch";
const CLUSTER_CONFIG: &str = "ClusterConfig";
const LOCK: &str = "LOCK";
const LOG_DIR: &str = "log";

#[derive(Debug)]
pub struct Persistence {
    dir: PathBuf,
    log: Log,
    proposed_epoch: u32,
    ack_epoch: u32,
    last_seen_config: Option<ClusterConfig>,
    _lock: LockFile,
}

impl Persistence {
    /// Opens the durable state under `dir`, creating it if absent.
    /// Cold start yields epochs (0, 0), no configuration, an empty log.
    pub fn open(dir: impl AsRef<Path>, segment_max_bytes: u64) -> Result<Persistence> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let lock = LockFile::acquire(dir.join(LOCK))?;

        let log = Log::open(dir.join(LOG_DIR), segment_max_bytes)?;
        let proposed_epoch = read_epoch(&dir.join(PROPOSED_EPOCH))?;
        let ack_epoch = read_epoch(&dir.join(ACK_EPOCH))?;
        if ack_epoch > proposed_epoch {
            return Err(Error::PersistenceCorruption(format!(
                "acknowledged epoch {ack_epoch} exceeds proposed epoch {proposed_epoch}"
            )));
        }
        let last_seen_config = read_config(&dir.join(CLUSTER_CONFIG))?;

        Ok(Persistence {
            dir,
            log,
            proposed_epoch,
            ack_epoch,
            last_seen_config,
            _lock: lock,
        })
    }

    pub fn log(&mut self) -> &mut Log {
        &mut self.log
    }

    pub fn latest_zxid(&self) -> Zxid {
        self.log.latest_zxid()
    }

    pub fn proposed_epoch(&self) -> u32 {
        self.proposed_epoch
    }

    pub fn ack_epoch(&self) -> u32 {
        self.ack_epoch
    }

    /// Durably advances the proposed epoch. Never decreases.
    pub fn set_proposed_epoch(&mut self, epoch: u32) -> Result<()> {
        if epoch < self.proposed_epoch {
            return Err(Error::ProtocolViolation(format!(
                "proposed epoch would regress from {} to {}",
                self.proposed_epoch, epoch
            )));
        }
        write_epoch(&self.dir, PROPOSED_EPOCH, epoch)?;
        self.proposed_epoch = epoch;
        Ok(())
    }

    /// Durably advances the acknowledged epoch. Never decreases, and never
    /// runs ahead of the proposed epoch.
    pub fn set_ack_epoch(&mut self, epoch: u32) -> Result<()> {
        if epoch < self.ack_epoch {
            return Err(Error::ProtocolViolation(format!(
                "acknowledged epoch would regress from {} to {}",
                self.ack_epoch, epoch
            )));
        }
        if epoch > self.proposed_epoch {
            return Err(Error::ProtocolViolation(format!(
                "acknowledged epoch {} would pass proposed epoch {}",
                epoch, self.proposed_epoch
            )));
        }
        write_epoch(&self.dir, ACK_EPOCH, epoch)?;
        self.ack_epoch = epoch;
        Ok(())
    }

    pub fn last_seen_config(&self) -> Option<&ClusterConfig> {
        self.last_seen_config.as_ref()
    }

    pub fn set_last_seen_config(&mut self, config: ClusterConfig) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&config)
            .map_err(|err| Error::PersistenceCorruption(err.to_string()))?;
        write_atomic(&self.dir, CLUSTER_CONFIG, &bytes)?;
        self.last_seen_config = Some(config);
        Ok(())
    }
}

fn read_epoch(path: &Path) -> Result<u32> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == 4 => Ok(BigEndian::read_u32(&bytes)),
        Ok(bytes) => Err(Error::PersistenceCorruption(format!(
            "epoch file {} holds {} bytes, want 4",
            path.display(),
            bytes.len()
        ))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn write_epoch(dir: &Path, name: &str, epoch: u32) -> Result<()> {
    let mut bytes = [0u8; 4];
    BigEndian::write_u32(&mut bytes, epoch);
    write_atomic(dir, name, &bytes)
}

fn read_config(path: &Path) -> Result<Option<ClusterConfig>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            Error::PersistenceCorruption(format!(
                "cluster config {} does not parse: {err}",
                path.display()
            ))
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    std::fs::rename(&tmp, dir.join(name))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Exclusive ownership of a log directory. Removed on drop; a crash leaves
/// it behind for the operator to clear after inspecting the directory.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<LockFile> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(LockFile { path }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(Error::Io(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!(
                        "log directory is locked by another process ({})",
                        path.display()
                    ),
                )))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Transaction;
    use bytes::Bytes;

    const SEG_MAX: u64 = 1 << 20;

    #[test]
    fn cold_start_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let state = Persistence::open(dir.path(), SEG_MAX).unwrap();
        assert_eq!(state.proposed_epoch(), 0);
        assert_eq!(state.ack_epoch(), 0);
        assert!(state.last_seen_config().is_none());
        assert_eq!(state.latest_zxid(), Zxid::NULL);
    }

    #[test]
    fn epochs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = Persistence::open(dir.path(), SEG_MAX).unwrap();
            state.set_proposed_epoch(7).unwrap();
            state.set_ack_epoch(5).unwrap();
        }
        let state = Persistence::open(dir.path(), SEG_MAX).unwrap();
        assert_eq!(state.proposed_epoch(), 7);
        assert_eq!(state.ack_epoch(), 5);
    }

    #[test]
    fn epochs_never_regress() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = Persistence::open(dir.path(), SEG_MAX).unwrap();
        state.set_proposed_epoch(4).unwrap();
        assert!(state.set_proposed_epoch(3).is_err());

        state.set_ack_epoch(4).unwrap();
        assert!(state.set_ack_epoch(2).is_err());
        // The acknowledged epoch cannot pass the proposed epoch.
        assert!(state.set_ack_epoch(5).is_err());
    }

    #[test]
    fn ack_epoch_ahead_of_proposed_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = Persistence::open(dir.path(), SEG_MAX).unwrap();
            state.set_proposed_epoch(2).unwrap();
            state.set_ack_epoch(2).unwrap();
        }
        // Simulate a mangled directory: regress only the proposed epoch.
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, 1);
        std::fs::write(dir.path().join(PROPOSED_EPOCH), bytes).unwrap();

        match Persistence::open(dir.path(), SEG_MAX) {
            Err(Error::PersistenceCorruption(_)) => (),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn cluster_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig::new(
            Zxid::new(3, 9),
            ["s1".to_string(), "s2".to_string(), "s3".to_string()],
        );
        {
            let mut state = Persistence::open(dir.path(), SEG_MAX).unwrap();
            state.set_last_seen_config(config.clone()).unwrap();
        }
        let state = Persistence::open(dir.path(), SEG_MAX).unwrap();
        assert_eq!(state.last_seen_config(), Some(&config));
    }

    #[test]
    fn log_contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let txn = Transaction::new(Zxid::new(1, 1), 0, Bytes::from_static(b"x"));
        {
            let mut state = Persistence::open(dir.path(), SEG_MAX).unwrap();
            state.log().append(&txn).unwrap();
            state.log().sync().unwrap();
        }
        let mut state = Persistence::open(dir.path(), SEG_MAX).unwrap();
        let entries: Vec<_> = state
            .log()
            .iterate(Zxid::NULL)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries, vec![txn]);
    }

    #[test]
    fn lock_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let held = Persistence::open(dir.path(), SEG_MAX).unwrap();
        assert!(Persistence::open(dir.path(), SEG_MAX).is_err());
        drop(held);
        Persistence::open(dir.path(), SEG_MAX).unwrap();
    }
}
