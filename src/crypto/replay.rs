//! Persisted replay protection.
//!
//! An append-only log of accepted (peer, session epoch, counter) triples.
//! Reloaded at startup so a restarted node keeps rejecting counters it has
//! already accepted, even after the in-memory session state is gone.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use log::warn;
use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::PeerId;

/// Identifier of a session epoch (truncated hash of the epoch public key)
pub type EpochId = [u8; 8];

/// Append-only log of accepted receive counters.
pub struct ReplayLog {
    floors: Mutex<HashMap<(PeerId, EpochId), u64>>,
    file: Mutex<Option<File>>,
}

impl ReplayLog {
    /// Purely in-memory log (tests, ephemeral nodes).
    pub fn in_memory() -> Self {
        Self {
            floors: Mutex::new(HashMap::new()),
            file: Mutex::new(None),
        }
    }

    /// Open (or create) the log at `path` and replay its entries.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut floors = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                match Self::parse_line(&line) {
                    Some((key, counter)) => {
                        let floor = floors.entry(key).or_insert(0u64);
                        if counter > *floor {
                            *floor = counter;
                        }
                    }
                    None => warn!("Skipping corrupt replay log line: {line}"),
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            floors: Mutex::new(floors),
            file: Mutex::new(Some(file)),
        })
    }

    fn parse_line(line: &str) -> Option<((PeerId, EpochId), u64)> {
        let mut parts = line.split_whitespace();
        let peer = hex::decode(parts.next()?).ok()?;
        let epoch = hex::decode(parts.next()?).ok()?;
        let counter: u64 = parts.next()?.parse().ok()?;

        let peer: [u8; 32] = peer.try_into().ok()?;
        let epoch: EpochId = epoch.try_into().ok()?;
        Some(((PeerId(peer), epoch), counter))
    }

    /// The highest accepted counter for this peer/epoch (0 if none).
    pub fn floor(&self, peer: &PeerId, epoch: &EpochId) -> u64 {
        self.floors
            .lock()
            .get(&(*peer, *epoch))
            .copied()
            .unwrap_or(0)
    }

    /// Record an accepted counter, appending to the log file if one is open.
    pub fn record(&self, peer: &PeerId, epoch: &EpochId, counter: u64) -> Result<()> {
        {
            let mut floors = self.floors.lock();
            let floor = floors.entry((*peer, *epoch)).or_insert(0);
            if counter > *floor {
                *floor = counter;
            }
        }

        if let Some(file) = self.file.lock().as_mut() {
            writeln!(file, "{} {} {}", peer, hex::encode(epoch), counter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn temp_log(name: &str) -> std::path::PathBuf {
        let mut unique = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut unique);
        std::env::temp_dir().join(format!("meshphone-replay-{name}-{}", hex::encode(unique)))
    }

    #[test]
    fn floor_starts_at_zero() {
        let log = ReplayLog::in_memory();
        assert_eq!(log.floor(&PeerId([1u8; 32]), &[0u8; 8]), 0);
    }

    #[test]
    fn record_raises_floor_monotonically() {
        let log = ReplayLog::in_memory();
        let peer = PeerId([1u8; 32]);
        let epoch = [2u8; 8];

        log.record(&peer, &epoch, 5).unwrap();
        assert_eq!(log.floor(&peer, &epoch), 5);

        // Late append of a lower counter must not lower the floor.
        log.record(&peer, &epoch, 3).unwrap();
        assert_eq!(log.floor(&peer, &epoch), 5);
    }

    #[test]
    fn survives_reopen() {
        let path = temp_log("reopen");
        let peer = PeerId([7u8; 32]);
        let epoch = [1u8; 8];

        {
            let log = ReplayLog::open(&path).unwrap();
            log.record(&peer, &epoch, 10).unwrap();
            log.record(&peer, &epoch, 12).unwrap();
        }

        let log = ReplayLog::open(&path).unwrap();
        assert_eq!(log.floor(&peer, &epoch), 12);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn skips_corrupt_lines() {
        let path = temp_log("corrupt");
        std::fs::write(&path, "not a valid line\n").unwrap();
        let log = ReplayLog::open(&path).unwrap();
        assert_eq!(log.floor(&PeerId([1u8; 32]), &[0u8; 8]), 0);
        std::fs::remove_file(&path).ok();
    }
}
