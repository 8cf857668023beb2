// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
use anyhow::{anyhow, Result};
use sn_codec::{Decodable, Encodable};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Ablage für kodierte Schnappschüsse (Register, Auszahlungen). Schreiben
/// ist atomar (Tempdatei + rename), optional mit fsync auf Datei und
/// Verzeichnis.
pub struct SnapshotStore {
    root: PathBuf,
    fsync: bool,
}

impl SnapshotStore {
    pub fn open<P: AsRef<Path>>(root: P, fsync: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        // dir fsync für Crash-Sicherheit (best effort)
        if fsync {
            Self::fsync_dir(&root)?;
        }
        Ok(Self { root, fsync })
    }

    fn fsync_dir(dir: &Path) -> Result<()> {
        let f = OpenOptions::new().read(true).open(dir)?;
        f.sync_all()?;
        Ok(())
    }

    fn write_atomic(&self, file_name: &str, data: &[u8]) -> Result<()> {
        let target = self.root.join(file_name);
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        if self.fsync {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&target)
            .map_err(|e| anyhow!("persist failed: {}", e))?;
        if self.fsync {
            let f = OpenOptions::new().read(true).open(&target)?;
            f.sync_all()?;
            Self::fsync_dir(&self.root)?;
        }
        Ok(())
    }

    pub fn put<T: Encodable>(&self, name: &str, value: &T) -> Result<()> {
        let mut buf = Vec::with_capacity(value.encoded_len());
        value.encode(&mut buf)?;
        self.write_atomic(&format!("{name}.bin"), &buf)
    }

    /// Liest einen Schnappschuss; `Ok(None)` wenn keiner existiert.
    pub fn get<T: Decodable>(&self, name: &str) -> Result<Option<T>> {
        let path = self.root.join(format!("{name}.bin"));
        if !path.exists() {
            return Ok(None);
        }
        let mut f = File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let mut slice = buf.as_slice();
        let value = T::decode(&mut slice)?;
        Ok(Some(value))
    }

    pub fn has(&self, name: &str) -> bool {
        self.root.join(format!("{name}.bin")).exists()
    }
}
