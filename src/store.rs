/*
 * This file is part of Sensorreg.
 *
 * Copyright (C) 2025 Sensorreg contributors
 *
 * Sensorreg is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Sensorreg is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Sensorreg. If not, see <https://www.gnu.org/licenses/>.
 */

//! Byte-addressable persistent stores with an explicit commit barrier.
//!
//! Both devices keep a RAM shadow of the whole image, the way an emulated
//! EEPROM does: byte reads and writes only touch the shadow and `commit`
//! makes the image durable.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Value of a byte that has never been written.
pub const ERASED: u8 = 0xFF;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("store image {path} is {actual} bytes, expected {expected}")]
    SizeMismatch { path: PathBuf, expected: usize, actual: u64 },
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// A fixed-capacity byte device.
///
/// Addresses at or beyond `capacity()` are a programming error and panic.
pub trait ByteStore {
    fn capacity(&self) -> usize;
    fn read_byte(&self, addr: usize) -> u8;
    fn write_byte(&mut self, addr: usize, value: u8);
    /// Durability barrier for every write since the last commit.
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// In-memory EEPROM image.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    bytes: Vec<u8>,
    commits: usize,
    byte_writes: usize,
    fail_commits: bool,
}

impl MemoryStore {
    /// Erased device of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { bytes: vec![ERASED; capacity], commits: 0, byte_writes: 0, fail_commits: false }
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Number of `write_byte` calls so far.
    pub fn byte_write_count(&self) -> usize {
        self.byte_writes
    }

    /// Make every following commit fail until switched off again.
    pub fn set_fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }

    pub fn contents(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteStore for MemoryStore {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read_byte(&self, addr: usize) -> u8 {
        self.bytes[addr]
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        self.bytes[addr] = value;
        self.byte_writes += 1;
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.fail_commits {
            return Err(StoreError::CommitFailed("injected failure".into()));
        }
        self.commits += 1;
        Ok(())
    }
}

/// EEPROM image kept in a regular file.
///
/// A missing file starts out erased and is created on the first commit.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    shadow: Vec<u8>,
    dirty: bool,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io { path: path.clone(), source };

        let shadow = match File::open(&path) {
            Ok(mut f) => {
                let actual = f.metadata().map_err(io_err)?.len();
                if actual != capacity as u64 {
                    return Err(StoreError::SizeMismatch { path: path.clone(), expected: capacity, actual });
                }
                let mut buf = Vec::with_capacity(capacity);
                f.read_to_end(&mut buf).map_err(io_err)?;
                buf
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => vec![ERASED; capacity],
            Err(e) => return Err(io_err(e)),
        };

        Ok(Self { path, shadow, dirty: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging file used by `commit`, e.g. `eeprom.bin.tmp`.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ByteStore for FileStore {
    fn capacity(&self) -> usize {
        self.shadow.len()
    }

    fn read_byte(&self, addr: usize) -> u8 {
        self.shadow[addr]
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        if self.shadow[addr] != value {
            self.shadow[addr] = value;
            self.dirty = true;
        }
    }

    /// Writes the image to a sibling temp file, syncs it and renames it over
    /// the image, so an interrupted commit leaves the previous image intact.
    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.dirty && self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|source| StoreError::Io { path: parent.to_path_buf(), source })?;
            }
        }

        let tmp = self.temp_path();
        let tmp_err = |source| StoreError::Io { path: tmp.clone(), source };
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(tmp_err)?;
        f.write_all(&self.shadow).map_err(tmp_err)?;
        f.sync_all().map_err(tmp_err)?;
        drop(f);

        fs::rename(&tmp, &self.path)
            .map_err(|source| StoreError::Io { path: self.path.clone(), source })?;
        self.dirty = false;
        Ok(())
    }
}
