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

//! Persistent mapping from sensor ids to user-assigned names.
//!
//! Store layout, format version 1:
//!
//! ```text
//! offset 0   header   "SREG" | version | policy | slot size | reserved
//! offset 8   slot 0   [len][address (probe only)][name bytes][0x00][padding]
//!            slot 1   ...
//! ```
//!
//! The first byte of a slot is `0xFF` when the slot was never written,
//! `0xFE` for a deleted slot under the probe policy, and otherwise the
//! length of the stored name.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{slot_index, HardwareAddress, SensorId, ADDRESS_LEN};
use crate::store::{ByteStore, StoreError, ERASED};

pub const HEADER_LEN: usize = 8;
pub const MAGIC: [u8; 4] = *b"SREG";
pub const FORMAT_VERSION: u8 = 1;
pub const TOMBSTONE: u8 = 0xFE;
pub const TERMINATOR: u8 = 0x00;
pub const DEFAULT_MAX_NAME_LEN: usize = 32;
/// Upper bound for `max_name_len`; keeps length bytes clear of the sentinels.
pub const MAX_NAME_LEN_LIMIT: usize = 200;

/// A stored sensor name.
pub type NameRecord = String;

/// How two ids that hash to the same slot are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Open addressing: every slot records its address, lookups verify it
    /// and probe linearly on mismatch.
    #[default]
    Probe,
    /// Direct-mapped slots. A second id hashing to an occupied slot
    /// replaces the first id's name, and reads cannot tell them apart.
    Overwrite,
}

impl CollisionPolicy {
    fn code(self) -> u8 {
        match self {
            CollisionPolicy::Overwrite => 1,
            CollisionPolicy::Probe => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CollisionPolicy::Overwrite),
            2 => Some(CollisionPolicy::Probe),
            _ => None,
        }
    }

    /// Slot bytes that are not name payload.
    pub fn slot_overhead(self) -> usize {
        match self {
            CollisionPolicy::Overwrite => 2,
            CollisionPolicy::Probe => 2 + ADDRESS_LEN,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("name is {len} bytes, a slot holds at most {max}")]
    CapacityExceeded { len: usize, max: usize },
    #[error("name must not contain NUL bytes")]
    InvalidName,
    #[error("no free slot left ({slots} slots in use)")]
    Full { slots: usize },
    #[error("slot {slot} holds malformed data")]
    CorruptSlot { slot: usize },
    #[error("store format mismatch: {0}")]
    FormatMismatch(String),
    #[error("invalid store layout: {0}")]
    InvalidLayout(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One live slot found by [`Registry::enumerate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub slot: usize,
    /// Owner of the slot. Only recorded under [`CollisionPolicy::Probe`].
    pub sensor: Option<SensorId>,
    pub name: NameRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotState {
    Empty,
    Deleted,
    Live { owner: Option<HardwareAddress>, name: NameRecord },
}

pub struct Registry<S: ByteStore> {
    store: S,
    policy: CollisionPolicy,
    max_name_len: usize,
    slot_size: usize,
    slot_count: usize,
}

impl<S: ByteStore> Registry<S> {
    /// Open the registry on `store`, formatting an erased device.
    ///
    /// A device formatted with another policy or slot size is rejected
    /// rather than reinterpreted.
    pub fn open(store: S, policy: CollisionPolicy, max_name_len: usize) -> Result<Self, RegistryError> {
        if max_name_len == 0 || max_name_len > MAX_NAME_LEN_LIMIT {
            return Err(RegistryError::InvalidLayout(format!(
                "max_name_len must be 1..={}, got {}",
                MAX_NAME_LEN_LIMIT, max_name_len
            )));
        }
        let slot_size = max_name_len + policy.slot_overhead();
        let capacity = store.capacity();
        let slot_count = capacity.saturating_sub(HEADER_LEN) / slot_size;
        if slot_count == 0 {
            return Err(RegistryError::InvalidLayout(format!(
                "{} bytes cannot hold a header and one {}-byte slot",
                capacity, slot_size
            )));
        }

        let mut reg = Self { store, policy, max_name_len, slot_size, slot_count };
        reg.check_or_format_header()?;
        Ok(reg)
    }

    fn check_or_format_header(&mut self) -> Result<(), RegistryError> {
        let header: Vec<u8> = (0..HEADER_LEN).map(|a| self.store.read_byte(a)).collect();
        if header.iter().all(|&b| b == ERASED) {
            let fresh = [
                MAGIC[0],
                MAGIC[1],
                MAGIC[2],
                MAGIC[3],
                FORMAT_VERSION,
                self.policy.code(),
                self.slot_size as u8,
                0,
            ];
            for (addr, b) in fresh.iter().enumerate() {
                self.store.write_byte(addr, *b);
            }
            self.store.commit()?;
            return Ok(());
        }

        if header[..4] != MAGIC {
            return Err(RegistryError::FormatMismatch("not a sensorreg store (bad magic)".into()));
        }
        if header[4] != FORMAT_VERSION {
            return Err(RegistryError::FormatMismatch(format!(
                "format version {} (supported: {})",
                header[4], FORMAT_VERSION
            )));
        }
        match CollisionPolicy::from_code(header[5]) {
            Some(p) if p == self.policy => {}
            Some(p) => {
                return Err(RegistryError::FormatMismatch(format!(
                    "store uses {:?} policy, configured {:?}",
                    p, self.policy
                )))
            }
            None => {
                return Err(RegistryError::FormatMismatch(format!("unknown policy code {}", header[5])))
            }
        }
        if header[6] as usize != self.slot_size {
            return Err(RegistryError::FormatMismatch(format!(
                "store slot size {} bytes, configured {}",
                header[6], self.slot_size
            )));
        }
        Ok(())
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    pub fn max_name_len(&self) -> usize {
        self.max_name_len
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn slot_base(&self, slot: usize) -> usize {
        HEADER_LEN + slot * self.slot_size
    }

    fn name_offset(&self) -> usize {
        match self.policy {
            CollisionPolicy::Overwrite => 1,
            CollisionPolicy::Probe => 1 + ADDRESS_LEN,
        }
    }

    fn read_slot(&self, slot: usize) -> Result<SlotState, RegistryError> {
        let base = self.slot_base(slot);
        let first = self.store.read_byte(base);
        if first == ERASED {
            return Ok(SlotState::Empty);
        }
        if first == TOMBSTONE && self.policy == CollisionPolicy::Probe {
            return Ok(SlotState::Deleted);
        }
        let len = first as usize;
        if len > self.max_name_len {
            return Err(RegistryError::CorruptSlot { slot });
        }

        let owner = match self.policy {
            CollisionPolicy::Overwrite => None,
            CollisionPolicy::Probe => {
                let mut bytes = [0u8; ADDRESS_LEN];
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = self.store.read_byte(base + 1 + i);
                }
                Some(HardwareAddress::new(bytes))
            }
        };

        let start = base + self.name_offset();
        if self.store.read_byte(start + len) != TERMINATOR {
            return Err(RegistryError::CorruptSlot { slot });
        }
        let raw: Vec<u8> = (start..start + len).map(|a| self.store.read_byte(a)).collect();
        let name = String::from_utf8(raw).map_err(|_| RegistryError::CorruptSlot { slot })?;
        Ok(SlotState::Live { owner, name })
    }

    /// Probe sequence for `id`, home slot first, every slot at most once.
    fn probe_path(&self, id: &SensorId) -> impl Iterator<Item = usize> {
        let home = slot_index(id, self.slot_count);
        let n = self.slot_count;
        let steps = match self.policy {
            CollisionPolicy::Overwrite => 1,
            CollisionPolicy::Probe => n,
        };
        (0..steps).map(move |step| (home + step) % n)
    }

    /// Slot currently holding `id`, if any.
    fn find(&self, id: &SensorId) -> Result<Option<usize>, RegistryError> {
        let want = id.to_address();
        for slot in self.probe_path(id) {
            match self.policy {
                CollisionPolicy::Overwrite => {
                    return Ok(match self.read_slot(slot)? {
                        SlotState::Live { .. } => Some(slot),
                        _ => None,
                    });
                }
                CollisionPolicy::Probe => match self.read_slot(slot) {
                    Ok(SlotState::Empty) => return Ok(None),
                    Ok(SlotState::Live { owner: Some(owner), .. }) if owner == want => {
                        return Ok(Some(slot))
                    }
                    // Tombstones, other owners and unreadable slots all continue the chain.
                    Ok(_) | Err(RegistryError::CorruptSlot { .. }) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(None)
    }

    /// Whether a name is stored for `id`. Unknown ids yield `Ok(false)`.
    pub fn exists(&self, id: &SensorId) -> Result<bool, RegistryError> {
        Ok(self.find(id)?.is_some())
    }

    /// Stored name for `id`.
    ///
    /// Under [`CollisionPolicy::Overwrite`] the name may belong to another
    /// id sharing the same slot.
    pub fn read(&self, id: &SensorId) -> Result<Option<NameRecord>, RegistryError> {
        let Some(slot) = self.find(id)? else { return Ok(None) };
        match self.read_slot(slot)? {
            SlotState::Live { name, .. } => Ok(Some(name)),
            _ => Ok(None),
        }
    }

    /// Store `name` for `id` and commit.
    ///
    /// Rewriting the name that is already stored touches nothing.
    pub fn write(&mut self, id: &SensorId, name: &str) -> Result<(), RegistryError> {
        if name.len() > self.max_name_len {
            return Err(RegistryError::CapacityExceeded { len: name.len(), max: self.max_name_len });
        }
        if name.as_bytes().contains(&TERMINATOR) {
            return Err(RegistryError::InvalidName);
        }

        let slot = match self.policy {
            CollisionPolicy::Overwrite => slot_index(id, self.slot_count),
            CollisionPolicy::Probe => self.claim_slot(id)?,
        };

        if let Ok(SlotState::Live { name: current, owner }) = self.read_slot(slot) {
            let same_owner = match self.policy {
                CollisionPolicy::Overwrite => true,
                CollisionPolicy::Probe => owner == Some(id.to_address()),
            };
            if same_owner && current == name {
                return Ok(());
            }
        }

        let base = self.slot_base(slot);
        self.store.write_byte(base, name.len() as u8);
        if self.policy == CollisionPolicy::Probe {
            for (i, b) in id.to_address().as_bytes().iter().enumerate() {
                self.store.write_byte(base + 1 + i, *b);
            }
        }
        let start = base + self.name_offset();
        for (i, b) in name.bytes().enumerate() {
            self.store.write_byte(start + i, b);
        }
        self.store.write_byte(start + name.len(), TERMINATOR);
        self.store.commit()?;
        Ok(())
    }

    /// The slot `id` should be written to: its current slot, else the first
    /// reusable slot on its probe path.
    fn claim_slot(&self, id: &SensorId) -> Result<usize, RegistryError> {
        let want = id.to_address();
        let mut reusable: Option<usize> = None;
        for slot in self.probe_path(id) {
            match self.read_slot(slot) {
                Ok(SlotState::Empty) => return Ok(reusable.unwrap_or(slot)),
                Ok(SlotState::Deleted) => {
                    reusable.get_or_insert(slot);
                }
                Ok(SlotState::Live { owner: Some(owner), .. }) if owner == want => return Ok(slot),
                Ok(SlotState::Live { .. }) | Err(RegistryError::CorruptSlot { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        reusable.ok_or(RegistryError::Full { slots: self.slot_count })
    }

    /// Remove the name stored for `id`. Returns whether anything was removed.
    pub fn delete(&mut self, id: &SensorId) -> Result<bool, RegistryError> {
        match self.find(id)? {
            Some(slot) => {
                self.clear_slot(slot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clear one slot by index and commit.
    ///
    /// Used to prune direct-mapped slots, whose owner is not recorded.
    pub fn clear_slot(&mut self, slot: usize) -> Result<(), RegistryError> {
        if slot >= self.slot_count {
            return Err(RegistryError::InvalidLayout(format!(
                "slot {} out of range (0..{})",
                slot, self.slot_count
            )));
        }
        let marker = match self.policy {
            CollisionPolicy::Overwrite => ERASED,
            CollisionPolicy::Probe => TOMBSTONE,
        };
        let base = self.slot_base(slot);
        self.store.write_byte(base, marker);
        self.store.commit()?;
        Ok(())
    }

    /// Scan every slot once, yielding the live ones.
    ///
    /// Each call starts a fresh scan. Malformed slots show up as
    /// [`RegistryError::CorruptSlot`] items without ending the scan.
    pub fn enumerate(&self) -> impl Iterator<Item = Result<StoredEntry, RegistryError>> + '_ {
        (0..self.slot_count).filter_map(move |slot| match self.read_slot(slot) {
            Ok(SlotState::Live { owner, name }) => Some(Ok(StoredEntry {
                slot,
                sensor: owner.map(|a| a.to_sensor_id()),
                name,
            })),
            Ok(SlotState::Empty) | Ok(SlotState::Deleted) => None,
            Err(e) => Some(Err(e)),
        })
    }
}

/// Cut `name` to at most `max` bytes on a char boundary, dropping NULs.
pub fn truncate_name(name: &str, max: usize) -> String {
    let mut out = String::new();
    for c in name.chars().filter(|&c| c != '\0') {
        if out.len() + c.len_utf8() > max {
            break;
        }
        out.push(c);
    }
    out
}
