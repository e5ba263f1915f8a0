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

//! Hardware addresses and their canonical textual form.
//!
//! The slot hash defined here is part of the on-store format (version 1).
//! Changing the multiplier, the seed or the input bytes moves every stored
//! name to a different slot, so treat it as a fixed contract.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Length of a 1-Wire ROM code in bytes.
pub const ADDRESS_LEN: usize = 8;

/// Length of the hexadecimal rendering of an address.
pub const SENSOR_ID_LEN: usize = ADDRESS_LEN * 2;

/// Multiplier of the polynomial slot hash (store format version 1).
pub const SLOT_HASH_MULTIPLIER: u32 = 31;

/// Family codes of the temperature sensors handled by `w1_therm`.
pub const THERMOMETER_FAMILIES: [u8; 5] = [0x10, 0x22, 0x28, 0x3B, 0x42];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("sensor id must be {expected} hex digits, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("invalid hex digit {0:?} in sensor id")]
    BadDigit(char),
    #[error("malformed w1 device name: {0}")]
    BadW1Name(String),
}

/// 8-byte ROM code assigned by the sensor manufacturer.
///
/// Byte 0 is the family code, bytes 1..=6 the serial number (least
/// significant byte first) and byte 7 a Dallas CRC-8 over the first seven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress([u8; ADDRESS_LEN]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn family(&self) -> u8 {
        self.0[0]
    }

    pub fn is_thermometer(&self) -> bool {
        THERMOMETER_FAMILIES.contains(&self.family())
    }

    /// True when byte 7 matches the CRC-8 of bytes 0..=6.
    pub fn crc_valid(&self) -> bool {
        dallas_crc8(&self.0[..ADDRESS_LEN - 1]) == self.0[ADDRESS_LEN - 1]
    }

    /// Build the ROM code from a Linux w1 device directory name such as
    /// `28-0316a2794aff`.
    ///
    /// The kernel prints the 48-bit serial most significant byte first and
    /// omits the CRC, so the serial is reversed into ROM order and the CRC
    /// byte is recomputed.
    pub fn from_w1_name(name: &str) -> Result<Self, AddressError> {
        let bad = || AddressError::BadW1Name(name.to_string());
        let (family, serial) = name.split_once('-').ok_or_else(bad)?;
        if family.len() != 2 || serial.len() != 12 || !serial.is_ascii() {
            return Err(bad());
        }
        let family = u8::from_str_radix(family, 16).map_err(|_| bad())?;

        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = family;
        for i in 0..6 {
            let pair = &serial[i * 2..i * 2 + 2];
            let value = u8::from_str_radix(pair, 16).map_err(|_| bad())?;
            bytes[6 - i] = value;
        }
        bytes[7] = dallas_crc8(&bytes[..7]);
        Ok(Self(bytes))
    }

    /// Linux w1 device directory name, the inverse of [`Self::from_w1_name`].
    pub fn to_w1_name(&self) -> String {
        let mut name = format!("{:02x}-", self.0[0]);
        for b in self.0[1..7].iter().rev() {
            name.push_str(&format!("{:02x}", b));
        }
        name
    }

    /// Canonical textual identifier of this address.
    pub fn to_sensor_id(&self) -> SensorId {
        to_sensor_id(self)
    }
}

impl From<[u8; ADDRESS_LEN]> for HardwareAddress {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Canonical 16-character uppercase hex rendering of a [`HardwareAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorId(String);

impl SensorId {
    /// Parse 16 hex digits in either case.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        let got = text.chars().count();
        if got != SENSOR_ID_LEN {
            return Err(AddressError::BadLength { expected: SENSOR_ID_LEN, got });
        }
        if let Some(c) = text.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(AddressError::BadDigit(c));
        }
        Ok(Self(text.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the raw address bytes.
    pub fn to_address(&self) -> HardwareAddress {
        let mut bytes = [0u8; ADDRESS_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            // Construction guarantees 16 ASCII hex digits.
            *b = u8::from_str_radix(&self.0[i * 2..i * 2 + 2], 16).unwrap_or(0);
        }
        HardwareAddress(bytes)
    }
}

impl FromStr for SensorId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&HardwareAddress> for SensorId {
    fn from(address: &HardwareAddress) -> Self {
        to_sensor_id(address)
    }
}

pub fn to_sensor_id(address: &HardwareAddress) -> SensorId {
    SensorId(address.to_string())
}

/// Polynomial rolling hash over the ASCII bytes of the id:
/// `h = h * 31 + byte`, wrapping at 32 bits, seed 0.
pub fn slot_hash(id: &SensorId) -> u32 {
    id.as_str()
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(SLOT_HASH_MULTIPLIER).wrapping_add(b as u32))
}

/// Home slot of `id` in a table of `slot_count` slots.
///
/// # Panics
/// Panics if `slot_count` is zero.
pub fn slot_index(id: &SensorId, slot_count: usize) -> usize {
    assert!(slot_count > 0, "slot_count must be positive");
    (slot_hash(id) as usize) % slot_count
}

/// Dallas/Maxim 1-Wire CRC-8 (x^8 + x^5 + x^4 + 1, reflected).
pub fn dallas_crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
    }
    crc
}
