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

//! Temperature bus drivers.
//!
//! [`W1SysfsBus`] talks to the Linux `w1_therm` driver through sysfs,
//! [`SimulatedBus`] serves a fixed set of sensors for tests and bench setups.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{HardwareAddress, SensorId};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("no device at index {0}")]
    NoDevice(usize),
    #[error("device at index {index} reported a bad address: {reason}")]
    BadAddress { index: usize, reason: String },
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("conversion request failed: {0}")]
    Conversion(String),
    #[error("invalid bus description: {0}")]
    Description(String),
}

/// Conversion resolution of a DS18B20-class sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Bits9,
    Bits10,
    Bits11,
    Bits12,
}

impl Resolution {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            9 => Some(Resolution::Bits9),
            10 => Some(Resolution::Bits10),
            11 => Some(Resolution::Bits11),
            12 => Some(Resolution::Bits12),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Resolution::Bits9 => 9,
            Resolution::Bits10 => 10,
            Resolution::Bits11 => 11,
            Resolution::Bits12 => 12,
        }
    }

    /// Worst-case conversion time from the DS18B20 datasheet.
    pub fn conversion_time_ms(self) -> u64 {
        match self {
            Resolution::Bits9 => 94,
            Resolution::Bits10 => 188,
            Resolution::Bits11 => 375,
            Resolution::Bits12 => 750,
        }
    }
}

/// Access to the sensors on one bus.
///
/// Conversion timing belongs to the driver: `request_conversion` only
/// starts a conversion and `last_temperature` returns the latest finished
/// value, or NaN when there is none.
#[cfg_attr(test, mockall::automock)]
pub trait BusDriver {
    fn device_count(&self) -> usize;
    fn address_at(&self, index: usize) -> Result<HardwareAddress, BusError>;
    fn request_conversion(&mut self) -> Result<(), BusError>;
    fn last_temperature(&self, address: &HardwareAddress) -> f32;
    fn set_resolution(&mut self, address: &HardwareAddress, resolution: Resolution) -> Result<(), BusError>;
}

// ============================================================================
// Linux w1_therm
// ============================================================================

pub const DEFAULT_W1_ROOT: &str = "/sys/bus/w1/devices";

/// Sensors exposed by the `w1_therm` kernel driver.
///
/// The device list is rescanned on every `device_count` call and
/// `address_at` indexes into that scan. Conversions use the bulk-read
/// interface so that requesting one never blocks.
#[derive(Debug)]
pub struct W1SysfsBus {
    root: PathBuf,
    devices: RefCell<Vec<String>>,
}

impl W1SysfsBus {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf(), devices: RefCell::new(Vec::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(&self.root) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .filter(|name| {
                    HardwareAddress::from_w1_name(name)
                        .map(|a| a.is_thermometer())
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn bus_masters(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else { return Vec::new() };
        let mut masters: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("w1_bus_master"))
            .map(|e| e.path())
            .collect();
        masters.sort();
        masters
    }

    fn device_dir(&self, address: &HardwareAddress) -> PathBuf {
        self.root.join(address.to_w1_name())
    }
}

impl BusDriver for W1SysfsBus {
    fn device_count(&self) -> usize {
        let names = self.scan();
        let n = names.len();
        *self.devices.borrow_mut() = names;
        n
    }

    fn address_at(&self, index: usize) -> Result<HardwareAddress, BusError> {
        let devices = self.devices.borrow();
        let name = devices.get(index).ok_or(BusError::NoDevice(index))?;
        HardwareAddress::from_w1_name(name)
            .map_err(|e| BusError::BadAddress { index, reason: e.to_string() })
    }

    fn request_conversion(&mut self) -> Result<(), BusError> {
        let masters = self.bus_masters();
        if masters.is_empty() {
            // Reads would fall back to w1_slave, which converts synchronously.
            return Err(BusError::Conversion(format!(
                "no w1_bus_master under {}",
                self.root.display()
            )));
        }
        let mut triggered = 0usize;
        let mut last_err: Option<BusError> = None;
        for master in masters {
            let path = master.join("therm_bulk_read");
            match fs::write(&path, "trigger") {
                Ok(()) => triggered += 1,
                Err(source) => last_err = Some(BusError::Io { path, source }),
            }
        }
        match (triggered, last_err) {
            (0, Some(e)) => Err(BusError::Conversion(e.to_string())),
            _ => Ok(()),
        }
    }

    fn last_temperature(&self, address: &HardwareAddress) -> f32 {
        let dir = self.device_dir(address);
        if let Ok(raw) = read_trimmed(dir.join("temperature")) {
            if let Ok(milli) = raw.parse::<i64>() {
                return milli as f32 / 1000.0;
            }
        }
        match read_trimmed(dir.join("w1_slave")) {
            Ok(text) => parse_w1_slave(&text).unwrap_or(f32::NAN),
            Err(_) => f32::NAN,
        }
    }

    fn set_resolution(&mut self, address: &HardwareAddress, resolution: Resolution) -> Result<(), BusError> {
        let path = self.device_dir(address).join("resolution");
        fs::write(&path, resolution.bits().to_string()).map_err(|source| BusError::Io { path, source })
    }
}

fn read_trimmed<P: AsRef<Path>>(p: P) -> io::Result<String> {
    let mut s = String::new();
    fs::File::open(p)?.read_to_string(&mut s)?;
    Ok(s.trim().to_string())
}

/// Temperature from the two-line `w1_slave` format; `None` on a CRC
/// failure or when the `t=` field is missing.
pub fn parse_w1_slave(text: &str) -> Option<f32> {
    let mut lines = text.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }
    let (_, milli) = lines.next()?.rsplit_once("t=")?;
    milli.trim().parse::<i64>().ok().map(|m| m as f32 / 1000.0)
}

// ============================================================================
// Simulated bus
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedSensor {
    /// Sensor id as 16 hex digits.
    pub address: String,
    #[serde(default)]
    pub temperature_c: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedBusFile {
    pub sensors: Vec<SimulatedSensor>,
}

#[derive(Debug, Clone)]
struct SimDevice {
    /// `None` makes `address_at` fail for this index.
    address: Option<HardwareAddress>,
    temperature_c: Option<f32>,
    converted_c: Option<f32>,
}

/// A bus with a fixed, scriptable set of sensors.
///
/// Temperatures become visible through `last_temperature` only after a
/// conversion has been requested, like on the real part.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    devices: Vec<SimDevice>,
    conversions: usize,
    fail_conversions: bool,
    resolutions: HashMap<HardwareAddress, Resolution>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor(mut self, address: HardwareAddress, temperature_c: f32) -> Self {
        self.add_sensor(address, Some(temperature_c));
        self
    }

    /// A device that answers the search but whose address cannot be read.
    pub fn with_unreadable_device(mut self) -> Self {
        self.devices.push(SimDevice { address: None, temperature_c: None, converted_c: None });
        self
    }

    pub fn add_sensor(&mut self, address: HardwareAddress, temperature_c: Option<f32>) {
        self.devices.push(SimDevice { address: Some(address), temperature_c, converted_c: None });
    }

    /// Unplug a sensor. Returns whether it was present.
    pub fn remove_sensor(&mut self, address: &HardwareAddress) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.address.as_ref() != Some(address));
        before != self.devices.len()
    }

    pub fn set_temperature(&mut self, address: &HardwareAddress, temperature_c: Option<f32>) {
        for d in self.devices.iter_mut().filter(|d| d.address.as_ref() == Some(address)) {
            d.temperature_c = temperature_c;
        }
    }

    pub fn set_fail_conversions(&mut self, fail: bool) {
        self.fail_conversions = fail;
    }

    pub fn conversion_count(&self) -> usize {
        self.conversions
    }

    pub fn resolution_of(&self, address: &HardwareAddress) -> Option<Resolution> {
        self.resolutions.get(address).copied()
    }

    pub fn from_description(desc: &SimulatedBusFile) -> Result<Self, BusError> {
        let mut bus = Self::new();
        for s in &desc.sensors {
            let id = SensorId::parse(&s.address)
                .map_err(|e| BusError::Description(format!("{}: {}", s.address, e)))?;
            bus.add_sensor(id.to_address(), s.temperature_c);
        }
        Ok(bus)
    }

    pub fn from_json(text: &str) -> Result<Self, BusError> {
        let desc: SimulatedBusFile =
            serde_json::from_str(text).map_err(|e| BusError::Description(e.to_string()))?;
        Self::from_description(&desc)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BusError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| BusError::Io { path: path.to_path_buf(), source })?;
        Self::from_json(&text)
    }
}

impl BusDriver for SimulatedBus {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn address_at(&self, index: usize) -> Result<HardwareAddress, BusError> {
        let dev = self.devices.get(index).ok_or(BusError::NoDevice(index))?;
        dev.address.ok_or_else(|| BusError::BadAddress { index, reason: "no response".into() })
    }

    fn request_conversion(&mut self) -> Result<(), BusError> {
        if self.fail_conversions {
            return Err(BusError::Conversion("bus held low".into()));
        }
        for d in &mut self.devices {
            d.converted_c = d.temperature_c;
        }
        self.conversions += 1;
        Ok(())
    }

    fn last_temperature(&self, address: &HardwareAddress) -> f32 {
        self.devices
            .iter()
            .find(|d| d.address.as_ref() == Some(address))
            .and_then(|d| d.converted_c)
            .unwrap_or(f32::NAN)
    }

    fn set_resolution(&mut self, address: &HardwareAddress, resolution: Resolution) -> Result<(), BusError> {
        if !self.devices.iter().any(|d| d.address.as_ref() == Some(address)) {
            return Err(BusError::Description(format!("no sensor {}", address)));
        }
        self.resolutions.insert(*address, resolution);
        Ok(())
    }
}
