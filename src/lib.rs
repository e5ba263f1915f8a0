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

//! Sensorreg - persistent names for 1-Wire temperature sensors
//!
//! This library maps sensor hardware addresses to user-assigned names kept
//! in a small byte-addressable store, reconciles the stored names with the
//! sensors present on the bus, and polls the bus for labeled readings.

pub mod address;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod input;
pub mod logger;
pub mod poll;
pub mod registry;
pub mod store;

#[cfg(test)]
pub mod test_utils;
