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

use std::io::{self, Write};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::address::SensorId;
use crate::bus::BusDriver;
use crate::logger::log_event;
use crate::registry::Registry;
use crate::store::ByteStore;

pub const UNNAMED_LABEL: &str = "<unnamed>";
pub const UNREADABLE_LABEL: &str = "<unreadable>";

/// Destination for report lines. Emitting never fails.
pub trait ReportSink {
    fn emit_line(&mut self, line: &str);
}

impl ReportSink for Vec<String> {
    fn emit_line(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn emit_line(&mut self, line: &str) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    }
}

pub fn format_report(label: &str, id: &SensorId, temp_c: f32) -> String {
    if temp_c.is_nan() {
        format!("Sensor {} ({}) = unavailable", label, id)
    } else {
        format!("Sensor {} ({}) = {:.2}°C", label, id, temp_c)
    }
}

/// Interval-gated conversion and report cycle.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    last_poll: Option<Instant>,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_poll: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_poll {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Poll if the interval has elapsed at `now`.
    ///
    /// Returns the number of report lines emitted, or `None` when it is not
    /// yet time.
    pub fn tick<S: ByteStore>(
        &mut self,
        now: Instant,
        bus: &mut dyn BusDriver,
        registry: &Registry<S>,
        sink: &mut dyn ReportSink,
    ) -> Option<usize> {
        if !self.is_due(now) {
            return None;
        }
        self.last_poll = Some(now);
        Some(poll_now(bus, registry, sink))
    }
}

/// One unconditional conversion and report pass.
pub fn poll_now<S: ByteStore>(
    bus: &mut dyn BusDriver,
    registry: &Registry<S>,
    sink: &mut dyn ReportSink,
) -> usize {
    if let Err(e) = bus.request_conversion() {
        log_event("conversion_failed", json!({ "error": e.to_string() }));
    }

    let mut emitted = 0;
    for index in 0..bus.device_count() {
        let address = match bus.address_at(index) {
            Ok(a) => a,
            Err(e) => {
                log_event("address_failed", json!({ "index": index, "error": e.to_string() }));
                continue;
            }
        };
        let id = address.to_sensor_id();
        let label = match registry.read(&id) {
            Ok(Some(name)) => name,
            Ok(None) => UNNAMED_LABEL.to_string(),
            Err(_) => UNREADABLE_LABEL.to_string(),
        };
        sink.emit_line(&format_report(&label, &id, bus.last_temperature(&address)));
        emitted += 1;
    }
    emitted
}
