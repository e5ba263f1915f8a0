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

//! Reconciling the sensors on the bus with the stored names.

use std::collections::HashSet;

use serde_json::json;

use crate::address::{slot_index, HardwareAddress, SensorId};
use crate::bus::{BusDriver, BusError, Resolution};
use crate::input::{is_affirmative, InputError, TextInput};
use crate::logger::log_event;
use crate::registry::{truncate_name, CollisionPolicy, Registry, RegistryError, StoredEntry};
use crate::store::ByteStore;

pub const DEFAULT_NAME_PREFIX: &str = "sensor-";

/// The devices that answered on the bus at one moment.
#[derive(Debug, Default)]
pub struct DeviceSnapshot {
    pub addresses: Vec<HardwareAddress>,
    /// Indices whose address could not be read.
    pub failures: Vec<(usize, BusError)>,
}

impl DeviceSnapshot {
    pub fn capture(bus: &dyn BusDriver) -> Self {
        let mut snap = Self::default();
        for index in 0..bus.device_count() {
            match bus.address_at(index) {
                Ok(addr) => snap.addresses.push(addr),
                Err(e) => {
                    log_event("address_failed", json!({ "index": index, "error": e.to_string() }));
                    snap.failures.push((index, e));
                }
            }
        }
        snap
    }

    pub fn from_addresses(addresses: Vec<HardwareAddress>) -> Self {
        Self { addresses, failures: Vec::new() }
    }

    pub fn ids(&self) -> Vec<SensorId> {
        self.addresses.iter().map(HardwareAddress::to_sensor_id).collect()
    }

    pub fn contains(&self, id: &SensorId) -> bool {
        let want = id.to_address();
        self.addresses.iter().any(|a| *a == want)
    }
}

#[derive(Debug, Clone)]
pub struct NamingOptions {
    pub default_prefix: String,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self { default_prefix: DEFAULT_NAME_PREFIX.to_string() }
    }
}

/// What one discovery pass did.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub connected: usize,
    pub already_named: Vec<SensorId>,
    pub named: Vec<(SensorId, String)>,
    /// Sensors that got the default name because no answer came.
    pub defaulted: Vec<SensorId>,
    pub failed: Vec<(SensorId, String)>,
    pub address_failures: usize,
    /// Set when the user aborted the prompt; later sensors were not asked.
    pub interrupted: bool,
}

impl DiscoveryReport {
    /// Number of registry writes the pass performed.
    pub fn writes(&self) -> usize {
        self.named.len()
    }
}

pub fn default_name(prefix: &str, id: &SensorId, max_len: usize) -> String {
    truncate_name(&format!("{}{}", prefix, id), max_len)
}

fn record_failure(report: &mut DiscoveryReport, id: &SensorId, err: &RegistryError) {
    let event = match err {
        RegistryError::Store(_) => "commit_failed",
        _ => "name_failed",
    };
    log_event(event, json!({ "sensor": id.as_str(), "error": err.to_string() }));
    report.failed.push((id.clone(), err.to_string()));
}

/// Name every connected sensor the registry does not know yet.
///
/// Blocks on `input` once per unknown sensor. A failure for one sensor is
/// recorded and the pass moves on; an interrupted prompt ends the pass.
pub fn discover<S: ByteStore>(
    snapshot: &DeviceSnapshot,
    registry: &mut Registry<S>,
    input: &mut dyn TextInput,
    opts: &NamingOptions,
) -> DiscoveryReport {
    let mut report = DiscoveryReport {
        connected: snapshot.addresses.len(),
        address_failures: snapshot.failures.len(),
        ..DiscoveryReport::default()
    };
    let max = registry.max_name_len();

    for addr in &snapshot.addresses {
        let id = addr.to_sensor_id();
        match registry.exists(&id) {
            Ok(true) => {
                report.already_named.push(id);
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                record_failure(&mut report, &id, &e);
                continue;
            }
        }

        let message = format!("New sensor {} found. Name (max {} bytes): ", id, max);
        let (name, defaulted) = match input.prompt_line(&message) {
            Ok(Some(line)) if !line.trim().is_empty() => (truncate_name(&line, max), false),
            Ok(_) => (default_name(&opts.default_prefix, &id, max), true),
            Err(InputError::Interrupted) => {
                report.interrupted = true;
                break;
            }
            Err(e) => {
                log_event("name_failed", json!({ "sensor": id.as_str(), "error": e.to_string() }));
                report.failed.push((id, e.to_string()));
                continue;
            }
        };

        match registry.write(&id, &name) {
            Ok(()) => {
                log_event(
                    "sensor_named",
                    json!({ "sensor": id.as_str(), "name": name, "defaulted": defaulted }),
                );
                if defaulted {
                    report.defaulted.push(id.clone());
                }
                report.named.push((id, name));
            }
            Err(e) => record_failure(&mut report, &id, &e),
        }
    }
    report
}

/// Stored entries with no connected owner.
#[derive(Debug, Default)]
pub struct PrunePlan {
    pub stale: Vec<StoredEntry>,
    pub corrupt: Vec<usize>,
}

/// Sort stored entries into stale ones and unreadable slots.
///
/// Direct-mapped slots do not record their owner, so an entry counts as
/// connected there when its slot is the home slot of a connected id.
pub fn plan_prune<S: ByteStore>(
    snapshot: &DeviceSnapshot,
    registry: &Registry<S>,
) -> Result<PrunePlan, RegistryError> {
    let homes: HashSet<usize> = snapshot
        .ids()
        .iter()
        .map(|id| slot_index(id, registry.slot_count()))
        .collect();

    let mut plan = PrunePlan::default();
    for item in registry.enumerate() {
        match item {
            Ok(entry) => {
                let connected = match registry.policy() {
                    CollisionPolicy::Probe => entry.sensor.as_ref().is_some_and(|id| snapshot.contains(id)),
                    CollisionPolicy::Overwrite => homes.contains(&entry.slot),
                };
                if !connected {
                    plan.stale.push(entry);
                }
            }
            Err(RegistryError::CorruptSlot { slot }) => plan.corrupt.push(slot),
            Err(e) => return Err(e),
        }
    }
    Ok(plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ask,
    PreConfirmed,
}

/// What to do when some devices did not report an address.
///
/// Such a device may be a connected sensor whose name would look stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteSnapshot {
    Refuse,
    Proceed,
}

#[derive(Debug, Default)]
pub struct PruneOutcome {
    pub deleted: Vec<StoredEntry>,
    pub failed: Vec<(usize, String)>,
    pub declined: bool,
    /// Address failures that stopped the prune; zero when it ran.
    pub refused_unreadable: usize,
    /// Unreadable slots, reported and left in place.
    pub corrupt_slots: Vec<usize>,
}

fn describe(entry: &StoredEntry) -> String {
    match &entry.sensor {
        Some(id) => format!("{} ({})", entry.name, id),
        None => format!("{} (slot {})", entry.name, entry.slot),
    }
}

/// Delete stored names whose sensors are not in `snapshot`.
///
/// Without [`Confirmation::PreConfirmed`] nothing is deleted unless the
/// user answers yes. Nothing is deleted either when the snapshot has
/// address failures; see [`prune_with`].
pub fn prune<S: ByteStore>(
    snapshot: &DeviceSnapshot,
    registry: &mut Registry<S>,
    input: &mut dyn TextInput,
    confirmation: Confirmation,
) -> Result<PruneOutcome, RegistryError> {
    prune_with(snapshot, registry, input, confirmation, IncompleteSnapshot::Refuse)
}

pub fn prune_with<S: ByteStore>(
    snapshot: &DeviceSnapshot,
    registry: &mut Registry<S>,
    input: &mut dyn TextInput,
    confirmation: Confirmation,
    incomplete: IncompleteSnapshot,
) -> Result<PruneOutcome, RegistryError> {
    let plan = plan_prune(snapshot, registry)?;
    let mut outcome = PruneOutcome { corrupt_slots: plan.corrupt, ..PruneOutcome::default() };
    if plan.stale.is_empty() {
        return Ok(outcome);
    }
    if !snapshot.failures.is_empty() && incomplete == IncompleteSnapshot::Refuse {
        log_event(
            "prune_refused",
            json!({ "address_failures": snapshot.failures.len(), "stale": plan.stale.len() }),
        );
        outcome.refused_unreadable = snapshot.failures.len();
        return Ok(outcome);
    }

    if confirmation == Confirmation::Ask {
        let listed: Vec<String> = plan.stale.iter().map(describe).collect();
        let message = format!(
            "Delete {} disconnected sensor name(s): {}? [y/N] ",
            plan.stale.len(),
            listed.join(", ")
        );
        let confirmed = matches!(input.prompt_line(&message), Ok(Some(answer)) if is_affirmative(&answer));
        if !confirmed {
            outcome.declined = true;
            return Ok(outcome);
        }
    }

    for entry in plan.stale {
        match registry.clear_slot(entry.slot) {
            Ok(()) => {
                log_event(
                    "sensor_deleted",
                    json!({
                        "slot": entry.slot,
                        "name": entry.name,
                        "sensor": entry.sensor.as_ref().map(SensorId::as_str),
                    }),
                );
                outcome.deleted.push(entry);
            }
            Err(e) => {
                log_event("commit_failed", json!({ "slot": entry.slot, "error": e.to_string() }));
                outcome.failed.push((entry.slot, e.to_string()));
            }
        }
    }
    Ok(outcome)
}

/// Connected sensors with their names, plus stored names of absent ones.
#[derive(Debug, Default)]
pub struct Listing {
    /// `None` for sensors without a readable name.
    pub connected: Vec<(SensorId, Option<String>)>,
    pub disconnected: Vec<StoredEntry>,
    pub corrupt: Vec<usize>,
}

pub fn list_sensors<S: ByteStore>(
    snapshot: &DeviceSnapshot,
    registry: &Registry<S>,
) -> Result<Listing, RegistryError> {
    let mut connected = Vec::with_capacity(snapshot.addresses.len());
    for id in snapshot.ids() {
        let name = match registry.read(&id) {
            Ok(name) => name,
            Err(RegistryError::CorruptSlot { .. }) => None,
            Err(e) => return Err(e),
        };
        connected.push((id, name));
    }
    let plan = plan_prune(snapshot, registry)?;
    Ok(Listing { connected, disconnected: plan.stale, corrupt: plan.corrupt })
}

/// Set every connected sensor to `resolution`, collecting failures.
pub fn configure_resolution(
    bus: &mut dyn BusDriver,
    snapshot: &DeviceSnapshot,
    resolution: Resolution,
) -> Vec<(SensorId, BusError)> {
    let mut failures = Vec::new();
    for addr in &snapshot.addresses {
        if let Err(e) = bus.set_resolution(addr, resolution) {
            failures.push((addr.to_sensor_id(), e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;
    use crate::input::MockTextInput;
    use crate::registry::DEFAULT_MAX_NAME_LEN;
    use crate::test_utils::test_utils::{colliding_pair, memory_registry, sensor, ScriptedInput};

    #[test]
    fn test_snapshot_records_address_failures() {
        let bus = SimulatedBus::new()
            .with_sensor(sensor(1), 1.0)
            .with_unreadable_device()
            .with_sensor(sensor(2), 2.0);
        let snap = DeviceSnapshot::capture(&bus);
        assert_eq!(snap.addresses, vec![sensor(1), sensor(2)]);
        assert_eq!(snap.failures.len(), 1);
        assert_eq!(snap.failures[0].0, 1);
        assert!(snap.contains(&sensor(2).to_sensor_id()));
        assert!(!snap.contains(&sensor(3).to_sensor_id()));
    }

    #[test]
    fn test_discovery_prompts_once_and_stores_verbatim() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        let x = sensor(1).to_sensor_id();
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1)]);

        let mut input = MockTextInput::new();
        input
            .expect_prompt_line()
            .times(1)
            .returning(|_| Ok(Some("Wine Cellar".to_string())));

        let report = discover(&snap, &mut reg, &mut input, &NamingOptions::default());
        assert_eq!(report.named, vec![(x.clone(), "Wine Cellar".to_string())]);
        assert_eq!(reg.read(&x).unwrap().as_deref(), Some("Wine Cellar"));
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1), sensor(2)]);
        let mut input = ScriptedInput::answering(&["Fridge", "Freezer"]);
        let first = discover(&snap, &mut reg, &mut input, &NamingOptions::default());
        assert_eq!(first.writes(), 2);

        let commits = reg.store().commit_count();
        let mut silent = MockTextInput::new();
        silent.expect_prompt_line().times(0);
        let second = discover(&snap, &mut reg, &mut silent, &NamingOptions::default());
        assert_eq!(second.writes(), 0);
        assert_eq!(second.already_named.len(), 2);
        assert_eq!(reg.store().commit_count(), commits);
    }

    #[test]
    fn test_timeout_or_blank_answer_gets_default_name() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1), sensor(2)]);
        let mut input = ScriptedInput::default();
        input.push(Ok(None));
        input.push(Ok(Some("   ".to_string())));
        let opts = NamingOptions { default_prefix: "probe-".to_string() };

        let report = discover(&snap, &mut reg, &mut input, &opts);
        assert_eq!(report.defaulted.len(), 2);
        let id = sensor(1).to_sensor_id();
        assert_eq!(reg.read(&id).unwrap(), Some(format!("probe-{}", id)));
    }

    #[test]
    fn test_long_answer_is_truncated() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(4)]);
        let long = "n".repeat(DEFAULT_MAX_NAME_LEN + 10);
        let mut input = ScriptedInput::answering(&[long.as_str()]);
        discover(&snap, &mut reg, &mut input, &NamingOptions::default());
        let stored = reg.read(&sensor(4).to_sensor_id()).unwrap().unwrap();
        assert_eq!(stored.len(), DEFAULT_MAX_NAME_LEN);
    }

    #[test]
    fn test_failure_for_one_sensor_does_not_stop_pass() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1), sensor(2), sensor(3)]);
        let mut input = ScriptedInput::answering(&["one"]);
        input.push(Err(InputError::Io(std::io::Error::other("tty gone"))));
        input.push(Ok(Some("three".to_string())));

        let report = discover(&snap, &mut reg, &mut input, &NamingOptions::default());
        assert_eq!(report.named.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, sensor(2).to_sensor_id());
        assert!(!reg.exists(&sensor(2).to_sensor_id()).unwrap());
    }

    #[test]
    fn test_commit_failure_is_recorded_per_sensor() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        reg.store_mut().set_fail_commits(true);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1), sensor(2)]);
        let mut input = ScriptedInput::answering(&["a", "b"]);
        let report = discover(&snap, &mut reg, &mut input, &NamingOptions::default());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(input.prompts.len(), 2);
    }

    #[test]
    fn test_interrupt_ends_pass() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1), sensor(2)]);
        let mut input = ScriptedInput::default();
        input.push(Err(InputError::Interrupted));
        let report = discover(&snap, &mut reg, &mut input, &NamingOptions::default());
        assert!(report.interrupted);
        assert_eq!(input.prompts.len(), 1);
        assert_eq!(report.writes(), 0);
    }

    fn fridge_and_freezer(policy: CollisionPolicy) -> (Registry<crate::store::MemoryStore>, SensorId, SensorId) {
        let mut reg = memory_registry(policy);
        let (a, b) = (sensor(1).to_sensor_id(), sensor(2).to_sensor_id());
        assert_ne!(slot_index(&a, reg.slot_count()), slot_index(&b, reg.slot_count()));
        reg.write(&a, "Fridge").unwrap();
        reg.write(&b, "Freezer").unwrap();
        (reg, a, b)
    }

    #[test]
    fn test_prune_deletes_only_disconnected() {
        let (mut reg, a, b) = fridge_and_freezer(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1)]);
        let mut input = ScriptedInput::answering(&["yes"]);

        let outcome = prune(&snap, &mut reg, &mut input, Confirmation::Ask).unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(outcome.deleted[0].name, "Freezer");
        assert!(input.prompts[0].contains("Freezer"));
        assert!(!reg.exists(&b).unwrap());
        assert_eq!(reg.read(&a).unwrap().as_deref(), Some("Fridge"));
    }

    #[test]
    fn test_prune_declined_deletes_nothing() {
        let (mut reg, _, b) = fridge_and_freezer(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1)]);
        let commits = reg.store().commit_count();
        for answer in [Ok(Some("n".to_string())), Ok(None)] {
            let mut input = ScriptedInput::default();
            input.push(answer);
            let outcome = prune(&snap, &mut reg, &mut input, Confirmation::Ask).unwrap();
            assert!(outcome.declined);
        }
        assert!(reg.exists(&b).unwrap());
        assert_eq!(reg.store().commit_count(), commits);
    }

    #[test]
    fn test_preconfirmed_prune_does_not_prompt() {
        let (mut reg, _, b) = fridge_and_freezer(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1)]);
        let mut input = MockTextInput::new();
        input.expect_prompt_line().times(0);
        let outcome = prune(&snap, &mut reg, &mut input, Confirmation::PreConfirmed).unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert!(!reg.exists(&b).unwrap());
    }

    #[test]
    fn test_prune_with_nothing_stale_skips_prompt() {
        let (mut reg, _, _) = fridge_and_freezer(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1), sensor(2)]);
        let mut input = MockTextInput::new();
        input.expect_prompt_line().times(0);
        let outcome = prune(&snap, &mut reg, &mut input, Confirmation::Ask).unwrap();
        assert!(outcome.deleted.is_empty());
        assert!(!outcome.declined);
    }

    #[test]
    fn test_prune_refuses_when_a_device_is_unreadable() {
        let (mut reg, a, b) = fridge_and_freezer(CollisionPolicy::Probe);
        let bus = SimulatedBus::new().with_sensor(sensor(1), 4.0).with_unreadable_device();
        let snap = DeviceSnapshot::capture(&bus);
        assert_eq!(snap.failures.len(), 1);
        let commits = reg.store().commit_count();

        let mut input = MockTextInput::new();
        input.expect_prompt_line().times(0);
        let outcome = prune(&snap, &mut reg, &mut input, Confirmation::PreConfirmed).unwrap();
        assert_eq!(outcome.refused_unreadable, 1);
        assert!(outcome.deleted.is_empty());
        assert!(reg.exists(&a).unwrap());
        assert!(reg.exists(&b).unwrap());
        assert_eq!(reg.store().commit_count(), commits);
    }

    #[test]
    fn test_prune_with_override_proceeds_despite_unreadable_device() {
        let (mut reg, a, b) = fridge_and_freezer(CollisionPolicy::Probe);
        let bus = SimulatedBus::new().with_sensor(sensor(1), 4.0).with_unreadable_device();
        let snap = DeviceSnapshot::capture(&bus);
        let outcome = prune_with(
            &snap,
            &mut reg,
            &mut ScriptedInput::default(),
            Confirmation::PreConfirmed,
            IncompleteSnapshot::Proceed,
        )
        .unwrap();
        assert_eq!(outcome.refused_unreadable, 0);
        assert_eq!(outcome.deleted.len(), 1);
        assert!(reg.exists(&a).unwrap());
        assert!(!reg.exists(&b).unwrap());
    }

    #[test]
    fn test_prune_under_overwrite_uses_home_slots() {
        let (mut reg, a, b) = fridge_and_freezer(CollisionPolicy::Overwrite);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1)]);
        let outcome = prune(&snap, &mut reg, &mut ScriptedInput::default(), Confirmation::PreConfirmed).unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(outcome.deleted[0].sensor, None);
        assert!(reg.exists(&a).unwrap());
        assert!(!reg.exists(&b).unwrap());
    }

    #[test]
    fn test_prune_keeps_colliding_connected_entry_under_probe() {
        let mut reg = memory_registry(CollisionPolicy::Probe);
        let (p, q) = colliding_pair(reg.slot_count());
        reg.write(&p, "P").unwrap();
        reg.write(&q, "Q").unwrap();
        let snap = DeviceSnapshot::from_addresses(vec![q.to_address()]);
        let outcome = prune(&snap, &mut reg, &mut ScriptedInput::default(), Confirmation::PreConfirmed).unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(outcome.deleted[0].sensor.as_ref(), Some(&p));
        assert_eq!(reg.read(&q).unwrap().as_deref(), Some("Q"));
    }

    #[test]
    fn test_list_sensors() {
        let (reg, a, _) = fridge_and_freezer(CollisionPolicy::Probe);
        let snap = DeviceSnapshot::from_addresses(vec![sensor(1), sensor(7)]);
        let listing = list_sensors(&snap, &reg).unwrap();
        assert_eq!(listing.connected[0], (a, Some("Fridge".to_string())));
        assert_eq!(listing.connected[1], (sensor(7).to_sensor_id(), None));
        assert_eq!(listing.disconnected.len(), 1);
        assert_eq!(listing.disconnected[0].name, "Freezer");
        assert!(listing.corrupt.is_empty());
    }

    #[test]
    fn test_configure_resolution() {
        let mut bus = SimulatedBus::new().with_sensor(sensor(1), 1.0).with_sensor(sensor(2), 2.0);
        let snap = DeviceSnapshot::capture(&bus);
        let mut ghost = DeviceSnapshot::from_addresses(snap.addresses.clone());
        ghost.addresses.push(sensor(9));

        let failures = configure_resolution(&mut bus, &ghost, Resolution::Bits9);
        assert_eq!(bus.resolution_of(&sensor(1)), Some(Resolution::Bits9));
        assert_eq!(bus.resolution_of(&sensor(2)), Some(Resolution::Bits9));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, sensor(9).to_sensor_id());
    }
}
