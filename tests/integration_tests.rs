/*
 * Integration tests for Sensorreg
 *
 * These tests drive the public API the way the binary does: a file-backed
 * store, a simulated bus, discovery, pruning and polling.
 */

use std::collections::VecDeque;
use std::fs;
use std::time::{Duration, Instant};

use sensorreg::address::{dallas_crc8, HardwareAddress, SensorId};
use sensorreg::bus::{BusDriver, SimulatedBus};
use sensorreg::config::{load_config, write_config, BusConfig, Config};
use sensorreg::discovery::{discover, list_sensors, prune, Confirmation, DeviceSnapshot, NamingOptions};
use sensorreg::input::{InputError, TextInput};
use sensorreg::poll::Poller;
use sensorreg::registry::{CollisionPolicy, Registry, RegistryError, DEFAULT_MAX_NAME_LEN};
use sensorreg::store::{FileStore, StoreError};
use tempfile::TempDir;

const CAPACITY: usize = 512;

fn address(n: u8) -> HardwareAddress {
    let mut bytes = [0x28, 0x10, n, 0x3C, 0x02, 0x00, 0x00, 0x00];
    bytes[7] = dallas_crc8(&bytes[..7]);
    HardwareAddress::new(bytes)
}

struct Answers(VecDeque<String>);

impl Answers {
    fn new(lines: &[&str]) -> Self {
        Self(lines.iter().map(|s| s.to_string()).collect())
    }
}

impl TextInput for Answers {
    fn prompt_line(&mut self, _message: &str) -> Result<Option<String>, InputError> {
        Ok(self.0.pop_front())
    }
}

fn open(dir: &TempDir) -> Registry<FileStore> {
    let store = FileStore::open(dir.path().join("eeprom.bin"), CAPACITY).unwrap();
    Registry::open(store, CollisionPolicy::Probe, DEFAULT_MAX_NAME_LEN).unwrap()
}

#[test]
fn test_names_survive_power_cycle() {
    let dir = TempDir::new().unwrap();
    let bus = SimulatedBus::new().with_sensor(address(1), 4.0).with_sensor(address(2), -18.0);
    {
        let mut reg = open(&dir);
        let snap = DeviceSnapshot::capture(&bus);
        let report = discover(&snap, &mut reg, &mut Answers::new(&["Fridge", "Freezer"]), &NamingOptions::default());
        assert_eq!(report.writes(), 2);
    }

    let reg = open(&dir);
    assert_eq!(reg.read(&address(1).to_sensor_id()).unwrap().as_deref(), Some("Fridge"));
    assert_eq!(reg.read(&address(2).to_sensor_id()).unwrap().as_deref(), Some("Freezer"));

    // Nothing left to ask after the restart.
    let mut reg = reg;
    let snap = DeviceSnapshot::capture(&bus);
    let report = discover(&snap, &mut reg, &mut Answers::new(&[]), &NamingOptions::default());
    assert_eq!(report.writes(), 0);
    assert_eq!(report.already_named.len(), 2);
}

#[test]
fn test_store_image_has_fixed_size() {
    let dir = TempDir::new().unwrap();
    let _ = open(&dir);
    let image = fs::read(dir.path().join("eeprom.bin")).unwrap();
    assert_eq!(image.len(), CAPACITY);
    assert_eq!(&image[..4], b"SREG");

    let err = FileStore::open(dir.path().join("eeprom.bin"), 1024).err().unwrap();
    assert!(matches!(err, StoreError::SizeMismatch { .. }));
}

#[test]
fn test_unplugged_sensor_is_listed_then_pruned() {
    let dir = TempDir::new().unwrap();
    let mut bus = SimulatedBus::new().with_sensor(address(1), 4.0).with_sensor(address(2), -18.0);
    let mut reg = open(&dir);
    let snap = DeviceSnapshot::capture(&bus);
    discover(&snap, &mut reg, &mut Answers::new(&["Fridge", "Freezer"]), &NamingOptions::default());

    assert!(bus.remove_sensor(&address(2)));
    let snap = DeviceSnapshot::capture(&bus);
    let listing = list_sensors(&snap, &reg).unwrap();
    assert_eq!(listing.connected.len(), 1);
    assert_eq!(listing.disconnected.len(), 1);
    assert_eq!(listing.disconnected[0].sensor, Some(address(2).to_sensor_id()));

    let outcome = prune(&snap, &mut reg, &mut Answers::new(&["y"]), Confirmation::Ask).unwrap();
    assert_eq!(outcome.deleted.len(), 1);
    drop(reg);

    let reg = open(&dir);
    assert!(reg.exists(&address(1).to_sensor_id()).unwrap());
    assert!(!reg.exists(&address(2).to_sensor_id()).unwrap());
}

#[test]
fn test_poll_reports_named_values_on_interval() {
    let dir = TempDir::new().unwrap();
    let mut bus = SimulatedBus::new().with_sensor(address(1), 21.5).with_sensor(address(3), 0.0);
    bus.set_temperature(&address(3), None);
    let mut reg = open(&dir);
    reg.write(&address(1).to_sensor_id(), "Living room").unwrap();

    let mut poller = Poller::new(Duration::from_secs(1));
    let mut lines: Vec<String> = Vec::new();
    let t0 = Instant::now();
    assert_eq!(poller.tick(t0, &mut bus, &reg, &mut lines), Some(2));
    assert_eq!(poller.tick(t0 + Duration::from_millis(500), &mut bus, &reg, &mut lines), None);

    let id1 = address(1).to_sensor_id();
    let id3 = address(3).to_sensor_id();
    assert_eq!(
        lines,
        vec![
            format!("Sensor Living room ({}) = 21.50°C", id1),
            format!("Sensor <unnamed> ({}) = unavailable", id3),
        ]
    );
    assert_eq!(bus.conversion_count(), 1);
}

#[test]
fn test_simulated_bus_from_config_file() {
    let dir = TempDir::new().unwrap();
    let id = address(5).to_sensor_id();
    let bus_path = dir.path().join("bus.json");
    fs::write(
        &bus_path,
        format!(r#"{{"sensors":[{{"address":"{}","temperature_c":12.5}}]}}"#, id),
    )
    .unwrap();

    let cfg_path = dir.path().join("config.json");
    let cfg = Config {
        store_path: dir.path().join("eeprom.bin"),
        bus: BusConfig::Simulated { path: bus_path.clone() },
        ..Config::default()
    };
    write_config(&cfg_path, &cfg).unwrap();
    let cfg = load_config(&cfg_path).unwrap();

    let BusConfig::Simulated { path } = &cfg.bus else { panic!("expected simulated bus") };
    let bus = SimulatedBus::load(path).unwrap();
    assert_eq!(bus.device_count(), 1);
    assert_eq!(bus.address_at(0).unwrap().to_sensor_id(), id);
}

#[test]
fn test_sensor_id_text_round_trip() {
    let id = address(9).to_sensor_id();
    let lower = id.as_str().to_ascii_lowercase();
    assert_eq!(SensorId::parse(&lower).unwrap(), id);
    assert_eq!(id.to_address(), address(9));
    assert!(SensorId::parse("28FF").is_err());
}

#[test]
fn test_overlong_rename_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let mut reg = open(&dir);
    let id = address(1).to_sensor_id();
    reg.write(&id, "Porch").unwrap();
    let err = reg.write(&id, &"z".repeat(DEFAULT_MAX_NAME_LEN + 1)).unwrap_err();
    assert!(matches!(err, RegistryError::CapacityExceeded { .. }));
    drop(reg);
    assert_eq!(open(&dir).read(&id).unwrap().as_deref(), Some("Porch"));
}
