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

use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossterm::tty::IsTty;
use serde_json::json;

use sensorreg::address::SensorId;
use sensorreg::bus::{BusDriver, SimulatedBus, W1SysfsBus};
use sensorreg::config::{config_path, load_config, BusConfig, Config};
use sensorreg::discovery::{
    configure_resolution, discover, list_sensors, prune_with, Confirmation, DeviceSnapshot, DiscoveryReport,
    IncompleteSnapshot, NamingOptions,
};
use sensorreg::input::{ReaderInput, TerminalPrompt, TextInput};
use sensorreg::logger::{self, DEFAULT_LOG_PATH};
use sensorreg::poll::{poll_now, Poller, StdoutSink};
use sensorreg::registry::Registry;
use sensorreg::store::FileStore;

const USAGE: &str = "\
usage: sensorreg [--config PATH] [--logging] [--log-file PATH] <command>

commands:
  run                      set resolution, name new sensors, then poll (default)
  discover                 name sensors not yet in the registry
  list                     show connected and stored sensors
  prune [--yes] [--force]  delete names of sensors no longer connected
  rename <SENSOR_ID> <NAME>
  forget <SENSOR_ID>
  poll-once                one conversion and report pass";

#[derive(Debug, Default)]
struct Cli {
    config: Option<PathBuf>,
    logging: bool,
    log_file: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let v = it.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                cli.config = Some(PathBuf::from(v));
            }
            "--log-file" => {
                let v = it.next().ok_or_else(|| anyhow!("--log-file needs a path"))?;
                cli.log_file = Some(PathBuf::from(v));
                cli.logging = true;
            }
            "--logging" => cli.logging = true,
            _ => cli.command.push(arg.clone()),
        }
    }
    Ok(cli)
}

fn open_bus(cfg: &Config) -> Result<Box<dyn BusDriver>> {
    Ok(match &cfg.bus {
        BusConfig::W1 { root } => Box::new(W1SysfsBus::new(root)),
        BusConfig::Simulated { path } => Box::new(
            SimulatedBus::load(path).with_context(|| format!("loading simulated bus {}", path.display()))?,
        ),
    })
}

fn open_registry(cfg: &Config) -> Result<Registry<FileStore>> {
    let store = FileStore::open(&cfg.store_path, cfg.store_capacity)
        .with_context(|| format!("opening store {}", cfg.store_path.display()))?;
    Registry::open(store, cfg.collision_policy, cfg.max_name_len)
        .with_context(|| format!("reading registry in {}", cfg.store_path.display()))
}

fn open_input(cfg: &Config) -> Box<dyn TextInput> {
    let stdin = io::stdin();
    if stdin.is_tty() {
        Box::new(TerminalPrompt::new(cfg.prompt_timeout()))
    } else {
        Box::new(ReaderInput::new(stdin.lock()))
    }
}

fn print_discovery(report: &DiscoveryReport) {
    println!(
        "{} sensor(s) connected, {} already named, {} newly named",
        report.connected,
        report.already_named.len(),
        report.named.len()
    );
    for (id, name) in &report.named {
        let note = if report.defaulted.contains(id) { " (default)" } else { "" };
        println!("  named {} as \"{}\"{}", id, name, note);
    }
    for (id, err) in &report.failed {
        eprintln!("  could not name {}: {}", id, err);
    }
    if report.address_failures > 0 {
        eprintln!("  {} device(s) did not return an address", report.address_failures);
    }
    if report.interrupted {
        eprintln!("  naming interrupted; remaining sensors stay unnamed");
    }
}

fn discovery_pass(cfg: &Config, bus: &dyn BusDriver, registry: &mut Registry<FileStore>) {
    let snapshot = DeviceSnapshot::capture(bus);
    let mut input = open_input(cfg);
    let opts = NamingOptions { default_prefix: cfg.default_name_prefix.clone() };
    let report = discover(&snapshot, registry, input.as_mut(), &opts);
    print_discovery(&report);
}

fn set_resolution(cfg: &Config, bus: &mut dyn BusDriver) {
    let snapshot = DeviceSnapshot::capture(bus);
    for (id, err) in configure_resolution(bus, &snapshot, cfg.resolution()) {
        eprintln!("warning: could not set resolution of {}: {}", id, err);
    }
}

fn run(cfg: &Config) -> Result<()> {
    let mut bus = open_bus(cfg)?;
    let mut registry = open_registry(cfg)?;
    set_resolution(cfg, bus.as_mut());
    discovery_pass(cfg, bus.as_ref(), &mut registry);

    let mut poller = Poller::new(cfg.poll_interval());
    let mut sink = StdoutSink;
    loop {
        poller.tick(Instant::now(), bus.as_mut(), &registry, &mut sink);
        thread::sleep(Duration::from_millis(50));
    }
}

fn list(cfg: &Config) -> Result<()> {
    let bus = open_bus(cfg)?;
    let registry = open_registry(cfg)?;
    let snapshot = DeviceSnapshot::capture(bus.as_ref());
    let listing = list_sensors(&snapshot, &registry)?;

    println!("connected:");
    for (id, name) in &listing.connected {
        println!("  {}  {}", id, name.as_deref().unwrap_or("<unnamed>"));
    }
    println!("stored, not connected:");
    for entry in &listing.disconnected {
        match &entry.sensor {
            Some(id) => println!("  {}  {}", id, entry.name),
            None => println!("  slot {:<3}           {}", entry.slot, entry.name),
        }
    }
    for slot in &listing.corrupt {
        eprintln!("warning: slot {} is unreadable", slot);
    }
    Ok(())
}

fn prune_cmd(cfg: &Config, assume_yes: bool, force: bool) -> Result<()> {
    let bus = open_bus(cfg)?;
    let mut registry = open_registry(cfg)?;
    let snapshot = DeviceSnapshot::capture(bus.as_ref());
    if !snapshot.failures.is_empty() {
        eprintln!(
            "warning: {} device(s) did not return an address; their names would look stale",
            snapshot.failures.len()
        );
    }
    let confirmation = if assume_yes { Confirmation::PreConfirmed } else { Confirmation::Ask };
    let incomplete = if force { IncompleteSnapshot::Proceed } else { IncompleteSnapshot::Refuse };
    let mut input = open_input(cfg);
    let outcome = prune_with(&snapshot, &mut registry, input.as_mut(), confirmation, incomplete)?;

    if outcome.refused_unreadable > 0 {
        eprintln!("nothing deleted; rerun once every device answers, or pass --force");
    }
    if outcome.declined {
        println!("nothing deleted");
    }
    for entry in &outcome.deleted {
        println!("deleted \"{}\" (slot {})", entry.name, entry.slot);
    }
    for (slot, err) in &outcome.failed {
        eprintln!("could not delete slot {}: {}", slot, err);
    }
    for slot in &outcome.corrupt_slots {
        eprintln!("warning: slot {} is unreadable", slot);
    }
    Ok(())
}

fn rename(cfg: &Config, id: &str, name: &str) -> Result<()> {
    let id = SensorId::parse(id).with_context(|| format!("invalid sensor id {:?}", id))?;
    let mut registry = open_registry(cfg)?;
    registry.write(&id, name)?;
    logger::log_event("sensor_named", json!({ "sensor": id.as_str(), "name": name, "defaulted": false }));
    println!("{} is now \"{}\"", id, name);
    Ok(())
}

fn forget(cfg: &Config, id: &str) -> Result<()> {
    let id = SensorId::parse(id).with_context(|| format!("invalid sensor id {:?}", id))?;
    let mut registry = open_registry(cfg)?;
    if registry.delete(&id)? {
        logger::log_event("sensor_deleted", json!({ "sensor": id.as_str() }));
        println!("forgot {}", id);
    } else {
        println!("{} has no stored name", id);
    }
    Ok(())
}

fn poll_once(cfg: &Config) -> Result<()> {
    let mut bus = open_bus(cfg)?;
    let registry = open_registry(cfg)?;
    let emitted = poll_now(bus.as_mut(), &registry, &mut StdoutSink);
    if emitted == 0 {
        println!("no sensors found");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    if cli.logging {
        let target = cli.log_file.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));
        if logger::init_logging(&target).is_none() {
            eprintln!("warning: could not open a log file, logging disabled");
        }
        logger::log_event("startup", json!({ "args": args }));
    }

    let path = cli.config.clone().unwrap_or_else(config_path);
    let cfg = load_config(&path).with_context(|| format!("loading config {}", path.display()))?;

    let words: Vec<&str> = cli.command.iter().map(String::as_str).collect();
    let result = match words.as_slice() {
        [] | ["run"] => run(&cfg),
        ["discover"] => {
            let mut bus = open_bus(&cfg)?;
            let mut registry = open_registry(&cfg)?;
            set_resolution(&cfg, bus.as_mut());
            discovery_pass(&cfg, bus.as_ref(), &mut registry);
            Ok(())
        }
        ["list"] => list(&cfg),
        ["prune", flags @ ..] if flags.iter().all(|f| matches!(*f, "--yes" | "-y" | "--force")) => {
            let assume_yes = flags.iter().any(|f| matches!(*f, "--yes" | "-y"));
            prune_cmd(&cfg, assume_yes, flags.contains(&"--force"))
        }
        ["rename", id, name] => rename(&cfg, id, name),
        ["forget", id] => forget(&cfg, id),
        ["poll-once"] => poll_once(&cfg),
        ["help"] | ["--help"] | ["-h"] => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => bail!("unrecognized arguments: {}\n{}", words.join(" "), USAGE),
    };

    if let Err(err) = &result {
        logger::log_event("fatal_error", json!({ "error": format!("{:#}", err) }));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_options_anywhere() {
        let cli = parse_args(&strings(&["list", "--config", "/tmp/c.json", "--logging"])).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(cli.logging);
        assert_eq!(cli.command, vec!["list".to_string()]);
    }

    #[test]
    fn test_log_file_implies_logging() {
        let cli = parse_args(&strings(&["--log-file", "/tmp/l.json", "rename", "28", "x"])).unwrap();
        assert!(cli.logging);
        assert_eq!(cli.command.len(), 3);
    }

    #[test]
    fn test_missing_option_value() {
        assert!(parse_args(&strings(&["--config"])).is_err());
    }
}
