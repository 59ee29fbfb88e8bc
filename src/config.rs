use std::path::PathBuf;
use std::time::Duration;

use crate::compatibility;
use crate::connection;
use crate::disabled;
use crate::registers::DeviceKind;

pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid firmware setting")]
    Firmware(#[from] compatibility::Error),
    #[error("{count} {kind} instances configured, at most {max} are supported")]
    TooManyInstances { kind: DeviceKind, count: u8, max: u8 },
    #[error("poll interval of {} must be between 5s and 300s", humantime::format_duration(*.0))]
    PollInterval(Duration),
    #[error("could not load the disabled register list")]
    DisabledRegisters(#[from] disabled::Error),
}

/// Settings describing the device cluster behind a single controller.
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "config::Args")]
pub struct Args {
    #[clap(flatten)]
    pub connection: connection::Args,

    /// Modbus unit id of the controller.
    #[arg(long, default_value_t = 1)]
    pub slave_id: u8,

    #[arg(long, default_value_t = 1)]
    pub heat_pumps: u8,
    #[arg(long, default_value_t = 0)]
    pub boilers: u8,
    #[arg(long, default_value_t = 0)]
    pub buffers: u8,
    #[arg(long, default_value_t = 0)]
    pub solar: u8,
    #[arg(long, default_value_t = 0)]
    pub heating_circuits: u8,

    /// Time between the starts of two consecutive poll cycles.
    #[arg(long, default_value = "30s")]
    pub poll_interval: humantime::Duration,

    /// Controller firmware, either a release name such as `V0.0.4-3K` or a numeric tier.
    #[arg(long, default_value = "V0.0.3-3K")]
    pub firmware: String,

    /// Report values under the sensor names used by earlier releases where they differ.
    #[arg(long)]
    pub legacy_names: bool,

    /// Keep reporting the last good value of a register whose read failed.
    #[arg(long)]
    pub retain_last_values: bool,

    /// Registers listed in this file are never polled. Created empty if it does not exist.
    #[arg(long, default_value = "disabled_registers.yaml")]
    pub disabled_registers: PathBuf,
}

/// Number of configured instances per device kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounts {
    pub heat_pumps: u8,
    pub boilers: u8,
    pub buffers: u8,
    pub solar: u8,
    pub heating_circuits: u8,
}

impl DeviceCounts {
    pub fn count(&self, kind: DeviceKind) -> u8 {
        match kind {
            DeviceKind::General => 1,
            DeviceKind::HeatPump => self.heat_pumps,
            DeviceKind::Boiler => self.boilers,
            DeviceKind::Buffer => self.buffers,
            DeviceKind::Solar => self.solar,
            DeviceKind::HeatingCircuit => self.heating_circuits,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        for kind in DeviceKind::INDEXED {
            let (count, max) = (self.count(kind), kind.max_instances());
            if count > max {
                return Err(Error::TooManyInstances { kind, count, max });
            }
        }
        Ok(())
    }
}

/// The part of the configuration a poll cycle consults.
#[derive(Clone, Debug, PartialEq)]
pub struct PollSettings {
    pub slave_id: u8,
    pub devices: DeviceCounts,
    pub poll_interval: Duration,
    pub firmware_tier: f64,
    pub legacy_names: bool,
    pub retain_last_values: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            slave_id: 1,
            devices: DeviceCounts { heat_pumps: 1, ..DeviceCounts::default() },
            poll_interval: Duration::from_secs(30),
            firmware_tier: 1.0,
            legacy_names: false,
            retain_last_values: false,
        }
    }
}

impl PollSettings {
    pub fn validate(&self) -> Result<(), Error> {
        self.devices.validate()?;
        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&self.poll_interval) {
            return Err(Error::PollInterval(self.poll_interval));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub connection: connection::Args,
    pub settings: PollSettings,
    pub disabled_registers: PathBuf,
}

impl ClusterConfig {
    pub fn from_args(args: Args) -> Result<Self, Error> {
        let config = ClusterConfig {
            settings: PollSettings {
                slave_id: args.slave_id,
                devices: DeviceCounts {
                    heat_pumps: args.heat_pumps,
                    boilers: args.boilers,
                    buffers: args.buffers,
                    solar: args.solar,
                    heating_circuits: args.heating_circuits,
                },
                poll_interval: *args.poll_interval,
                firmware_tier: compatibility::parse_firmware(&args.firmware)?,
                legacy_names: args.legacy_names,
                retain_last_values: args.retain_last_values,
            },
            connection: args.connection,
            disabled_registers: args.disabled_registers,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.settings.validate()
    }
}
