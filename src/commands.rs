/// Build the runtime the networked commands execute on.
fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub mod registers {
    use crate::compatibility;
    use crate::output;
    use crate::registers::{self, DataType, DeviceKind, Mode, RegisterTemplate};
    use strum::IntoEnumIterator as _;

    /// Search and output known registers of the controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list registers of this device kind.
        #[arg(long, short = 'k', value_enum)]
        kind: Option<DeviceKind>,
        /// Only list registers present in this firmware version or compatibility tier.
        #[arg(long)]
        firmware: Option<String>,
        /// Only list registers whose key, name or first address contain this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Output(#[from] output::Error),
        #[error(transparent)]
        Firmware(#[from] compatibility::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub kind: DeviceKind,
        /// Address of the register in the first instance of the kind.
        pub address: u16,
        pub offset: u16,
        pub key: &'static str,
        pub name: &'static str,
        pub mode: Mode,
        pub data_type: DataType,
        pub unit: Option<&'static str>,
        pub scale: f64,
        pub min_firmware: u8,
        pub legacy_key: Option<&'static str>,
    }

    impl RegisterSchema {
        fn new(kind: DeviceKind, template: &'static RegisterTemplate) -> Self {
            Self {
                kind,
                address: registers::absolute(kind, 1, template.offset),
                offset: template.offset,
                key: template.key,
                name: template.name,
                mode: template.mode,
                data_type: template.data_type,
                unit: template.unit,
                scale: template.scale,
                min_firmware: template.min_firmware,
                legacy_key: template.legacy_key,
            }
        }

        pub fn all_registers() -> impl Iterator<Item = Self> {
            DeviceKind::iter().flat_map(|kind| {
                kind.templates().iter().map(move |template| Self::new(kind, template))
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.key.contains(&pattern)
                || self.legacy_key.is_some_and(|k| k.contains(&pattern))
                || self.name.to_lowercase().contains(&pattern)
                || self.address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let firmware_tier =
            args.firmware.as_deref().map(compatibility::parse_firmware).transpose()?;
        let mut output = args.output.open()?;
        output.header(&[
            "Kind", "Address", "Key", "Name", "Mode", "Type", "Unit", "Scale", "Since",
        ])?;
        let selected = RegisterSchema::all_registers()
            .filter(|r| args.kind.is_none_or(|kind| r.kind == kind))
            .filter(|r| firmware_tier.is_none_or(|tier| f64::from(r.min_firmware) <= tier))
            .filter(|r| args.filter.as_deref().is_none_or(|pattern| r.is_match(pattern)));
        for register in selected {
            let cells = vec![
                register.kind.to_string(),
                register.address.to_string(),
                register.key.to_string(),
                register.name.to_string(),
                register.mode.to_string(),
                register.data_type.to_string(),
                register.unit.unwrap_or_default().to_string(),
                register.scale.to_string(),
                register.min_firmware.to_string(),
            ];
            output.record(cells, &register)?;
        }
        Ok(output.finish()?)
    }
}

pub mod poll {
    use std::sync::Arc;

    use futures::StreamExt as _;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    use crate::config::{self, ClusterConfig};
    use crate::coordinator::{self, Coordinator, PollResult, UpdateStatus};
    use crate::output;

    /// Poll the device cluster and output the decoded values.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Output the result of a single poll cycle and exit.
        #[arg(long)]
        once: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the runtime")]
        Runtime(#[source] std::io::Error),
        #[error("invalid configuration")]
        Config(#[from] config::Error),
        #[error("polling failed")]
        Poll(#[source] Arc<coordinator::Error>),
        #[error(transparent)]
        Output(#[from] output::Error),
        #[error("could not listen for the interrupt signal")]
        Signal(#[source] std::io::Error),
    }

    #[derive(serde::Serialize)]
    struct Reading<'a> {
        sensor: &'a str,
        value: &'a crate::codec::Value,
        polled_at: Option<jiff::Timestamp>,
    }

    fn print(output: &output::Args, result: &PollResult) -> Result<(), output::Error> {
        let mut output = output.open()?;
        output.header(&["Sensor", "Value"])?;
        for (sensor, value) in &result.values {
            let reading = Reading { sensor, value, polled_at: result.polled_at };
            output.record(vec![sensor.clone(), value.to_string()], &reading)?;
        }
        output.finish()
    }

    fn print_once(
        output: &output::Args,
        result: Result<Arc<PollResult>, Arc<coordinator::Error>>,
    ) -> Result<(), Error> {
        let result = result.map_err(Error::Poll)?;
        Ok(print(output, &result)?)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(run_async(args))
    }

    async fn run_async(args: Args) -> Result<(), Error> {
        let config = ClusterConfig::from_args(args.config)?;
        let coordinator = Arc::new(Coordinator::from_config(&config)?);
        if args.once {
            let result = coordinator.poll().await;
            coordinator.shutdown().await;
            return print_once(&args.output, result);
        }

        let shutdown = CancellationToken::new();
        let poller = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            let shutdown = shutdown.clone();
            async move { coordinator.run(shutdown).await }
        });
        let mut updates = coordinator.updates();
        let outcome = loop {
            let snapshot = tokio::select! {
                signal = tokio::signal::ctrl_c() => break signal.map_err(Error::Signal),
                snapshot = updates.next() => snapshot,
            };
            let Some(snapshot) = snapshot else { break Ok(()) };
            match snapshot.status {
                UpdateStatus::Pending => {}
                UpdateStatus::Updated => {
                    if let Err(e) = print(&args.output, &snapshot.result) {
                        break Err(e.into());
                    }
                }
                UpdateStatus::Failed(error) => {
                    warn!(message = "update failed, keeping the previous values", %error);
                }
            }
        };
        info!(message = "stopping");
        shutdown.cancel();
        if let Err(e) = poller.await {
            warn!(message = "poll loop ended abnormally", error = %e);
        }
        outcome
    }

}

pub mod write {
    use tracing::info;

    use crate::config::{self, ClusterConfig};
    use crate::coordinator::{self, Coordinator};
    use crate::registers::DeviceKind;

    /// Write a value, in engineering units, to a writeable register.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,
        #[arg(value_enum)]
        kind: DeviceKind,
        key: String,
        #[arg(allow_negative_numbers = true)]
        value: f64,
        /// The 1-based instance of the device kind.
        #[arg(long, default_value_t = 1)]
        index: u8,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the runtime")]
        Runtime(#[source] std::io::Error),
        #[error("invalid configuration")]
        Config(#[from] config::Error),
        #[error(transparent)]
        Write(#[from] coordinator::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(run_async(args))
    }

    async fn run_async(args: Args) -> Result<(), Error> {
        let config = ClusterConfig::from_args(args.config)?;
        let coordinator = Coordinator::from_config(&config)?;
        let result = coordinator.write(args.kind, args.index, &args.key, args.value).await;
        coordinator.shutdown().await;
        result?;
        info!(message = "written", kind = %args.kind, index = args.index, key = %args.key);
        Ok(())
    }
}

pub mod disabled {
    use std::path::PathBuf;

    use tracing::info;

    use crate::disabled::{self, DisabledRegisters};
    use crate::output;
    use crate::registers;

    #[derive(clap::Subcommand)]
    enum Action {
        /// Output the disabled registers.
        List,
        /// Stop polling the given register addresses.
        Add { addresses: Vec<u16> },
        /// Resume polling the given register addresses.
        Remove { addresses: Vec<u16> },
    }

    /// Inspect or edit the list of registers which are never polled.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, default_value = "disabled_registers.yaml")]
        file: PathBuf,
        #[clap(flatten)]
        output: output::Args,
        #[command(subcommand)]
        action: Action,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Disabled(#[from] disabled::Error),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Entry {
        address: u16,
        sensor: Option<String>,
    }

    fn list(output: &output::Args, disabled: &DisabledRegisters) -> Result<(), output::Error> {
        let mut output = output.open()?;
        output.header(&["Address", "Sensor"])?;
        for address in disabled.sorted() {
            let sensor = registers::locate(address)
                .map(|(kind, index, template)| registers::sensor_id(kind, index, template, false));
            let cells = vec![address.to_string(), sensor.clone().unwrap_or_default()];
            output.record(cells, &Entry { address, sensor })?;
        }
        output.finish()
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut disabled = DisabledRegisters::load(&args.file)?;
        let changed = match args.action {
            Action::List => return Ok(list(&args.output, &disabled)?),
            Action::Add { addresses } => {
                addresses.into_iter().filter(|&a| disabled.insert(a)).count()
            }
            Action::Remove { addresses } => {
                addresses.into_iter().filter(|&a| disabled.remove(a)).count()
            }
        };
        if changed > 0 {
            disabled.store(&args.file)?;
        }
        info!(message = "updated the disabled register list", changed, total = disabled.len());
        Ok(())
    }
}
