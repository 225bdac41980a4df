use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, Level};

use crate::{
    archiver,
    broker::BrokerConfig,
    config::{ArchiveConfig, Config, LinkConfig},
    error::Error,
    link,
    serial::{self, DEFAULT_BAUD},
};

/// Where the TCP server listens when neither a configuration file nor `--tcp` says otherwise.
pub const DEFAULT_TCP: &str = "localhost:5000";

/// The command line interface for the serial gateway.
///
/// Options given here are added to (or override) those of the configuration file.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Pub/sub broker to use, e.g. `tcp://mqtt:1883`
    #[arg(short = 'H', long)]
    pub broker: Option<String>,

    /// Broker topic to subscribe to
    #[arg(short, long)]
    pub subscribe: Option<String>,

    /// Broker topic to publish on
    #[arg(short, long)]
    pub publish: Option<String>,

    /// Log messages to this file
    #[arg(short, long)]
    pub log_file: Option<PathBuf>,

    /// Log file max size in bytes
    #[arg(long, default_value_t = archiver::DEFAULT_MAX_SIZE)]
    pub log_max_size: u64,

    /// Where full log files are moved
    #[arg(long, default_value = "/var/spool/messager")]
    pub log_archive_dir: PathBuf,

    /// Serial device to use
    #[arg(short, long)]
    pub device: Option<String>,

    /// Serial baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Only pass lines starting with this
    #[arg(long)]
    pub filter: Option<String>,

    /// Pass lines verbatim, without a timestamp and device prefix
    #[arg(long)]
    pub raw: bool,

    /// Lines discarded after opening the device
    #[arg(long, default_value_t = link::DEFAULT_WARMUP)]
    pub warmup: usize,

    /// Write lines received from the broker to the device
    #[arg(long)]
    pub writable: bool,

    /// TCP address to broadcast on [default without a configuration file: localhost:5000]
    #[arg(short, long)]
    pub tcp: Option<String>,

    /// UDP address to send to, e.g. `192.168.1.255:5000`
    #[arg(short, long)]
    pub udp: Option<String>,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Also log (at trace level) into daily files in this directory
    #[arg(long)]
    pub trace_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List the serial ports of this host.
    ListPorts,

    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Debug, Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

impl Cli {
    /// The level of logs going to stdout.
    pub fn stdout_level(&self) -> Level {
        if self.debug {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    /// If, and where, to log into files.
    pub fn file_logging(&self) -> Option<(Level, PathBuf)> {
        self.trace_dir.clone().map(|dir| (Level::TRACE, dir))
    }

    /// The configuration file (if any) with the command line options applied.
    pub fn config(&self) -> Result<Config, Error> {
        let mut config = if let Some(config_path) = &self.config {
            debug!(?config_path, "Config from path");
            Config::new_from_path(config_path)?
        } else {
            debug!("Default config");
            Config {
                tcp: Some(DEFAULT_TCP.into()),
                ..Default::default()
            }
        };

        if let Some(device) = &self.device {
            let link = LinkConfig {
                baud: self.baud,
                filter: self.filter.clone(),
                raw: self.raw,
                warmup: self.warmup,
                writable: self.writable,
                ..LinkConfig::new(device.as_str())
            };

            match config.links.iter_mut().find(|l| &l.device == device) {
                Some(existing) => *existing = link,
                None => config.links.push(link),
            }
        }

        if let Some(template) = &self.log_file {
            config.archive = Some(ArchiveConfig {
                template: template.clone(),
                max_size: self.log_max_size,
                dir: Some(self.log_archive_dir.clone()),
            });
        }

        if let Some(url) = &self.broker {
            config.broker = Some(BrokerConfig {
                url: url.clone(),
                subscribe: None,
                publish: None,
            });
        }

        if let Some(broker) = &mut config.broker {
            if self.subscribe.is_some() {
                broker.subscribe = self.subscribe.clone();
            }
            if self.publish.is_some() {
                broker.publish = self.publish.clone();
            }
        }

        if self.tcp.is_some() {
            config.tcp = self.tcp.clone();
        }

        if self.udp.is_some() {
            config.udp = self.udp.clone();
        }

        Ok(config)
    }
}

/// Run a subcommand, printing its result.
pub fn handle_command(command: Commands) -> Result<(), Error> {
    match command {
        Commands::ListPorts => {
            let ports = serial::list_ports()?;

            if ports.is_empty() {
                println!("No serial ports found!");
            }
            for port in ports {
                println!("{port}");
            }
        }
        Commands::Examples(example) => match example {
            Examples::Config => println!("{}", Config::example().serialize_pretty()?),
        },
    }

    Ok(())
}
