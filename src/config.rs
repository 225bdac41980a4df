use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    archiver::{self, ArchiverBuilder},
    broker::BrokerConfig,
    error::Error,
    link::{self, LinkBuilder, LinkHandle},
    liveness::CorroborationConfig,
    serial::DEFAULT_BAUD,
};

/// A serial device to read from (and maybe write to).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkConfig {
    /// Likely "/dev/ttyACMx" or "COMx".
    pub device: String,

    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Only lines starting with this are kept.
    #[serde(default)]
    pub filter: Option<String>,

    /// Pass lines on verbatim instead of prefixing them with `<unixNanos>:<device>:`.
    #[serde(default)]
    pub raw: bool,

    /// Lines thrown away after each (re)connect.
    #[serde(default = "default_warmup")]
    pub warmup: usize,

    /// Whether lines from the broker are written to this device.
    /// At most one link may be writable.
    #[serde(default)]
    pub writable: bool,
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_warmup() -> usize {
    link::DEFAULT_WARMUP
}

fn default_max_size() -> u64 {
    archiver::DEFAULT_MAX_SIZE
}

impl LinkConfig {
    /// A read-only link with default settings.
    pub fn new<S: Into<String>>(device: S) -> Self {
        Self {
            device: device.into(),
            baud: DEFAULT_BAUD,
            filter: None,
            raw: false,
            warmup: link::DEFAULT_WARMUP,
            writable: false,
        }
    }

    /// Start a link as described.
    pub fn build(&self) -> LinkHandle {
        LinkBuilder::new(&self.device, self.baud)
            .set_filter(self.filter.as_deref().unwrap_or_default())
            .set_raw(self.raw)
            .set_warmup(self.warmup)
            .set_writable(self.writable)
            .build()
    }
}

/// Where to log messages, and where full logs go.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Log file names are made from this, see [`ArchiverBuilder::new`].
    pub template: PathBuf,

    /// Bytes per log file.
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Where full log files are moved.
    /// They stay where they are if not given.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// The configuration used for running the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// The serial devices to read from.
    #[serde(default)]
    pub links: Vec<LinkConfig>,

    /// Tee messages into rotating log files.
    #[serde(default)]
    pub archive: Option<ArchiveConfig>,

    /// Bridge messages to and from a pub/sub broker.
    #[serde(default)]
    pub broker: Option<BrokerConfig>,

    /// Broadcast messages to TCP clients connecting here, e.g. `localhost:5000`.
    #[serde(default)]
    pub tcp: Option<String>,

    /// Send messages as UDP datagrams here, e.g. `192.168.1.255:5000`.
    #[serde(default)]
    pub udp: Option<String>,

    /// Mask messages of one device while another device is silent.
    /// See [`crate::liveness`].
    #[serde(default)]
    pub corroboration: Option<CorroborationConfig>,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Ok(Self::ron().from_str::<Config>(input)?)
    }

    /// An example configuration with most fields filled in.
    pub fn example() -> Self {
        Self {
            links: vec![
                LinkConfig {
                    filter: Some("$GP".into()),
                    writable: true,
                    ..LinkConfig::new("/dev/ttyUSB0")
                },
                LinkConfig {
                    baud: 4800,
                    raw: true,
                    ..LinkConfig::new("/dev/ttyUSB1")
                },
            ],
            archive: Some(ArchiveConfig {
                template: "/var/log/messager/nmea.log".into(),
                max_size: archiver::DEFAULT_MAX_SIZE,
                dir: Some("/var/spool/messager".into()),
            }),
            broker: Some(BrokerConfig {
                url: "tcp://mqtt:1883".into(),
                subscribe: Some("gateway/to-device".into()),
                publish: Some("gateway/from-device".into()),
            }),
            tcp: Some("localhost:5000".into()),
            udp: Some("192.168.1.255:5000".into()),
            corroboration: Some(CorroborationConfig {
                subject: "/dev/ttyUSB1".into(),
                witness: "/dev/ttyUSB0".into(),
                timeout_secs: 10,
            }),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Ok(Self::ron().to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.into(),
            source,
        })?;

        Self::deserialize(&s)
    }

    fn check_links(&self) -> Result<(), Error> {
        if self.links.is_empty() {
            return Err(Error::BadConfig(
                "No serial device configured, please give at least one.".into(),
            ));
        }

        let duplicates = self
            .links
            .iter()
            .map(|link| &link.device)
            .duplicates()
            .collect::<Vec<_>>();

        if !duplicates.is_empty() {
            return Err(Error::BadConfig(format!(
                "Each device may only be opened by one link. Duplicates: {duplicates:?}"
            )));
        }

        let writable = self
            .links
            .iter()
            .filter(|link| link.writable)
            .map(|link| &link.device)
            .collect::<Vec<_>>();

        if writable.len() > 1 {
            return Err(Error::BadConfig(format!(
                "At most one link may be writable, but these are: {writable:?}"
            )));
        }

        Ok(())
    }

    fn check_corroboration(&self) -> Result<(), Error> {
        let Some(corroboration) = &self.corroboration else {
            return Ok(());
        };

        for device in [&corroboration.subject, &corroboration.witness] {
            if !self.links.iter().any(|link| &link.device == device) {
                return Err(Error::BadConfig(format!(
                    "Corroboration names the device `{device}`, which has no link."
                )));
            }
        }

        if corroboration.subject == corroboration.witness {
            return Err(Error::BadConfig(format!(
                "A device (`{}`) cannot corroborate itself.",
                corroboration.subject
            )));
        }

        Ok(())
    }

    fn check_archive(&self) -> Result<(), Error> {
        match &self.archive {
            Some(archive) if archive.max_size == 0 => Err(Error::BadConfig(format!(
                "The log file `{:?}` has a max size of zero.",
                archive.template
            ))),
            _ => Ok(()),
        }
    }

    /// Check that the configuration makes sense before anything is started.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_links()?;
        self.check_corroboration()?;
        self.check_archive()?;

        if let Some(broker) = &self.broker {
            broker.address()?;
        }

        Ok(())
    }
}

impl From<&ArchiveConfig> for ArchiverBuilder {
    fn from(config: &ArchiveConfig) -> Self {
        let builder = ArchiverBuilder::new(&config.template, config.max_size);

        match &config.dir {
            Some(dir) => builder.set_archive_dir(dir),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn links(devices: &[&str]) -> Config {
        Config {
            links: devices.iter().map(|&device| LinkConfig::new(device)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn example_survives_serialization() {
        let c = Config::example();
        let serialized = c.serialize_pretty().unwrap();

        println!("{serialized}");

        assert_eq!(Config::deserialize(&serialized).unwrap(), c);
        c.validate().unwrap();
    }

    #[test]
    fn deserialize_with_defaults() {
        let input = r#"
(
    links: [
        (device: "/dev/ttyUSB0"),
        (device: "COM3", baud: 4800, filter: "$GP", raw: true, warmup: 0),
    ],
    archive: (template: "nmea.log"),
    tcp: "localhost:5000",
)
"#;
        let config = Config::deserialize(input).unwrap();

        assert_eq!(config.links[0], LinkConfig::new("/dev/ttyUSB0"));
        assert_eq!(
            config.links[1],
            LinkConfig {
                baud: 4800,
                filter: Some("$GP".into()),
                raw: true,
                warmup: 0,
                ..LinkConfig::new("COM3")
            }
        );

        let archive = config.archive.unwrap();
        assert_eq!(archive.max_size, archiver::DEFAULT_MAX_SIZE);
        assert_eq!(archive.dir, None);

        assert_eq!(config.tcp.as_deref(), Some("localhost:5000"));
        assert_eq!(config.udp, None);
        assert_eq!(config.broker, None);
    }

    #[test]
    fn deserialize_garbage() {
        assert!(matches!(
            Config::deserialize("(links: [(baud: 1)])"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            Config::new_from_path(dir.path().join("nope.ron")),
            Err(Error::ConfigRead { .. })
        ));
    }

    #[test]
    fn bad_config_no_links() {
        let err = Config::default()
            .validate()
            .unwrap_err()
            .try_into_bad_config()
            .unwrap();

        assert!(err.contains("No serial device"));
    }

    #[test]
    fn bad_config_duplicates() {
        let c = links(&["COM0", "COM1", "COM0", "COM2"]);

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("COM0"));
        assert!(!err.contains("COM1"));
    }

    #[test]
    fn bad_config_many_writable() {
        let mut c = links(&["COM0", "COM1", "COM2"]);
        c.links[0].writable = true;
        c.links[2].writable = true;

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("COM0"));
        assert!(err.contains("COM2"));
    }

    #[test]
    fn bad_config_corroboration() {
        let mut c = links(&["COM0", "COM1"]);

        c.corroboration = Some(CorroborationConfig {
            subject: "COM1".into(),
            witness: "COM9".into(),
            timeout_secs: 1,
        });
        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("COM9"));

        c.corroboration = Some(CorroborationConfig {
            subject: "COM1".into(),
            witness: "COM1".into(),
            timeout_secs: 1,
        });
        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("itself"));
    }

    #[test]
    fn bad_config_zero_log_size() {
        let mut c = links(&["COM0"]);
        c.archive = Some(ArchiveConfig {
            template: "nmea.log".into(),
            max_size: 0,
            dir: None,
        });

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("nmea.log"));
    }

    #[test]
    fn bad_config_broker_url() {
        let mut c = links(&["COM0"]);
        c.broker = Some(BrokerConfig {
            url: "tcp://mqtt:not-a-port".into(),
            subscribe: None,
            publish: None,
        });

        assert!(c.validate().is_err());
    }
}
