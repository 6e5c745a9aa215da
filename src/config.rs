//! Configuration loading and validation
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, else `./voltage-relay.toml`, else `/etc/voltage-relay.toml`)
//! 3. Environment variables prefixed `VOLTAGE_RELAY_` (`__` separates nested keys)
//! 4. Command-line flags
//!
//! ```toml
//! mode = "poll"
//! interval = 10
//! socket_file = "/tmp/mbsocket"
//!
//! [device]
//! kind = "tcp"
//! address = "192.168.1.20:502"
//!
//! [[target]]
//! id = 1
//! name = "plant1"
//! addresses = [100, 200]
//! lengths = [2, 4]
//! types = ["int", "floatmsb"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::ValueType;
use crate::constants::MAX_READ_REGISTERS;
use crate::error::{RelayError, RelayResult};
use crate::output::DEFAULT_SOCKET_FILE;
use crate::protocol::SlaveId;
use crate::register_map::DEFAULT_REGISTER_COUNT;
use crate::scheduler::{ReadSpec, Target};

/// Config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "voltage-relay.toml";

/// System-wide config file
pub const ETC_CONFIG_FILE: &str = "/etc/voltage-relay.toml";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "VOLTAGE_RELAY_";

/// Highest unit id a request can address
const MAX_UNIT_ID: i32 = 247;

/// What the relay does with the field side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Poll remote devices on a fixed interval
    #[default]
    #[serde(alias = "master")]
    Poll,
    /// Serve a register map and relay the writes it receives
    #[serde(alias = "slave")]
    Serve,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Tcp,
    Rtu,
}

/// `[device]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub kind: DeviceKind,
    /// TCP peer when polling, bind address when serving
    pub address: String,
    /// Serial device path
    pub port: String,
    pub baud: u32,
    /// `N`, `E` or `O`
    pub parity: String,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Tcp,
            address: "127.0.0.1:1502".to_string(),
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            parity: "O".to_string(),
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

/// One `[[target]]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    pub id: i32,
    pub name: Option<String>,
    /// Device address overriding `device.address`
    pub address: Option<String>,
    pub addresses: Vec<u16>,
    pub lengths: Vec<u16>,
    /// All or nothing: absent means every run is an integer run
    pub types: Option<Vec<String>>,
}

/// Raw configuration as merged from every source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub mode: Role,
    /// Unit id announced in serve mode. Informational only: the TCP server
    /// answers requests addressed to any unit.
    pub id: i32,
    /// Seconds between polls
    pub interval: u64,
    pub socket_file: PathBuf,
    /// Size of the served register map
    pub registers: u16,
    pub retry_delay_ms: u64,
    pub response_timeout_ms: u64,
    pub verbose: bool,
    pub device: DeviceSection,
    #[serde(rename = "target")]
    pub targets: Vec<TargetSection>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            mode: Role::Poll,
            id: 1,
            interval: 10,
            socket_file: PathBuf::from(DEFAULT_SOCKET_FILE),
            registers: DEFAULT_REGISTER_COUNT,
            retry_delay_ms: 1000,
            response_timeout_ms: 1000,
            verbose: false,
            device: DeviceSection::default(),
            targets: Vec::new(),
        }
    }
}

/// Command-line arguments
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "voltage-relay", version, about = "Modbus field-data relay")]
pub struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Poll remote devices or serve a local register map
    #[arg(long, value_enum)]
    pub mode: Option<Role>,

    /// Serial device (eg. /dev/ttyUSB0)
    #[arg(long)]
    pub device: Option<String>,

    /// Baud rate
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,

    /// Parity: 'O' for odd, 'E' for even or 'N' for none
    #[arg(short = 'p', long)]
    pub parity: Option<String>,

    /// Data bits (7 or 8)
    #[arg(short = 'd', long = "databit")]
    pub data_bits: Option<u8>,

    /// Stop bits (1 or 2)
    #[arg(short = 's', long = "stopbit")]
    pub stop_bits: Option<u8>,

    /// Interval in seconds
    #[arg(short = 'i', long)]
    pub interval: Option<u64>,

    /// Consumer Unix socket (eg. /tmp/mbsocket)
    #[arg(long = "socketfile")]
    pub socket_file: Option<PathBuf>,

    /// Modbus TCP address to poll or to listen on
    #[arg(long)]
    pub address: Option<String>,

    /// Verbose mode
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[derive(Debug, Default, Serialize)]
struct DeviceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<DeviceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    baud: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_bits: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_bits: Option<u8>,
}

/// Flags given on the command line, serialized as the top configuration layer
#[derive(Debug, Default, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    socket_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    device: DeviceOverrides,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            mode: self.mode,
            interval: self.interval,
            socket_file: self.socket_file.clone(),
            verbose: self.verbose.then_some(true),
            device: DeviceOverrides {
                // Naming a serial device selects the RTU line
                kind: self.device.as_ref().map(|_| DeviceKind::Rtu),
                address: self.address.clone(),
                port: self.device.clone(),
                baud: self.baud,
                parity: self.parity.clone(),
                data_bits: self.data_bits,
                stop_bits: self.stop_bits,
            },
        }
    }

    /// Config file to read, if any
    pub fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config {
            return Some(path.clone());
        }
        [LOCAL_CONFIG_FILE, ETC_CONFIG_FILE]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Merge every configuration source
    pub fn figment(&self) -> RelayResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(ConfigFile::default()));
        if let Some(path) = self.config_path() {
            if !path.exists() {
                return Err(RelayError::config(format!(
                    "Config file {} not found",
                    path.display()
                )));
            }
            debug!("Loading config file {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(self.overrides())))
    }

    /// Load and validate the configuration
    pub fn load(&self) -> RelayResult<RelayConfig> {
        ConfigFile::from_figment(&self.figment()?)?.resolve()
    }
}

/// RTU line parameters, validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLine {
    pub port: String,
    pub baud: u32,
    pub parity: char,
    pub data_bits: u8,
    pub stop_bits: u8,
}

#[cfg(feature = "rtu")]
impl SerialLine {
    pub fn settings(&self) -> crate::transport::SerialSettings {
        use tokio_serial::{DataBits, Parity, StopBits};

        crate::transport::SerialSettings {
            port: self.port.clone(),
            baud: self.baud,
            parity: match self.parity {
                'E' => Parity::Even,
                'O' => Parity::Odd,
                _ => Parity::None,
            },
            data_bits: match self.data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                _ => DataBits::Eight,
            },
            stop_bits: if self.stop_bits == 2 {
                StopBits::Two
            } else {
                StopBits::One
            },
        }
    }
}

/// Field side of the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Tcp(SocketAddr),
    Rtu(SerialLine),
}

/// Validated configuration for one supervisor cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub role: Role,
    /// Logged at startup; requests for every unit are served
    pub unit_id: SlaveId,
    pub interval: Duration,
    pub socket_file: PathBuf,
    pub registers: u16,
    pub retry_delay: Duration,
    pub response_timeout: Duration,
    pub verbose: bool,
    pub device: Device,
    pub targets: Vec<Target>,
}

impl ConfigFile {
    pub fn from_figment(figment: &Figment) -> RelayResult<Self> {
        Ok(figment.extract()?)
    }

    /// Load from a single TOML file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> RelayResult<Self> {
        let figment = Figment::from(Serialized::defaults(ConfigFile::default()))
            .merge(Toml::file(path.as_ref()));
        Self::from_figment(&figment)
    }

    /// Validate and convert into typed settings
    pub fn resolve(&self) -> RelayResult<RelayConfig> {
        if self.interval == 0 {
            return Err(RelayError::config("interval must be at least 1 second"));
        }
        if !(0..=MAX_UNIT_ID).contains(&self.id) {
            return Err(RelayError::config(format!("Invalid unit id {}", self.id)));
        }

        let device = self.device.resolve()?;
        let targets = self
            .targets
            .iter()
            .enumerate()
            .map(|(i, section)| section.resolve(i, &device))
            .collect::<RelayResult<Vec<_>>>()?;

        match self.mode {
            Role::Poll if targets.is_empty() => {
                return Err(RelayError::config("Poll mode needs at least one [[target]]"));
            }
            Role::Serve if matches!(device, Device::Rtu(_)) => {
                return Err(RelayError::config("Serve mode is only available over TCP"));
            }
            Role::Serve if self.registers == 0 => {
                return Err(RelayError::config("registers must be at least 1"));
            }
            _ => {}
        }

        Ok(RelayConfig {
            role: self.mode,
            unit_id: self.id as SlaveId,
            interval: Duration::from_secs(self.interval),
            socket_file: self.socket_file.clone(),
            registers: self.registers,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms.max(1)),
            verbose: self.verbose,
            device,
            targets,
        })
    }
}

impl DeviceSection {
    fn resolve(&self) -> RelayResult<Device> {
        match self.kind {
            DeviceKind::Tcp => {
                let addr = self.address.parse().map_err(|e| {
                    RelayError::config(format!("Invalid device address {}: {}", self.address, e))
                })?;
                Ok(Device::Tcp(addr))
            }
            DeviceKind::Rtu => {
                let parity = match self.parity.chars().next().map(|c| c.to_ascii_uppercase()) {
                    Some(p @ ('N' | 'E' | 'O')) => p,
                    _ => {
                        return Err(RelayError::config(format!(
                            "Invalid parity '{}' (expected N, E or O)",
                            self.parity
                        )))
                    }
                };
                if !(5..=8).contains(&self.data_bits) {
                    return Err(RelayError::config(format!(
                        "Invalid data bits {}",
                        self.data_bits
                    )));
                }
                if !matches!(self.stop_bits, 1 | 2) {
                    return Err(RelayError::config(format!(
                        "Invalid stop bits {}",
                        self.stop_bits
                    )));
                }
                if self.baud == 0 {
                    return Err(RelayError::config("Invalid baud rate 0"));
                }
                Ok(Device::Rtu(SerialLine {
                    port: self.port.clone(),
                    baud: self.baud,
                    parity,
                    data_bits: self.data_bits,
                    stop_bits: self.stop_bits,
                }))
            }
        }
    }
}

impl TargetSection {
    fn resolve(&self, index: usize, device: &Device) -> RelayResult<Target> {
        let section = match &self.name {
            Some(name) => format!("target '{}'", name),
            None => format!("target #{} (id {})", index + 1, self.id),
        };
        let fail = |message: String| RelayError::config(format!("{}: {}", section, message));

        if self.id > MAX_UNIT_ID {
            return Err(fail(format!("invalid unit id {}", self.id)));
        }
        if self.addresses.len() != self.lengths.len() {
            return Err(fail(format!(
                "not same number of addresses ({}) and lengths ({})",
                self.addresses.len(),
                self.lengths.len()
            )));
        }

        let types = match &self.types {
            Some(names) if names.len() != self.addresses.len() => {
                return Err(fail(format!(
                    "not same number of addresses ({}) and types ({})",
                    self.addresses.len(),
                    names.len()
                )));
            }
            Some(names) => names
                .iter()
                .map(|name| name.parse::<ValueType>().map_err(|e| fail(e.to_string())))
                .collect::<RelayResult<Vec<_>>>()?,
            None => vec![ValueType::Integer16; self.addresses.len()],
        };

        let endpoint = match (&self.address, device) {
            (None, _) => None,
            (Some(address), Device::Tcp(_)) => Some(address.parse().map_err(|e| {
                fail(format!("invalid address {}: {}", address, e))
            })?),
            (Some(_), Device::Rtu(_)) => {
                return Err(fail("a device address needs a TCP device".to_string()));
            }
        };

        let mut specs = Vec::with_capacity(self.addresses.len());
        for ((&address, &length), &value_type) in
            self.addresses.iter().zip(&self.lengths).zip(&types)
        {
            if length == 0 || length as usize > MAX_READ_REGISTERS {
                return Err(fail(format!(
                    "length {} at address {} is out of 1..={}",
                    length, address, MAX_READ_REGISTERS
                )));
            }
            if value_type.is_float() && length % 2 != 0 {
                return Err(fail(format!(
                    "odd length {} at address {} for type {}",
                    length, address, value_type
                )));
            }
            if address as u32 + length as u32 > 0x1_0000 {
                return Err(fail(format!(
                    "{} registers at address {} run past 65535",
                    length, address
                )));
            }
            specs.push(ReadSpec {
                address,
                length,
                value_type,
            });
        }

        Ok(Target {
            id: self.id,
            name: self.name.clone(),
            endpoint,
            specs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(toml: &str) -> RelayResult<RelayConfig> {
        let figment =
            Figment::from(Serialized::defaults(ConfigFile::default())).merge(Toml::string(toml));
        ConfigFile::from_figment(&figment)?.resolve()
    }

    #[test]
    fn test_poll_config() {
        let config = parse(
            r#"
            interval = 5
            [device]
            address = "10.0.0.2:502"

            [[target]]
            id = 1
            name = "plant1"
            addresses = [100, 200]
            lengths = [2, 4]
            types = ["int", "floatlsb"]

            [[target]]
            id = 2
            address = "10.0.0.3:502"
            addresses = [0]
            lengths = [10]
            "#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Poll);
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.socket_file, PathBuf::from("/tmp/mbsocket"));
        assert_eq!(config.device, Device::Tcp("10.0.0.2:502".parse().unwrap()));
        assert_eq!(config.targets.len(), 2);
        assert_eq!(
            config.targets[0].specs[1],
            ReadSpec {
                address: 200,
                length: 4,
                value_type: ValueType::Float32LsbFirst
            }
        );
        assert_eq!(config.targets[1].specs[0].value_type, ValueType::Integer16);
        assert_eq!(config.targets[1].endpoint, Some("10.0.0.3:502".parse().unwrap()));
    }

    #[test]
    fn test_rejects_mismatched_lists() {
        let err = parse(
            r#"
            [[target]]
            id = 1
            addresses = [1, 2]
            lengths = [1]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not same number of addresses"));

        let err = parse(
            r#"
            [[target]]
            id = 1
            addresses = [1, 2]
            lengths = [1, 1]
            types = ["int"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("types"));
    }

    #[test]
    fn test_rejects_bad_lengths() {
        for (lengths, types) in [("[0]", "[\"int\"]"), ("[126]", "[\"int\"]"), ("[3]", "[\"float\"]")] {
            let toml = format!(
                "[[target]]\nid = 1\naddresses = [0]\nlengths = {}\ntypes = {}\n",
                lengths, types
            );
            assert!(parse(&toml).is_err(), "accepted {} {}", lengths, types);
        }

        let err = parse("[[target]]\nid = 1\naddresses = [65530]\nlengths = [10]\n").unwrap_err();
        assert!(err.to_string().contains("65535"));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = parse(
            "[[target]]\nid = 1\nname = \"boiler\"\naddresses = [0]\nlengths = [2]\ntypes = [\"double\"]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("boiler"));
    }

    #[test]
    fn test_poll_needs_targets_and_interval() {
        assert!(parse("").is_err());
        assert!(parse("interval = 0\n[[target]]\naddresses = [0]\nlengths = [1]\n").is_err());
    }

    #[test]
    fn test_serve_config() {
        let config = parse("mode = \"serve\"\nregisters = 64\n[device]\naddress = \"0.0.0.0:1502\"\n")
            .unwrap();
        assert_eq!(config.role, Role::Serve);
        assert_eq!(config.registers, 64);
        assert_eq!(config.unit_id, 1);

        let legacy = parse("mode = \"slave\"\n").unwrap();
        assert_eq!(legacy.role, Role::Serve);
    }

    #[test]
    fn test_serve_over_rtu_rejected() {
        let err = parse("mode = \"serve\"\n[device]\nkind = \"rtu\"\n").unwrap_err();
        assert!(err.to_string().contains("TCP"));
    }

    #[test]
    fn test_serial_line_validation() {
        let base = "[[target]]\naddresses = [0]\nlengths = [1]\n[device]\nkind = \"rtu\"\n";
        let config = parse(&format!("{}parity = \"e\"\nbaud = 9600\n", base)).unwrap();
        assert_eq!(
            config.device,
            Device::Rtu(SerialLine {
                port: "/dev/ttyUSB0".to_string(),
                baud: 9600,
                parity: 'E',
                data_bits: 8,
                stop_bits: 1,
            })
        );

        assert!(parse(&format!("{}parity = \"X\"\n", base)).is_err());
        assert!(parse(&format!("{}stop_bits = 3\n", base)).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "interval = 30\nsocket_file = \"/run/relay.sock\"\n[[target]]\naddresses = [0]\nlengths = [1]"
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            interval: Some(2),
            device: Some("/dev/ttyS1".to_string()),
            parity: Some("N".to_string()),
            verbose: true,
            ..Args::default()
        };
        let config = args.load().unwrap();

        assert_eq!(config.interval, Duration::from_secs(2));
        assert_eq!(config.socket_file, PathBuf::from("/run/relay.sock"));
        assert!(config.verbose);
        match config.device {
            Device::Rtu(line) => {
                assert_eq!(line.port, "/dev/ttyS1");
                assert_eq!(line.parity, 'N');
            }
            other => panic!("Expected RTU line, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_explicit_file() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/voltage-relay.toml")),
            ..Args::default()
        };
        assert!(matches!(args.load(), Err(RelayError::Config { .. })));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode = \"serve\"\nid = 3").unwrap();
        let raw = ConfigFile::from_file(file.path()).unwrap();
        assert_eq!(raw.mode, Role::Serve);
        assert_eq!(raw.resolve().unwrap().unit_id, 3);
    }
}
