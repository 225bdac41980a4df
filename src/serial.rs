use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info};

/// Serial port related errors.
pub mod error;

/// Codecs for encoding/decoding messages to/from wire.
pub mod codecs;

use error::SerialPortError;

/// The baud rate used when none is given.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Something which can (try to) open a connection to a device.
///
/// Each successful [`Connect::connect`] is one session with the device.
/// The session ends when reading from the port ends or fails,
/// after which a new connection is attempted.
pub trait Connect: Send + 'static {
    /// The open port.
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// A human readable name of the device, such as `/dev/ttyUSB0`.
    fn name(&self) -> &str;

    /// Try to open the device.
    fn connect(&mut self) -> Result<Self::Port, SerialPortError>;
}

/// Opens a real tty/COM device.
#[derive(Debug, Clone)]
pub struct TtyConnector {
    path: String,
    baud: u32,
}

impl TtyConnector {
    /// The tty should likely be along the lines of `/dev/ttyACMx` on unix, and `COMx` on Windows.
    pub fn new(path: &str, baud: u32) -> Self {
        Self {
            path: path.to_string(),
            baud,
        }
    }
}

impl Connect for TtyConnector {
    type Port = tokio_serial::SerialStream;

    fn name(&self) -> &str {
        &self.path
    }

    fn connect(&mut self) -> Result<Self::Port, SerialPortError> {
        let serial_stream = tokio_serial::new(&self.path, self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        Ok(serial_stream)
    }
}

/// The names of the serial ports present on this host.
pub fn list_ports() -> Result<Vec<String>, SerialPortError> {
    let ports = tokio_serial::available_ports()?;

    Ok(ports.into_iter().map(|port| port.port_name).collect())
}

/// Log which serial ports are present on this host.
pub fn log_available_ports() {
    match list_ports() {
        Ok(ports) if ports.is_empty() => info!("No serial ports found!"),
        Ok(ports) => {
            for port in ports {
                info!(%port, "Found port");
            }
        }
        Err(e) => error!(?e, "Could not list serial ports"),
    }
}
