//! A mock, useful to test serial port functionality without the actual serial ports.
//!
//! A [`MockDevice`] is handed to a link in place of a tty.
//! The test keeps the [`MockDeviceHandle`] and plugs the device in (and out) at will.
//! Each plug-in is one [`MockSession`], where lines can be typed as if the device sent them,
//! and where lines written to the device show up.

use std::io;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    sync::mpsc,
};
use tracing::{debug, trace};

use crate::serial::{error::SerialPortError, Connect};

// Plenty for a handful of NMEA sentences in flight.
const SESSION_BUFFER_SIZE: usize = 64 * 1024;

/// A device which is only present while plugged in, see [`device`].
#[derive(Debug)]
pub struct MockDevice {
    name: String,
    sessions: mpsc::UnboundedReceiver<DuplexStream>,
}

/// Controls a [`MockDevice`].
#[derive(Debug, Clone)]
pub struct MockDeviceHandle {
    name: String,
    sessions: mpsc::UnboundedSender<DuplexStream>,
}

/// Create a mock device with the given name.
///
/// The device is initially unplugged, so connecting to it fails
/// until [`MockDeviceHandle::plug_in`] has been called.
pub fn device(name: &str) -> (MockDevice, MockDeviceHandle) {
    let (tx, rx) = mpsc::unbounded_channel();

    (
        MockDevice {
            name: name.into(),
            sessions: rx,
        },
        MockDeviceHandle {
            name: name.into(),
            sessions: tx,
        },
    )
}

impl MockDeviceHandle {
    /// Queue up a session.
    /// The next successful connect to the device yields it.
    pub fn plug_in(&self) -> MockSession {
        let (device_side, test_side) = tokio::io::duplex(SESSION_BUFFER_SIZE);

        // If the device is gone, so is anyone who would connect.
        // The session is then simply never read from.
        let _ = self.sessions.send(device_side);
        debug!(name = %self.name, "Mock plugged in");

        let (reader, writer) = tokio::io::split(test_side);

        MockSession {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

impl Connect for MockDevice {
    type Port = DuplexStream;

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<Self::Port, SerialPortError> {
        self.sessions
            .try_recv()
            .map_err(|_| SerialPortError::NotPresent(self.name.clone()))
    }
}

/// The test side of a plugged in mock device.
///
/// Dropping this unplugs the device.
#[derive(Debug)]
pub struct MockSession {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockSession {
    /// Have the device send a line, terminated by `\r\n`.
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        trace!(%line, "Mock sending");
        self.send_bytes(format!("{line}\r\n").as_bytes()).await
    }

    /// Have the device send some bytes as-is.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Wait for the next line written to the device.
    /// `None` if the port was closed.
    pub async fn next_written_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();

        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let line = line.trim_end_matches(['\r', '\n']).to_string();
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn unplugged_device_is_not_present() {
        let (mut mock, _handle) = device("/dev/ttyMock");

        assert!(matches!(
            mock.connect(),
            Err(SerialPortError::NotPresent(name)) if name == "/dev/ttyMock"
        ));
    }

    #[tokio::test]
    async fn one_connect_per_plug_in() {
        let (mut mock, handle) = device("/dev/ttyMock");

        let mut session = handle.plug_in();
        let mut port = mock.connect().unwrap();
        assert!(mock.connect().is_err());

        session.send_line("hello").await.unwrap();
        let mut buf = [0u8; 7];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\r\n");

        port.write_all(b"back\n").await.unwrap();
        assert_eq!(
            session.next_written_line().await.unwrap(),
            Some("back".to_string())
        );

        drop(port);
        assert_eq!(session.next_written_line().await.unwrap(), None);
    }
}
