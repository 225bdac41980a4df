use std::{io, string};

use thiserror::Error;

/// Any error a serial link might encounter.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem")]
    IO(#[from] io::Error),

    /// The serial port driver refused us.
    #[error("Serial port problem")]
    Serial(#[from] tokio_serial::Error),

    /// Utf8 related errors.
    #[error("Problem with UTF8 conversion")]
    Utf8(#[from] string::FromUtf8Error),

    /// The device sent more than this many bytes without ending the line.
    #[error("Line longer than {0} bytes")]
    LineTooLong(usize),

    /// There is no such device (right now).
    #[error("The device `{0}` is not present")]
    NotPresent(String),
}
