use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that may occur in this library.
///
/// These are the errors which stop the gateway from starting.
/// Problems at runtime (a device going away, a client disconnecting, a full disk)
/// are logged where they happen instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is not usable.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// A configuration file could not be read.
    #[error("Could not read the configuration file `{path:?}`")]
    ConfigRead {
        /// Where we looked.
        path: PathBuf,

        /// The underlying problem.
        #[source]
        source: io::Error,
    },

    /// A configuration file was not valid RON.
    #[error("Could not parse the configuration")]
    ConfigParse(#[from] ron::error::SpannedError),

    /// A configuration could not be written out as RON.
    #[error("Could not serialize the configuration")]
    ConfigSerialize(#[from] ron::Error),

    /// A listener could not be set up.
    #[error("Could not bind to `{address}`")]
    Bind {
        /// The address we tried binding to.
        address: String,

        /// The underlying problem.
        #[source]
        source: io::Error,
    },

    /// Serial port related errors.
    #[error("Serial port problem")]
    Serial(#[from] crate::serial::error::SerialPortError),

    /// IO related errors.
    #[error("Underlying IO problem")]
    Io(#[from] io::Error),
}

impl Error {
    /// Get the explanation of a bad configuration, if that is what this error is.
    pub fn try_into_bad_config(self) -> Option<String> {
        if let Self::BadConfig(reason) = self {
            Some(reason)
        } else {
            None
        }
    }
}
