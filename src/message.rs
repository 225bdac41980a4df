use std::fmt::Display;

use chrono::{DateTime, Utc};

/// A line of text seen on some device, with where and when it was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Where the message came from, usually a device path such as `/dev/ttyGPS`.
    pub origin: String,

    /// When the message was captured.
    pub timestamp: DateTime<Utc>,

    /// The line itself, without any line terminator.
    pub body: String,

    /// A masked message is kept in the archive but withheld from the live sinks.
    pub masked: bool,
}

impl Message {
    /// A new unmasked message, captured now.
    pub fn new<O: Into<String>, B: Into<String>>(origin: O, body: B) -> Self {
        Self::with_timestamp(origin, body, Utc::now())
    }

    /// A new unmasked message captured at the given instant.
    pub fn with_timestamp<O: Into<String>, B: Into<String>>(
        origin: O,
        body: B,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            origin: origin.into(),
            timestamp,
            body: body.into(),
            masked: false,
        }
    }

    /// The same message, but masked.
    #[must_use]
    pub fn mask(mut self) -> Self {
        self.masked = true;
        self
    }

    /// Mask or unmask the message.
    pub fn set_masked(&mut self, masked: bool) {
        self.masked = masked;
    }

    /// Nanoseconds since the unix epoch.
    pub fn unix_nanos(&self) -> i64 {
        unix_nanos(&self.timestamp)
    }

    /// How this message is represented in an archive file:
    /// `<unixNanos>:<origin>:<body>`, where origin gets a `#` prefix if masked.
    pub fn archive_line(&self) -> String {
        let marker = if self.masked { "#" } else { "" };

        format!(
            "{}:{marker}{}:{}",
            self.unix_nanos(),
            self.origin,
            self.body
        )
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.body.chars().take(48).collect::<String>();

        write!(f, "{}: {}", self.origin, s.trim())
    }
}

/// Nanoseconds since the unix epoch.
///
/// Saturates to zero outside of what an `i64` can hold (years 1677 to 2262).
pub(crate) fn unix_nanos(timestamp: &DateTime<Utc>) -> i64 {
    timestamp.timestamp_nanos_opt().unwrap_or_default()
}
