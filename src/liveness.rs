//! Use one device's data only while another device corroborates it.
//!
//! The witness device is expected to talk regularly.
//! While it does, messages from the subject device pass as usual.
//! Once the witness has been silent for longer than the timeout,
//! subject messages are masked: archived, but kept from the live sinks.
//! They pass again as soon as the witness is heard from.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::message::Message;

/// Which device corroborates which.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorroborationConfig {
    /// The device whose messages are masked when not corroborated.
    pub subject: String,

    /// The device which must be heard from.
    pub witness: String,

    /// How long the witness may be silent, in seconds.
    pub timeout_secs: u64,
}

/// The state of the policy.
#[derive(Debug)]
pub struct Corroboration {
    subject: String,
    witness: String,
    timeout: Duration,
    last_witness: Instant,
    masking: bool,
}

impl Corroboration {
    /// The witness counts as seen right now.
    pub fn new<S: Into<String>, W: Into<String>>(subject: S, witness: W, timeout: Duration) -> Self {
        Self {
            subject: subject.into(),
            witness: witness.into(),
            timeout,
            last_witness: Instant::now(),
            masking: false,
        }
    }

    /// Note the message, and mask it if it is an uncorroborated subject message.
    pub fn apply(&mut self, message: Message) -> Message {
        if message.origin == self.witness {
            self.last_witness = Instant::now();
            return message;
        }

        if message.origin != self.subject {
            return message;
        }

        let silent = self.last_witness.elapsed() > self.timeout;

        if silent != self.masking {
            self.masking = silent;
            if silent {
                warn!(subject = %self.subject, witness = %self.witness, "Witness is silent, masking");
            } else {
                info!(subject = %self.subject, witness = %self.witness, "Witness is back, unmasking");
            }
        }

        if silent {
            message.mask()
        } else {
            message
        }
    }
}

impl From<&CorroborationConfig> for Corroboration {
    fn from(config: &CorroborationConfig) -> Self {
        Self::new(
            config.subject.as_str(),
            config.witness.as_str(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}
