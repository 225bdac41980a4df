//! A link is a serial device which is (re)opened for as long as the process lives.
//!
//! Lines read from the device become [`Message`]s, lines given to the link are written to the device.
//! When the device goes away the link waits a bit and tries again, forever.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{codec::Decoder, sync::CancellationToken};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    message::{unix_nanos, Message},
    serial::{codecs::lines::LinesCodec, error::SerialPortError, Connect, TtyConnector},
};

/// How many lines to throw away after opening a device.
/// The first lines after opening a port are often garbled.
pub const DEFAULT_WARMUP: usize = 2;

/// How long to wait before trying again when a device could not be opened.
pub const DEFAULT_OPEN_RETRY: Duration = Duration::from_secs(18);

/// How long to wait before reopening a device which went away.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const CHANNEL_CAPACITY: usize = 4;

/// Decides which lines read from a device become messages, and what they look like.
#[derive(Debug, Clone)]
pub(crate) struct LineFilter {
    device: String,
    prefix: Option<String>,
    raw: bool,
}

impl LineFilter {
    /// `None` if the line should be dropped.
    pub(crate) fn admit(&self, line: String) -> Option<Message> {
        if let Some(prefix) = &self.prefix {
            if !line.starts_with(prefix.as_str()) {
                return None;
            }
        }

        let mut message = Message::new(self.device.as_str(), String::new());
        message.body = if self.raw {
            line
        } else {
            format!("{}:{}:{line}", unix_nanos(&message.timestamp), self.device)
        };

        Some(message)
    }
}

/// Builder for a [`LinkHandle`].
#[derive(Debug)]
pub struct LinkBuilder<C> {
    connector: C,
    prefix: Option<String>,
    raw: bool,
    warmup: usize,
    writable: bool,
    open_retry: Duration,
    reconnect_delay: Duration,
}

impl LinkBuilder<TtyConnector> {
    /// Start a new builder for a tty.
    /// The tty should likely be along the lines of `/dev/ttyACMx` on unix, and `COMx` on Windows.
    pub fn new(tty: &str, baud: u32) -> Self {
        Self::with_connector(TtyConnector::new(tty, baud))
    }
}

impl<C: Connect> LinkBuilder<C> {
    /// Start a new builder for something which connects to a device.
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector,
            prefix: None,
            raw: false,
            warmup: DEFAULT_WARMUP,
            writable: false,
            open_retry: DEFAULT_OPEN_RETRY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Only lines starting with this prefix are kept.
    /// An empty prefix keeps everything.
    pub fn set_filter(mut self, prefix: &str) -> Self {
        self.prefix = (!prefix.is_empty()).then(|| prefix.to_string());
        self
    }

    /// If raw, lines are passed on verbatim.
    /// Otherwise they are prefixed with `<unixNanos>:<device>:`.
    pub fn set_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// How many lines to discard after each (re)connect.
    /// See [`DEFAULT_WARMUP`].
    pub fn set_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    /// Whether the link accepts lines to write to the device.
    pub fn set_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Set how long to wait after failing to open the device,
    /// and how long to wait after the device went away.
    pub fn set_backoff(mut self, open_retry: Duration, reconnect_delay: Duration) -> Self {
        self.open_retry = open_retry;
        self.reconnect_delay = reconnect_delay;
        self
    }

    /// Start the link.
    #[must_use]
    pub fn build(self) -> LinkHandle
    where
        C: Sync,
    {
        let device = self.connector.name().to_string();

        info!(%device, warmup = self.warmup, raw = self.raw, prefix = ?self.prefix, "Starting link");

        let (to_device_sender, to_device_receiver) = if self.writable {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let (from_device_sender, from_device_receiver) = mpsc::channel(CHANNEL_CAPACITY);

        let stop = CancellationToken::new();

        let link = Link {
            connector: self.connector,
            filter: LineFilter {
                device: device.clone(),
                prefix: self.prefix,
                raw: self.raw,
            },
            warmup: self.warmup,
            open_retry: self.open_retry,
            reconnect_delay: self.reconnect_delay,
            to_device: to_device_receiver,
            from_device: from_device_sender,
            stop: stop.clone(),
        };

        let task = tokio::spawn(link.run().instrument(info_span!("link", %device)));

        LinkHandle {
            device,
            to_device: to_device_sender,
            from_device: from_device_receiver,
            stop,
            task,
        }
    }
}

/// A running link.
#[derive(Debug)]
pub struct LinkHandle {
    /// The device the link talks to.
    pub device: String,

    /// Lines put here are written to the device, each terminated by a newline.
    /// `None` if the link was not made writable.
    pub to_device: Option<mpsc::Sender<String>>,

    /// Lines read from the device.
    /// Closes when the link is stopped.
    pub from_device: mpsc::Receiver<Message>,

    /// Cancel this to stop the link.
    pub stop: CancellationToken,

    /// The task running the link.
    pub task: JoinHandle<()>,
}

impl LinkHandle {
    /// Stop the link and wait for it to finish.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(?e, device = %self.device, "Link task did not finish cleanly");
        }
    }
}

/// Why reading from a device stopped.
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    /// The device went away, try again later.
    Disconnected,

    /// We were told to stop.
    Stopped,

    /// Nobody listens to us anymore.
    Abandoned,
}

struct Link<C> {
    connector: C,
    filter: LineFilter,
    warmup: usize,
    open_retry: Duration,
    reconnect_delay: Duration,
    to_device: Option<mpsc::Receiver<String>>,
    from_device: mpsc::Sender<Message>,
    stop: CancellationToken,
}

impl<C: Connect> Link<C> {
    async fn run(mut self) {
        loop {
            info!("Opening device");

            let port = match self.connector.connect() {
                Ok(port) => port,
                Err(e) => {
                    error!(?e, "Could not open device, retrying in {:?}", self.open_retry);
                    if self.sleep(self.open_retry).await {
                        continue;
                    }
                    break;
                }
            };

            info!("Device open");

            // Sink: Send things (to serial port), stream: receive things (from serial port)
            let codec = LinesCodec::default().into_string_codec(true);
            let (sink, stream) = codec.framed(port).split::<String>();

            // Stops the writer when the reader is done.
            // A child of our own stop token, so shutting the link down also stops the writer.
            let stop_writing = self.stop.child_token();

            let (filter, warmup, from_device, stop) =
                (&self.filter, self.warmup, &self.from_device, &self.stop);

            let writer = write_to_device(sink, self.to_device.as_mut(), stop_writing.clone());
            let reader = async {
                let outcome = read_from_device(stream, filter, warmup, from_device, stop).await;
                stop_writing.cancel();
                outcome
            };

            // Both halves of the port are dropped here, after the writer is done.
            let ((), outcome) = tokio::join!(writer, reader);
            info!(?outcome, "Device closed");

            match outcome {
                ReadOutcome::Disconnected => {
                    if !self.sleep(self.reconnect_delay).await {
                        break;
                    }
                }
                ReadOutcome::Stopped | ReadOutcome::Abandoned => break,
            }
        }

        info!("Link done");
    }

    /// Sleep, unless stopped.
    /// Returns `true` if the full duration passed.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

async fn read_from_device<S>(
    mut stream: S,
    filter: &LineFilter,
    warmup: usize,
    from_device: &mpsc::Sender<Message>,
    stop: &CancellationToken,
) -> ReadOutcome
where
    S: Stream<Item = Result<String, SerialPortError>> + Unpin,
{
    debug!("Reading from device");
    let mut warmup = warmup;

    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => return ReadOutcome::Stopped,
            line = stream.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                error!(?e, "Read from device failed");
                return ReadOutcome::Disconnected;
            }
            None => {
                info!("Device stream ended");
                return ReadOutcome::Disconnected;
            }
        };

        if warmup > 0 {
            warmup -= 1;
            trace!(%line, "Discarding warmup line");
            continue;
        }

        let Some(message) = filter.admit(line) else {
            continue;
        };

        debug!(payload = %message.body, "Read from device");

        tokio::select! {
            _ = stop.cancelled() => return ReadOutcome::Stopped,
            sent = from_device.send(message) => {
                if sent.is_err() {
                    warn!("Nobody is receiving from the link");
                    return ReadOutcome::Abandoned;
                }
            }
        }
    }
}

async fn write_to_device<S>(
    mut sink: S,
    to_device: Option<&mut mpsc::Receiver<String>>,
    stop: CancellationToken,
) where
    S: Sink<String, Error = SerialPortError> + Unpin,
{
    let Some(to_device) = to_device else {
        // Nothing will ever be written.
        stop.cancelled().await;
        return;
    };

    debug!("Writing to device");

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,
            line = to_device.recv() => match line {
                Some(line) => match sink.send(line.clone()).await {
                    Ok(()) => debug!(payload = %line, "Wrote to device"),
                    Err(e) => error!(?e, "Write to device failed"),
                },
                None => {
                    // The owner will not give us more lines.
                    stop.cancelled().await;
                    break;
                }
            }
        }
    }

    debug!("Done writing to device");
}
