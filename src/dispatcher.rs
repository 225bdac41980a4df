//! Wires links, the archiver and the sinks together.
//!
//! ```text
//! links ─┬─> [corroboration] ─> archiver (or unmask) ─> fan-out ─┬─> tcp
//!        │                                                        ├─> udp
//!        │                                                        └─> broker ─┐
//!        └─<─────────────────── writable link <───────────────────────────────┘
//! ```
//!
//! Shutting down closes the head of the pipeline.
//! Each stage then drains, closes its own output and finishes,
//! so the stages end in the order the data flows.

use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    archiver::{ArchiverBuilder, ArchiverHandle},
    broker::{self, BrokerHandle},
    config::Config,
    error::Error,
    link::LinkHandle,
    liveness::Corroboration,
    message::Message,
    server::{BroadcastHandle, BroadcastServer},
    udp,
};

/// How long the workers get to finish after shutdown, before they are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const CHANNEL_CAPACITY: usize = 10;
const SINK_CAPACITY: usize = 64;

/// Somewhere message bodies go.
#[derive(Debug)]
pub struct Sink {
    name: String,
    input: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl Sink {
    /// A sink fed through `input`.
    /// The `task` should finish after `input` is closed.
    pub fn new<S: Into<String>>(name: S, input: mpsc::Sender<String>, task: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            input,
            task,
        }
    }

    /// Broadcast to TCP clients.
    pub fn tcp(server: BroadcastServer) -> (Self, BroadcastHandle) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let (handle, task) = server.run(rx);

        (Self::new("tcp", tx, task), handle)
    }

    /// Send datagrams to `target`.
    pub fn udp(target: &str) -> Self {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let task = tokio::spawn(
            udp::run(target.to_string(), rx).instrument(info_span!("udp", %target)),
        );

        Self::new("udp", tx, task)
    }

    /// Publish to a broker.
    /// Also gives what the broker sends us.
    pub fn broker(handle: BrokerHandle) -> (Self, mpsc::Receiver<String>) {
        let BrokerHandle {
            to_broker,
            from_broker,
            task,
        } = handle;

        (Self::new("broker", to_broker, task), from_broker)
    }
}

/// Owns every running part of the gateway.
#[derive(Debug, Default)]
pub struct Dispatcher {
    links: Vec<LinkHandle>,
    archiver: Option<ArchiverHandle>,
    sinks: Vec<Sink>,
    to_device: Option<mpsc::Receiver<String>>,
    corroboration: Option<Corroboration>,
}

impl Dispatcher {
    /// Nothing wired up yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start everything the configuration asks for.
    ///
    /// The TCP listener is bound before anything else is started,
    /// so failing to bind leaves nothing running.
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        config.validate()?;

        let mut dispatcher = Self::new();

        if let Some(address) = &config.tcp {
            let server = BroadcastServer::bind(address).await?;
            let (sink, _) = Sink::tcp(server);
            dispatcher.add_sink(sink);
        }

        if let Some(target) = &config.udp {
            dispatcher.add_sink(Sink::udp(target));
        }

        if let Some(broker_config) = &config.broker {
            let (sink, from_broker) = Sink::broker(broker::start(broker_config.clone())?);
            dispatcher.add_sink(sink);

            if broker_config.subscribe.is_some() {
                dispatcher.route_to_device(from_broker);
            }
        }

        if let Some(archive) = &config.archive {
            dispatcher.set_archiver(ArchiverBuilder::from(archive).build());
        }

        for link in &config.links {
            dispatcher.add_link(link.build());
        }

        if let Some(corroboration) = &config.corroboration {
            dispatcher.set_corroboration(corroboration.into());
        }

        Ok(dispatcher)
    }

    /// Merge the messages of this link with the others.
    pub fn add_link(&mut self, link: LinkHandle) {
        self.links.push(link);
    }

    /// Archive messages before they reach the sinks.
    pub fn set_archiver(&mut self, archiver: ArchiverHandle) {
        self.archiver = Some(archiver);
    }

    /// Send message bodies here too.
    pub fn add_sink(&mut self, sink: Sink) {
        self.sinks.push(sink);
    }

    /// Write lines arriving here to the writable link.
    pub fn route_to_device(&mut self, lines: mpsc::Receiver<String>) {
        self.to_device = Some(lines);
    }

    /// Mask messages of one device while another is silent.
    pub fn set_corroboration(&mut self, corroboration: Corroboration) {
        self.corroboration = Some(corroboration);
    }

    /// Run until `shutdown` is cancelled (or every link is gone),
    /// then stop everything.
    pub async fn run(self, shutdown: CancellationToken) {
        self.run_inner(shutdown)
            .instrument(info_span!("dispatcher"))
            .await
    }

    async fn run_inner(self, shutdown: CancellationToken) {
        let Self {
            links,
            archiver,
            sinks,
            to_device,
            mut corroboration,
        } = self;

        if sinks.is_empty() {
            warn!("No sinks configured, messages go nowhere but the archive");
        }

        let mut workers: Vec<(String, JoinHandle<()>)> = vec![];
        let mut link_stops = vec![];
        let mut from_devices = vec![];
        let mut writable = None;

        for link in links {
            let LinkHandle {
                device,
                to_device,
                from_device,
                stop,
                task,
            } = link;

            if writable.is_none() {
                writable = to_device.map(|tx| (device.clone(), tx));
            }

            from_devices.push(ReceiverStream::new(from_device));
            link_stops.push(stop);
            workers.push((format!("link {device}"), task));
        }

        let stop_routing = shutdown.child_token();

        match (to_device, writable) {
            (Some(lines), Some((device, tx))) => {
                info!(%device, "Routing lines to device");
                let task = tokio::spawn(
                    route(lines, tx, stop_routing.clone())
                        .instrument(info_span!("route", %device)),
                );
                workers.push(("route".into(), task));
            }
            (Some(_), None) => warn!("No writable link, lines for the device are dropped"),
            (None, _) => {}
        }

        let (head, bodies, head_task) = match archiver {
            Some(ArchiverHandle {
                input,
                output,
                task,
            }) => (input, output, task),
            None => {
                let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
                let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
                let task = tokio::spawn(unmask(input_rx, output_tx).in_current_span());

                (input_tx, output_rx, task)
            }
        };
        workers.push(("archiver".into(), head_task));

        let mut inputs = vec![];
        let mut sink_tasks = vec![];
        for Sink { name, input, task } in sinks {
            inputs.push((name.clone(), input));
            sink_tasks.push((name, task));
        }

        let fan_out_task = tokio::spawn(fan_out(bodies, inputs).in_current_span());
        workers.push(("fan-out".into(), fan_out_task));
        workers.extend(sink_tasks);

        let mut merged = stream::select_all(from_devices);

        info!(workers = workers.len(), "Dispatching");

        loop {
            let message = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutting down");
                    break;
                }
                message = merged.next() => match message {
                    Some(message) => message,
                    None => {
                        warn!("Every link is gone, shutting down");
                        break;
                    }
                },
            };

            let message = match &mut corroboration {
                Some(policy) => policy.apply(message),
                None => message,
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutting down, dropping a message in flight");
                    break;
                }
                sent = head.send(message) => {
                    if sent.is_err() {
                        error!("The pipeline is closed, shutting down");
                        break;
                    }
                }
            }
        }

        // Closing the head lets everything downstream drain and finish.
        drop(head);
        drop(merged);
        stop_routing.cancel();
        for stop in link_stops {
            stop.cancel();
        }

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for (name, task) in workers.iter_mut() {
                match task.await {
                    Ok(()) => debug!(%name, "Finished"),
                    Err(e) => warn!(?e, %name, "Did not finish cleanly"),
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!("Not everything finished in {SHUTDOWN_GRACE:?}, aborting the rest");
            for (_, task) in &workers {
                task.abort();
            }
        }

        info!("Dispatcher done");
    }
}

/// Without an archiver masked messages are simply dropped.
async fn unmask(mut input: mpsc::Receiver<Message>, output: mpsc::Sender<String>) {
    while let Some(message) = input.recv().await {
        if message.masked {
            debug!(%message, "Masked, dropping");
            continue;
        }

        if output.send(message.body).await.is_err() {
            break;
        }
    }
}

/// Give each body to every sink, in turn.
///
/// Never waits on a sink. One that lags behind misses bodies instead of holding up the rest.
async fn fan_out(mut bodies: mpsc::Receiver<String>, mut sinks: Vec<(String, mpsc::Sender<String>)>) {
    while let Some(body) = bodies.recv().await {
        let mut gone = vec![];

        for (index, (name, sink)) in sinks.iter().enumerate() {
            match sink.try_send(body.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(body)) => warn!(%name, %body, "Sink is lagging, dropping"),
                Err(TrySendError::Closed(_)) => gone.push(index),
            }
        }

        for index in gone.into_iter().rev() {
            let (name, _) = sinks.remove(index);
            warn!(%name, "Sink stopped, no longer sending to it");
        }
    }

    info!("Fan-out done");
}

/// Pass lines on to a device.
///
/// An absent device takes nothing, so lines are dropped until it is back.
async fn route(
    mut lines: mpsc::Receiver<String>,
    device: mpsc::Sender<String>,
    stop: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        debug!(%line, "Routing to device");

        match device.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(line)) => warn!(%line, "Device is not taking lines, dropping"),
            Err(TrySendError::Closed(_)) => {
                warn!("Device no longer takes lines");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn unmask_drops_masked_messages() {
        let (input_tx, input_rx) = mpsc::channel(10);
        let (output_tx, mut output_rx) = mpsc::channel(10);

        let task = tokio::spawn(unmask(input_rx, output_tx));

        input_tx.send(Message::new("a", "1")).await.unwrap();
        input_tx.send(Message::new("a", "2").mask()).await.unwrap();
        input_tx.send(Message::new("a", "3")).await.unwrap();
        drop(input_tx);

        task.await.unwrap();

        let mut bodies = vec![];
        while let Some(body) = output_rx.recv().await {
            bodies.push(body);
        }
        assert_eq!(bodies, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn fan_out_forgets_stopped_sinks() {
        let (bodies_tx, bodies_rx) = mpsc::channel(10);
        let (a_tx, mut a_rx) = mpsc::channel(10);
        let (b_tx, b_rx) = mpsc::channel(10);

        drop(b_rx);

        let task = tokio::spawn(fan_out(
            bodies_rx,
            vec![("a".into(), a_tx), ("b".into(), b_tx)],
        ));

        bodies_tx.send("1".to_string()).await.unwrap();
        bodies_tx.send("2".to_string()).await.unwrap();
        drop(bodies_tx);

        task.await.unwrap();

        assert_eq!(a_rx.recv().await.as_deref(), Some("1"));
        assert_eq!(a_rx.recv().await.as_deref(), Some("2"));
        assert_eq!(a_rx.recv().await, None);
    }

    #[tokio::test]
    async fn fan_out_does_not_wait_for_a_full_sink() {
        let (bodies_tx, bodies_rx) = mpsc::channel(10);
        let (full_tx, mut full_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(10);

        let task = tokio::spawn(fan_out(
            bodies_rx,
            vec![("full".into(), full_tx), ("fast".into(), fast_tx)],
        ));

        for body in ["1", "2", "3"] {
            bodies_tx.send(body.to_string()).await.unwrap();
        }
        drop(bodies_tx);

        task.await.unwrap();

        let mut fast = vec![];
        while let Some(body) = fast_rx.recv().await {
            fast.push(body);
        }
        assert_eq!(fast, vec!["1", "2", "3"]);

        // Only what fit.
        assert_eq!(full_rx.recv().await.as_deref(), Some("1"));
        assert_eq!(full_rx.recv().await, None);
    }

    #[tokio::test]
    async fn route_passes_lines_until_stopped() {
        let (lines_tx, lines_rx) = mpsc::channel(10);
        let (device_tx, mut device_rx) = mpsc::channel(10);
        let stop = CancellationToken::new();

        let task = tokio::spawn(route(lines_rx, device_tx, stop.clone()));

        lines_tx.send("AT".to_string()).await.unwrap();
        assert_eq!(device_rx.recv().await.as_deref(), Some("AT"));

        stop.cancel();
        task.await.unwrap();

        // The route is gone, so is its sender.
        assert_eq!(device_rx.recv().await, None);
    }

    #[tokio::test]
    async fn route_drops_lines_for_a_busy_device() {
        let (lines_tx, lines_rx) = mpsc::channel(10);
        let (device_tx, mut device_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();

        let task = tokio::spawn(route(lines_rx, device_tx, stop.clone()));

        for line in ["AT", "AT+CSQ", "AT+CREG"] {
            lines_tx.send(line.to_string()).await.unwrap();
        }
        drop(lines_tx);

        task.await.unwrap();

        assert_eq!(device_rx.recv().await.as_deref(), Some("AT"));
        assert_eq!(device_rx.recv().await, None);
    }
}
