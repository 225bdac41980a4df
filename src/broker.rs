//! Bridges messages to and from an MQTT broker.
//!
//! Messages given to the bridge are published on one topic.
//! Messages arriving on another (subscribed) topic come out of the bridge.
//! The connection to the broker is kept alive and reestablished by the client library,
//! we only have to keep polling it.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::Error;

/// The port used if the broker URL has none.
pub const DEFAULT_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(25);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 4;
const BACKLOG: usize = 64;

/// How to reach the broker, and which topics to use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Such as `tcp://mqtt:1883`.
    pub url: String,

    /// Messages arriving on this topic are passed on.
    #[serde(default)]
    pub subscribe: Option<String>,

    /// Messages are published on this topic.
    #[serde(default)]
    pub publish: Option<String>,
}

impl BrokerConfig {
    /// The host and port of the broker.
    ///
    /// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` and `host`.
    pub fn address(&self) -> Result<(String, u16), Error> {
        let url = self.url.trim();
        let without_scheme = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(url)
            .trim_end_matches('/');

        let (host, port) = match without_scheme.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    Error::BadConfig(format!("The broker URL `{url}` has a bad port `{port}`"))
                })?;
                (host, port)
            }
            None => (without_scheme, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(Error::BadConfig(format!(
                "The broker URL `{url}` has no host"
            )));
        }

        Ok((host.to_string(), port))
    }
}

/// A running bridge to a broker.
#[derive(Debug)]
pub struct BrokerHandle {
    /// Messages to publish.
    /// Close this (drop it) to disconnect from the broker.
    pub to_broker: mpsc::Sender<String>,

    /// Messages received on the subscribed topic.
    pub from_broker: mpsc::Receiver<String>,

    /// Finishes after disconnecting.
    pub task: JoinHandle<()>,
}

/// Connect to a broker.
pub fn start(config: BrokerConfig) -> Result<BrokerHandle, Error> {
    let (host, port) = config.address()?;

    let client_id = format!("serial-gateway-{}", Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);

    let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

    let (to_broker_tx, to_broker_rx) = mpsc::channel(BACKLOG);
    let (from_broker_tx, from_broker_rx) = mpsc::channel(BACKLOG);

    let stop = CancellationToken::new();
    let span = info_span!("broker", url = %config.url);

    let poller = tokio::spawn(
        poll(
            eventloop,
            client.clone(),
            config.subscribe.clone(),
            from_broker_tx,
            stop.clone(),
        )
        .instrument(span.clone()),
    );

    let task = tokio::spawn(
        async move {
            publish(client, config.publish, to_broker_rx).await;
            stop.cancel();

            if let Err(e) = poller.await {
                warn!(?e, "Broker connection did not finish cleanly");
            }

            info!("Broker bridge done");
        }
        .instrument(span),
    );

    Ok(BrokerHandle {
        to_broker: to_broker_tx,
        from_broker: from_broker_rx,
        task,
    })
}

/// Publishing never waits on the broker.
/// While it is unreachable the client's queue fills up, and messages are dropped.
async fn publish(client: AsyncClient, topic: Option<String>, mut input: mpsc::Receiver<String>) {
    if topic.is_none() {
        info!("No publish topic, messages are not published");
    }

    while let Some(message) = input.recv().await {
        let Some(topic) = &topic else {
            continue;
        };

        match client.try_publish(topic.as_str(), QoS::AtMostOnce, false, message.clone()) {
            Ok(()) => debug!(%topic, payload = %message, "Message published"),
            Err(e) => warn!(?e, %topic, "Publish failed, dropping the message"),
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!(?e, "Disconnect failed");
    }
}

async fn poll(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscribe: Option<String>,
    from_broker: mpsc::Sender<String>,
    stop: CancellationToken,
) {
    let mut receiving = true;

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to broker");

                // Subscriptions do not survive reconnects.
                if let Some(topic) = &subscribe {
                    match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        Ok(()) => info!(%topic, "Subscribed"),
                        Err(e) => error!(?e, %topic, "Subscribe failed"),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!(topic = %publish.topic, %payload, "Message received");

                if receiving && !forward(&from_broker, payload) {
                    warn!("Nobody receives broker messages, dropping them");
                    receiving = false;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(?e, "Broker connection lost, retrying");

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        }
    }
}

/// Pass on a received message without waiting, so the event loop keeps being polled.
/// Returns `false` if nobody receives them anymore.
fn forward(from_broker: &mpsc::Sender<String>, payload: String) -> bool {
    match from_broker.try_send(payload) {
        Ok(()) => true,
        Err(TrySendError::Full(payload)) => {
            warn!(%payload, "Broker messages are not taken fast enough, dropping");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
