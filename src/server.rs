//! A TCP server which broadcasts every message to every connected client.
//!
//! A single actor owns the set of clients.
//! The accept loop hands new connections to the actor,
//! and each client is served by a [`peer`](crate::peer) task which tells the actor when it leaves.
//!
//! Test with `nc {host} {port}`.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{error::Error, peer};

/// At most this many clients are served at once, unless told otherwise.
pub const DEFAULT_MAX_CLIENTS: usize = 10;

// Messages queued per client before the broadcast waits for it.
const CLIENT_CAPACITY: usize = 4;

// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

// How long clients get to flush their last messages when the server stops.
const CLIENT_FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClientId(u64);

#[derive(Debug)]
pub(crate) enum Request {
    /// A new connection was accepted.
    Entering {
        stream: TcpStream,
        address: SocketAddr,
    },

    /// A client went away.
    Leaving(ClientId),

    /// How many clients are connected?
    Count(oneshot::Sender<usize>),
}

/// A bound, but not yet running, broadcast server.
#[derive(Debug)]
pub struct BroadcastServer {
    listener: TcpListener,
    max_clients: usize,
}

impl BroadcastServer {
    /// Bind to the given address, such as `localhost:5000`.
    pub async fn bind(address: &str) -> Result<Self, Error> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| Error::Bind {
                address: address.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            max_clients: DEFAULT_MAX_CLIENTS,
        })
    }

    /// Where we are listening.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Set how many clients may be connected at once.
    /// Connections beyond this are closed right away.
    pub fn set_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Start accepting clients, and broadcast what arrives on `input` to them.
    ///
    /// When `input` closes the listener is closed,
    /// clients get their remaining messages and are then disconnected.
    /// The returned task finishes after that.
    pub fn run(self, input: mpsc::Receiver<String>) -> (BroadcastHandle, JoinHandle<()>) {
        let address = self
            .listener
            .local_addr()
            .map(|address| address.to_string())
            .unwrap_or_default();

        info!(%address, max_clients = self.max_clients, "TCP server is listening");

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let stop_accepting = CancellationToken::new();

        let span = info_span!("broadcast", %address);

        let accept_task = tokio::spawn(
            accept_connections(self.listener, requests_tx.clone(), stop_accepting.clone())
                .instrument(span.clone()),
        );

        let broadcaster = Broadcaster {
            max_clients: self.max_clients,
            clients: HashMap::new(),
            peers: JoinSet::new(),
            next_id: 0,
            requests_tx: requests_tx.clone(),
        };

        let task = tokio::spawn(
            broadcaster
                .run(input, requests_rx, stop_accepting, accept_task)
                .instrument(span),
        );

        (
            BroadcastHandle {
                requests: requests_tx,
            },
            task,
        )
    }
}

/// A handle to a running [`BroadcastServer`].
#[derive(Debug, Clone)]
pub struct BroadcastHandle {
    requests: mpsc::UnboundedSender<Request>,
}

impl BroadcastHandle {
    /// How many clients are currently connected.
    /// Zero if the server has stopped.
    pub async fn connected_clients(&self) -> usize {
        let (tx, rx) = oneshot::channel();

        if self.requests.send(Request::Count(tx)).is_err() {
            return 0;
        }

        rx.await.unwrap_or_default()
    }
}

async fn accept_connections(
    listener: TcpListener,
    requests: mpsc::UnboundedSender<Request>,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, address)) => {
                debug!(%address, "Accepted connection");
                if requests
                    .send(Request::Entering { stream, address })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                error!(?e, "TCP accept failed");
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            }
        }
    }

    info!("No longer accepting connections");
}

/// Owns the connected clients.
struct Broadcaster {
    max_clients: usize,
    clients: HashMap<ClientId, mpsc::Sender<Arc<str>>>,
    peers: JoinSet<()>,
    next_id: u64,

    // Given to peers, so they can tell us when they leave.
    requests_tx: mpsc::UnboundedSender<Request>,
}

impl Broadcaster {
    async fn run(
        mut self,
        mut input: mpsc::Receiver<String>,
        mut requests: mpsc::UnboundedReceiver<Request>,
        stop_accepting: CancellationToken,
        accept_task: JoinHandle<()>,
    ) {
        info!("Broadcasting");

        loop {
            tokio::select! {
                message = input.recv() => match message {
                    Some(message) => self.broadcast(message).await,
                    None => break,
                },
                Some(request) = requests.recv() => self.handle(request),
            }
        }

        info!("Input closed, stopping");

        stop_accepting.cancel();
        if let Err(e) = accept_task.await {
            warn!(?e, "Accept task did not finish cleanly");
        }

        // Dropping the senders lets each peer flush and close its socket.
        self.clients.clear();

        let peers = &mut self.peers;
        let flushed = tokio::time::timeout(CLIENT_FLUSH_GRACE, async {
            while peers.join_next().await.is_some() {}
        })
        .await;

        if flushed.is_err() {
            warn!("Clients did not finish in time, disconnecting them");
            self.peers.abort_all();
        }

        info!("Broadcast done");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Entering { stream, address } => self.enter(stream, address),
            Request::Leaving(id) => {
                if self.clients.remove(&id).is_some() {
                    info!(?id, clients = self.clients.len(), "Client left");
                }
            }
            Request::Count(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn enter(&mut self, stream: TcpStream, address: SocketAddr) {
        if self.clients.len() >= self.max_clients {
            info!(
                %address,
                "Connection rejected (max number of connections reached)"
            );
            // Closes the socket.
            drop(stream);
            return;
        }

        let id = ClientId(self.next_id);
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(CLIENT_CAPACITY);
        self.clients.insert(id, tx);

        self.peers.spawn(
            peer::run(id, stream, rx, self.requests_tx.clone())
                .instrument(info_span!("peer", %address)),
        );

        info!(%address, ?id, clients = self.clients.len(), "New connection");
    }

    async fn broadcast(&mut self, message: String) {
        debug!(payload = %message, "Broadcasting");

        let line: Arc<str> = format!("{message}\r\n").into();
        let mut gone = vec![];

        for (id, client) in &self.clients {
            if client.send(Arc::clone(&line)).await.is_err() {
                gone.push(*id);
            }
        }

        for id in gone {
            self.clients.remove(&id);
            info!(?id, clients = self.clients.len(), "Client dropped");
        }

        // Reap peers which are done, so the set does not grow forever.
        while self.peers.try_join_next().is_some() {}
    }
}
