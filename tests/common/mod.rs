#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use color_eyre::{eyre::eyre, Result};
use serial_gateway::{
    link::{LinkBuilder, LinkHandle},
    logging,
    message::Message,
    mock::{self, MockDeviceHandle},
    server::{BroadcastHandle, BroadcastServer},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{info, Level};

/// Generous, things usually happen within milliseconds.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Short backoffs, so reconnecting does not slow tests down.
pub const BACKOFF: Duration = Duration::from_millis(20);

pub async fn init_logging() {
    logging::init(Level::DEBUG, None).await;
}

pub struct Server {
    pub address: SocketAddr,
    pub input: mpsc::Sender<String>,
    pub handle: BroadcastHandle,
    pub task: JoinHandle<()>,
}

pub async fn start_server(max_clients: usize) -> Result<Server> {
    let server = BroadcastServer::bind("127.0.0.1:0")
        .await?
        .set_max_clients(max_clients);
    let address = server.local_addr()?;

    let (input, rx) = mpsc::channel(4);
    let (handle, task) = server.run(rx);

    info!(%address, "Test server started");

    Ok(Server {
        address,
        input,
        handle,
        task,
    })
}

pub type Client = BufReader<TcpStream>;

pub async fn connect(address: SocketAddr) -> Result<Client> {
    Ok(BufReader::new(TcpStream::connect(address).await?))
}

/// The next line, including its line ending.
/// `None` on end of stream.
pub async fn receive_line(client: &mut Client) -> Result<Option<String>> {
    let mut line = String::new();

    let read = timeout(PATIENCE, client.read_line(&mut line)).await??;

    Ok((read > 0).then_some(line))
}

/// Wait until the server reports this many clients.
pub async fn wait_for_clients(handle: &BroadcastHandle, expected: usize) -> Result<()> {
    timeout(PATIENCE, async {
        while handle.connected_clients().await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| eyre!("Never saw {expected} clients"))
}

/// A link to a fresh mock device, reconnecting quickly.
pub fn mock_link(
    name: &str,
    configure: impl FnOnce(LinkBuilder<mock::MockDevice>) -> LinkBuilder<mock::MockDevice>,
) -> (LinkHandle, MockDeviceHandle) {
    let (device, handle) = mock::device(name);

    let link = configure(LinkBuilder::with_connector(device).set_backoff(BACKOFF, BACKOFF)).build();

    (link, handle)
}

/// The next message from a link.
pub async fn next_message(link: &mut LinkHandle) -> Result<Message> {
    timeout(PATIENCE, link.from_device.recv())
        .await?
        .ok_or_else(|| eyre!("Link closed"))
}
