//! Sends every message as a UDP datagram.
//!
//! Test with `nc -kluw 0 {port}`.

use std::{io, net::SocketAddr};

use tokio::{
    net::{lookup_host, UdpSocket},
    sync::mpsc,
};
use tracing::{debug, error, info};

/// Send each message on `input` to `target` (`host:port`) as `<body>\n`.
///
/// Runs until `input` closes.
/// If the target cannot be resolved or the socket set up, this logs and returns right away.
pub async fn run(target: String, mut input: mpsc::Receiver<String>) {
    let socket = match connect(&target).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(?e, %target, "UDP setup failed, not sending");
            return;
        }
    };

    info!(%target, "UDP is ready to send");

    while let Some(message) = input.recv().await {
        let datagram = format!("{message}\n");

        match socket.send(datagram.as_bytes()).await {
            Ok(bytes) => debug!(payload = %message, %bytes, "UDP sent"),
            Err(e) => error!(?e, "UDP send failed"),
        }
    }

    info!("UDP done");
}

async fn connect(target: &str) -> io::Result<UdpSocket> {
    let address = resolve(target).await?;

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

    // So that broadcast addresses such as 192.168.1.255 may be used.
    socket.set_broadcast(true)?;
    socket.connect(address).await?;

    Ok(socket)
}

async fn resolve(target: &str) -> io::Result<SocketAddr> {
    lookup_host(target)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{target}` has no IPv4 address"),
            )
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn sends_one_datagram_per_message() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap().to_string();

        let (tx, rx) = mpsc::channel(3);
        let task = tokio::spawn(run(target, rx));

        for message in ["$GPGGA,1", "$GPGGA,2"] {
            tx.send(message.into()).await.unwrap();
        }

        let mut buf = [0u8; 64];
        for expected in ["$GPGGA,1\n", "$GPGGA,2\n"] {
            let n = timeout(Duration::from_secs(5), receiver.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), expected);
        }

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unresolvable_target_gives_up() {
        let (tx, rx) = mpsc::channel(3);

        run("no-port-given".into(), rx).await;

        // Our input is gone, so senders notice.
        assert!(tx.send("lost".into()).await.is_err());
    }
}
