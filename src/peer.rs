//! The task serving a single client of the broadcast server.

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::server::{ClientId, Request};

/// Write whatever arrives on `lines` to the client.
///
/// Clients are not expected to send anything.
/// Whatever they do send is discarded, but their end of stream means they left.
///
/// On the first failed write, or when the client leaves, the broadcaster is told via `leaving`.
/// When `lines` closes the socket is shut down.
pub(crate) async fn run(
    id: ClientId,
    mut stream: TcpStream,
    mut lines: mpsc::Receiver<Arc<str>>,
    leaving: mpsc::UnboundedSender<Request>,
) {
    debug!("Serving client");

    let (mut reader, mut writer) = stream.split();
    let mut discard = [0u8; 256];

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        warn!(?e, "Write to client failed, dropping it");
                        let _ = leaving.send(Request::Leaving(id));
                        return;
                    }
                }
                None => break,
            },
            read = reader.read(&mut discard) => match read {
                Ok(0) => {
                    info!("Client closed the connection");
                    let _ = leaving.send(Request::Leaving(id));
                    return;
                }
                Err(e) => {
                    warn!(?e, "Read from client failed, dropping it");
                    let _ = leaving.send(Request::Leaving(id));
                    return;
                }
                Ok(_) => {}
            },
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(?e, "Problem shutting down client socket");
    }

    debug!("Done serving client");
}
