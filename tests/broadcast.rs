use std::time::Duration;

use color_eyre::Result;
use common::{connect, init_logging, receive_line, start_server, wait_for_clients};
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;

mod common;

#[tokio::test]
async fn every_client_gets_every_message_in_order() -> Result<()> {
    init_logging().await;
    let server = start_server(10).await?;

    let mut clients = vec![];
    for _ in 0..3 {
        clients.push(connect(server.address).await?);
    }
    wait_for_clients(&server.handle, 3).await?;

    let messages = (0..20)
        .map(|i| format!("$GPGGA,{i},{}", lipsum::lipsum_words(3)))
        .collect::<Vec<_>>();

    for message in &messages {
        server.input.send(message.clone()).await?;
    }

    for client in &mut clients {
        for message in &messages {
            assert_eq!(
                receive_line(client).await?,
                Some(format!("{message}\r\n"))
            );
        }
    }

    Ok(())
}

#[tokio::test]
async fn connections_beyond_the_cap_are_closed() -> Result<()> {
    init_logging().await;
    let server = start_server(2).await?;

    let mut first = connect(server.address).await?;
    let _second = connect(server.address).await?;
    wait_for_clients(&server.handle, 2).await?;

    let mut third = connect(server.address).await?;

    // Rejected right away, without ever getting anything.
    assert_eq!(receive_line(&mut third).await?, None);
    assert_eq!(server.handle.connected_clients().await, 2);

    server.input.send("still here".into()).await?;
    assert_eq!(
        receive_line(&mut first).await?,
        Some("still here\r\n".to_string())
    );

    Ok(())
}

#[tokio::test]
async fn closed_clients_are_removed() -> Result<()> {
    init_logging().await;
    let server = start_server(10).await?;

    let mut staying = connect(server.address).await?;
    let mut leaving = connect(server.address).await?;
    wait_for_clients(&server.handle, 2).await?;

    leaving.get_mut().shutdown().await?;
    drop(leaving);

    wait_for_clients(&server.handle, 1).await?;

    // Broadcasting keeps working for the rest.
    for i in 0..5 {
        server.input.send(format!("msg {i}")).await?;
    }
    for i in 0..5 {
        assert_eq!(
            receive_line(&mut staying).await?,
            Some(format!("msg {i}\r\n"))
        );
    }

    // And the spot is free again.
    let _another = connect(server.address).await?;
    wait_for_clients(&server.handle, 2).await?;

    Ok(())
}

#[tokio::test]
async fn reset_clients_are_removed_mid_broadcast() -> Result<()> {
    init_logging().await;
    let server = start_server(10).await?;

    let mut staying = vec![connect(server.address).await?, connect(server.address).await?];
    let resetting = connect(server.address).await?;
    wait_for_clients(&server.handle, 3).await?;

    let messages = (0..200).map(|i| format!("$GPGGA,{i}")).collect::<Vec<_>>();
    let (before, after) = messages.split_at(20);

    for message in before {
        server.input.send(message.clone()).await?;
    }

    // Abortive close, the server sees a reset rather than an orderly end of stream.
    resetting.get_ref().set_linger(Some(Duration::ZERO))?;
    drop(resetting);

    for message in after {
        server.input.send(message.clone()).await?;
    }

    wait_for_clients(&server.handle, 2).await?;

    for client in &mut staying {
        for message in &messages {
            assert_eq!(
                receive_line(client).await?,
                Some(format!("{message}\r\n"))
            );
        }
    }

    drop(server.input);
    server.task.await?;

    Ok(())
}

#[tokio::test]
async fn closing_the_input_disconnects_everyone() -> Result<()> {
    init_logging().await;
    let server = start_server(10).await?;

    let mut client = connect(server.address).await?;
    wait_for_clients(&server.handle, 1).await?;

    server.input.send("last words".into()).await?;
    drop(server.input);

    // Queued messages are still delivered before the socket closes.
    assert_eq!(
        receive_line(&mut client).await?,
        Some("last words\r\n".to_string())
    );
    assert_eq!(receive_line(&mut client).await?, None);

    server.task.await?;
    assert_eq!(server.handle.connected_clients().await, 0);

    Ok(())
}
