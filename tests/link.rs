use color_eyre::Result;
use common::{init_logging, mock_link, next_message, PATIENCE};
use pretty_assertions::assert_eq;
use serial_gateway::serial::codecs::lines::MAX_LINE_LENGTH;
use tokio::time::timeout;

mod common;

#[tokio::test]
async fn warmup_then_filter() -> Result<()> {
    init_logging().await;
    let (mut link, device) = mock_link("/dev/ttyGPS", |b| {
        b.set_warmup(2).set_filter("$GP").set_raw(true)
    });

    let mut session = device.plug_in();
    for line in ["$GPGGA,1", "$GPGGA,2", "junk", "$GPGGA,3", "$GPGGA,marker"] {
        session.send_line(line).await?;
    }

    assert_eq!(next_message(&mut link).await?.body, "$GPGGA,3");
    assert_eq!(next_message(&mut link).await?.body, "$GPGGA,marker");

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn all_but_warmup_lines_arrive_in_order() -> Result<()> {
    init_logging().await;
    let (mut link, device) = mock_link("/dev/ttyA", |b| b.set_warmup(3).set_raw(true));

    let lines = (0..50).map(|i| format!("line {i}")).collect::<Vec<_>>();

    let mut session = device.plug_in();
    for line in &lines {
        session.send_line(line).await?;
    }

    for line in &lines[3..] {
        let message = next_message(&mut link).await?;
        assert_eq!(&message.body, line);
        assert_eq!(message.origin, "/dev/ttyA");
        assert!(!message.masked);
    }

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn fewer_lines_than_warmup_give_nothing() -> Result<()> {
    init_logging().await;
    let (mut link, device) = mock_link("/dev/ttyA", |b| b.set_warmup(5).set_raw(true));

    let mut session = device.plug_in();
    for i in 0..3 {
        session.send_line(&format!("line {i}")).await?;
    }

    let nothing = timeout(std::time::Duration::from_millis(200), link.from_device.recv()).await;
    assert!(nothing.is_err());

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn tagged_lines() -> Result<()> {
    init_logging().await;
    let (mut link, device) = mock_link("/dev/ttyGPS", |b| b.set_warmup(0));

    let mut session = device.plug_in();
    session.send_line("$GPRMC,1").await?;

    let message = next_message(&mut link).await?;
    assert_eq!(
        message.body,
        format!("{}:/dev/ttyGPS:$GPRMC,1", message.unix_nanos())
    );

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn final_line_without_newline_is_kept() -> Result<()> {
    init_logging().await;
    let (mut link, device) = mock_link("/dev/ttyA", |b| b.set_warmup(0).set_raw(true));

    let mut session = device.plug_in();
    session.send_bytes(b"first\nsecond").await?;
    drop(session);

    assert_eq!(next_message(&mut link).await?.body, "first");
    assert_eq!(next_message(&mut link).await?.body, "second");

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn reconnects_and_warms_up_again() -> Result<()> {
    init_logging().await;
    let (mut link, device) = mock_link("/dev/ttyA", |b| b.set_warmup(1).set_raw(true));

    let mut session = device.plug_in();
    for line in ["garbled", "one"] {
        session.send_line(line).await?;
    }
    assert_eq!(next_message(&mut link).await?.body, "one");

    // Unplug. The link notices and tries again, failing until plugged back in.
    drop(session);
    tokio::time::sleep(common::BACKOFF * 3).await;

    let mut session = device.plug_in();
    for line in ["garbled again", "two"] {
        session.send_line(line).await?;
    }
    assert_eq!(next_message(&mut link).await?.body, "two");

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn endless_garbage_reconnects() -> Result<()> {
    init_logging().await;
    let (mut link, device) = mock_link("/dev/ttyA", |b| b.set_warmup(0).set_raw(true));

    // No line ending in sight. The port may be closed on us midway.
    let mut session = device.plug_in();
    let garbage = vec![b'x'; MAX_LINE_LENGTH + 16 * 1024];
    let _ = session.send_bytes(&garbage).await;
    drop(session);

    tokio::time::sleep(common::BACKOFF * 3).await;

    let mut session = device.plug_in();
    session.send_line("clean").await?;
    assert_eq!(next_message(&mut link).await?.body, "clean");

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn writes_reach_the_device() -> Result<()> {
    init_logging().await;
    let (link, device) = mock_link("/dev/ttyA", |b| b.set_writable(true));

    let mut session = device.plug_in();

    let to_device = link.to_device.clone().expect("writable");
    to_device.send("AT+RESET".into()).await?;
    to_device.send("AT".into()).await?;

    for expected in ["AT+RESET", "AT"] {
        let line = timeout(PATIENCE, session.next_written_line()).await??;
        assert_eq!(line.as_deref(), Some(expected));
    }

    link.shutdown().await;

    // The port was closed.
    assert_eq!(timeout(PATIENCE, session.next_written_line()).await??, None);

    Ok(())
}

#[tokio::test]
async fn read_only_links_take_no_lines() -> Result<()> {
    init_logging().await;
    let (link, _device) = mock_link("/dev/ttyA", |b| b);

    assert!(link.to_device.is_none());

    link.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn shutdown_closes_the_output() -> Result<()> {
    init_logging().await;
    let (link, device) = mock_link("/dev/ttyA", |b| b.set_warmup(0));
    let _session = device.plug_in();

    let mut from_device = {
        let serial_gateway::link::LinkHandle {
            from_device,
            stop,
            task,
            ..
        } = link;

        stop.cancel();
        timeout(PATIENCE, task).await??;
        from_device
    };

    assert_eq!(from_device.recv().await, None);

    Ok(())
}

#[tokio::test]
async fn shutdown_while_device_is_absent() -> Result<()> {
    init_logging().await;
    // Never plugged in, so the link is waiting to retry.
    let (link, _device) = mock_link("/dev/ttyMissing", |b| b);

    timeout(PATIENCE, link.shutdown()).await?;

    Ok(())
}
