//! Event channel: a status snapshot, then every published event

use std::sync::Arc;

use tokio::io::{AsyncReadExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use et_core::ipc::Event;

use super::write_json_line;
use crate::state::TunnelContext;

pub(super) async fn serve(
    stream: TcpStream,
    ctx: Arc<TunnelContext>,
    interrupt: CancellationToken,
) -> std::io::Result<()> {
    tracing::debug!("accepted an events connection, writing events to pipe");
    let (id, mut queue) = ctx.hub.subscribe(ctx.config.event_queue_capacity).await;

    let result = forward(stream, &ctx, &mut queue, &interrupt).await;

    // a dispatcher blocked on our full queue is released by the drop, so it
    // can accept the unregister message
    drop(queue);
    ctx.hub.unregister(id).await;
    tracing::info!("a connected event client has disconnected");
    result
}

async fn forward(
    stream: TcpStream,
    ctx: &TunnelContext,
    queue: &mut mpsc::Receiver<Event>,
    interrupt: &CancellationToken,
) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);

    tracing::info!("new event client connected - sending current status");
    let status = Event::status(ctx.to_status().await);
    tokio::select! {
        _ = interrupt.cancelled() => return Ok(()),
        written = write_json_line(&mut writer, &status) => written?,
    }
    tracing::info!("status sent. listening for new events");

    // clients never send anything; reading only detects disconnects
    let mut discard = [0u8; 256];
    loop {
        tokio::select! {
            _ = interrupt.cancelled() => break,
            event = queue.recv() => match event {
                // a client that stopped reading must not hold up an interrupt
                Some(event) => tokio::select! {
                    _ = interrupt.cancelled() => break,
                    written = write_json_line(&mut writer, &event) => written?,
                },
                None => break,
            },
            read = reader.read(&mut discard) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    Ok(())
}
