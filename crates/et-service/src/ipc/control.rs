//! Control channel read loop

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use et_core::ipc::{AddIdentity, Command, Response, ResponseCode};

use super::handler::{CommandHandler, Outcome};
use super::write_json_line;
use crate::identity::IdentityManager;
use crate::state::TunnelContext;

enum Line {
    Read,
    Closed,
    Interrupted,
}

async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut String,
    interrupt: &CancellationToken,
) -> std::io::Result<Line> {
    line.clear();
    tokio::select! {
        _ = interrupt.cancelled() => Ok(Line::Interrupted),
        read = reader.read_line(line) => match read? {
            0 => Ok(Line::Closed),
            _ => Ok(Line::Read),
        },
    }
}

pub(super) async fn serve(
    stream: TcpStream,
    ctx: Arc<TunnelContext>,
    manager: IdentityManager,
    interrupt: CancellationToken,
) -> std::io::Result<()> {
    tracing::debug!("beginning ipc receive loop");
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let handler = CommandHandler::new(Arc::clone(&ctx), manager);
    let mut line = String::new();

    loop {
        match read_line(&mut reader, &mut line, &interrupt).await {
            Ok(Line::Read) => {}
            Ok(Line::Closed) => {
                tracing::debug!("pipe closed. client likely disconnected");
                break;
            }
            Ok(Line::Interrupted) => {
                tracing::info!("request to interrupt read loop received");
                break;
            }
            Err(e) => {
                tracing::error!("unexpected error while reading line. {}", e);
                let response = Response::error(
                    ResponseCode::UnknownError,
                    "could not read line properly! exiting loop!",
                    e.to_string(),
                );
                let _ = write_json_line(&mut writer, &response).await;
                break;
            }
        }

        let request = line.trim();
        if request.is_empty() {
            tracing::debug!("empty line received. ignoring");
            continue;
        }
        tracing::debug!("msg received: {}", request);

        let command = match Command::decode(request) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("rejecting request: {}", e);
                let response = Response::error(e.code(), "could not process request", e.to_string());
                write_json_line(&mut writer, &response).await?;
                continue;
            }
        };

        let outcome = if command == Command::AddIdentity {
            match read_line(&mut reader, &mut line, &interrupt).await {
                Ok(Line::Read) => match serde_json::from_str::<AddIdentity>(line.trim()) {
                    Ok(request) => handler.add_identity(request).await,
                    Err(e) => Outcome {
                        response: Response::error(
                            ResponseCode::ProtocolError,
                            "could not parse the enrollment request",
                            e.to_string(),
                        ),
                        mutated: false,
                    },
                },
                Ok(Line::Closed) | Ok(Line::Interrupted) => break,
                Err(e) => {
                    let response = Response::error(
                        ResponseCode::UnknownError,
                        "could not read string properly",
                        e.to_string(),
                    );
                    let _ = write_json_line(&mut writer, &response).await;
                    break;
                }
            }
        } else {
            handler.handle(command).await
        };

        let mut response = outcome.response;
        if outcome.mutated {
            if let Err(e) = ctx.persist().await {
                tracing::error!("failed to save tunnel state: {}", e);
                response.code = e.code().as_i32();
                response.error = e.to_string();
            }
        }
        write_json_line(&mut writer, &response).await?;
    }

    tracing::info!("a connected IPC client has disconnected");
    Ok(())
}
