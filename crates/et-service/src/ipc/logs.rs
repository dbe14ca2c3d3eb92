//! Log stream channel: the current log file, then a terminator line

use std::path::PathBuf;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Line written after the log contents
pub const END_OF_LOGS: &[u8] = b"end of logs\n";

pub(super) async fn serve(
    stream: TcpStream,
    log_file: PathBuf,
    interrupt: CancellationToken,
) -> std::io::Result<()> {
    tokio::select! {
        _ = interrupt.cancelled() => {
            tracing::debug!("logs connection interrupted before the log was written");
            Ok(())
        }
        result = write_logs(stream, log_file) => result,
    }
}

async fn write_logs(stream: TcpStream, log_file: PathBuf) -> std::io::Result<()> {
    tracing::debug!("accepted a logs connection, writing logs to pipe");
    let mut writer = BufWriter::new(stream);

    match tokio::fs::File::open(&log_file).await {
        Ok(mut file) => {
            match tokio::io::copy(&mut file, &mut writer).await {
                Ok(wrote) => tracing::debug!("wrote {} bytes to client from logs", wrote),
                Err(e) => tracing::error!("problem responding with log data for {:?}: {}", log_file, e),
            }
            writer.write_all(END_OF_LOGS).await?;
        }
        Err(e) => {
            tracing::error!("could not open log file at {:?}: {}", log_file, e);
            writer
                .write_all(b"an unexpected error occurred while retrieving logs. look at the actual log file.\n")
                .await?;
        }
    }

    writer.flush().await?;
    writer.into_inner().shutdown().await
}
