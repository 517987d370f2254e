//! The per-connection outbound multiplexer.
//!
//! Every write a connection makes goes through one ordered queue drained by a
//! single writer task, so a response header always precedes its body and
//! responses leave in the order they were queued. A dispatched request
//! queues a [`Outbound::Pending`] slot before it is processed; the writer
//! waits on that slot even if a later response is ready first.

use std::sync::Weak;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::connection::Connection;
use super::context::{AfterWrite, BodySegment, INTERNAL_SERVER_ERROR, ResponsePacket};

/// One queued write.
#[derive(Debug)]
pub(crate) enum Outbound {
    Ready(ResponsePacket),
    /// A response still being produced by a processor.
    Pending(oneshot::Receiver<ResponsePacket>),
}

pub(crate) type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub(crate) type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

pub(crate) fn channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// Drains `queue` into `writer` until the queue closes, a write fails, or a
/// packet asks for the connection to be closed. The connection is closed in
/// every case; a closed queue means the peer finished sending and nothing
/// else will be queued.
pub(crate) async fn run_writer<W>(connection: Weak<Connection>, mut writer: W, mut queue: OutboundReceiver)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = queue.recv().await {
        let packet = match item {
            Outbound::Ready(packet) => packet,
            Outbound::Pending(slot) => match slot.await {
                Ok(packet) => packet,
                Err(_) => {
                    debug!("response slot dropped without a response");
                    ResponsePacket::canned(INTERNAL_SERVER_ERROR, AfterWrite::KeepOpen)
                }
            },
        };
        let after = packet.after;

        if let Err(e) = write_packet(&mut writer, packet).await {
            debug!(error = %e, "write failed");
            close(&connection);
            return;
        }
        if after == AfterWrite::Close {
            let _ = writer.shutdown().await;
            close(&connection);
            return;
        }
    }
    let _ = writer.shutdown().await;
    close(&connection);
}

async fn write_packet<W>(writer: &mut W, packet: ResponsePacket) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.header).await?;
    for segment in packet.body {
        match segment {
            BodySegment::Bytes(bytes) => writer.write_all(&bytes).await?,
            BodySegment::File { file, len } => {
                let mut file = tokio::fs::File::from_std(file).take(len);
                let copied = tokio::io::copy(&mut file, writer).await?;
                if copied != len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("file body ended after {copied} of {len} bytes"),
                    ));
                }
            }
        }
    }
    writer.flush().await
}

fn close(connection: &Weak<Connection>) {
    if let Some(connection) = connection.upgrade() {
        connection.close();
    }
}
