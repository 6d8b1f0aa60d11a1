//! Read loop and process lifecycle.

use std::io;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::{FrameCodec, FrameError};
use crate::bridge::sender::{FrameSender, run_writer};
use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, Flow};
use crate::host::AppletHost;

/// Why the read loop stopped cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The host sent `ShutdownServer`.
    Shutdown,
    /// The host closed its end of the stream.
    Eof,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("host stream closed for writing")]
    WriterClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Serve one host connection until shutdown, EOF, or a fatal error.
///
/// Frames are decoded and dispatched in arrival order. Everything written
/// back goes through a single writer task, which is drained before return.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    host: Arc<dyn AppletHost>,
    config: BridgeConfig,
) -> Result<ExitReason, ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, rx) = FrameSender::channel();
    let (stop_writer, writer_shutdown) = oneshot::channel();
    let writer_task = tokio::spawn(run_writer(writer, rx, writer_shutdown));

    let dispatcher = Dispatcher::new(host, sender, config);
    let mut frames = FramedRead::new(reader, FrameCodec::new());
    tracing::info!("Bridge ready");

    let outcome = loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Fatal error reading from host");
                break Err(ServerError::from(e));
            }
            None => {
                tracing::info!("Host closed the stream");
                break Ok(ExitReason::Eof);
            }
        };

        match dispatcher.dispatch(&frame).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Shutdown) => break Ok(ExitReason::Shutdown),
            Err(e) if e.is_fatal() => {
                tracing::error!(code = frame.code(), error = %e, "Cannot answer host");
                break Err(ServerError::WriterClosed);
            }
            Err(e) => tracing::warn!(code = frame.code(), error = %e, "Skipping frame"),
        }
    };

    dispatcher.shutdown().await;
    drop(dispatcher);
    let _ = stop_writer.send(());
    let written = match writer_task.await {
        Ok(result) => result.map_err(ServerError::from),
        Err(e) => Err(ServerError::Io(io::Error::other(e))),
    };

    let reason = outcome?;
    match written {
        Err(e) if reason != ExitReason::Eof => Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "Writer failed after host EOF");
            Ok(reason)
        }
        Ok(()) => Ok(reason),
    }
}

/// Serve the host over this process's stdin and stdout.
pub async fn run_stdio(
    host: Arc<dyn AppletHost>,
    config: BridgeConfig,
) -> Result<ExitReason, ServerError> {
    serve(tokio::io::stdin(), tokio::io::stdout(), host, config).await
}
