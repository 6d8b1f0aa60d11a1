//! Outbound half of the host stream.
//!
//! Any task may hold a [`FrameSender`]; a single writer task owns the
//! underlying sink so frames are never interleaved.

use std::io;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;

use super::codec::{Frame, FrameCodec, FrameError};
use super::protocol::BridgeEvent;

/// Cloneable handle that queues frames for the writer task.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSender {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { tx }
    }

    /// Sender plus the receiver to hand to [`run_writer`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, event: BridgeEvent) -> io::Result<()> {
        self.send_frame(event.into_frame())
    }

    /// Rejects frames the codec could not encode before they reach the writer.
    pub fn send_frame(&self, frame: Frame) -> io::Result<()> {
        frame
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host stream closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain queued frames into `writer`.
///
/// Runs until every sender is dropped, or until `shutdown` fires and the
/// frames already queued have been written.
pub async fn run_writer<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());
    let mut closing = false;
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = &mut shutdown, if !closing => {
                closing = true;
                rx.close();
                continue;
            }
        };
        let Some(frame) = frame else {
            break;
        };
        let code = frame.code();
        if let Err(e) = sink.send(frame).await {
            tracing::error!(code, error = %e, "Failed to write frame to host");
            return Err(e);
        }
    }
    tracing::debug!("Writer finished");
    sink.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use crate::bridge::protocol::{Command, ProgramState};

    #[tokio::test]
    async fn frames_reach_the_wire_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let (sender, rx) = FrameSender::channel();
        let (_stop, shutdown) = oneshot::channel();
        let writer = tokio::spawn(run_writer(server, rx, shutdown));

        sender
            .send(BridgeEvent::ProgramState {
                context: "ctx1".into(),
                program: "p1".into(),
                state: ProgramState::Instantiated,
            })
            .unwrap();
        sender
            .send(BridgeEvent::ShowStatus {
                context: "ctx1".into(),
                message: "ready".into(),
            })
            .unwrap();
        drop(sender);

        let mut reader = FramedRead::new(client, FrameCodec::new());
        let first = reader.next().await.unwrap().unwrap();
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(first.code(), Command::ProgramState.code());
        assert_eq!(first.get(2).unwrap().as_ref(), b"2");
        assert_eq!(second.code(), Command::ShowStatus.code());
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_queue_while_senders_live() {
        let (client, server) = tokio::io::duplex(1024);
        let (sender, rx) = FrameSender::channel();
        let (stop, shutdown) = oneshot::channel();
        let writer = tokio::spawn(run_writer(server, rx, shutdown));

        sender.send_frame(Frame::new(29)).unwrap();
        stop.send(()).unwrap();
        writer.await.unwrap().unwrap();
        assert!(sender.is_closed());

        let mut reader = FramedRead::new(client, FrameCodec::new());
        assert_eq!(reader.next().await.unwrap().unwrap().code(), 29);
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn invalid_frame_is_rejected_before_queueing() {
        let (sender, mut rx) = FrameSender::channel();
        let err = sender
            .send_frame(Frame::new(10).field("c").field(&b"bad\0"[..]))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_channel_is_broken_pipe() {
        let (sender, rx) = FrameSender::channel();
        drop(rx);
        let err = sender.send_frame(Frame::new(29)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(sender.is_closed());
    }
}
