//! Caller's end of a tunneled job.

use std::sync::Arc;

use bytes::{Buf, BytesMut};

use super::job::Job;
use super::{Direction, Tunnel, TunnelError, connection_error};
use crate::bridge::protocol::{DataCommand, JobId};

/// A connected tunnel job.
///
/// Reads drain the host's `URLData` chunks in arrival order; writes are
/// buffered and shipped as `PutData` frames when the host asks for data.
/// Dropping an unclosed stream releases the job and tells the host to stop.
pub struct TunnelStream {
    tunnel: Arc<Tunnel>,
    job: Arc<Job>,
    out: BytesMut,
    closed: bool,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("job", &self.job.id())
            .field("url", &self.job.url())
            .field("closed", &self.closed)
            .finish()
    }
}

impl TunnelStream {
    pub(crate) fn new(tunnel: Arc<Tunnel>, job: Arc<Job>) -> Self {
        Self {
            tunnel,
            job,
            out: BytesMut::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id()
    }

    pub fn url(&self) -> &str {
        self.job.url()
    }

    pub fn direction(&self) -> Direction {
        self.job.direction()
    }

    pub fn headers(&self) -> Option<String> {
        self.job.lock().headers.clone()
    }

    pub fn mime_type(&self) -> Option<String> {
        self.job.lock().mime_type.clone()
    }

    pub fn redirect(&self) -> Option<String> {
        self.job.lock().redirect.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read into `buf` from the oldest queued chunk. `Ok(0)` is end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if self.closed {
            return Err(TunnelError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.job.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let resume = {
                let mut state = self.job.lock();
                if let Some(front) = state.chunks.front_mut() {
                    let n = front.len().min(buf.len());
                    buf[..n].copy_from_slice(&front[..n]);
                    front.advance(n);
                    if front.is_empty() {
                        state.chunks.pop_front();
                    }
                    return Ok(n);
                }
                if let Some(code) = state.error {
                    return Err(connection_error(self.job.url(), code));
                }
                if state.finished {
                    return Ok(0);
                }
                // About to block: let a held host send again.
                std::mem::take(&mut state.on_hold)
            };
            if resume {
                self.tunnel.control(self.job.id(), DataCommand::Resume);
            }
            notified.await;
        }
    }

    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, TunnelError> {
        let start = out.len();
        let mut buf = [0u8; 8192];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(out.len() - start),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Buffer `data`, shipping once a full chunk is pending and the host is ready.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.closed {
            return Err(TunnelError::Closed);
        }
        self.out.extend_from_slice(data);
        if self.out.len() >= self.tunnel.config().write_chunk {
            self.flush(false).await?;
        }
        Ok(data.len())
    }

    /// Ship buffered output.
    ///
    /// Without `force`, data stays buffered until the host has sent
    /// `REQUESTDATA`. With `force`, waits for it up to the flush timeout and
    /// tears the job down on expiry.
    pub async fn flush(&mut self, force: bool) -> Result<(), TunnelError> {
        if self.closed {
            return Err(TunnelError::Closed);
        }
        if self.out.is_empty() {
            return Ok(());
        }
        if !force {
            if self.job.lock().ready_for_data {
                self.ship()?;
            }
            return Ok(());
        }

        let job = Arc::clone(&self.job);
        let ready = async {
            loop {
                let notified = job.changed().notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let state = job.lock();
                    if state.ready_for_data {
                        return Ok(());
                    }
                    if let Some(code) = state.error {
                        return Err(connection_error(job.url(), code));
                    }
                    if state.finished {
                        return Err(TunnelError::Closed);
                    }
                }
                notified.await;
            }
        };

        let timeout = self.tunnel.config().flush_timeout;
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => self.ship(),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(job = %self.job.id(), "Flush timed out, stopping job");
                self.teardown();
                Err(TunnelError::Timeout(timeout))
            }
        }
    }

    fn ship(&mut self) -> Result<(), TunnelError> {
        let mut data = self.out.split().freeze();
        self.job.lock().ready_for_data = false;
        let chunk = self.tunnel.config().write_chunk.max(1);
        while !data.is_empty() {
            let part = data.split_to(chunk.min(data.len()));
            self.tunnel.send_data(self.job.id(), part)?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.tunnel.release(self.job.id());
        if !self.job.lock().finished {
            self.tunnel.control(self.job.id(), DataCommand::Stop);
        }
    }

    /// Flush pending output and release the job. Safe to call twice.
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        if self.closed {
            return Ok(());
        }
        let flushed = match self.direction() {
            Direction::Output => self.flush(true).await,
            Direction::Input => Ok(()),
        };
        self.teardown();
        flushed
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(job = %self.job.id(), "Dropping unclosed tunnel stream");
            self.teardown();
        }
    }
}
