//! Network I/O proxied through the host.
//!
//! The bridge never opens sockets itself: a [`Tunnel`] asks the host to fetch
//! (`GetURLData`) or upload (`PutURLData`) a URL, and the host streams
//! `URLData` signals back, which the reader task folds into the job's state
//! via [`Tunnel::deliver`]. [`TunnelStream`] is the caller's end.

pub mod job;
pub mod stream;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use crate::bridge::protocol::{BridgeEvent, DataCommand, JobId, UrlDataCode};
use crate::bridge::sender::FrameSender;
use crate::config::BridgeConfig;

pub use job::{Job, JobState};
pub use stream::TunnelStream;

/// Job ids are unique for the life of the process.
static NEXT_JOB: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host fetches the URL and streams its body to us.
    Input,
    /// We stream a body the host uploads to the URL.
    Output,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("host did not respond within {0:?}")]
    Timeout(Duration),

    #[error("host reported error {code} for {url}")]
    Connection { url: String, code: i32 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("stream is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = match &err {
            TunnelError::Io(inner) => inner.kind(),
            TunnelError::Timeout(_) => io::ErrorKind::TimedOut,
            TunnelError::NotFound(_) => io::ErrorKind::NotFound,
            TunnelError::Closed => io::ErrorKind::BrokenPipe,
            TunnelError::Connection { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

fn is_http(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub(crate) fn connection_error(url: &str, code: i32) -> TunnelError {
    if code == 404 && is_http(url) {
        TunnelError::NotFound(url.to_string())
    } else {
        TunnelError::Connection {
            url: url.to_string(),
            code,
        }
    }
}

/// Table of in-flight jobs plus the means to signal the host about them.
pub struct Tunnel {
    sender: FrameSender,
    jobs: DashMap<JobId, Arc<Job>>,
    config: BridgeConfig,
}

impl Tunnel {
    pub fn new(sender: FrameSender, config: BridgeConfig) -> Self {
        Self {
            sender,
            jobs: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Open a job and wait for the host to report it connected.
    pub async fn connect(
        self: &Arc<Self>,
        url: &str,
        direction: Direction,
    ) -> Result<TunnelStream, TunnelError> {
        let id = JobId::new(NEXT_JOB.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(Job::new(id, url, direction));
        self.jobs.insert(id, Arc::clone(&job));

        let request = match direction {
            Direction::Input => BridgeEvent::GetUrlData {
                job: id,
                url: url.to_string(),
            },
            Direction::Output => BridgeEvent::PutUrlData {
                job: id,
                url: url.to_string(),
            },
        };
        tracing::debug!(%id, %url, ?direction, "Opening tunnel");
        if let Err(e) = self.sender.send(request) {
            self.release(id);
            return Err(e.into());
        }

        let connected = async {
            loop {
                let notified = job.changed().notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let state = job.lock();
                    if let Some(code) = state.error {
                        return Err(code);
                    }
                    if state.connected {
                        return Ok(());
                    }
                }
                notified.await;
            }
        };

        match tokio::time::timeout(self.config.connect_timeout, connected).await {
            Ok(Ok(())) => Ok(TunnelStream::new(Arc::clone(self), job)),
            Ok(Err(code)) => {
                tracing::debug!(%id, %url, code, "Tunnel connect failed");
                self.release(id);
                Err(connection_error(url, code))
            }
            Err(_) => {
                tracing::warn!(%id, %url, "Tunnel connect timed out");
                self.release(id);
                self.control(id, DataCommand::Stop);
                Err(TunnelError::Timeout(self.config.connect_timeout))
            }
        }
    }

    /// Route one `URLData` signal to its job.
    pub fn deliver(&self, id: JobId, code: UrlDataCode, data: Bytes) {
        let Some(job) = self.jobs.get(&id).map(|entry| Arc::clone(entry.value())) else {
            tracing::debug!(%id, ?code, "URLData for unknown job");
            return;
        };
        tracing::trace!(%id, ?code, bytes = data.len(), "URLData");
        if let Some(command) = job.apply(code, data) {
            self.control(id, command);
        }
    }

    pub(crate) fn control(&self, job: JobId, command: DataCommand) {
        tracing::trace!(%job, ?command, "DataControl");
        if let Err(e) = self.sender.send(BridgeEvent::DataControl { job, command }) {
            tracing::debug!(%job, error = %e, "Could not send DataControl");
        }
    }

    pub(crate) fn send_data(&self, job: JobId, data: Bytes) -> Result<(), TunnelError> {
        Ok(self.sender.send(BridgeEvent::PutData { job, data })?)
    }

    pub(crate) fn release(&self, job: JobId) -> Option<Arc<Job>> {
        self.jobs.remove(&job).map(|(_, job)| job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Abort every job so blocked readers and writers return.
    pub fn shutdown(&self) {
        let jobs: Vec<Arc<Job>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        self.jobs.clear();
        for job in jobs {
            job.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::Frame;
    use crate::bridge::protocol::Command;
    use tokio::sync::mpsc;

    fn setup(config: BridgeConfig) -> (Arc<Tunnel>, mpsc::UnboundedReceiver<Frame>) {
        let (sender, rx) = FrameSender::channel();
        (Arc::new(Tunnel::new(sender, config)), rx)
    }

    fn job_of(frame: &Frame) -> JobId {
        let raw = String::from_utf8_lossy(frame.get(0).unwrap()).into_owned();
        JobId::new(raw.parse().unwrap())
    }

    /// Open a stream, answering the request with `reply`.
    async fn open(
        tunnel: &Arc<Tunnel>,
        rx: &mut mpsc::UnboundedReceiver<Frame>,
        url: &str,
        direction: Direction,
        reply: UrlDataCode,
    ) -> Result<TunnelStream, TunnelError> {
        let pending = {
            let tunnel = Arc::clone(tunnel);
            let url = url.to_string();
            tokio::spawn(async move { tunnel.connect(&url, direction).await })
        };
        let request = rx.recv().await.unwrap();
        let expected = match direction {
            Direction::Input => Command::GetUrlData,
            Direction::Output => Command::PutUrlData,
        };
        assert_eq!(request.code(), expected.code());
        let data = match reply {
            UrlDataCode::ErrorCode => Bytes::from_static(b"404"),
            _ => Bytes::new(),
        };
        tunnel.deliver(job_of(&request), reply, data);
        pending.await.unwrap()
    }

    fn control_of(frame: &Frame) -> (u8, String) {
        (
            frame.code(),
            String::from_utf8_lossy(frame.get(1).unwrap()).into_owned(),
        )
    }

    const HOLD: &str = "1";
    const RESUME: &str = "2";
    const STOP: &str = "0";

    #[tokio::test]
    async fn hold_after_three_chunks_then_resume_once() {
        let (tunnel, mut rx) = setup(BridgeConfig::default());
        let mut stream = open(
            &tunnel,
            &mut rx,
            "http://x/a",
            Direction::Input,
            UrlDataCode::Connected,
        )
        .await
        .unwrap();
        let id = stream.id();

        for chunk in ["ab", "cd", "ef"] {
            tunnel.deliver(id, UrlDataCode::Data, Bytes::from(chunk));
        }
        let hold = rx.try_recv().unwrap();
        assert_eq!(control_of(&hold), (Command::DataControl.code(), HOLD.to_string()));
        tunnel.deliver(id, UrlDataCode::Data, Bytes::from_static(b"gh"));
        assert!(rx.try_recv().is_err(), "HOLD must be sent once");

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        let mut all = Vec::new();
        for _ in 0..3 {
            let n = stream.read(&mut buf).await.unwrap();
            all.extend_from_slice(&buf[..n]);
        }
        assert_eq!(all, b"cdefgh");
        assert!(rx.try_recv().is_err(), "no RESUME while data is queued");

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = stream.read(&mut buf).await.unwrap();
            (stream, buf[..n].to_vec())
        });
        let resume = rx.recv().await.unwrap();
        assert_eq!(control_of(&resume), (Command::DataControl.code(), RESUME.to_string()));

        tunnel.deliver(id, UrlDataCode::Data, Bytes::from_static(b"ij"));
        let (mut stream, tail) = reader.await.unwrap();
        assert_eq!(tail, b"ij");
        assert!(rx.try_recv().is_err(), "RESUME must be sent once");

        tunnel.deliver(id, UrlDataCode::Finished, Bytes::new());
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        stream.close().await.unwrap();
        assert!(rx.try_recv().is_err(), "no STOP after the host finished");
        assert!(tunnel.is_empty());
    }

    #[tokio::test]
    async fn data_counts_as_connected() {
        let (tunnel, mut rx) = setup(BridgeConfig::default());
        let mut stream = open(
            &tunnel,
            &mut rx,
            "http://x/a",
            Direction::Input,
            UrlDataCode::Finished,
        )
        .await
        .unwrap();
        let mut out = Vec::new();
        assert_eq!(stream.read_to_end(&mut out).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_sends_stop_and_releases() {
        let (tunnel, mut rx) = setup(BridgeConfig::default());
        let err = tunnel.connect("http://x/slow", Direction::Input).await.unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(d) if d == Duration::from_secs(20)));

        let request = rx.recv().await.unwrap();
        let stop = rx.recv().await.unwrap();
        assert_eq!(job_of(&request), job_of(&stop));
        assert_eq!(control_of(&stop), (Command::DataControl.code(), STOP.to_string()));
        assert!(tunnel.is_empty());
    }

    #[tokio::test]
    async fn not_found_only_for_http() {
        let (tunnel, mut rx) = setup(BridgeConfig::default());
        let err = open(
            &tunnel,
            &mut rx,
            "https://x/missing",
            Direction::Input,
            UrlDataCode::ErrorCode,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::NotFound(_)));

        let err = open(
            &tunnel,
            &mut rx,
            "ftp://x/missing",
            Direction::Input,
            UrlDataCode::ErrorCode,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::Connection { code: 404, .. }));
        assert!(tunnel.is_empty());

        let io: io::Error = TunnelError::NotFound("u".into()).into();
        assert_eq!(io.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn writes_wait_for_request_data() {
        let config = BridgeConfig::default().with_write_chunk(4);
        let (tunnel, mut rx) = setup(config);
        let mut stream = open(
            &tunnel,
            &mut rx,
            "http://x/up",
            Direction::Output,
            UrlDataCode::Connected,
        )
        .await
        .unwrap();
        let id = stream.id();

        stream.write(b"abcdef").await.unwrap();
        assert!(rx.try_recv().is_err(), "host has not asked for data yet");

        tunnel.deliver(id, UrlDataCode::RequestData, Bytes::new());
        stream.write(b"gh").await.unwrap();
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.code(), Command::PutData.code());
        assert_eq!(first.get(1).unwrap().as_ref(), b"abcd");
        assert_eq!(second.get(1).unwrap().as_ref(), b"efgh");

        stream.write(b"z").await.unwrap();
        tunnel.deliver(id, UrlDataCode::RequestData, Bytes::new());
        stream.close().await.unwrap();
        assert_eq!(rx.try_recv().unwrap().get(1).unwrap().as_ref(), b"z");
        let stop = rx.try_recv().unwrap();
        assert_eq!(control_of(&stop), (Command::DataControl.code(), STOP.to_string()));

        // Idempotent.
        stream.close().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn forced_flush_timeout_tears_down() {
        let (tunnel, mut rx) = setup(BridgeConfig::default());
        let mut stream = open(
            &tunnel,
            &mut rx,
            "http://x/up",
            Direction::Output,
            UrlDataCode::Connected,
        )
        .await
        .unwrap();

        stream.write(b"pending").await.unwrap();
        let err = stream.flush(true).await.unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(d) if d == Duration::from_secs(10)));
        let stop = rx.try_recv().unwrap();
        assert_eq!(control_of(&stop), (Command::DataControl.code(), STOP.to_string()));
        assert!(tunnel.is_empty());
        assert!(matches!(stream.write(b"x").await, Err(TunnelError::Closed)));
    }

    #[tokio::test]
    async fn drop_releases_and_stops() {
        let (tunnel, mut rx) = setup(BridgeConfig::default());
        let stream = open(&tunnel, &mut rx, "http://x/a", Direction::Input, UrlDataCode::Connected)
            .await
            .unwrap();
        let id = stream.id();
        drop(stream);
        assert!(tunnel.is_empty());
        let stop = rx.try_recv().unwrap();
        assert_eq!(job_of(&stop), id);

        // Late signals for a released job are ignored.
        tunnel.deliver(id, UrlDataCode::Data, Bytes::from_static(b"late"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_wakes_readers() {
        let (tunnel, mut rx) = setup(BridgeConfig::default());
        let mut stream = open(
            &tunnel,
            &mut rx,
            "http://x/a",
            Direction::Input,
            UrlDataCode::Connected,
        )
        .await
        .unwrap();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            stream.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        tunnel.shutdown();
        assert!(reader.await.unwrap().is_err());
    }
}
