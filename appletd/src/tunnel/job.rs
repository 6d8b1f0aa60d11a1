//! State of one tunneled I/O job.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;

use super::Direction;
use crate::bridge::protocol::{DataCommand, JobId, UrlDataCode};

/// Queue depth beyond which the host is asked to hold.
pub const HOLD_THRESHOLD: usize = 2;

#[derive(Debug, Default)]
pub struct JobState {
    pub connected: bool,
    pub finished: bool,
    pub on_hold: bool,
    pub ready_for_data: bool,
    pub chunks: VecDeque<Bytes>,
    pub error: Option<i32>,
    pub headers: Option<String>,
    pub mime_type: Option<String>,
    pub redirect: Option<String>,
}

#[derive(Debug)]
pub struct Job {
    id: JobId,
    url: String,
    direction: Direction,
    state: Mutex<JobState>,
    changed: Notify,
}

fn text(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

impl Job {
    pub fn new(id: JobId, url: impl Into<String>, direction: Direction) -> Self {
        Self {
            id,
            url: url.into(),
            direction,
            state: Mutex::new(JobState::default()),
            changed: Notify::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(job = %self.id, "Job mutex poisoned");
            poisoned.into_inner()
        })
    }

    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Fold one `URLData` signal into the state.
    ///
    /// Returns a flow-control command the caller must send to the host.
    pub fn apply(&self, code: UrlDataCode, data: Bytes) -> Option<DataCommand> {
        let mut command = None;
        {
            let mut state = self.lock();
            match code {
                UrlDataCode::Data => {
                    state.connected = true;
                    if !data.is_empty() {
                        state.chunks.push_back(data);
                    }
                    if state.chunks.len() > HOLD_THRESHOLD && !state.on_hold {
                        state.on_hold = true;
                        command = Some(DataCommand::Hold);
                    }
                }
                UrlDataCode::Finished => {
                    state.connected = true;
                    state.finished = true;
                }
                UrlDataCode::ErrorCode => {
                    let raw = text(&data);
                    let code = raw.trim().parse().unwrap_or_else(|_| {
                        tracing::warn!(job = %self.id, error_code = %raw, "Non-numeric error code");
                        -1
                    });
                    state.error = Some(code);
                    state.finished = true;
                }
                UrlDataCode::Headers => state.headers = Some(text(&data)),
                UrlDataCode::Redirect => state.redirect = Some(text(&data)),
                UrlDataCode::MimeType => state.mime_type = Some(text(&data)),
                UrlDataCode::Connected => state.connected = true,
                UrlDataCode::RequestData => state.ready_for_data = true,
            }
        }
        self.changed.notify_waiters();
        command
    }

    /// Fail the job locally, waking every waiter.
    pub fn abort(&self) {
        {
            let mut state = self.lock();
            if !state.finished {
                state.finished = true;
                state.error.get_or_insert(-1);
            }
        }
        self.changed.notify_waiters();
    }
}
