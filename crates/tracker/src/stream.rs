// crates/tracker/src/stream.rs
//! Per-job streaming update channel.
//!
//! [`JobStream::connect`] never fails synchronously: it hands back a
//! handle at once and spawns the connect/read task; handshake rejections,
//! missing bodies and transport failures all arrive as
//! [`StreamEvent::Error`] on the queue. The controller turns those into a
//! polling fallback instead of surfacing them.

use std::sync::Arc;

use futures_util::StreamExt;
use spendlens_api::ApiClient;
use spendlens_types::JobUpdate;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sse::EventStreamParser;

/// Why a stream stopped delivering.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The handshake never succeeded.
    #[error("stream connect failed: {0}")]
    Connect(String),
    /// The connection died mid-stream.
    #[error("stream interrupted: {0}")]
    Transport(String),
}

/// Events delivered by a [`JobStream`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A record whose payload parsed as a job update.
    Update { event: String, update: JobUpdate },
    /// A record whose payload did not conform. Delivered, never dropped.
    Raw { event: String, data: String },
    /// Connect or transport failure; the stream is dead.
    Error(StreamError),
    /// The server ended the stream.
    Closed,
}

const EVENT_QUEUE: usize = 64;

/// Handle to one job's event stream.
///
/// `close` is idempotent and callable from anywhere; events queued before
/// the cancellation may still be observed once afterwards, which callers
/// treat as stale-but-harmless.
pub struct JobStream {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl JobStream {
    /// Spawn the reader task for `job_id` and return immediately. The
    /// bearer token is read fresh inside the connect call, never reused
    /// from an earlier attempt.
    pub fn connect(api: Arc<ApiClient>, job_id: &str) -> Self {
        let (tx, events) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            read_stream(api, id, tx, task_cancel).await;
        });
        Self { events, cancel }
    }

    /// Next event, or `None` once the reader is gone and the queue is
    /// drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop the reader. Safe to call any number of times.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_stream(
    api: Arc<ApiClient>,
    job_id: String,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let resp = tokio::select! {
        _ = cancel.cancelled() => return,
        resp = api.open_job_events(&job_id) => resp,
    };
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            let _ = tx
                .send(StreamEvent::Error(StreamError::Connect(e.to_string())))
                .await;
            return;
        }
    };

    let mut body = resp.bytes_stream();
    let mut parser = EventStreamParser::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    for record in parser.push(&bytes) {
                        let event = match serde_json::from_str::<JobUpdate>(&record.data) {
                            Ok(update) => StreamEvent::Update {
                                event: record.name,
                                update,
                            },
                            Err(e) => {
                                debug!(job_id = %job_id, error = %e, "non-conforming stream payload, delivering raw");
                                StreamEvent::Raw {
                                    event: record.name,
                                    data: record.data,
                                }
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx
                        .send(StreamEvent::Error(StreamError::Transport(e.to_string())))
                        .await;
                    return;
                }
                None => {
                    let _ = tx.send(StreamEvent::Closed).await;
                    return;
                }
            }
        }
    }
}
