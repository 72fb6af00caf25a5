//! Bounded request dispatcher
//!
//! `workers` long-lived tasks drain one shared FIFO queue, so at most
//! `workers` exchanges are in flight and requests start in dispatch order.
//! Raw downloads that carry a destination are streamed straight to disk.

use futures_util::StreamExt;
use reqwest::{
    Client,
    header::{self, HeaderMap, HeaderValue},
};
use std::{path::Path, sync::Arc};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    runtime::Handle,
    sync::{Mutex, mpsc},
};
use tracing::{Instrument, Level, Span, debug, span, trace, warn};

use super::pending::{Completer, Outcome, PendingResult};
use super::response::Response;
use crate::error::{ApiError, Result, TransportError};
use crate::models::{BodyKind, Payload, Request, target_name};
use crate::util::parse_content_disposition;

/// Default number of concurrent exchanges.
pub const DEFAULT_WORKERS: usize = 4;

struct Job {
    request: Request,
    completer: Completer,
    span: Span,
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

struct Inner {
    queue: mpsc::UnboundedSender<Job>,
    workers: usize,
}

/// Shared, cheaply cloneable request executor
///
/// Workers stop once every clone has been dropped and the queue is drained.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.inner.workers)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher on the current tokio runtime.
    ///
    /// Panics when called outside a runtime; use [`Dispatcher::with_runtime`]
    /// to hand it a runtime explicitly.
    pub fn new(workers: usize) -> Self {
        Self::with_runtime(workers, Handle::current())
    }

    pub fn with_runtime(workers: usize, runtime: Handle) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        // only fails if the TLS backend cannot initialise, fall back to reqwest's defaults then
        let http = Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client, using defaults");
                Client::new()
            });

        Self::with_http(workers, runtime, http)
    }

    pub fn with_http(workers: usize, runtime: Handle, http: Client) -> Self {
        let workers = workers.max(1);
        let (queue, jobs) = mpsc::unbounded_channel();
        let jobs: JobQueue = Arc::new(Mutex::new(jobs));

        for id in 0..workers {
            let worker = Worker {
                id,
                http: http.clone(),
            };
            runtime.spawn(worker.run(jobs.clone()));
        }

        Self {
            inner: Arc::new(Inner { queue, workers }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Queue `request` and return immediately.
    ///
    /// Transport failures never surface here; they become the terminal value
    /// of the returned result.
    pub fn dispatch(&self, request: Request) -> PendingResult {
        let (pending, completer) = PendingResult::new();

        let span = span!(
            Level::DEBUG,
            "dispatch",
            method = %request.method(),
            url = %request.url()
        );

        let job = Job {
            request,
            completer,
            span,
        };
        // the rejected job drops its completer, which abandons the result
        if self.inner.queue.send(job).is_err() {
            warn!("Dispatcher workers are gone, request abandoned");
        }

        pending
    }

    /// Dispatch `request` and wrap the result for decoding.
    pub fn response(&self, request: Request) -> Response {
        let kind = request.kind();
        let name = request.name().map(str::to_string);
        Response::new(self.dispatch(request), kind, name)
    }

    /// Dispatch and wait, for exchanges that are sequential by nature.
    ///
    /// Only the calling task waits; the pool keeps serving other requests.
    pub async fn dispatch_and_wait(&self, request: Request) -> Result<Arc<Payload>> {
        Ok(self.dispatch(request).wait().await?)
    }
}

struct Worker {
    id: usize,
    http: Client,
}

impl Worker {
    async fn run(self, jobs: JobQueue) {
        trace!(worker = self.id, "Worker started");
        loop {
            // the lock is only held while waiting for the next job, so jobs
            // leave the queue in the order they were sent
            let job = jobs.lock().await.recv().await;
            let Some(Job {
                request,
                completer,
                span,
            }) = job
            else {
                break;
            };

            let outcome = self.execute(&request).instrument(span.clone()).await;
            span.in_scope(|| completer.complete(outcome));
        }
        trace!(worker = self.id, "Worker stopped");
    }

    async fn execute(&self, request: &Request) -> Outcome {
        let url = request.url();
        let auth = request.auth().ok_or(TransportError::MissingApiKey)?;

        debug!(worker = self.id, params = request.params().len(), "Sending request");

        let mut builder = self
            .http
            .request(request.method().clone(), url)
            .header(header::AUTHORIZATION, auth.header_value());
        if !request.params().is_empty() {
            builder = builder.query(request.params());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::connection(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "Request rejected");
            return Err(TransportError::Api {
                url: url.to_string(),
                error: ApiError::from_status(status.as_u16(), body),
            });
        }

        let file_name = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|cd| cd.to_str().ok())
            .and_then(parse_content_disposition);
        let content_length = response.content_length();

        let payload = match (request.kind(), request.destination()) {
            (BodyKind::Raw, Some(dir)) => {
                let path = dir.join(target_name(file_name.as_deref(), request.name(), url));
                let written = stream_to_file(response, url, &path, content_length).await?;
                Payload::stored(url, path, written)
            }
            _ => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| TransportError::connection(url, e))?;
                debug!(bytes = bytes.len(), "Request complete");
                Payload::new(url, bytes.to_vec())
            }
        };

        Ok(Arc::new(
            payload
                .with_content_length(content_length)
                .with_file_name(file_name),
        ))
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    url: &str,
    path: &Path,
    total: Option<u64>,
) -> std::result::Result<u64, TransportError> {
    let mut file = File::create(path)
        .await
        .map_err(|e| TransportError::storage(url, path, e))?;

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                // a truncated file must not pass for a finished download
                if let Err(remove) = tokio::fs::remove_file(path).await {
                    warn!(path = ?path, error = %remove, "Failed to remove partial download");
                }
                return Err(TransportError::connection(url, e));
            }
        };
        file.write_all(&chunk)
            .await
            .map_err(|e| TransportError::storage(url, path, e))?;
        written += chunk.len() as u64;
        trace!(written, total = ?total, "Chunk written");
    }

    file.flush()
        .await
        .map_err(|e| TransportError::storage(url, path, e))?;

    debug!(path = ?path, bytes = written, "Download stored");
    Ok(written)
}
