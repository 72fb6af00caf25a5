use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use super::pending::{Outcome, PendingResult};
use crate::error::{Error, Result};
use crate::models::{BodyKind, Page, Payload};

/// Decoded body of a finished response
#[derive(Debug, Clone)]
pub enum Body {
    Raw(Arc<Payload>),
    Json(Value),
    Page(Page),
}

impl Body {
    pub fn into_page(self) -> Option<Page> {
        match self {
            Body::Page(page) => Some(page),
            _ => None,
        }
    }
}

/// A dispatched request whose body may not have arrived yet
///
/// Cloning is cheap; every clone observes the same outcome.
#[derive(Debug, Clone)]
pub struct Response {
    pending: PendingResult,
    kind: BodyKind,
    name: Option<String>,
}

impl Response {
    pub(crate) fn new(pending: PendingResult, kind: BodyKind, name: Option<String>) -> Self {
        Self {
            pending,
            kind,
            name,
        }
    }

    /// A response that has already finished, for callers that produce bodies
    /// without going through a dispatcher.
    pub fn ready(outcome: Outcome, kind: BodyKind, name: Option<String>) -> Self {
        Self::new(PendingResult::ready(outcome), kind, name)
    }

    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    /// Content name of this response, e.g. the scene id of a download.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_complete()
    }

    /// Content length reported by the transport. `None` while pending, on
    /// failure, or when the server did not send one.
    pub fn size(&self) -> Option<u64> {
        match self.pending.try_outcome()? {
            Ok(payload) => payload.content_length(),
            Err(_) => None,
        }
    }

    /// Wait for the response and decode it as declared.
    pub async fn body(&self) -> Result<Body> {
        self.decode(self.pending.wait().await)
    }

    /// Blocking variant of [`Response::body`] for callers outside a runtime.
    pub fn body_blocking(&self) -> Result<Body> {
        self.decode(self.pending.wait_blocking())
    }

    /// The decoded body if the response has finished, without waiting.
    ///
    /// This is the accessor to use inside [`Response::on_complete`] callbacks.
    pub fn try_body(&self) -> Option<Result<Body>> {
        self.pending.try_outcome().map(|outcome| self.decode(outcome))
    }

    /// The raw outcome if the response has finished, without waiting or decoding.
    pub fn try_payload(&self) -> Option<Outcome> {
        self.pending.try_outcome()
    }

    /// Run `callback` exactly once with this response when it finishes.
    ///
    /// Fires immediately on the calling thread if the response is already
    /// complete, otherwise on the dispatcher worker that completes it.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        let this = self.clone();
        self.pending.on_complete(move || callback(&this));
    }

    /// Wait for the raw payload regardless of the declared decoding.
    pub async fn payload(&self) -> Result<Arc<Payload>> {
        Ok(self.pending.wait().await?)
    }

    pub async fn json<T: DeserializeOwned>(&self) -> Result<T> {
        self.payload().await?.json()
    }

    pub async fn page(&self) -> Result<Page> {
        let payload = self.payload().await?;
        decode_page(&payload)
    }

    fn decode(&self, outcome: Outcome) -> Result<Body> {
        let payload = outcome?;
        match self.kind {
            BodyKind::Raw => Ok(Body::Raw(payload)),
            BodyKind::Json => payload.json().map(Body::Json),
            BodyKind::Paged => decode_page(&payload).map(Body::Page),
        }
    }
}

fn decode_page(payload: &Payload) -> Result<Page> {
    serde_json::from_slice(payload.bytes()).map_err(|source| Error::Decode {
        context: "scene page",
        source,
    })
}
