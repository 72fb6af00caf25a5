//! Lazy iteration over multi-page listings.

use futures_util::{Stream, stream};
use tracing::debug;

use crate::dispatch::{Dispatcher, Response};
use crate::error::{Error, Result};
use crate::models::{Page, Request};

enum Cursor {
    /// A page that has been requested but not handed out yet.
    Fetched(Response),
    /// The next page is known but has not been requested.
    Next(Request),
    Exhausted,
}

/// Pages of a listing, fetched one at a time as they are consumed
///
/// The set is single pass: pages are handed out in order and the next page is
/// only requested once the caller asks for it. Iterating again means issuing a
/// fresh query.
pub struct PagedResultSet {
    dispatcher: Dispatcher,
    first: Response,
    template: Request,
    cursor: Cursor,
}

impl PagedResultSet {
    /// Build a result set from the response to `request`.
    ///
    /// Follow-up pages reuse the credentials and decoding of `request`.
    pub fn new(dispatcher: Dispatcher, request: Request, first: Response) -> Self {
        Self {
            dispatcher,
            first: first.clone(),
            template: request,
            cursor: Cursor::Fetched(first),
        }
    }

    /// The first page, without advancing the iteration.
    pub async fn first_page(&self) -> Result<Page> {
        self.first.page().await
    }

    /// Total match count reported on the first page.
    pub async fn count(&self) -> Result<u64> {
        let page = self.first_page().await?;
        Ok(page.count.unwrap_or(page.features.len() as u64))
    }

    /// Fetch the next page, or `None` once the server stops linking further.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        let response = match std::mem::replace(&mut self.cursor, Cursor::Exhausted) {
            Cursor::Fetched(response) => response,
            Cursor::Next(request) => {
                debug!(url = %request.url(), "Fetching next page");
                self.dispatcher.response(request)
            }
            Cursor::Exhausted => return Ok(None),
        };

        let page = response.page().await?;
        if let Some(next) = page.next_link() {
            self.cursor = Cursor::Next(self.template.follow(next));
        }
        Ok(Some(page))
    }

    /// Consume the set as a stream of pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<Page>> {
        stream::try_unfold(self, |mut pages| async move {
            Ok::<_, Error>(pages.next_page().await?.map(|page| (page, pages)))
        })
    }
}
