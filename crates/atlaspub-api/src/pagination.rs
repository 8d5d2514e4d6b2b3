//! Cursor-based pagination over list endpoints
//!
//! A [`Paginator`] is a lazy, finite sequence of pages driven by the
//! server's `next_cursor`. It can be restarted from the first page but not
//! resumed after a failure: once a page request fails, the sequence ends
//! and [`Paginator::collect_all`] hands back the pages gathered so far
//! together with the error.

use std::marker::PhantomData;

use futures_util::Stream;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use crate::{client::ApiGateway, ApiError};

/// One page of a list response: `{"data": [...], "next_cursor": "..." | null}`
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct PageBody<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Items gathered by [`Paginator::collect_all`], plus the failure that
/// stopped it early, if any
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResults<T> {
    pub items: Vec<T>,
    pub error: Option<ApiError>,
}

impl<T> PartialResults<T> {
    /// Returns true if every page was fetched
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Discards partial items on failure
    pub fn into_result(self) -> Result<Vec<T>, ApiError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.items),
        }
    }
}

/// Lazy page sequence over one list endpoint
pub struct Paginator<'a, T> {
    gateway: &'a ApiGateway,
    path: String,
    query: Vec<(&'static str, String)>,
    page_size: u32,
    cursor: Option<String>,
    pages_fetched: usize,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: DeserializeOwned> Paginator<'a, T> {
    pub(crate) fn new(
        gateway: &'a ApiGateway,
        path: &str,
        query: Vec<(&'static str, String)>,
        page_size: u32,
    ) -> Self {
        Self {
            gateway,
            path: path.to_string(),
            query,
            page_size: page_size.max(1),
            cursor: None,
            pages_fetched: 0,
            done: false,
            _marker: PhantomData,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Returns true once the last page was returned or a page failed
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Fetches the next page
    ///
    /// Returns `None` when the sequence is exhausted. After an `Err` the
    /// sequence is exhausted as well; call [`restart`](Self::restart) to
    /// begin again from the first page.
    pub async fn next_page(&mut self) -> Option<Result<Vec<T>, ApiError>> {
        if self.done {
            return None;
        }

        let mut query = self.query.clone();
        query.push(("page_size", self.page_size.to_string()));
        if let Some(cursor) = &self.cursor {
            query.push(("cursor", cursor.clone()));
        }

        let page: PageBody<T> = match self
            .gateway
            .call_json(Method::GET, &self.path, None, &query)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        self.pages_fetched += 1;
        let next = page.next_cursor.filter(|c| !c.is_empty());
        if next.is_some() && next == self.cursor {
            warn!(path = %self.path, "Pagination cursor did not advance, stopping");
            self.done = true;
        } else {
            self.done = next.is_none();
            self.cursor = next;
        }

        debug!(
            path = %self.path,
            page = self.pages_fetched,
            items = page.data.len(),
            last = self.done,
            "Fetched page"
        );
        Some(Ok(page.data))
    }

    /// Rewinds to the first page
    pub fn restart(&mut self) {
        self.cursor = None;
        self.pages_fetched = 0;
        self.done = false;
    }

    /// Fetches every remaining page
    pub async fn collect_all(mut self) -> PartialResults<T> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await {
            match page {
                Ok(mut page) => items.append(&mut page),
                Err(error) => {
                    return PartialResults {
                        items,
                        error: Some(error),
                    }
                }
            }
        }
        PartialResults { items, error: None }
    }

    /// Converts the paginator into a stream of pages
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<T>, ApiError>> + 'a
    where
        T: 'a,
    {
        futures_util::stream::unfold(self, |mut paginator| async move {
            paginator.next_page().await.map(|page| (page, paginator))
        })
    }
}
