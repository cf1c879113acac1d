//! Lazy traversal of cursor-linked result pages.
use crate::api::PageSource;
use crate::error::FetchError;
use futures_util::Stream;
use std::collections::HashSet;
use std::marker::PhantomData;
use url::Url;

/// Pull-based iterator over the items of a paged listing.
///
/// Holds exactly one page at a time and fetches the next one only when the
/// current page is exhausted. Traversal is single-shot: build a new iterator
/// to start over. A fetch failure ends the sequence; nothing is retried here.
pub struct PageIterator<'a, T, S: PageSource<T>> {
    source: &'a S,
    next_url: Option<Url>,
    buffer: std::vec::IntoIter<T>,
    visited: HashSet<Url>,
    pages_fetched: usize,
    finished: bool,
    _item: PhantomData<T>,
}

impl<'a, T, S: PageSource<T>> PageIterator<'a, T, S> {
    pub fn new(source: &'a S, first: Url) -> Self {
        Self {
            source,
            next_url: Some(first),
            buffer: Vec::new().into_iter(),
            visited: HashSet::new(),
            pages_fetched: 0,
            finished: false,
            _item: PhantomData,
        }
    }

    pub fn pages_fetched(self: &Self) -> usize {
        self.pages_fetched
    }

    pub async fn next(&mut self) -> Option<Result<T, FetchError>> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(Ok(item));
            }
            if self.finished {
                return None;
            }
            let Some(url) = self.next_url.take() else {
                self.finished = true;
                return None;
            };
            if !self.visited.insert(url.clone()) {
                self.finished = true;
                return Some(Err(FetchError::LinkLoop {
                    url: url.to_string(),
                }));
            }

            match self.source.fetch_page(&url).await {
                Ok(page) => {
                    self.pages_fetched += 1;
                    tracing::debug!(
                        url = %url,
                        items = page.items.len(),
                        has_next = page.next.is_some(),
                        "Fetched page"
                    );
                    self.next_url = page.next;
                    self.buffer = page.items.into_iter();
                }
                Err(source) => {
                    self.finished = true;
                    return Some(Err(FetchError::Http {
                        url: url.to_string(),
                        source,
                    }));
                }
            }
        }
    }

    /// Drain the whole listing, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<T>, FetchError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T, FetchError>> + 'a
    where
        T: 'a,
        S: 'a,
    {
        futures_util::stream::unfold(self, |mut pages| async move {
            let item = pages.next().await?;
            Some((item, pages))
        })
    }
}
