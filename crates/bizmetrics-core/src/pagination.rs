//! Accumulation of paginated upstream responses.

use std::future::Future;

use crate::error::{MetricsError, Result};

/// One page of an upstream response.
#[derive(Clone, Debug, PartialEq)]
pub struct Page<T, C> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Cursor for the following page; `None` on the last page.
    pub next: Option<C>,
}

impl<T, C> Page<T, C> {
    /// A final page.
    #[must_use]
    pub const fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }

    /// A page followed by another.
    #[must_use]
    pub const fn more(items: Vec<T>, next: C) -> Self {
        Self {
            items,
            next: Some(next),
        }
    }
}

/// Fetches pages until one has no cursor and returns every item in order.
///
/// `fetch_page` receives `None` for the first page and the previous page's
/// cursor afterwards. Any page error aborts the whole fetch, so callers never
/// see a partial result. More than `max_pages` pages is treated as a broken
/// upstream cursor.
pub async fn collect_pages<T, C, F, Fut>(
    connector: &str,
    max_pages: usize,
    mut fetch_page: F,
) -> Result<Vec<T>>
where
    F: FnMut(Option<C>) -> Fut,
    Fut: Future<Output = Result<Page<T, C>>>,
{
    let mut items = Vec::new();
    let mut cursor = None;

    for _ in 0..max_pages {
        let page = fetch_page(cursor.take()).await?;
        items.extend(page.items);
        match page.next {
            Some(next) => cursor = Some(next),
            None => return Ok(items),
        }
    }

    Err(MetricsError::data(
        connector,
        format!("pagination did not finish within {max_pages} pages"),
    ))
}
