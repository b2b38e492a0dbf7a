//! Cursor pagination flattened into lazy item streams.

use super::models::{FileQuery, Page, PageRequest, RemoteFile, SessionQuery, SessionSummary};
use super::ControlPlane;
use crate::error::{IngestError, IngestResult};
use async_stream::try_stream;
use futures::Stream;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Flatten a cursor-paginated endpoint into a stream of items.
///
/// Nothing is fetched until the stream is polled. The stream ends at the
/// end-of-results marker or at an empty page. A cursor handed out twice
/// would loop forever and ends the stream with an error.
pub fn paginate<T, F, Fut>(page_size: u32, mut fetch: F) -> impl Stream<Item = IngestResult<T>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = IngestResult<Page<T>>>,
{
    let limit = page_size.clamp(1, MAX_PAGE_SIZE);
    try_stream! {
        let mut cursor: Option<String> = None;
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            let request = PageRequest { cursor: cursor.clone(), limit };
            let page = fetch(request).await?;
            let next = page.continuation().map(str::to_string);
            let empty = page.data.is_empty();

            for item in page.data {
                yield item;
            }

            match next {
                Some(next) if !empty => {
                    if !seen.insert(next.clone()) {
                        Err::<(), _>(IngestError::MalformedResponse {
                            message: format!("Server repeated pagination cursor {}", next),
                        })?;
                    }
                    debug!(cursor = %next, "Fetching next page");
                    cursor = Some(next);
                }
                _ => break,
            }
        }
    }
}

/// Lists remote files and sessions page by page
#[derive(Clone)]
pub struct PaginatedLister {
    api: Arc<dyn ControlPlane>,
    page_size: u32,
}

impl PaginatedLister {
    pub fn new(api: Arc<dyn ControlPlane>, page_size: u32) -> Self {
        Self { api, page_size }
    }

    pub fn files(
        &self,
        workspace: &str,
        query: FileQuery,
    ) -> impl Stream<Item = IngestResult<RemoteFile>> + Send + 'static {
        let api = self.api.clone();
        let workspace = workspace.to_string();
        let query = Arc::new(query);
        paginate(self.page_size, move |page| {
            let api = api.clone();
            let workspace = workspace.clone();
            let query = query.clone();
            async move { api.list_files(&workspace, &query, page).await }
        })
    }

    pub fn sessions(
        &self,
        workspace: &str,
        query: SessionQuery,
    ) -> impl Stream<Item = IngestResult<SessionSummary>> + Send + 'static {
        let api = self.api.clone();
        let workspace = workspace.to_string();
        let query = Arc::new(query);
        paginate(self.page_size, move |page| {
            let api = api.clone();
            let workspace = workspace.clone();
            let query = query.clone();
            async move { api.list_sessions(&workspace, &query, page).await }
        })
    }
}

impl std::fmt::Debug for PaginatedLister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginatedLister")
            .field("page_size", &self.page_size)
            .finish()
    }
}
