//! Paged (cursor-driven) fetching layered over the single-value machinery.
//!
//! A paged entry caches an [`InfinitePages`] list as its one data value. The
//! [`InfiniteBehavior`] wraps the registered fetch function: appending fetches
//! one page with the next cursor, refetching replays the whole list from the
//! first page so cursors derived from page contents stay consistent. The
//! whole replay is a single fetch execution, so retry restarts it from the
//! first page rather than resuming mid-list.

use std::sync::Arc;

use tracing::trace;

use crate::query::{BehaviorContext, FetchBehavior, FetchContext, FetchFuture, FetchKind};
use crate::state::SharedData;

/// One fetched page and the cursor it was fetched with.
#[derive(Clone)]
pub struct Page {
    /// The page's data.
    pub data: SharedData,
    /// Cursor used to fetch this page; `None` for a first page fetched
    /// without an explicit cursor.
    pub param: Option<SharedData>,
}

/// Ordered page list cached by a paged entry.
#[derive(Clone, Default)]
pub struct InfinitePages {
    pages: Vec<Page>,
}

impl InfinitePages {
    /// The pages, oldest first.
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no pages have been fetched.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The most recently appended page.
    pub fn last(&self) -> Option<&Page> {
        self.pages.last()
    }

    /// Typed view of every page, in order. `None` if any page is not a `T`.
    pub fn typed<T: Send + Sync + 'static>(&self) -> Option<Vec<Arc<T>>> {
        self.pages
            .iter()
            .map(|page| page.data.clone().downcast::<T>().ok())
            .collect()
    }

    fn push(&mut self, page: Page) {
        self.pages.push(page);
    }

    fn evict_to(&mut self, max_pages: Option<usize>) {
        if let Some(max) = max_pages {
            let max = max.max(1);
            while self.pages.len() > max {
                // Oldest page goes first.
                self.pages.remove(0);
            }
        }
    }
}

impl std::fmt::Debug for InfinitePages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfinitePages")
            .field("len", &self.pages.len())
            .finish()
    }
}

/// Derives the cursor for the page after the ones fetched so far. `None`
/// means the list is complete.
pub type NextParamFn = Arc<dyn Fn(&InfinitePages) -> Option<SharedData> + Send + Sync>;

/// Configuration of a paged entry.
#[derive(Clone)]
pub struct InfiniteOptions {
    /// Cursor for the first page; `None` lets the fetch function default.
    pub initial_param: Option<SharedData>,
    /// Retention bound on the page list. Appending beyond it evicts the
    /// oldest page. `None` keeps every page.
    pub max_pages: Option<usize>,
    /// Cursor derivation for the next page.
    pub next_param: NextParamFn,
}

/// [`FetchBehavior`] that turns a single-page fetch function into page-list
/// maintenance.
pub(crate) struct InfiniteBehavior {
    pub options: InfiniteOptions,
}

impl InfiniteBehavior {
    fn previous_pages(ctx: &BehaviorContext) -> InfinitePages {
        ctx.previous
            .as_ref()
            .and_then(|data| data.downcast_ref::<InfinitePages>())
            .cloned()
            .unwrap_or_default()
    }

    async fn fetch_page(
        ctx: &BehaviorContext,
        param: Option<SharedData>,
    ) -> anyhow::Result<Page> {
        let data = (ctx.fetch)(FetchContext {
            key: ctx.key.clone(),
            cancel: ctx.cancel.clone(),
            page_param: param.clone(),
        })
        .await?;
        Ok(Page { data, param })
    }
}

impl FetchBehavior for InfiniteBehavior {
    fn run(&self, ctx: BehaviorContext) -> FetchFuture {
        let options = self.options.clone();
        Box::pin(async move {
            let previous = Self::previous_pages(&ctx);
            let mut pages = match ctx.kind {
                FetchKind::NextPage => {
                    let mut pages = previous;
                    let param = if pages.is_empty() {
                        options.initial_param.clone()
                    } else {
                        match (options.next_param)(&pages) {
                            Some(param) => Some(param),
                            // List complete: appending is a no-op.
                            None => {
                                trace!(key = %ctx.key.debug_repr(), "no next page, keeping list");
                                return Ok(Arc::new(pages) as SharedData);
                            }
                        }
                    };
                    let page = Self::fetch_page(&ctx, param).await?;
                    pages.push(page);
                    pages
                }
                FetchKind::Refetch => {
                    // Replay the list from the first page, re-deriving each
                    // cursor from the pages fetched so far.
                    let target = previous.len().max(1);
                    let mut pages = InfinitePages::default();
                    for index in 0..target {
                        let param = if index == 0 {
                            options.initial_param.clone()
                        } else {
                            match (options.next_param)(&pages) {
                                Some(param) => Some(param),
                                None => break,
                            }
                        };
                        let page = Self::fetch_page(&ctx, param).await?;
                        pages.push(page);
                    }
                    pages
                }
            };
            pages.evict_to(options.max_pages);
            Ok(Arc::new(pages) as SharedData)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    // Fetch function serving pages of consecutive integers; the cursor is
    // the next page's start offset.
    fn counting_fetch(calls: Arc<AtomicUsize>) -> crate::query::FetchFn {
        Arc::new(move |ctx: FetchContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            let start = ctx
                .page_param
                .and_then(|p| p.downcast_ref::<usize>().copied())
                .unwrap_or(0);
            Box::pin(async move { Ok(Arc::new((start..start + 3).collect::<Vec<usize>>()) as SharedData) })
        })
    }

    fn offset_cursor() -> NextParamFn {
        Arc::new(|pages: &InfinitePages| {
            let fetched: usize = pages.len() * 3;
            if fetched >= 9 {
                None // three pages is the whole data set
            } else {
                Some(Arc::new(fetched) as SharedData)
            }
        })
    }

    fn behavior(max_pages: Option<usize>) -> InfiniteBehavior {
        InfiniteBehavior {
            options: InfiniteOptions {
                initial_param: None,
                max_pages,
                next_param: offset_cursor(),
            },
        }
    }

    fn context(kind: FetchKind, fetch: crate::query::FetchFn, previous: Option<SharedData>) -> BehaviorContext {
        BehaviorContext {
            key: query_key!["feed"],
            kind,
            cancel: CancellationToken::new(),
            fetch,
            previous,
        }
    }

    fn as_pages(data: SharedData) -> InfinitePages {
        data.downcast_ref::<InfinitePages>().unwrap().clone()
    }

    #[tokio::test]
    async fn test_appending_extends_the_list() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone());
        let behavior = behavior(None);

        let first = behavior
            .run(context(FetchKind::NextPage, fetch.clone(), None))
            .await
            .unwrap();
        let pages = as_pages(first.clone());
        assert_eq!(pages.len(), 1);
        assert_eq!(*pages.typed::<Vec<usize>>().unwrap()[0], vec![0, 1, 2]);

        let second = behavior
            .run(context(FetchKind::NextPage, fetch, Some(first)))
            .await
            .unwrap();
        let pages = as_pages(second);
        assert_eq!(pages.len(), 2);
        assert_eq!(*pages.typed::<Vec<usize>>().unwrap()[1], vec![3, 4, 5]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_append_past_the_end_is_a_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone());
        let behavior = behavior(None);

        let mut data = None;
        for _ in 0..5 {
            data = Some(
                behavior
                    .run(context(FetchKind::NextPage, fetch.clone(), data))
                    .await
                    .unwrap(),
            );
        }
        // The cursor refuses a fourth page.
        assert_eq!(as_pages(data.unwrap()).len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refetch_replays_every_page() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone());
        let behavior = behavior(None);

        let mut data = None;
        for _ in 0..3 {
            data = Some(
                behavior
                    .run(context(FetchKind::NextPage, fetch.clone(), data))
                    .await
                    .unwrap(),
            );
        }
        calls.store(0, Ordering::SeqCst);

        let refetched = behavior
            .run(context(FetchKind::Refetch, fetch, data))
            .await
            .unwrap();
        assert_eq!(as_pages(refetched).len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "one fetch per page");
    }

    #[tokio::test]
    async fn test_max_pages_evicts_oldest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone());
        let behavior = behavior(Some(2));

        let mut data = None;
        for _ in 0..3 {
            data = Some(
                behavior
                    .run(context(FetchKind::NextPage, fetch.clone(), data))
                    .await
                    .unwrap(),
            );
        }
        let pages = as_pages(data.unwrap());
        assert_eq!(pages.len(), 2);
        let typed = pages.typed::<Vec<usize>>().unwrap();
        assert_eq!(*typed[0], vec![3, 4, 5]);
        assert_eq!(*typed[1], vec![6, 7, 8]);
    }
}
