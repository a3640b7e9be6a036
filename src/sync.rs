//! Library sync engine.
//!
//! Drives the paged library-state RPC against the local index. The first
//! pass enumerates the whole library (resumable across restarts via the
//! persisted page cursor); after that, each pass sends the saved state
//! token and receives only the delta. Refreshes are throttled so bursts of
//! callers share one pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::index::{CursorUpdate, IndexError, LocalIndex};
use crate::mapper::LibraryPage;
use crate::protocol::{ProtocolClient, ProtocolError};

/// Refreshes closer together than this are coalesced, unless forced.
pub const DEFAULT_REFRESH_THROTTLE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Seam over the paged library-state fetch so the engine is testable
/// without a network.
#[async_trait]
pub trait LibrarySource: Send + Sync {
    async fn fetch_library_page(
        &self,
        state_token: &str,
        page_token: &str,
        cancel: &CancellationToken,
    ) -> Result<LibraryPage, ProtocolError>;
}

#[async_trait]
impl LibrarySource for ProtocolClient {
    async fn fetch_library_page(
        &self,
        state_token: &str,
        page_token: &str,
        cancel: &CancellationToken,
    ) -> Result<LibraryPage, ProtocolError> {
        ProtocolClient::fetch_library_page(self, state_token, page_token, cancel).await
    }
}

pub struct SyncEngine {
    source: Arc<dyn LibrarySource>,
    index: Arc<dyn LocalIndex>,
    throttle: Duration,
    /// Serializes refresh passes; waiters piggyback on the holder's result
    /// via the freshness check they run once they acquire it.
    refresh: Mutex<()>,
    /// Set when a local mutation made the index stale; the next
    /// `ensure_fresh` bypasses the throttle.
    dirty: AtomicBool,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn LibrarySource>, index: Arc<dyn LocalIndex>) -> Self {
        Self {
            source,
            index,
            throttle: DEFAULT_REFRESH_THROTTLE,
            refresh: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Flag the index as stale after a local mutation (upload, trash).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Bring the index up to date if it needs it: run the initial
    /// enumeration when it has never completed, otherwise an incremental
    /// pass when the index is dirty or the throttle window has lapsed.
    pub async fn ensure_fresh(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let _guard = self.refresh.lock().await;

        let cursor = self.index.cursor().await?;
        if !cursor.init_complete {
            info!("starting initial library enumeration");
            self.run_pass(true, cancel).await?;
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let age = Utc::now().timestamp() - cursor.last_sync;
        let stale = age >= self.throttle.as_secs() as i64;
        let dirty = self.dirty.swap(false, Ordering::SeqCst);
        if !dirty && !stale {
            debug!(age_secs = age, "index fresh enough, skipping refresh");
            return Ok(());
        }

        if let Err(e) = self.run_pass(false, cancel).await {
            // Preserve the staleness signal for the next caller.
            if dirty {
                self.dirty.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Refresh unconditionally, ignoring the throttle.
    pub async fn refresh_now(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let _guard = self.refresh.lock().await;
        let cursor = self.index.cursor().await?;
        self.run_pass(!cursor.init_complete, cancel).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// One full pass: drain pages until the continuation token runs out.
    /// Each page is applied atomically together with its cursor advance, so
    /// an interruption resumes from the last applied page.
    async fn run_pass(&self, initial: bool, cancel: &CancellationToken) -> Result<(), SyncError> {
        let cursor = self.index.cursor().await?;
        let state_token = if initial {
            String::new()
        } else {
            cursor.state_token.clone()
        };
        // An interrupted initial pass left its continuation token behind.
        let mut page_token = if initial {
            cursor.page_token.clone()
        } else {
            String::new()
        };

        let mut pages = 0u32;
        let mut total_items = 0usize;
        let mut total_deleted = 0usize;
        loop {
            let page = self
                .source
                .fetch_library_page(&state_token, &page_token, cancel)
                .await?;
            pages += 1;
            total_items += page.items.len();
            total_deleted += page.deleted_keys.len();

            let done = page.next_page_token.is_empty();
            let mut update = CursorUpdate {
                page_token: Some(page.next_page_token.clone()),
                ..CursorUpdate::default()
            };
            if !page.state_token.is_empty() {
                update.state_token = Some(page.state_token.clone());
            }
            if done {
                update.last_sync = Some(Utc::now().timestamp());
                if initial {
                    update.init_complete = Some(true);
                }
            }

            self.index
                .apply_page(&page.items, &page.deleted_keys, update)
                .await?;

            if done {
                break;
            }
            page_token = page.next_page_token;
        }

        info!(
            initial,
            pages,
            items = total_items,
            deleted = total_deleted,
            "library pass complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{MediaItem, MediaKind, SqliteIndex};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedSource {
        pages: StdMutex<VecDeque<Result<LibraryPage, ProtocolError>>>,
        /// (state_token, page_token) per fetch.
        fetches: StdMutex<Vec<(String, String)>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<LibraryPage, ProtocolError>>) -> Arc<Self> {
            Arc::new(Self {
                pages: StdMutex::new(pages.into()),
                fetches: StdMutex::new(Vec::new()),
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LibrarySource for ScriptedSource {
        async fn fetch_library_page(
            &self,
            state_token: &str,
            page_token: &str,
            _cancel: &CancellationToken,
        ) -> Result<LibraryPage, ProtocolError> {
            self.fetches
                .lock()
                .unwrap()
                .push((state_token.to_string(), page_token.to_string()));
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .expect("no more scripted pages")
        }
    }

    fn item(key: &str) -> MediaItem {
        MediaItem::new(
            key.to_string(),
            format!("{key}.jpg"),
            format!("dk-{key}"),
            MediaKind::Photo,
        )
    }

    fn page(keys: &[&str], next: &str, state: &str) -> Result<LibraryPage, ProtocolError> {
        Ok(LibraryPage {
            state_token: state.to_string(),
            next_page_token: next.to_string(),
            items: keys.iter().map(|k| item(k)).collect(),
            deleted_keys: vec![],
        })
    }

    async fn engine(
        source: Arc<ScriptedSource>,
    ) -> (SyncEngine, Arc<SqliteIndex>) {
        let index = Arc::new(SqliteIndex::open_in_memory().unwrap());
        let engine = SyncEngine::new(source, index.clone());
        (engine, index)
    }

    #[tokio::test]
    async fn initial_pass_pages_to_completion() {
        let source = ScriptedSource::new(vec![
            page(&["a", "b"], "p2", ""),
            page(&["c"], "", "state-final"),
        ]);
        let (engine, index) = engine(source.clone()).await;

        engine.ensure_fresh(&CancellationToken::new()).await.unwrap();

        let cursor = index.cursor().await.unwrap();
        assert!(cursor.init_complete);
        assert_eq!(cursor.state_token, "state-final");
        assert_eq!(cursor.page_token, "");
        assert!(cursor.last_sync > 0);

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total, 3);

        // Second page resumed with the continuation token.
        let fetches = source.fetches.lock().unwrap();
        assert_eq!(*fetches, vec![("".into(), "".into()), ("".into(), "p2".into())]);
    }

    #[tokio::test]
    async fn interrupted_initial_pass_resumes_from_page_cursor() {
        let source = ScriptedSource::new(vec![
            page(&["a"], "p2", ""),
            Err(ProtocolError::Server { status: 503 }),
        ]);
        let (engine, index) = engine(source.clone()).await;

        engine
            .ensure_fresh(&CancellationToken::new())
            .await
            .unwrap_err();

        // First page landed; cursor points at the continuation.
        let cursor = index.cursor().await.unwrap();
        assert!(!cursor.init_complete);
        assert_eq!(cursor.page_token, "p2");
        assert_eq!(index.stats().await.unwrap().total, 1);

        // A fresh engine over the same index resumes, not restarts.
        let source2 = ScriptedSource::new(vec![page(&["b"], "", "s1")]);
        let engine2 = SyncEngine::new(source2.clone(), index.clone());
        engine2
            .ensure_fresh(&CancellationToken::new())
            .await
            .unwrap();

        let fetches = source2.fetches.lock().unwrap();
        assert_eq!(*fetches, vec![("".into(), "p2".into())]);
        let cursor = index.cursor().await.unwrap();
        assert!(cursor.init_complete);
        assert_eq!(index.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn throttle_coalesces_back_to_back_refreshes() {
        let source = ScriptedSource::new(vec![page(&["a"], "", "s1")]);
        let (engine, _index) = engine(source.clone()).await;

        let cancel = CancellationToken::new();
        engine.ensure_fresh(&cancel).await.unwrap();
        // Fresh and not dirty: no fetch.
        engine.ensure_fresh(&cancel).await.unwrap();
        engine.ensure_fresh(&cancel).await.unwrap();
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn incremental_pass_sends_state_token() {
        let source = ScriptedSource::new(vec![
            page(&["a"], "", "s1"),
            page(&["b"], "", "s2"),
        ]);
        let (engine, index) = engine(source.clone()).await;
        let cancel = CancellationToken::new();

        engine.ensure_fresh(&cancel).await.unwrap();
        engine.mark_dirty();
        engine.ensure_fresh(&cancel).await.unwrap();

        let fetches = source.fetches.lock().unwrap();
        assert_eq!(fetches[1], ("s1".to_string(), "".to_string()));
        assert_eq!(index.cursor().await.unwrap().state_token, "s2");
        assert_eq!(index.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn refresh_now_ignores_throttle() {
        let source = ScriptedSource::new(vec![
            page(&["a"], "", "s1"),
            page(&[], "", "s2"),
        ]);
        let (engine, _index) = engine(source.clone()).await;
        let cancel = CancellationToken::new();

        engine.ensure_fresh(&cancel).await.unwrap();
        engine.refresh_now(&cancel).await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn failed_dirty_refresh_stays_dirty() {
        let source = ScriptedSource::new(vec![
            page(&["a"], "", "s1"),
            Err(ProtocolError::Server { status: 500 }),
            page(&["b"], "", "s2"),
        ]);
        let (engine, index) = engine(source.clone()).await;
        let cancel = CancellationToken::new();

        engine.ensure_fresh(&cancel).await.unwrap();
        engine.mark_dirty();
        engine.ensure_fresh(&cancel).await.unwrap_err();
        // The flag survived the failure, so this retries despite the
        // throttle window.
        engine.ensure_fresh(&cancel).await.unwrap();

        assert_eq!(source.fetch_count(), 3);
        assert_eq!(index.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn deletions_remove_indexed_items() {
        let source = ScriptedSource::new(vec![
            page(&["a", "b"], "", "s1"),
            Ok(LibraryPage {
                state_token: "s2".into(),
                next_page_token: String::new(),
                items: vec![],
                deleted_keys: vec!["a".into()],
            }),
        ]);
        let (engine, index) = engine(source.clone()).await;
        let cancel = CancellationToken::new();

        engine.ensure_fresh(&cancel).await.unwrap();
        engine.mark_dirty();
        engine.ensure_fresh(&cancel).await.unwrap();

        assert!(index.get_by_media_key("a").await.unwrap().is_none());
        assert!(index.get_by_media_key("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_page_leaves_cursor_untouched() {
        let source = ScriptedSource::new(vec![
            page(&["a"], "", "s1"),
            Err(ProtocolError::Malformed("undecodable envelope".into())),
        ]);
        let (engine, index) = engine(source.clone()).await;
        let cancel = CancellationToken::new();

        engine.ensure_fresh(&cancel).await.unwrap();
        let before = index.cursor().await.unwrap();

        engine.mark_dirty();
        engine.ensure_fresh(&cancel).await.unwrap_err();

        let after = index.cursor().await.unwrap();
        assert_eq!(after.state_token, before.state_token);
        assert_eq!(after.page_token, before.page_token);
        assert_eq!(after.last_sync, before.last_sync);
    }
}
