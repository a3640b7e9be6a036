//! Shared download multiplexer.
//!
//! Concurrent readers of the same media item share one backing download.
//! The first open spawns a writer task that streams the object into a
//! scratch file; readers follow the write frontier through a notify-based
//! wakeup, so a slow reader never stalls a fast one and a second reader
//! attaches mid-flight instead of fetching again. Finished entries linger
//! for a grace period before a reaper evicts them, so a close/reopen pair
//! (common with seeking consumers) reuses the bytes already on disk.

use std::collections::HashMap;
use std::os::unix::fs::FileExt as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt as _;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{ByteStream, ProtocolClient, ProtocolError};

/// How long a fully-released entry stays cached before eviction.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

const REAPER_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The shared download failed; every attached reader observes the same
    /// failure.
    #[error("download failed: {0}")]
    Download(String),
}

/// A resolved object ready to stream.
pub struct FetchedObject {
    pub total_size: Option<u64>,
    pub stream: ByteStream,
}

/// Seam over URL resolution + streaming GET so the multiplexer is testable
/// without a network.
#[async_trait::async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(
        &self,
        media_key: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedObject, ProtocolError>;
}

#[async_trait::async_trait]
impl ObjectFetcher for ProtocolClient {
    async fn fetch(
        &self,
        media_key: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedObject, ProtocolError> {
        let url = self.fetch_download_url(media_key, cancel).await?;
        let resp = self.fetch_url(&url, cancel).await?;
        Ok(FetchedObject {
            total_size: resp.content_length,
            stream: resp.body,
        })
    }
}

#[derive(Default)]
struct EntryState {
    bytes_written: u64,
    total_size: Option<u64>,
    done: bool,
    error: Option<String>,
    refcount: usize,
    /// Set when the refcount drops to zero; cleared on reattach.
    idle_since: Option<Instant>,
}

struct DownloadEntry {
    media_key: String,
    path: PathBuf,
    state: Mutex<EntryState>,
    /// Signaled on every write, on completion, and on failure.
    notify: Notify,
    /// Cancels the writer task when the entry is evicted.
    cancel: CancellationToken,
}

impl DownloadEntry {
    fn fail(&self, message: String) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.error = Some(message);
        st.done = true;
        drop(st);
        self.notify.notify_waiters();
    }
}

struct MuxInner {
    fetcher: Arc<dyn ObjectFetcher>,
    scratch_dir: PathBuf,
    grace: Duration,
    entries: Mutex<HashMap<String, Arc<DownloadEntry>>>,
    seq: AtomicU64,
    cancel: CancellationToken,
}

/// Refcounted map of in-flight and recently-finished downloads.
pub struct DownloadMultiplexer {
    inner: Arc<MuxInner>,
    reaper: JoinHandle<()>,
}

impl DownloadMultiplexer {
    pub fn new(
        fetcher: Arc<dyn ObjectFetcher>,
        scratch_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_grace(fetcher, scratch_dir, cancel, DEFAULT_GRACE)
    }

    pub fn with_grace(
        fetcher: Arc<dyn ObjectFetcher>,
        scratch_dir: PathBuf,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Self {
        let inner = Arc::new(MuxInner {
            fetcher,
            scratch_dir,
            grace,
            entries: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            cancel,
        });
        let reaper = tokio::spawn(reap_idle(inner.clone()));
        Self { inner, reaper }
    }

    /// Attach a reader to the download for `media_key`, starting it if no
    /// live entry exists.
    pub fn open(&self, media_key: &str) -> Result<SharedReader, MuxError> {
        let entry = {
            let mut entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(media_key) {
                let mut st = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                st.refcount += 1;
                st.idle_since = None;
                drop(st);
                debug!(media_key, "attached to existing download");
                entry.clone()
            } else {
                let entry = self.start_entry(media_key)?;
                entries.insert(media_key.to_string(), entry.clone());
                entry
            }
        };

        let file = std::fs::File::open(&entry.path)?;
        Ok(SharedReader {
            entry,
            file,
            pos: 0,
        })
    }

    fn start_entry(&self, media_key: &str) -> Result<Arc<DownloadEntry>, MuxError> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.inner.scratch_dir.join(format!("dl-{seq}.partial"));
        std::fs::File::create(&path)?;

        let entry = Arc::new(DownloadEntry {
            media_key: media_key.to_string(),
            path,
            state: Mutex::new(EntryState {
                refcount: 1,
                ..EntryState::default()
            }),
            notify: Notify::new(),
            cancel: self.inner.cancel.child_token(),
        });

        debug!(media_key, path = %entry.path.display(), "starting download");
        tokio::spawn(run_writer(self.inner.fetcher.clone(), entry.clone()));
        Ok(entry)
    }
}

impl Drop for DownloadMultiplexer {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

/// Stream the object into the entry's scratch file, advancing the write
/// frontier and waking readers as bytes land.
async fn run_writer(fetcher: Arc<dyn ObjectFetcher>, entry: Arc<DownloadEntry>) {
    let fetched = tokio::select! {
        _ = entry.cancel.cancelled() => {
            entry.fail("download cancelled".to_string());
            return;
        }
        result = fetcher.fetch(&entry.media_key, &entry.cancel) => match result {
            Ok(fetched) => fetched,
            Err(e) => {
                entry.fail(e.to_string());
                return;
            }
        },
    };

    {
        let mut st = entry.state.lock().unwrap_or_else(|e| e.into_inner());
        st.total_size = fetched.total_size;
    }
    entry.notify.notify_waiters();

    // The frontier is only advanced after bytes are actually in the file,
    // so readers below it never observe a short scratch file. A blocking
    // write handle guarantees that ordering; tokio's async file writes
    // complete once buffered, before the bytes reach the file.
    let mut offset = 0u64;
    let file = match std::fs::OpenOptions::new().write(true).open(&entry.path) {
        Ok(f) => f,
        Err(e) => {
            entry.fail(format!("scratch file: {e}"));
            return;
        }
    };

    let mut stream = fetched.stream;
    loop {
        let chunk = tokio::select! {
            _ = entry.cancel.cancelled() => {
                entry.fail("download cancelled".to_string());
                return;
            }
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                if let Err(e) = file.write_all_at(&bytes, offset) {
                    entry.fail(format!("scratch write: {e}"));
                    return;
                }
                offset += bytes.len() as u64;
                let mut st = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                st.bytes_written = offset;
                drop(st);
                entry.notify.notify_waiters();
            }
            Some(Err(e)) => {
                entry.fail(e.to_string());
                return;
            }
            None => break,
        }
    }

    let mut st = entry.state.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(expected) = st.total_size {
        if st.bytes_written != expected {
            let got = st.bytes_written;
            drop(st);
            entry.fail(format!("truncated download: {got} of {expected} bytes"));
            return;
        }
    }
    st.done = true;
    let written = st.bytes_written;
    drop(st);
    entry.notify.notify_waiters();
    debug!(media_key = %entry.media_key, bytes = written, "download complete");
}

/// Evict entries that have been unreferenced past the grace period.
async fn reap_idle(inner: Arc<MuxInner>) {
    let mut tick = tokio::time::interval(REAPER_TICK);
    loop {
        tick.tick().await;
        let mut evicted = Vec::new();
        {
            let mut entries = inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.retain(|_, entry| {
                let st = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                let expired = st.refcount == 0
                    && st
                        .idle_since
                        .map(|t| t.elapsed() >= inner.grace)
                        .unwrap_or(false);
                if expired {
                    evicted.push(entry.clone());
                }
                !expired
            });
        }
        for entry in evicted {
            entry.cancel.cancel();
            debug!(media_key = %entry.media_key, "evicting idle download");
            if let Err(e) = std::fs::remove_file(&entry.path) {
                warn!(path = %entry.path.display(), error = %e, "scratch cleanup failed");
            }
        }
    }
}

/// One consumer's view of a shared download. Each reader tracks its own
/// position and owns its own file handle; reads past the write frontier
/// wait for the writer, reads behind it are served straight from disk.
pub struct SharedReader {
    entry: Arc<DownloadEntry>,
    file: std::fs::File,
    pos: u64,
}

impl SharedReader {
    /// Read at the current position, waiting for bytes when the writer has
    /// not reached it yet. Returns 0 only at true end of object.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Register for the wakeup before inspecting state, so a write
            // landing in between is not missed.
            let notified = self.entry.notify.notified();
            tokio::pin!(notified);

            let (frontier, done, error) = {
                let st = self.entry.state.lock().unwrap_or_else(|e| e.into_inner());
                (st.bytes_written, st.done, st.error.clone())
            };

            if self.pos < frontier {
                let want = buf.len().min((frontier - self.pos) as usize);
                let n = self.file.read_at(&mut buf[..want], self.pos)?;
                if n > 0 {
                    self.pos += n as u64;
                    return Ok(n);
                }
                // Below the frontier a short read is never end of object.
                // The writer publishes the frontier only after the bytes
                // land, so this indicates a damaged scratch file.
                if let Some(message) = error {
                    return Err(MuxError::Download(message));
                }
                if done {
                    return Err(MuxError::Download(
                        "scratch file shorter than write frontier".to_string(),
                    ));
                }
                notified.await;
                continue;
            }
            if let Some(message) = error {
                return Err(MuxError::Download(message));
            }
            if done {
                return Ok(0);
            }
            notified.await;
        }
    }

    /// Reposition the read cursor. Purely local; the shared download is
    /// unaffected.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read the remainder of the object from the current position.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, MuxError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

impl Drop for SharedReader {
    fn drop(&mut self) {
        let mut st = self.entry.state.lock().unwrap_or_else(|e| e.into_inner());
        st.refcount = st.refcount.saturating_sub(1);
        if st.refcount == 0 {
            st.idle_since = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;

    struct ScriptedFetcher {
        chunks: Vec<Result<Bytes, String>>,
        total_size: Option<u64>,
        fetches: AtomicU32,
        /// Delay before each chunk, to exercise mid-flight attachment.
        chunk_delay: Duration,
    }

    impl ScriptedFetcher {
        fn new(chunks: Vec<&[u8]>) -> Arc<Self> {
            Arc::new(Self {
                chunks: chunks.into_iter().map(|c| Ok(Bytes::copy_from_slice(c))).collect(),
                total_size: None,
                fetches: AtomicU32::new(0),
                chunk_delay: Duration::ZERO,
            })
        }

        fn failing_after(chunks: Vec<&[u8]>, message: &str) -> Arc<Self> {
            let mut scripted: Vec<Result<Bytes, String>> = chunks
                .into_iter()
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            scripted.push(Err(message.to_string()));
            Arc::new(Self {
                chunks: scripted,
                total_size: None,
                fetches: AtomicU32::new(0),
                chunk_delay: Duration::ZERO,
            })
        }

        fn fetch_count(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ObjectFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _media_key: &str,
            _cancel: &CancellationToken,
        ) -> Result<FetchedObject, ProtocolError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let chunks = self.chunks.clone();
            let delay = self.chunk_delay;
            let stream = futures_util::stream::iter(chunks).then(move |c| async move {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                c.map_err(|m| std::io::Error::new(std::io::ErrorKind::Other, m))
            });
            Ok(FetchedObject {
                total_size: self.total_size,
                stream: Box::pin(stream),
            })
        }
    }

    use futures_util::StreamExt;

    fn mux(fetcher: Arc<ScriptedFetcher>, dir: &tempfile::TempDir) -> DownloadMultiplexer {
        DownloadMultiplexer::with_grace(
            fetcher,
            dir.path().to_path_buf(),
            CancellationToken::new(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![b"hello ", b"world"]);
        let mux = mux(fetcher.clone(), &dir);

        let mut r1 = mux.open("k1").unwrap();
        let mut r2 = mux.open("k1").unwrap();

        let (a, b) = tokio::join!(r1.read_to_end(), r2.read_to_end());
        assert_eq!(a.unwrap(), b"hello world");
        assert_eq!(b.unwrap(), b"hello world");
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_download_independently() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![b"data"]);
        let mux = mux(fetcher.clone(), &dir);

        let mut r1 = mux.open("k1").unwrap();
        let mut r2 = mux.open("k2").unwrap();
        r1.read_to_end().await.unwrap();
        r2.read_to_end().await.unwrap();
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn stream_failure_is_replayed_to_every_reader() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::failing_after(vec![b"part"], "connection reset");
        let mux = mux(fetcher, &dir);

        let mut r1 = mux.open("k1").unwrap();
        let err = r1.read_to_end().await.unwrap_err();
        assert!(matches!(err, MuxError::Download(ref m) if m.contains("connection reset")));

        // A reader attaching after the failure sees the same cached error.
        let mut r2 = mux.open("k1").unwrap();
        let err = r2.read_to_end().await.unwrap_err();
        assert!(matches!(err, MuxError::Download(_)));
    }

    #[tokio::test]
    async fn partial_bytes_readable_before_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::failing_after(vec![b"abcd"], "reset");
        let mux = mux(fetcher, &dir);

        let mut reader = mux.open("k1").unwrap();
        let mut buf = [0u8; 4];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn reopen_within_grace_reuses_cached_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![b"cached"]);
        let mux = mux(fetcher.clone(), &dir);

        let mut r1 = mux.open("k1").unwrap();
        assert_eq!(r1.read_to_end().await.unwrap(), b"cached");
        drop(r1);

        let mut r2 = mux.open("k1").unwrap();
        assert_eq!(r2.read_to_end().await.unwrap(), b"cached");
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_entry_evicted_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![b"x"]);
        let mux = DownloadMultiplexer::with_grace(
            fetcher.clone(),
            dir.path().to_path_buf(),
            CancellationToken::new(),
            Duration::from_millis(100),
        );

        let mut r1 = mux.open("k1").unwrap();
        r1.read_to_end().await.unwrap();
        let scratch = r1.entry.path.clone();
        drop(r1);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!scratch.exists());

        let mut r2 = mux.open("k1").unwrap();
        r2.read_to_end().await.unwrap();
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn seek_rereads_earlier_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![b"0123456789"]);
        let mux = mux(fetcher, &dir);

        let mut reader = mux.open("k1").unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"0123456789");

        reader.seek(3);
        assert_eq!(reader.read_to_end().await.unwrap(), b"3456789");
        assert_eq!(reader.position(), 10);
    }

    #[tokio::test]
    async fn truncated_download_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher {
            chunks: vec![Ok(Bytes::from_static(b"half"))],
            total_size: Some(100),
            fetches: AtomicU32::new(0),
            chunk_delay: Duration::ZERO,
        });
        let mux = mux(fetcher, &dir);

        let mut reader = mux.open("k1").unwrap();
        // The first 4 bytes are readable; the end is an error, not EOF.
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, MuxError::Download(ref m) if m.contains("truncated")));
    }

    #[tokio::test]
    async fn read_waiting_at_the_frontier_returns_bytes_not_eof() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher {
            chunks: vec![Ok(Bytes::from_static(b"chunk"))],
            total_size: None,
            fetches: AtomicU32::new(0),
            chunk_delay: Duration::from_millis(10),
        });
        let mux = mux(fetcher, &dir);

        // The read is issued before the writer has produced anything; when
        // it resolves it must carry the chunk, never a spurious 0.
        let mut reader = mux.open("k1").unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"chunk");
    }

    #[tokio::test]
    async fn slow_stream_wakes_waiting_reader() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher {
            chunks: vec![
                Ok(Bytes::from_static(b"first")),
                Ok(Bytes::from_static(b"second")),
            ],
            total_size: None,
            fetches: AtomicU32::new(0),
            chunk_delay: Duration::from_millis(20),
        });
        let mux = mux(fetcher, &dir);

        let mut reader = mux.open("k1").unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"firstsecond");
    }
}
