//! The image pipeline: two bounded caches, a decoder, and a prioritized
//! worker pool behind one explicitly constructed handle.
//!
//! Collaborators talk to it through:
//! - `lookup` - synchronous memory check, never decodes
//! - `request` / `request_async` - decode on a worker if needed, exactly one completion
//! - `preload_all` / `preload_window` - fire-and-forget warming
//! - `invalidate` / `clear` / `clear_disk` - administration

pub mod completion;

use crate::cache::{staleness, CacheKey, CacheStats, ImageCache, SizeClass, Tier};
use crate::config::PipelineConfig;
use crate::decode::{DecodeEngine, DecodedImage, Decoder, SourceKind};
use crate::error::DecodeError;
use crate::library::SourceFile;
use crate::preload::queue::{deliver, notify};
use crate::preload::{
    lookahead, Completion, Job, JobQueue, Priority, QueueStats, Submitted, Waiter, WorkerPool,
};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

pub use completion::{mailbox, CompletionContext, Mailbox, MailboxReceiver};

/// Counters for both tiers and the job queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub thumbnails: CacheStats,
    pub previews: CacheStats,
    pub queue: QueueStats,
}

/// State shared with the workers
struct Shared {
    thumbnails: ImageCache,
    previews: ImageCache,
    queue: Arc<JobQueue>,
    decoder: Arc<dyn Decoder>,
    preview_max_dimension: u32,
    high_dpi: bool,
}

impl Shared {
    fn cache_for(&self, size: SizeClass) -> &ImageCache {
        match size.tier() {
            Tier::Thumbnail => &self.thumbnails,
            Tier::Preview => &self.previews,
        }
    }

    /// Worker entry point: serve from cache if possible, otherwise decode
    fn run_job(&self, job: Job) {
        let cache = self.cache_for(job.key.size_class());
        let result = match cache.get(&job.key, &job.path) {
            Some(image) => {
                trace!(path = ?job.path, "job served from cache");
                Ok(image)
            }
            None => self.decode_and_store(cache, &job),
        };

        // Store before completing, so a waiter's follow-up lookup hits
        deliver(self.queue.complete(&job.key), &result);
    }

    fn decode_and_store(&self, cache: &ImageCache, job: &Job) -> Completion {
        let size = job.key.size_class();
        let max_dimension = size.max_dimension(self.high_dpi, self.preview_max_dimension);
        let before = staleness::source_modified(&job.path);

        let decoded = catch_unwind(AssertUnwindSafe(|| {
            self.decoder.decode(&job.path, max_dimension)
        }))
        .unwrap_or_else(|_| {
            Err(DecodeError::Corrupt {
                path: job.path.clone(),
                message: "decoder panicked".to_string(),
            })
        });

        let image = match decoded {
            Ok(image) => Arc::new(image),
            Err(e) => {
                warn!(path = ?job.path, size = size.as_str(), error = %e, "decode failed");
                return Err(e);
            }
        };

        // Write-time staleness guard: only cache what still matches the source
        match (before, staleness::source_modified(&job.path)) {
            (Some(before), Some(after)) if before == after => {
                let generation = self.queue.generation_of(&job.key).unwrap_or(job.generation);
                cache.put_if_current(job.key, image.clone(), before, generation);
            }
            _ => {
                debug!(path = ?job.path, "source changed during decode, not caching");
                cache.note_discarded();
            }
        }

        Ok(image)
    }
}

/// Handle to the caching and preloading pipeline.
///
/// Construct one at startup and pass references to whoever needs images.
/// Dropping it shuts the workers down.
pub struct ImagePipeline {
    shared: Arc<Shared>,
    pool: WorkerPool,
}

impl ImagePipeline {
    /// Pipeline with the standard decode engine
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_decoder(config, Arc::new(DecodeEngine::new()))
    }

    pub fn with_decoder(config: &PipelineConfig, decoder: Arc<dyn Decoder>) -> Self {
        let queue = Arc::new(JobQueue::new());
        let shared = Arc::new(Shared {
            thumbnails: ImageCache::new(
                "thumbnails",
                &config.thumbnails,
                config.mirror_for(Tier::Thumbnail),
            ),
            previews: ImageCache::new(
                "previews",
                &config.previews,
                config.mirror_for(Tier::Preview),
            ),
            queue: queue.clone(),
            decoder,
            preview_max_dimension: config.preview_max_dimension,
            high_dpi: config.high_dpi,
        });

        let worker_shared = shared.clone();
        let pool = WorkerPool::spawn(config.worker_count(), queue, move |job| {
            worker_shared.run_job(job)
        });

        info!(
            workers = pool.size(),
            cache_root = ?config.cache_root(),
            "image pipeline ready"
        );
        Self { shared, pool }
    }

    /// Cached image for `path` at `size`, if resident. Never decodes and never
    /// reads the disk mirror; a stale entry is evicted and reported as a miss.
    pub fn lookup(&self, path: impl AsRef<Path>, size: SizeClass) -> Option<Arc<DecodedImage>> {
        let path = path.as_ref();
        self.shared
            .cache_for(size)
            .get_memory(&CacheKey::new(path, size), path)
    }

    /// Fetch an image, decoding on a worker if needed.
    ///
    /// Returns immediately. `callback` runs exactly once, through `context`,
    /// with the image or the reason it could not be produced.
    pub fn request<F>(
        &self,
        path: impl AsRef<Path>,
        size: SizeClass,
        context: &CompletionContext,
        callback: F,
    ) where
        F: FnOnce(Completion) + Send + 'static,
    {
        let path = path.as_ref();
        let key = CacheKey::new(path, size);
        let cache = self.shared.cache_for(size);

        if let Some(image) = cache.get_memory(&key, path) {
            context.post(Box::new(move || callback(Ok(image))));
            return;
        }

        let context = context.clone();
        let waiter: Waiter = Box::new(move |result| context.post(Box::new(move || callback(result))));
        let (submitted, rejected) = self.shared.queue.submit(
            key,
            path.to_path_buf(),
            Priority::Interactive,
            cache.generation(),
            Some(waiter),
        );
        trace!(?path, size = size.as_str(), ?submitted, "interactive request");

        if let Some(waiter) = rejected {
            waiter(Err(DecodeError::Cancelled {
                path: path.to_path_buf(),
            }));
        }
    }

    /// `request` as a future. The result is produced on a worker and handed
    /// over through a oneshot channel, so it resolves on whatever executor
    /// awaits it.
    pub fn request_async(
        &self,
        path: impl AsRef<Path>,
        size: SizeClass,
    ) -> impl Future<Output = Completion> + Send + 'static {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = oneshot::channel();
        self.request(&path, size, &CompletionContext::Inline, move |result| {
            let _ = tx.send(result);
        });
        async move { rx.await.unwrap_or_else(|_| Err(DecodeError::Cancelled { path })) }
    }

    /// Queue every raster in `files` that is not already cached or in flight.
    ///
    /// PDF and SVG sources are skipped. Returns how many new jobs were queued.
    pub fn preload_all(&self, files: &[SourceFile], size: SizeClass, priority: Priority) -> usize {
        let queued = self.preload(
            files.iter().filter(|f| f.kind == SourceKind::Raster),
            size,
            priority,
        );
        debug!(
            files = files.len(),
            queued,
            size = size.as_str(),
            ?priority,
            "library preload dispatched"
        );
        queued
    }

    /// Queue the `window` items after `current_index`.
    ///
    /// SVGs are skipped since they render on demand. Returns how many new jobs
    /// were queued.
    pub fn preload_window(
        &self,
        files: &[SourceFile],
        current_index: usize,
        window: usize,
        size: SizeClass,
        priority: Priority,
    ) -> usize {
        let range = lookahead(files.len(), current_index, window);
        let queued = self.preload(
            files[range.clone()]
                .iter()
                .filter(|f| f.kind.is_supported() && f.kind != SourceKind::Svg),
            size,
            priority,
        );
        trace!(?range, queued, size = size.as_str(), "viewport preload dispatched");
        queued
    }

    fn preload<'a>(
        &self,
        files: impl Iterator<Item = &'a SourceFile>,
        size: SizeClass,
        priority: Priority,
    ) -> usize {
        let cache = self.shared.cache_for(size);
        let generation = cache.generation();
        let mut queued = 0;

        for file in files {
            let key = CacheKey::new(&file.path, size);
            // Dedup: resident entries are skipped, pending ones collapse in the queue
            if cache.contains(&key) {
                continue;
            }
            let (submitted, _) =
                self.shared
                    .queue
                    .submit(key, file.path.clone(), priority, generation, None);
            if submitted == Submitted::Queued {
                queued += 1;
            }
        }
        queued
    }

    /// Forget every size class of one source, in memory and on disk
    pub fn invalidate(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        for size in SizeClass::ALL {
            self.shared
                .cache_for(size)
                .invalidate(&CacheKey::new(path, size));
        }
        debug!(?path, "invalidated");
    }

    /// Empty both memory caches. Disk mirrors are kept; jobs already in flight
    /// deliver their results without repopulating the cache.
    pub fn clear(&self) {
        self.shared.thumbnails.clear();
        self.shared.previews.clear();
        info!("memory caches cleared");
    }

    /// Delete both disk mirrors. Returns how many files were removed.
    pub fn clear_disk(&self) -> std::io::Result<usize> {
        let removed = self.shared.thumbnails.clear_disk()? + self.shared.previews.clear_disk()?;
        info!(removed, "disk mirrors cleared");
        Ok(removed)
    }

    /// Whether a disk mirror entry exists for `path` at `size`
    pub fn is_mirrored(&self, path: impl AsRef<Path>, size: SizeClass) -> bool {
        self.shared
            .cache_for(size)
            .is_mirrored(&CacheKey::new(path.as_ref(), size))
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            thumbnails: self.shared.thumbnails.stats(),
            previews: self.shared.previews.stats(),
            queue: self.shared.queue.stats(),
        }
    }

    pub fn thumbnails(&self) -> &ImageCache {
        &self.shared.thumbnails
    }

    pub fn previews(&self) -> &ImageCache {
        &self.shared.previews
    }

    /// Block until no job is queued or running
    pub fn wait_idle(&self) {
        self.shared.queue.wait_idle();
    }

    /// Stop the workers. Queued requests complete with `Cancelled`; running
    /// ones finish normally. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.queue.is_shutdown() {
            return;
        }
        let orphaned = self.shared.queue.shutdown();
        let cancelled = orphaned.len();
        for (path, waiter) in orphaned {
            notify(waiter, Err(DecodeError::Cancelled { path }));
        }
        self.pool.join();
        info!(cancelled, "image pipeline stopped");
    }
}

impl Drop for ImagePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("thumbnails", &self.shared.thumbnails)
            .field("previews", &self.shared.previews)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use image::{Rgba, RgbaImage};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Counts decodes passed through to the real engine
    #[derive(Default)]
    struct CountingDecoder {
        engine: DecodeEngine,
        calls: AtomicUsize,
    }

    impl CountingDecoder {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Decoder for CountingDecoder {
        fn decode(&self, path: &Path, max_dimension: u32) -> Result<DecodedImage, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.engine.decode(path, max_dimension)
        }
    }

    /// Holds every decode until the test releases it
    struct GatedDecoder {
        engine: DecodeEngine,
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    fn gated() -> (GatedDecoder, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let decoder = GatedDecoder {
            engine: DecodeEngine::new(),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        };
        (decoder, started_rx, release_tx)
    }

    impl Decoder for GatedDecoder {
        fn decode(&self, path: &Path, max_dimension: u32) -> Result<DecodedImage, DecodeError> {
            let _ = self.started.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.engine.decode(path, max_dimension)
        }
    }

    struct PanickingDecoder;

    impl Decoder for PanickingDecoder {
        fn decode(&self, _path: &Path, _max_dimension: u32) -> Result<DecodedImage, DecodeError> {
            panic!("malformed input");
        }
    }

    fn config(workers: usize) -> PipelineConfig {
        PipelineConfig {
            worker_threads: Some(workers),
            ..PipelineConfig::in_memory()
        }
    }

    fn mirrored_config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            worker_threads: Some(2),
            cache_dir: Some(dir.path().join("cache")),
            ..PipelineConfig::default()
        }
    }

    fn write_png(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        RgbaImage::from_pixel(800, 400, Rgba([10, 120, 200, 255]))
            .save(&path)
            .unwrap();
        path
    }

    fn fetch(pipeline: &ImagePipeline, path: &Path, size: SizeClass) -> Completion {
        let (tx, rx) = mpsc::channel();
        pipeline.request(path, size, &CompletionContext::Inline, move |result| {
            let _ = tx.send(result);
        });
        rx.recv_timeout(TIMEOUT).unwrap()
    }

    #[test]
    fn test_cold_request_then_lookup_hits() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "cold.png");
        let decoder = Arc::new(CountingDecoder::default());
        let pipeline = ImagePipeline::with_decoder(&config(2), decoder.clone());

        assert!(pipeline.lookup(&path, SizeClass::GridSmall).is_none());

        let image = fetch(&pipeline, &path, SizeClass::GridSmall).unwrap();
        assert_eq!(image.dimensions(), (160, 80));

        let cached = pipeline.lookup(&path, SizeClass::GridSmall).unwrap();
        assert!(Arc::ptr_eq(&image, &cached));
        assert_eq!(decoder.calls(), 1);
    }

    #[test]
    fn test_size_classes_cached_independently() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "sizes.png");
        let pipeline = ImagePipeline::with_decoder(&config(2), Arc::new(DecodeEngine::new()));

        let small = fetch(&pipeline, &path, SizeClass::GridSmall).unwrap();
        let preview = fetch(&pipeline, &path, SizeClass::Preview).unwrap();

        assert_eq!(small.dimensions(), (160, 80));
        assert_eq!(preview.dimensions(), (800, 400));
        assert!(pipeline.lookup(&path, SizeClass::GridMedium).is_none());
        assert_eq!(pipeline.thumbnails().len(), 1);
        assert_eq!(pipeline.previews().len(), 1);
    }

    #[test]
    fn test_preload_all_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let files: Vec<SourceFile> = (0..5)
            .map(|i| SourceFile::new(write_png(&dir, &format!("img_{}.png", i))))
            .collect();
        let decoder = Arc::new(CountingDecoder::default());
        let pipeline = ImagePipeline::with_decoder(&config(3), decoder.clone());

        let first = pipeline.preload_all(&files, SizeClass::GridMedium, Priority::Library);
        let second = pipeline.preload_all(&files, SizeClass::GridMedium, Priority::Library);
        pipeline.wait_idle();

        assert_eq!(first, 5);
        assert_eq!(second, 0);
        assert_eq!(decoder.calls(), 5);
        for file in &files {
            assert!(pipeline.lookup(&file.path, SizeClass::GridMedium).is_some());
        }

        assert_eq!(
            pipeline.preload_all(&files, SizeClass::GridMedium, Priority::Library),
            0
        );
    }

    #[test]
    fn test_preload_all_skips_documents() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            SourceFile::new(write_png(&dir, "a.png")),
            SourceFile::new(dir.path().join("b.pdf")),
            SourceFile::new(dir.path().join("c.svg")),
        ];
        let decoder = Arc::new(CountingDecoder::default());
        let pipeline = ImagePipeline::with_decoder(&config(1), decoder.clone());

        assert_eq!(
            pipeline.preload_all(&files, SizeClass::List, Priority::Library),
            1
        );
        pipeline.wait_idle();
        assert_eq!(decoder.calls(), 1);
    }

    #[test]
    fn test_preload_window_skips_svg() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            SourceFile::new(write_png(&dir, "a.png")),
            SourceFile::new(dir.path().join("b.svg")),
            SourceFile::new(write_png(&dir, "c.png")),
            SourceFile::new(dir.path().join("d.pdf")),
            SourceFile::new(write_png(&dir, "e.png")),
        ];
        let decoder = Arc::new(CountingDecoder::default());
        let pipeline = ImagePipeline::with_decoder(&config(2), decoder.clone());

        let queued = pipeline.preload_window(&files, 0, 3, SizeClass::Preview, Priority::Viewport);
        pipeline.wait_idle();

        assert_eq!(queued, 2);
        assert_eq!(decoder.calls(), 2);
        assert!(pipeline.lookup(&files[2].path, SizeClass::Preview).is_some());
        assert!(pipeline.lookup(&files[4].path, SizeClass::Preview).is_none());
    }

    #[test]
    fn test_modified_source_is_redecoded() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "edited.png");
        let decoder = Arc::new(CountingDecoder::default());
        let pipeline = ImagePipeline::with_decoder(&config(2), decoder.clone());

        fetch(&pipeline, &path, SizeClass::Preview).unwrap();
        fetch(&pipeline, &path, SizeClass::Preview).unwrap();
        assert_eq!(decoder.calls(), 1);

        let later = SystemTime::now() + Duration::from_secs(60);
        filetime::set_file_mtime(&path, FileTime::from_system_time(later)).unwrap();

        assert!(pipeline.lookup(&path, SizeClass::Preview).is_none());
        fetch(&pipeline, &path, SizeClass::Preview).unwrap();
        assert_eq!(decoder.calls(), 2);
        assert!(pipeline.lookup(&path, SizeClass::Preview).is_some());
        assert_eq!(pipeline.stats().previews.stale_evictions, 1);
    }

    #[test]
    fn test_svg_request_is_rendered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logo.svg");
        std::fs::write(
            &path,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"><rect width="10" height="10" fill="#336699"/></svg>"##,
        )
        .unwrap();
        let config = PipelineConfig {
            preview_max_dimension: 400,
            ..config(1)
        };
        let pipeline = ImagePipeline::with_decoder(&config, Arc::new(DecodeEngine::new()));

        let preview = fetch(&pipeline, &path, SizeClass::Preview).unwrap();
        assert_eq!(preview.dimensions(), (400, 400));
        let thumb = fetch(&pipeline, &path, SizeClass::GridSmall).unwrap();
        assert_eq!(thumb.dimensions(), (160, 160));
        assert!(pipeline.lookup(&path, SizeClass::Preview).is_some());
    }

    #[test]
    fn test_decode_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let good = write_png(&dir, "good.png");
        let bad = dir.path().join("bad.jpg");
        std::fs::write(&bad, b"definitely not a jpeg").unwrap();
        let pipeline = ImagePipeline::with_decoder(&config(2), Arc::new(DecodeEngine::new()));

        assert!(fetch(&pipeline, &bad, SizeClass::GridLarge).is_err());
        assert!(fetch(&pipeline, &good, SizeClass::GridLarge).is_ok());

        assert!(pipeline.lookup(&bad, SizeClass::GridLarge).is_none());
        assert!(pipeline.lookup(&good, SizeClass::GridLarge).is_some());
        assert_eq!(pipeline.thumbnails().len(), 1);
    }

    #[test]
    fn test_missing_source_reports_io() {
        let dir = TempDir::new().unwrap();
        let pipeline = ImagePipeline::with_decoder(&config(1), Arc::new(DecodeEngine::new()));

        let result = fetch(&pipeline, &dir.path().join("gone.png"), SizeClass::List);
        assert!(matches!(result, Err(DecodeError::Io { .. })));
    }

    #[test]
    fn test_decoder_panic_becomes_error() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "boom.png");
        let pipeline = ImagePipeline::with_decoder(&config(1), Arc::new(PanickingDecoder));

        let result = fetch(&pipeline, &path, SizeClass::List);
        assert!(matches!(result, Err(DecodeError::Corrupt { .. })));

        // The worker survives the panic
        let result = fetch(&pipeline, &path, SizeClass::GridSmall);
        assert!(result.is_err());
    }

    #[test]
    fn test_disk_mirror_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "kept.png");
        let config = mirrored_config(&dir);

        {
            let pipeline = ImagePipeline::with_decoder(&config, Arc::new(DecodeEngine::new()));
            fetch(&pipeline, &path, SizeClass::GridSmall).unwrap();
            assert!(pipeline.is_mirrored(&path, SizeClass::GridSmall));
        }

        let decoder = Arc::new(CountingDecoder::default());
        let pipeline = ImagePipeline::with_decoder(&config, decoder.clone());
        assert!(pipeline.lookup(&path, SizeClass::GridSmall).is_none());

        let image = fetch(&pipeline, &path, SizeClass::GridSmall).unwrap();
        assert_eq!(image.dimensions(), (160, 80));
        assert_eq!(decoder.calls(), 0);
        assert_eq!(pipeline.stats().thumbnails.disk_hits, 1);
        assert!(pipeline.lookup(&path, SizeClass::GridSmall).is_some());

        assert_eq!(pipeline.clear_disk().unwrap(), 1);
        assert!(!pipeline.is_mirrored(&path, SizeClass::GridSmall));
    }

    #[test]
    fn test_invalidate_drops_every_size() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "gone.png");
        let pipeline = ImagePipeline::with_decoder(&mirrored_config(&dir), Arc::new(DecodeEngine::new()));

        fetch(&pipeline, &path, SizeClass::List).unwrap();
        fetch(&pipeline, &path, SizeClass::Preview).unwrap();

        pipeline.invalidate(&path);

        assert!(pipeline.lookup(&path, SizeClass::List).is_none());
        assert!(pipeline.lookup(&path, SizeClass::Preview).is_none());
        assert!(!pipeline.is_mirrored(&path, SizeClass::List));
        assert!(!pipeline.is_mirrored(&path, SizeClass::Preview));
    }

    #[test]
    fn test_clear_during_decode_does_not_resurrect() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "inflight.png");
        let (decoder, started, release) = gated();
        let pipeline = ImagePipeline::with_decoder(&config(1), Arc::new(decoder));

        let (tx, rx) = mpsc::channel();
        pipeline.request(&path, SizeClass::Preview, &CompletionContext::Inline, move |result| {
            let _ = tx.send(result);
        });
        started.recv_timeout(TIMEOUT).unwrap();

        pipeline.clear();
        release.send(()).unwrap();

        // The requester still gets its image
        assert!(rx.recv_timeout(TIMEOUT).unwrap().is_ok());
        pipeline.wait_idle();
        assert!(pipeline.lookup(&path, SizeClass::Preview).is_none());
        assert_eq!(pipeline.stats().previews.discarded_writes, 1);
    }

    #[test]
    fn test_shutdown_cancels_queued_requests() {
        let dir = TempDir::new().unwrap();
        let busy = write_png(&dir, "busy.png");
        let waiting = write_png(&dir, "waiting.png");
        let (decoder, started, release) = gated();
        let pipeline = ImagePipeline::with_decoder(&config(1), Arc::new(decoder));

        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        pipeline.request(&busy, SizeClass::Preview, &CompletionContext::Inline, move |result| {
            let _ = first.send(("busy", result));
        });
        started.recv_timeout(TIMEOUT).unwrap();
        pipeline.request(&waiting, SizeClass::Preview, &CompletionContext::Inline, move |result| {
            let _ = tx.send(("waiting", result));
        });

        std::thread::scope(|scope| {
            scope.spawn(|| pipeline.shutdown());

            let (name, result) = rx.recv_timeout(TIMEOUT).unwrap();
            assert_eq!(name, "waiting");
            assert!(matches!(result, Err(DecodeError::Cancelled { .. })));

            release.send(()).unwrap();
        });

        // The running job finished normally
        let (name, result) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(name, "busy");
        assert!(result.is_ok());

        // Requests after shutdown are cancelled straight away
        let result = fetch(&pipeline, &busy, SizeClass::List);
        assert!(matches!(result, Err(DecodeError::Cancelled { .. })));
    }

    #[test]
    fn test_mailbox_delivers_on_owner_thread() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "mail.png");
        let pipeline = ImagePipeline::with_decoder(&config(2), Arc::new(DecodeEngine::new()));
        let (mailbox, mut receiver) = mailbox();
        let owner = std::thread::current().id();

        let (tx, rx) = mpsc::channel();
        pipeline.request(
            &path,
            SizeClass::List,
            &CompletionContext::Mailbox(mailbox),
            move |result| {
                let _ = tx.send((std::thread::current().id(), result.is_ok()));
            },
        );
        pipeline.wait_idle();
        assert!(rx.try_recv().is_err());

        assert!(receiver.blocking_run_next());
        let (thread, ok) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(thread, owner);
        assert!(ok);
    }

    #[test]
    fn test_memory_hit_completes_exactly_once() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "once.png");
        let pipeline = ImagePipeline::with_decoder(&config(2), Arc::new(DecodeEngine::new()));
        fetch(&pipeline, &path, SizeClass::List).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let calls = calls.clone();
            pipeline.request(&path, SizeClass::List, &CompletionContext::Inline, move |result| {
                assert!(result.is_ok());
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_concurrent_requests_share_one_decode() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "shared.png");
        let (decoder, started, release) = gated();
        let pipeline = ImagePipeline::with_decoder(&config(2), Arc::new(decoder));

        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            pipeline.request(&path, SizeClass::GridLarge, &CompletionContext::Inline, move |result| {
                let _ = tx.send(result);
            });
        }
        started.recv_timeout(TIMEOUT).unwrap();
        release.send(()).unwrap();

        let results: Vec<_> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap().unwrap()).collect();
        assert!(results.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert!(started.try_recv().is_err());
    }

    #[test]
    fn test_panicking_callback_keeps_worker_alive() {
        let dir = TempDir::new().unwrap();
        let shared = write_png(&dir, "shared.png");
        let other = write_png(&dir, "other.png");
        let (decoder, started, release) = gated();
        let pipeline = ImagePipeline::with_decoder(&config(1), Arc::new(decoder));

        pipeline.request(&shared, SizeClass::List, &CompletionContext::Inline, |_| {
            panic!("caller bug");
        });
        started.recv_timeout(TIMEOUT).unwrap();
        let (tx, rx) = mpsc::channel();
        pipeline.request(&shared, SizeClass::List, &CompletionContext::Inline, move |result| {
            let _ = tx.send(result);
        });
        release.send(()).unwrap();

        // The sibling waiter still hears back
        assert!(rx.recv_timeout(TIMEOUT).unwrap().is_ok());

        // And the only worker is still serving
        let (tx, rx) = mpsc::channel();
        pipeline.request(&other, SizeClass::List, &CompletionContext::Inline, move |result| {
            let _ = tx.send(result);
        });
        started.recv_timeout(TIMEOUT).unwrap();
        release.send(()).unwrap();
        assert!(rx.recv_timeout(TIMEOUT).unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_request_async() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "async.png");
        let pipeline = ImagePipeline::with_decoder(&config(1), Arc::new(DecodeEngine::new()));

        let image = pipeline.request_async(&path, SizeClass::List).await.unwrap();
        assert_eq!(image.dimensions(), (80, 40));

        let missing = pipeline
            .request_async(dir.path().join("missing.png"), SizeClass::List)
            .await;
        assert!(missing.is_err());
    }
}
