//! The stream session: one conversion, one task.
//!
//! A session fetches and parses the manifest, selects representations,
//! writes init segments, then loops: refresh (dynamic only), enumerate,
//! download, decrypt, append. The two variants run as parallel sub-tasks
//! per cycle; appends serialize within a variant through the writer's
//! per-variant lock. Cancellation is observed at every suspension point.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::dash::select::select_variants;
use crate::dash::{MediaManifest, MediaRepresentation, SegmentRef};
use crate::decrypt::Decryptor;
use crate::error::{GatewayError, Result};
use crate::fetch::{build_client, SegmentFetcher};
use crate::hls::{MasterTrack, MultiVariantWriter};
use crate::model::{StreamSnapshot, StreamStatus, TrackKind, VariantInfo};

/// Consecutive failures of the same segment (or of manifest refresh)
/// tolerated before the session transitions to `error`.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

pub struct StreamSession {
    id: Uuid,
    config: StreamConfig,
    output_dir: PathBuf,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: StdMutex<SessionState>,
    task: TokioMutex<Option<JoinHandle<()>>>,
}

struct SessionState {
    status: StreamStatus,
    error: Option<String>,
    live: bool,
    video: Option<VariantInfo>,
    audio: Option<VariantInfo>,
    last_sequence: Option<u64>,
    updated_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn new(id: Uuid, config: StreamConfig, output_dir: PathBuf) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id,
            config,
            output_dir,
            created_at: now,
            cancel: CancellationToken::new(),
            state: StdMutex::new(SessionState {
                status: StreamStatus::Starting,
                error: None,
                live: true,
                video: None,
                audio: None,
                last_sequence: None,
                updated_at: now,
            }),
            task: TokioMutex::new(None),
        })
    }

    /// Where this session writes its HLS output; the file-serving route
    /// resolves `hls_url` through this, so `output_dir` overrides work.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Starts the session task. Called once, by the manager.
    pub async fn spawn(session: &Arc<Self>) {
        let task = Arc::clone(session);
        let handle = tokio::spawn(async move {
            StreamSession::run(task).await;
        });
        *session.task.lock().await = Some(handle);
    }

    /// Signals cancellation and waits for the session task to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(stream = %self.id, error = %e, "session task did not shut down cleanly");
            }
        }
        self.update(|s| {
            if !s.status.is_terminal() {
                s.status = StreamStatus::Stopped;
            }
        });
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let state = self.state.lock().expect("session state poisoned");
        StreamSnapshot {
            id: self.id,
            mpd_url: self.config.mpd_url.clone(),
            status: state.status,
            hls_url: format!("/hls/{}/master.m3u8", self.id),
            live: state.live,
            label: self.config.label.clone(),
            video: state.video.clone(),
            audio: state.audio.clone(),
            error: state.error.clone(),
            last_sequence: state.last_sequence,
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.lock().expect("session state poisoned");
        apply(&mut state);
        state.updated_at = Utc::now();
    }

    async fn run(session: Arc<Self>) {
        let result = SessionRunner::start(Arc::clone(&session)).await;
        match result {
            Ok(()) => {
                info!(stream = %session.id, "session completed");
                session.update(|s| s.status = StreamStatus::Stopped);
            }
            Err(_) if session.cancel.is_cancelled() => {
                // live playlists are intentionally left without ENDLIST
                info!(stream = %session.id, "session cancelled");
                session.update(|s| s.status = StreamStatus::Stopped);
            }
            Err(e) => {
                error!(stream = %session.id, error = %e, "session failed");
                session.update(|s| {
                    s.status = StreamStatus::Error;
                    s.error = Some(e.to_string());
                });
            }
        }
    }
}

/// FIFO-bounded set of segment numbers that were fully written.
struct ProcessedSet {
    order: VecDeque<u64>,
    set: HashSet<u64>,
    capacity: usize,
}

impl ProcessedSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, number: u64) {
        if !self.set.insert(number) {
            return;
        }
        self.order.push_back(number);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    fn contains(&self, number: u64) -> bool {
        self.set.contains(&number)
    }
}

struct VariantRunner {
    kind: TrackKind,
    representation_id: String,
    timescale: u64,
    init_url: Url,
    processed: ProcessedSet,
    last_number: Option<u64>,
    /// Segment number currently failing and for how many consecutive cycles.
    failing: Option<(u64, u32)>,
    /// Static manifests only: every enumerated segment has been emitted.
    caught_up: bool,
}

impl VariantRunner {
    fn new(representation: &MediaRepresentation, history_size: usize) -> Self {
        Self {
            kind: representation.kind,
            representation_id: representation.id.clone(),
            timescale: representation.timescale,
            init_url: representation.init_url.clone(),
            processed: ProcessedSet::new(history_size),
            last_number: None,
            failing: None,
            caught_up: false,
        }
    }

    fn is_new(&self, number: u64) -> bool {
        !self.processed.contains(number) && self.last_number.is_none_or(|last| number > last)
    }

    fn mark_emitted(&mut self, number: u64) {
        self.processed.insert(number);
        self.last_number = Some(self.last_number.map_or(number, |last| last.max(number)));
        self.failing = None;
    }

    /// Returns the consecutive-cycle failure count for `number`.
    fn record_failure(&mut self, number: u64) -> u32 {
        let count = match self.failing {
            Some((failing, count)) if failing == number => count + 1,
            _ => 1,
        };
        self.failing = Some((number, count));
        count
    }
}

struct SessionRunner {
    session: Arc<StreamSession>,
    fetcher: SegmentFetcher,
    decryptor: Decryptor,
    writer: MultiVariantWriter,
    manifest_url: Url,
    manifest: MediaManifest,
    variants: Vec<VariantRunner>,
    refresh_failures: u32,
}

impl SessionRunner {
    /// Runs the whole session: the `starting` phase, then the refresh loop.
    /// Returns `Ok(())` only on completion (VOD exhausted or a dynamic
    /// manifest that ended); cancellation surfaces as an error that the
    /// caller maps to `stopped`.
    async fn start(session: Arc<StreamSession>) -> Result<()> {
        let config = &session.config;
        let cancel = session.cancel.clone();

        let client = build_client(&config.headers, config.http_timeout())?;
        let fetcher = SegmentFetcher::new(client);
        let manifest_url = config.mpd_url()?;

        let xml = cancellable(&cancel, fetcher.fetch_text(&manifest_url)).await?;
        let manifest = MediaManifest::parse(&xml, &manifest_url, Utc::now())?;
        let selected = select_variants(&manifest, config)?;

        session.update(|s| {
            s.live = manifest.live;
            s.video = selected.video.map(variant_info);
            s.audio = selected.audio.map(variant_info);
        });
        info!(
            stream = %session.id,
            live = manifest.live,
            video = selected.video.map(|r| r.id.as_str()).unwrap_or("-"),
            audio = selected.audio.map(|r| r.id.as_str()).unwrap_or("-"),
            "session starting"
        );

        let decryptor = if config.wants_decryption() {
            let default_kid = selected
                .iter()
                .find_map(|r| r.default_kid.clone());
            let keys = config.decryption_keys(default_kid.as_deref())?;
            Decryptor::mp4decrypt(keys, config.mp4decrypt_path.clone())?
        } else {
            Decryptor::passthrough()
        };

        let writer = MultiVariantWriter::create(
            session.output_dir.clone(),
            manifest.live,
            config.window_size,
            selected.video.is_some(),
            selected.audio.is_some(),
        )
        .await?;

        // init segment failures during `starting` are fatal
        for representation in selected.iter() {
            let bytes = cancellable(&cancel, fetcher.fetch_bytes(&representation.init_url)).await?;
            let bytes = decryptor.decrypt(&bytes).await?;
            writer.write_init(representation.kind, &bytes).await?;
            debug!(stream = %session.id, kind = %representation.kind, "init segment written");
        }

        writer
            .write_master(
                selected.video.map(master_track).as_ref(),
                selected.audio.map(master_track).as_ref(),
            )
            .await?;

        let variants = selected
            .iter()
            .map(|r| VariantRunner::new(r, config.history_size))
            .collect();

        session.update(|s| s.status = StreamStatus::Running);

        let mut runner = SessionRunner {
            session,
            fetcher,
            decryptor,
            writer,
            manifest_url,
            manifest,
            variants,
            refresh_failures: 0,
        };
        runner.run_loop().await
    }

    async fn run_loop(&mut self) -> Result<()> {
        let cancel = self.session.cancel.clone();
        loop {
            self.run_cycle(&cancel).await?;

            if !self.manifest.live && self.variants.iter().all(|v| v.caught_up) {
                self.session.update(|s| s.status = StreamStatus::Stopping);
                self.writer.finalize().await?;
                return Ok(());
            }

            let poll = self.poll_interval();
            cancellable(&cancel, async {
                tokio::time::sleep(poll).await;
                Ok(())
            })
            .await?;

            if self.manifest.live {
                self.refresh(&cancel).await?;
            }
        }
    }

    /// The refresh cadence: the configured poll interval, with the
    /// manifest's minimumUpdatePeriod as a lower bound.
    fn poll_interval(&self) -> Duration {
        let configured = self.session.config.poll_interval();
        match self.manifest.minimum_update_period {
            Some(minimum) if self.manifest.live => configured.max(minimum),
            _ => configured,
        }
    }

    /// Refetches and re-parses a dynamic manifest. Failures keep the
    /// previous manifest in effect and are fatal only after
    /// `MAX_CONSECUTIVE_FAILURES` consecutive misses.
    async fn refresh(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.try_refresh(cancel).await {
            Ok(()) => {
                self.refresh_failures = 0;
                Ok(())
            }
            Err(e) if cancel.is_cancelled() => Err(e),
            Err(e) => {
                self.refresh_failures += 1;
                warn!(
                    stream = %self.session.id,
                    failures = self.refresh_failures,
                    error = %e,
                    "manifest refresh failed; keeping previous manifest"
                );
                if self.refresh_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(GatewayError::Session(format!(
                        "manifest refresh failed {} consecutive times: {e}",
                        self.refresh_failures
                    )));
                }
                Ok(())
            }
        }
    }

    async fn try_refresh(&mut self, cancel: &CancellationToken) -> Result<()> {
        let xml = cancellable(cancel, self.fetcher.fetch_text(&self.manifest_url)).await?;
        let manifest = MediaManifest::parse(&xml, &self.manifest_url, Utc::now())?;

        for variant in &mut self.variants {
            let representation = manifest
                .representation(&variant.representation_id)
                .ok_or_else(|| {
                    GatewayError::Manifest(format!(
                        "representation {:?} disappeared from the manifest",
                        variant.representation_id
                    ))
                })?;

            if representation.timescale != variant.timescale {
                debug!(
                    stream = %self.session.id,
                    kind = %variant.kind,
                    old = variant.timescale,
                    new = representation.timescale,
                    "timescale changed"
                );
                variant.timescale = representation.timescale;
                self.writer.mark_discontinuity(variant.kind).await?;
            }

            if representation.init_url != variant.init_url {
                variant.init_url = representation.init_url.clone();
                let bytes =
                    cancellable(cancel, self.fetcher.fetch_bytes(&variant.init_url)).await?;
                let bytes = self.decryptor.decrypt(&bytes).await?;
                // a changed payload arms the discontinuity inside the writer
                self.writer.write_init(variant.kind, &bytes).await?;
            }
        }

        self.manifest = manifest;
        Ok(())
    }

    /// One refresh cycle: both variants in parallel, state updated after
    /// the join so observers see a consistent snapshot between cycles.
    async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<()> {
        let manifest = &self.manifest;
        let fetcher = &self.fetcher;
        let decryptor = &self.decryptor;
        let writer = &self.writer;
        let stream_id = self.session.id;

        let results = futures::future::join_all(self.variants.iter_mut().map(|variant| {
            process_variant(stream_id, manifest, fetcher, decryptor, writer, cancel, variant)
        }))
        .await;
        for result in results {
            result?;
        }

        let last_sequence = self
            .variants
            .iter()
            .find(|v| v.kind == TrackKind::Video)
            .or_else(|| self.variants.first())
            .and_then(|v| v.last_number);
        self.session.update(|s| s.last_sequence = last_sequence);
        Ok(())
    }
}

/// Processes one variant for one cycle: enumerate new segments, then in
/// ascending number order download, decrypt, append, mark processed. A 404
/// defers the rest of the cycle; other failures are counted per segment
/// number and become fatal past the consecutive-cycle cap.
async fn process_variant(
    stream_id: Uuid,
    manifest: &MediaManifest,
    fetcher: &SegmentFetcher,
    decryptor: &Decryptor,
    writer: &MultiVariantWriter,
    cancel: &CancellationToken,
    variant: &mut VariantRunner,
) -> Result<()> {
    let Some(representation) = manifest.representation(&variant.representation_id) else {
        // refresh validation keeps this from happening; be safe regardless
        return Ok(());
    };

    let mut fresh: Vec<&SegmentRef> = representation
        .segments
        .iter()
        .filter(|s| variant.is_new(s.number))
        .collect();
    fresh.sort_by_key(|s| s.number);

    for segment in fresh {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        match emit_segment(fetcher, decryptor, writer, cancel, variant, segment).await {
            Ok(()) => {
                debug!(stream = %stream_id, kind = %variant.kind, number = segment.number, "segment written");
                variant.mark_emitted(segment.number);
            }
            Err(e) if cancel.is_cancelled() => return Err(e),
            Err(e) if e.is_not_found() => {
                // not yet available; it will be re-enumerated next cycle,
                // and later numbers wait so appends stay in order
                debug!(stream = %stream_id, kind = %variant.kind, number = segment.number, "segment not available yet");
                break;
            }
            Err(e) => {
                let failures = variant.record_failure(segment.number);
                warn!(
                    stream = %stream_id,
                    kind = %variant.kind,
                    number = segment.number,
                    failures,
                    error = %e,
                    "segment failed; will retry next cycle"
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(GatewayError::Session(format!(
                        "{} segment {} failed {failures} consecutive cycles: {e}",
                        variant.kind, segment.number
                    )));
                }
                break;
            }
        }
    }

    if !manifest.live {
        variant.caught_up = representation
            .segments
            .iter()
            .all(|s| !variant.is_new(s.number));
    }
    Ok(())
}

async fn emit_segment(
    fetcher: &SegmentFetcher,
    decryptor: &Decryptor,
    writer: &MultiVariantWriter,
    cancel: &CancellationToken,
    variant: &VariantRunner,
    segment: &SegmentRef,
) -> Result<()> {
    let bytes = cancellable(cancel, fetcher.fetch_bytes(&segment.url)).await?;
    let bytes = decryptor.decrypt(&bytes).await?;

    if let Some(last) = variant.last_number {
        if segment.number > last + 1 {
            writer.mark_discontinuity(variant.kind).await?;
        }
    }
    writer
        .append_segment(variant.kind, segment.number, segment.duration_secs, &bytes)
        .await
}

fn variant_info(representation: &MediaRepresentation) -> VariantInfo {
    VariantInfo {
        representation_id: representation.id.clone(),
        bandwidth: representation.bandwidth,
        codecs: representation.codecs.clone(),
        width: representation.width,
        height: representation.height,
    }
}

fn master_track(representation: &MediaRepresentation) -> MasterTrack {
    MasterTrack {
        bandwidth: representation.bandwidth,
        codecs: representation.codecs.clone(),
        resolution: representation.resolution(),
    }
}

fn cancelled() -> GatewayError {
    GatewayError::Session("cancelled".into())
}

/// Runs a fallible future, aborting it promptly when the token fires.
async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled()),
        result = future => result,
    }
}
