//! On-disk HLS output: one directory per stream, video at the root, audio
//! under `audio/`. Every write goes through temp-then-rename so a reader
//! polling through the file server never sees a partial playlist or
//! segment (nor a playlist referencing a file that is not yet on disk).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::model::TrackKind;

use super::playlist::{self, MasterMedia, MasterVariant, MediaPlaylist, PlaylistSegment};

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const MEDIA_PLAYLIST: &str = "index.m3u8";
pub const INIT_SEGMENT: &str = "init.mp4";
pub const AUDIO_SUBDIR: &str = "audio";

pub fn segment_file_name(number: u64) -> String {
    format!("segment_{number}.m4s")
}

#[derive(Debug)]
struct WindowEntry {
    number: u64,
    duration: f64,
    file_name: String,
    discontinuity: bool,
}

/// Playlist + segment files for a single variant.
pub struct VariantWriter {
    dir: PathBuf,
    live: bool,
    /// `None` for VOD (unbounded window).
    window_size: Option<usize>,
    window: VecDeque<WindowEntry>,
    /// Monotonic within a session: once a larger duration has been seen,
    /// later playlists never advertise a smaller one.
    target_duration: u64,
    discontinuity_sequence: u64,
    init_bytes: Option<Vec<u8>>,
    pending_discontinuity: bool,
    finalized: bool,
}

impl VariantWriter {
    pub async fn create(dir: PathBuf, live: bool, window_size: usize) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| GatewayError::write(&dir, e))?;
        Ok(Self {
            dir,
            live,
            window_size: live.then_some(window_size.max(1)),
            window: VecDeque::new(),
            target_duration: 1,
            discontinuity_sequence: 0,
            init_bytes: None,
            pending_discontinuity: false,
            finalized: false,
        })
    }

    /// Writes the init segment. Idempotent: identical bytes are a no-op; a
    /// changed payload is rewritten and arms a discontinuity for the next
    /// appended segment. Returns whether the file was (re)written.
    pub async fn write_init(&mut self, bytes: &[u8]) -> Result<bool> {
        match &self.init_bytes {
            Some(current) if current == bytes => return Ok(false),
            Some(_) => {
                debug!(dir = %self.dir.display(), "init segment changed");
                self.pending_discontinuity = true;
            }
            None => {}
        }
        write_atomic(&self.dir, INIT_SEGMENT, bytes).await?;
        self.init_bytes = Some(bytes.to_vec());
        Ok(true)
    }

    /// Arms `#EXT-X-DISCONTINUITY` for the next appended segment.
    pub fn mark_discontinuity(&mut self) {
        self.pending_discontinuity = true;
    }

    /// Writes one media segment, slides the live window, and rewrites the
    /// media playlist. The init segment must already be on disk.
    pub async fn append_segment(&mut self, number: u64, duration: f64, bytes: &[u8]) -> Result<()> {
        if self.init_bytes.is_none() {
            return Err(GatewayError::Session(format!(
                "segment {number} appended before the init segment"
            )));
        }
        if let Some(last) = self.window.back() {
            if number <= last.number {
                return Err(GatewayError::Session(format!(
                    "segment {number} appended after {}",
                    last.number
                )));
            }
        }

        let file_name = segment_file_name(number);
        write_atomic(&self.dir, &file_name, bytes).await?;

        self.window.push_back(WindowEntry {
            number,
            duration,
            file_name,
            discontinuity: std::mem::take(&mut self.pending_discontinuity),
        });
        self.target_duration = self.target_duration.max(duration.ceil() as u64);

        if let Some(limit) = self.window_size {
            while self.window.len() > limit {
                let evicted = self.window.pop_front().expect("window not empty");
                if evicted.discontinuity {
                    self.discontinuity_sequence += 1;
                }
                let path = self.dir.join(&evicted.file_name);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "failed to evict segment file");
                    }
                }
            }
        }

        self.rewrite_playlist().await
    }

    /// Emits `#EXT-X-ENDLIST`. VOD completion only, never cancellation.
    pub async fn finalize(&mut self) -> Result<()> {
        self.finalized = true;
        self.rewrite_playlist().await
    }

    pub fn media_sequence(&self) -> u64 {
        self.window.front().map(|e| e.number).unwrap_or(0)
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    async fn rewrite_playlist(&self) -> Result<()> {
        if self.window.is_empty() && !self.finalized {
            return Ok(());
        }
        let segments: Vec<PlaylistSegment> = self
            .window
            .iter()
            .map(|e| PlaylistSegment {
                uri: e.file_name.clone(),
                duration: e.duration,
                discontinuity: e.discontinuity,
            })
            .collect();

        let rendered = MediaPlaylist {
            target_duration: self.target_duration,
            media_sequence: self.media_sequence(),
            discontinuity_sequence: self.discontinuity_sequence,
            map_uri: INIT_SEGMENT,
            vod: !self.live,
            // finalize is called on completion only, never on cancellation,
            // so a live stream that ended also gets its ENDLIST
            end_list: self.finalized,
            segments: &segments,
        }
        .render();

        write_atomic(&self.dir, MEDIA_PLAYLIST, rendered.as_bytes()).await
    }
}

/// Identity of a variant as it appears in the master playlist.
pub struct MasterTrack {
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub resolution: Option<(u64, u64)>,
}

/// The video/audio writer pair for one stream. Appends serialize within a
/// variant (per-variant lock) while the two variants proceed concurrently.
pub struct MultiVariantWriter {
    dir: PathBuf,
    video: Option<Mutex<VariantWriter>>,
    audio: Option<Mutex<VariantWriter>>,
}

impl MultiVariantWriter {
    pub async fn create(
        dir: PathBuf,
        live: bool,
        window_size: usize,
        has_video: bool,
        has_audio: bool,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| GatewayError::write(&dir, e))?;

        let video = if has_video {
            Some(Mutex::new(
                VariantWriter::create(dir.clone(), live, window_size).await?,
            ))
        } else {
            None
        };
        let audio = if has_audio {
            Some(Mutex::new(
                VariantWriter::create(dir.join(AUDIO_SUBDIR), live, window_size).await?,
            ))
        } else {
            None
        };

        Ok(Self { dir, video, audio })
    }

    /// Writes `master.m3u8` once at session start. Representation
    /// identities never change afterwards, so it is not rewritten.
    pub async fn write_master(
        &self,
        video: Option<&MasterTrack>,
        audio: Option<&MasterTrack>,
    ) -> Result<()> {
        let audio_playlist_uri = format!("{AUDIO_SUBDIR}/{MEDIA_PLAYLIST}");
        let mut variants = Vec::new();
        let mut media = Vec::new();

        match (video, audio) {
            (Some(v), audio) => {
                let mut codecs: Vec<&str> = Vec::new();
                if let Some(c) = v.codecs.as_deref() {
                    codecs.push(c);
                }
                let mut bandwidth = v.bandwidth;
                if let Some(a) = audio {
                    bandwidth += a.bandwidth;
                    if let Some(c) = a.codecs.as_deref() {
                        if !codecs.contains(&c) {
                            codecs.push(c);
                        }
                    }
                    media.push(MasterMedia {
                        group_id: "aud".into(),
                        name: "audio".into(),
                        uri: audio_playlist_uri.clone(),
                    });
                }
                variants.push(MasterVariant {
                    bandwidth,
                    codecs: (!codecs.is_empty()).then(|| codecs.join(",")),
                    resolution: v.resolution,
                    audio_group: audio.map(|_| "aud".into()),
                    uri: MEDIA_PLAYLIST.into(),
                });
            }
            (None, Some(a)) => {
                variants.push(MasterVariant {
                    bandwidth: a.bandwidth,
                    codecs: a.codecs.clone(),
                    resolution: None,
                    audio_group: None,
                    uri: audio_playlist_uri.clone(),
                });
            }
            (None, None) => {
                return Err(GatewayError::Session(
                    "cannot write a master playlist with no variants".into(),
                ))
            }
        }

        let rendered = playlist::render_master(&variants, &media);
        write_atomic(&self.dir, MASTER_PLAYLIST, rendered.as_bytes()).await
    }

    pub async fn write_init(&self, kind: TrackKind, bytes: &[u8]) -> Result<bool> {
        self.variant(kind)?.lock().await.write_init(bytes).await
    }

    pub async fn append_segment(
        &self,
        kind: TrackKind,
        number: u64,
        duration: f64,
        bytes: &[u8],
    ) -> Result<()> {
        self.variant(kind)?
            .lock()
            .await
            .append_segment(number, duration, bytes)
            .await
    }

    pub async fn mark_discontinuity(&self, kind: TrackKind) -> Result<()> {
        self.variant(kind)?.lock().await.mark_discontinuity();
        Ok(())
    }

    pub async fn finalize(&self) -> Result<()> {
        for writer in [self.video.as_ref(), self.audio.as_ref()].into_iter().flatten() {
            writer.lock().await.finalize().await?;
        }
        Ok(())
    }

    fn variant(&self, kind: TrackKind) -> Result<&Mutex<VariantWriter>> {
        let writer = match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Text => None,
        };
        writer.ok_or_else(|| {
            GatewayError::Session(format!("no {kind} variant configured for this stream"))
        })
    }
}

/// Write-to-temp + rename within the target directory. The rename is atomic
/// on POSIX, so readers see either the old file or the new one, never a
/// partial write.
async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let path = dir.join(name);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| GatewayError::write(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| GatewayError::write(&path, e))?;
    Ok(())
}
