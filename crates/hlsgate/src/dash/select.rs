//! Representation selection: a pure function of the parsed manifest and
//! the stream configuration, picking at most one video and one audio track.

use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{GatewayError, Result};
use crate::model::TrackKind;

use super::{MediaManifest, MediaRepresentation};

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectedVariants<'a> {
    pub video: Option<&'a MediaRepresentation>,
    pub audio: Option<&'a MediaRepresentation>,
}

impl<'a> SelectedVariants<'a> {
    pub fn get(&self, kind: TrackKind) -> Option<&'a MediaRepresentation> {
        match kind {
            TrackKind::Video => self.video,
            TrackKind::Audio => self.audio,
            TrackKind::Text => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a MediaRepresentation> {
        self.video.into_iter().chain(self.audio)
    }
}

/// Selects the representations to convert.
///
/// With `representation_id` set, that exact representation becomes the only
/// selected variant, its kind inferred. Otherwise the highest-bandwidth
/// video and audio representations win, first-seen order breaking ties.
pub fn select_variants<'a>(
    manifest: &'a MediaManifest,
    config: &StreamConfig,
) -> Result<SelectedVariants<'a>> {
    if let Some(forced) = &config.representation_id {
        let representation = manifest.representation(forced).ok_or_else(|| {
            GatewayError::Config(format!("representation {forced:?} not found in manifest"))
        })?;
        debug!(
            representation = %representation.id,
            kind = %representation.kind,
            bandwidth = representation.bandwidth,
            "using forced representation"
        );
        return Ok(match representation.kind {
            TrackKind::Video => SelectedVariants {
                video: Some(representation),
                audio: None,
            },
            TrackKind::Audio => SelectedVariants {
                video: None,
                audio: Some(representation),
            },
            TrackKind::Text => {
                return Err(GatewayError::Config(format!(
                    "representation {forced:?} is not an audio or video track"
                )))
            }
        });
    }

    let video = highest_bandwidth(manifest, TrackKind::Video);
    let audio = highest_bandwidth(manifest, TrackKind::Audio);
    if video.is_none() && audio.is_none() {
        return Err(GatewayError::Config(
            "no usable representation in manifest".into(),
        ));
    }

    Ok(SelectedVariants { video, audio })
}

fn highest_bandwidth(manifest: &MediaManifest, kind: TrackKind) -> Option<&MediaRepresentation> {
    let mut best: Option<&MediaRepresentation> = None;
    for candidate in manifest.representations.iter().filter(|r| r.kind == kind) {
        // strict comparison keeps the first-seen representation on ties
        if best.is_none_or(|b| candidate.bandwidth > b.bandwidth) {
            best = Some(candidate);
        }
    }
    best
}
