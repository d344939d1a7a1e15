//! Resolved DASH manifest model.
//!
//! `dash_mpd` supplies the raw serde tree; this module layers on what the
//! gateway actually needs: BaseURL chain resolution, track classification,
//! default-KID extraction, and segment enumeration for both addressing
//! schemes. Enumeration is a pure function of the manifest text, the
//! request URL and a caller-supplied instant, so it is testable without a
//! network or a real clock.

pub mod select;
pub mod template;
mod timeline;
mod url;

use std::time::Duration;

use ::url::Url;
use chrono::{DateTime, Utc};
use dash_mpd::{AdaptationSet, Period, Representation};
use tracing::{debug, warn};

use crate::config::normalize_hex128;
use crate::error::{GatewayError, Result};
use crate::model::TrackKind;
use template::Template;
use timeline::{EffectiveTemplate, LiveEdge, TimelineEntry};
pub(crate) use self::url::merge_baseurls;

/// A parsed manifest reduced to the first Period, with URLs resolved and
/// segments enumerated. Immutable after parse.
#[derive(Debug, Clone)]
pub struct MediaManifest {
    pub base_url: Url,
    pub live: bool,
    pub media_presentation_duration: Option<Duration>,
    pub minimum_update_period: Option<Duration>,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub suggested_presentation_delay: Option<Duration>,
    pub representations: Vec<MediaRepresentation>,
}

#[derive(Debug, Clone)]
pub struct MediaRepresentation {
    pub id: String,
    pub kind: TrackKind,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub frame_rate: Option<String>,
    pub default_kid: Option<String>,
    pub timescale: u64,
    pub init_url: Url,
    pub segments: Vec<SegmentRef>,
}

impl MediaRepresentation {
    pub fn resolution(&self) -> Option<(u64, u64)> {
        self.width.zip(self.height)
    }
}

/// One downloadable media segment.
#[derive(Debug, Clone)]
pub struct SegmentRef {
    pub number: u64,
    pub time: u64,
    pub duration_ticks: u64,
    pub duration_secs: f64,
    pub url: Url,
}

impl MediaManifest {
    /// Parses MPD XML fetched from `request_url`, enumerating segments as of
    /// `now` (relevant for dynamic manifests with `@duration` addressing).
    pub fn parse(xml: &str, request_url: &Url, now: DateTime<Utc>) -> Result<Self> {
        let mpd = dash_mpd::parse(xml).map_err(|e| GatewayError::Manifest(e.to_string()))?;

        let live = mpd
            .mpdtype
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("dynamic"));

        let mut base_url = request_url.clone();
        if let Some(base) = mpd.base_url.first() {
            base_url = merge_baseurls(&base_url, &base.base)?;
        }

        let period = match mpd.periods.as_slice() {
            [] => return Err(GatewayError::Manifest("manifest contains no Period".into())),
            [single] => single,
            [first, rest @ ..] => {
                warn!(
                    extra_periods = rest.len(),
                    "multi-period manifest; only the first Period is converted"
                );
                first
            }
        };

        let mut period_base = base_url.clone();
        if let Some(base) = period.BaseURL.first() {
            period_base = merge_baseurls(&period_base, &base.base)?;
        }

        let total_duration = period.duration.or(mpd.mediaPresentationDuration);
        let edge = LiveEdge {
            now,
            // A dynamic manifest without availabilityStartTime is malformed;
            // assume a distant start so the whole backlog window is open.
            availability_start: mpd
                .availabilityStartTime
                .unwrap_or_else(|| now - chrono::Duration::days(7)),
            period_start: period.start.unwrap_or(Duration::ZERO),
            suggested_delay: mpd.suggestedPresentationDelay.unwrap_or(Duration::ZERO),
            time_shift_depth: mpd.timeShiftBufferDepth,
        };

        let mut representations = Vec::new();
        for adaptation in &period.adaptations {
            let mut adaptation_base = period_base.clone();
            if let Some(base) = adaptation.BaseURL.first() {
                adaptation_base = merge_baseurls(&adaptation_base, &base.base)?;
            }

            for representation in &adaptation.representations {
                let Some(id) = representation.id.clone().filter(|id| !id.is_empty()) else {
                    continue;
                };

                let kind = classify_track(adaptation, representation);
                if kind == TrackKind::Text {
                    debug!(representation = %id, "skipping non-audiovisual representation");
                    continue;
                }

                let mut rep_base = adaptation_base.clone();
                if let Some(base) = representation.BaseURL.first() {
                    rep_base = merge_baseurls(&rep_base, &base.base)?;
                }

                match resolve_representation(
                    period,
                    adaptation,
                    representation,
                    id,
                    kind,
                    &rep_base,
                    total_duration,
                    live,
                    &edge,
                )? {
                    Some(resolved) => representations.push(resolved),
                    None => continue,
                }
            }
        }

        if representations.is_empty() {
            return Err(GatewayError::Unsupported(
                "no representation uses SegmentTemplate addressing".into(),
            ));
        }

        Ok(MediaManifest {
            base_url,
            live,
            media_presentation_duration: mpd.mediaPresentationDuration,
            minimum_update_period: mpd.minimumUpdatePeriod,
            availability_start_time: mpd.availabilityStartTime,
            time_shift_buffer_depth: mpd.timeShiftBufferDepth,
            suggested_presentation_delay: mpd.suggestedPresentationDelay,
            representations,
        })
    }

    pub fn representation(&self, id: &str) -> Option<&MediaRepresentation> {
        self.representations.iter().find(|r| r.id == id)
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_representation(
    period: &Period,
    adaptation: &AdaptationSet,
    representation: &Representation,
    id: String,
    kind: TrackKind,
    rep_base: &Url,
    total_duration: Option<Duration>,
    live: bool,
    edge: &LiveEdge,
) -> Result<Option<MediaRepresentation>> {
    let Some(template) = effective_template(period, adaptation, representation) else {
        warn!(
            representation = %id,
            "no SegmentTemplate in scope; SegmentBase/SegmentList addressing is not supported"
        );
        return Ok(None);
    };
    let Some(media_pattern) = template.media.clone() else {
        warn!(representation = %id, "SegmentTemplate without a media pattern");
        return Ok(None);
    };

    let bandwidth = representation.bandwidth.unwrap_or(0);
    let mut vars = Template::new();
    vars.insert(Template::REPRESENTATION_ID, id.clone());
    vars.insert(Template::BANDWIDTH, bandwidth.to_string());

    let Some(init_pattern) = &template.initialization else {
        warn!(representation = %id, "SegmentTemplate without an initialization pattern");
        return Ok(None);
    };
    let init_url = merge_baseurls(rep_base, &vars.resolve(init_pattern))?;

    let points = if template.timeline.is_some() {
        timeline::expand_timeline(&template, live)
    } else if live {
        timeline::enumerate_live(&template, edge)
    } else {
        timeline::enumerate_static(&template, total_duration)
    };

    let timescale = template.timescale();
    let mut segments = Vec::with_capacity(points.len());
    for point in points {
        vars.insert(Template::NUMBER, point.number.to_string());
        vars.insert(Template::TIME, point.time.to_string());
        let url = merge_baseurls(rep_base, &vars.resolve(&media_pattern))?;
        segments.push(SegmentRef {
            number: point.number,
            time: point.time,
            duration_ticks: point.duration_ticks,
            duration_secs: point.duration_ticks as f64 / timescale as f64,
            url,
        });
    }

    Ok(Some(MediaRepresentation {
        id,
        kind,
        bandwidth,
        codecs: representation
            .codecs
            .clone()
            .or_else(|| adaptation.codecs.clone()),
        mime_type: representation
            .mimeType
            .clone()
            .or_else(|| adaptation.mimeType.clone()),
        width: representation.width.or(adaptation.width),
        height: representation.height.or(adaptation.height),
        frame_rate: representation
            .frameRate
            .clone()
            .or_else(|| adaptation.frameRate.clone()),
        default_kid: extract_default_kid(adaptation, representation),
        timescale,
        init_url,
        segments,
    }))
}

/// Applies SegmentTemplate inheritance attribute by attribute, innermost
/// level winning; a SegmentTimeline replaces any inherited one wholesale.
fn effective_template(
    period: &Period,
    adaptation: &AdaptationSet,
    representation: &Representation,
) -> Option<EffectiveTemplate> {
    let levels = [
        period.SegmentTemplate.as_ref(),
        adaptation.SegmentTemplate.as_ref(),
        representation.SegmentTemplate.as_ref(),
    ];
    if levels.iter().all(Option::is_none) {
        return None;
    }

    let mut template = EffectiveTemplate {
        timescale: 1,
        start_number: 1,
        ..Default::default()
    };
    for level in levels.into_iter().flatten() {
        if let Some(v) = &level.initialization {
            template.initialization = Some(v.clone());
        }
        if let Some(v) = &level.media {
            template.media = Some(v.clone());
        }
        if let Some(v) = level.timescale {
            template.timescale = v;
        }
        if let Some(v) = level.duration {
            template.duration = Some(v);
        }
        if let Some(v) = level.startNumber {
            template.start_number = v;
        }
        if let Some(v) = level.presentationTimeOffset {
            template.presentation_time_offset = v;
        }
        if let Some(tl) = &level.SegmentTimeline {
            template.timeline = Some(
                tl.segments
                    .iter()
                    .map(|s| TimelineEntry {
                        t: s.t.map(|v| v as i64),
                        d: s.d as i64,
                        r: s.r.unwrap_or(0),
                    })
                    .collect(),
            );
        }
    }
    Some(template)
}

const AUDIO_CODEC_PREFIXES: &[&str] = &["mp4a", "ac-3", "ec-3"];
const VIDEO_CODEC_PREFIXES: &[&str] = &["avc", "hev", "hvc", "vp", "av01"];

/// Infers the track kind from `@contentType`, then MIME type, then the
/// codec string. Anything unrecognized is treated as text and ignored.
fn classify_track(adaptation: &AdaptationSet, representation: &Representation) -> TrackKind {
    let content_type = representation
        .contentType
        .as_deref()
        .or(adaptation.contentType.as_deref());
    match content_type.map(str::to_ascii_lowercase).as_deref() {
        Some("video") => return TrackKind::Video,
        Some("audio") => return TrackKind::Audio,
        Some(_) => return TrackKind::Text,
        None => {}
    }

    let mime = representation
        .mimeType
        .as_deref()
        .or(adaptation.mimeType.as_deref())
        .map(str::to_ascii_lowercase);
    match mime.as_deref() {
        Some(m) if m.starts_with("video/") => return TrackKind::Video,
        Some(m) if m.starts_with("audio/") => return TrackKind::Audio,
        _ => {}
    }

    let codecs = representation
        .codecs
        .as_deref()
        .or(adaptation.codecs.as_deref())
        .map(str::to_ascii_lowercase);
    if let Some(codecs) = codecs {
        if AUDIO_CODEC_PREFIXES.iter().any(|p| codecs.starts_with(p)) {
            return TrackKind::Audio;
        }
        if VIDEO_CODEC_PREFIXES.iter().any(|p| codecs.starts_with(p)) {
            return TrackKind::Video;
        }
    }

    TrackKind::Text
}

/// Looks for `cenc:default_KID` on the Representation's ContentProtection
/// first, then the AdaptationSet's. Hyphenated GUIDs are normalized to 32
/// lowercase hex chars.
fn extract_default_kid(
    adaptation: &AdaptationSet,
    representation: &Representation,
) -> Option<String> {
    representation
        .ContentProtection
        .iter()
        .chain(adaptation.ContentProtection.iter())
        .filter_map(|cp| cp.default_KID.as_deref())
        .find_map(|kid| match normalize_hex128(kid, "default_KID") {
            Ok(normalized) => Some(normalized),
            Err(_) => {
                warn!(kid, "ignoring malformed default_KID");
                None
            }
        })
}
