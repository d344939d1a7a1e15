use std::time::Duration;

use chrono::{DateTime, Utc};

/// Segments assumed when a static manifest gives neither a total duration
/// nor a timeline to derive the count from.
const FALLBACK_SEGMENT_COUNT: u64 = 200;

/// Expansion cap for open-ended (`r="-1"`) timeline entries on live
/// manifests; the next refresh extends the timeline anyway.
const OPEN_ENDED_REPEAT_CAP: i64 = 30;

/// Trailing segments enumerated behind the live edge when the manifest
/// specifies no timeShiftBufferDepth.
const DEFAULT_BACKLOG_SEGMENTS: u64 = 30;

/// A SegmentTemplate with inheritance already applied (Representation over
/// AdaptationSet over Period, attribute by attribute).
#[derive(Debug, Clone, Default)]
pub(crate) struct EffectiveTemplate {
    pub initialization: Option<String>,
    pub media: Option<String>,
    pub timescale: u64,
    pub duration: Option<f64>,
    pub start_number: u64,
    pub presentation_time_offset: u64,
    pub timeline: Option<Vec<TimelineEntry>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TimelineEntry {
    pub t: Option<i64>,
    pub d: i64,
    pub r: i64,
}

/// One enumerated media segment, before URL expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentPoint {
    pub number: u64,
    pub time: u64,
    pub duration_ticks: u64,
}

/// Wall-clock context for live enumeration with `@duration` addressing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LiveEdge {
    pub now: DateTime<Utc>,
    pub availability_start: DateTime<Utc>,
    pub period_start: Duration,
    pub suggested_delay: Duration,
    pub time_shift_depth: Option<Duration>,
}

impl EffectiveTemplate {
    pub fn timescale(&self) -> u64 {
        self.timescale.max(1)
    }
}

/// Expands `(t, d, r)` timeline entries into numbered segments. Numbering
/// starts at `startNumber` and increases by one per expanded entry; an
/// omitted `t` continues from the previous entry's end.
pub(crate) fn expand_timeline(template: &EffectiveTemplate, live: bool) -> Vec<SegmentPoint> {
    let Some(entries) = &template.timeline else {
        return Vec::new();
    };

    let offset = template.presentation_time_offset as i64;
    let mut number = template.start_number;
    let mut current_time = offset;
    let mut points = Vec::new();

    for entry in entries {
        if let Some(t) = entry.t {
            current_time = t;
        }
        if entry.d <= 0 {
            continue;
        }

        let repeats = if entry.r >= 0 {
            entry.r
        } else if live {
            OPEN_ENDED_REPEAT_CAP
        } else {
            0
        };

        for _ in 0..=repeats {
            points.push(SegmentPoint {
                number,
                time: (current_time - offset).max(0) as u64,
                duration_ticks: entry.d as u64,
            });
            number += 1;
            current_time += entry.d;
        }
    }

    points
}

/// Enumerates numbered segments for `@duration` addressing on a static
/// manifest: `[startNumber, startNumber + ceil(total / segment_duration))`.
pub(crate) fn enumerate_static(
    template: &EffectiveTemplate,
    total_duration: Option<Duration>,
) -> Vec<SegmentPoint> {
    let Some(duration_ticks) = template.duration.filter(|d| *d > 0.0) else {
        return Vec::new();
    };
    let timescale = template.timescale() as f64;
    let segment_secs = duration_ticks / timescale;

    let count = match total_duration {
        Some(total) if segment_secs > 0.0 => {
            ((total.as_secs_f64() / segment_secs).ceil() as u64).max(1)
        }
        _ => FALLBACK_SEGMENT_COUNT,
    };

    numbered_range(template, template.start_number, count)
}

/// Enumerates the currently-available window of numbered segments for a
/// dynamic manifest. The high-water number derives from the wall clock:
/// `startNumber + floor((now - availabilityStartTime - periodStart) *
/// timescale / duration)`; timeShiftBufferDepth bounds the low end.
pub(crate) fn enumerate_live(template: &EffectiveTemplate, edge: &LiveEdge) -> Vec<SegmentPoint> {
    let Some(duration_ticks) = template.duration.filter(|d| *d > 0.0) else {
        return Vec::new();
    };
    let timescale = template.timescale() as f64;
    let segment_secs = duration_ticks / timescale;

    let origin = edge.availability_start
        + chrono::Duration::from_std(edge.period_start).unwrap_or_default();
    let elapsed = (edge.now - origin)
        .to_std()
        .unwrap_or_default()
        .saturating_sub(edge.suggested_delay);

    let available = (elapsed.as_secs_f64() / segment_secs).floor() as u64;
    if available == 0 {
        return Vec::new();
    }
    let high = template.start_number + available;

    let backlog = match edge.time_shift_depth {
        Some(depth) => ((depth.as_secs_f64() / segment_secs).floor() as u64).max(1),
        None => DEFAULT_BACKLOG_SEGMENTS,
    };
    let low = high.saturating_sub(backlog).max(template.start_number);

    numbered_range(template, low, high - low)
}

fn numbered_range(template: &EffectiveTemplate, first: u64, count: u64) -> Vec<SegmentPoint> {
    let duration_ticks = template.duration.unwrap_or_default();
    (0..count)
        .map(|i| {
            let number = first + i;
            let ticks_from_start = (number - template.start_number) as f64 * duration_ticks;
            SegmentPoint {
                number,
                time: template.presentation_time_offset
                    + ticks_from_start.round() as u64,
                duration_ticks: duration_ticks.round() as u64,
            }
        })
        .collect()
}
