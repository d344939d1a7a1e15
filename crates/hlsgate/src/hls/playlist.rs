//! Line-oriented rendering of HLS master and media playlists (fMP4, v7).

/// One media segment entry of a playlist.
#[derive(Debug, Clone)]
pub struct PlaylistSegment {
    pub uri: String,
    pub duration: f64,
    /// Prefix this entry with `#EXT-X-DISCONTINUITY`.
    pub discontinuity: bool,
}

#[derive(Debug)]
pub struct MediaPlaylist<'a> {
    pub target_duration: u64,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    pub map_uri: &'a str,
    pub vod: bool,
    pub end_list: bool,
    pub segments: &'a [PlaylistSegment],
}

impl MediaPlaylist<'_> {
    pub fn render(&self) -> String {
        let mut lines = vec![
            "#EXTM3U".to_string(),
            "#EXT-X-VERSION:7".to_string(),
            format!("#EXT-X-TARGETDURATION:{}", self.target_duration),
            format!("#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence),
        ];
        if self.discontinuity_sequence > 0 {
            lines.push(format!(
                "#EXT-X-DISCONTINUITY-SEQUENCE:{}",
                self.discontinuity_sequence
            ));
        }
        if self.vod {
            lines.push("#EXT-X-PLAYLIST-TYPE:VOD".to_string());
        }
        lines.push(format!("#EXT-X-MAP:URI=\"{}\"", self.map_uri));

        for segment in self.segments {
            if segment.discontinuity {
                lines.push("#EXT-X-DISCONTINUITY".to_string());
            }
            lines.push(format!("#EXTINF:{:.3},", segment.duration));
            lines.push(segment.uri.clone());
        }

        if self.end_list {
            lines.push("#EXT-X-ENDLIST".to_string());
        }

        lines.join("\n") + "\n"
    }
}

/// A `#EXT-X-STREAM-INF` entry of the master playlist.
#[derive(Debug, Clone)]
pub struct MasterVariant {
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub resolution: Option<(u64, u64)>,
    pub audio_group: Option<String>,
    pub uri: String,
}

/// A `#EXT-X-MEDIA` rendition entry (alternate audio).
#[derive(Debug, Clone)]
pub struct MasterMedia {
    pub group_id: String,
    pub name: String,
    pub uri: String,
}

pub fn render_master(variants: &[MasterVariant], media: &[MasterMedia]) -> String {
    let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:7".to_string()];

    for entry in media {
        lines.push(format!(
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{}\",NAME=\"{}\",DEFAULT=YES,AUTOSELECT=YES,URI=\"{}\"",
            entry.group_id, entry.name, entry.uri
        ));
    }

    for variant in variants {
        let mut attrs = vec![format!("BANDWIDTH={}", variant.bandwidth)];
        if let Some((w, h)) = variant.resolution {
            attrs.push(format!("RESOLUTION={w}x{h}"));
        }
        if let Some(codecs) = &variant.codecs {
            attrs.push(format!("CODECS=\"{codecs}\""));
        }
        if let Some(group) = &variant.audio_group {
            attrs.push(format!("AUDIO=\"{group}\""));
        }
        lines.push(format!("#EXT-X-STREAM-INF:{}", attrs.join(",")));
        lines.push(variant.uri.clone());
    }

    lines.join("\n") + "\n"
}
