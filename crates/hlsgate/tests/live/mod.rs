use std::time::Duration;

use anyhow::Result;
use wiremock::MockServer;

use hlsgate::{StreamConfig, StreamManager, StreamStatus};

use crate::common::*;

/// Dynamic manifest with an explicit timeline; `r` controls how many
/// segments are advertised past number 100.
fn live_mpd(repeat: u64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" availabilityStartTime="2024-05-01T00:00:00Z" minimumUpdatePeriod="PT0S" timeShiftBufferDepth="PT30S">
  <Period start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="1500000" codecs="avc1.64001f" width="1280" height="720">
        <SegmentTemplate initialization="init_src.mp4" media="seg_$Number$.m4s" timescale="1" startNumber="100">
          <SegmentTimeline>
            <S t="0" d="2" r="{repeat}"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#
    )
}

fn fast(config: &mut StreamConfig) {
    config.poll_interval = 0.05;
    config.window_size = 3;
}

#[tokio::test]
async fn live_window_slides_with_the_manifest() -> Result<()> {
    let server = MockServer::start().await;
    // first poll advertises 100..=102, later polls 100..=104
    mount_manifest_sequence(&server, &live_mpd(2), &live_mpd(4)).await;
    mount_media(&server, "/init_src.mp4", b"INITSEG-video").await;
    for n in 100..=104u64 {
        mount_media(&server, &format!("/seg_{n}.m4s"), format!("SEGDATA-{n}").as_bytes()).await;
    }

    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    fast(&mut config);

    let created = manager.create(config).await?;
    let dir = root.path().join(created.id.to_string());

    let playlist_path = dir.join("index.m3u8");
    wait_until("segment 104 to reach the playlist", Duration::from_secs(15), || {
        std::fs::read_to_string(&playlist_path)
            .map(|p| p.contains("segment_104.m4s"))
            .unwrap_or(false)
    })
    .await;

    let snapshot = manager.get(created.id).await.unwrap();
    assert_eq!(snapshot.status, StreamStatus::Running);
    assert!(snapshot.live);
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.last_sequence, Some(104));

    let playlist = read_playlist(&dir, "index.m3u8");
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:102"));
    assert!(!playlist.contains("#EXT-X-ENDLIST"));
    assert!(!playlist.contains("#EXT-X-PLAYLIST-TYPE"));
    for n in [102u64, 103, 104] {
        assert!(playlist.contains(&format!("segment_{n}.m4s")));
        assert!(dir.join(format!("segment_{n}.m4s")).exists());
    }
    for n in [100u64, 101] {
        assert!(!playlist.contains(&format!("segment_{n}.m4s")));
        assert!(!dir.join(format!("segment_{n}.m4s")).exists(), "segment {n} not evicted");
    }
    assert_playlist_files_exist(&dir, &playlist);

    // removal cancels without finalizing: live playlists keep no ENDLIST
    assert!(manager.remove(created.id).await);
    assert!(manager.get(created.id).await.is_none());
    let playlist = read_playlist(&dir, "index.m3u8");
    assert!(!playlist.contains("#EXT-X-ENDLIST"));
    Ok(())
}

#[tokio::test]
async fn segment_404_is_skipped_and_recovered_next_cycle() -> Result<()> {
    let server = MockServer::start().await;
    mount_manifest_sequence(&server, &live_mpd(2), &live_mpd(4)).await;
    mount_media(&server, "/init_src.mp4", b"INITSEG-video").await;
    for n in [100u64, 101, 102, 104] {
        mount_media(&server, &format!("/seg_{n}.m4s"), format!("SEGDATA-{n}").as_bytes()).await;
    }
    // 103 is not available for its first two polls, then appears
    mount_media_flaky(&server, "/seg_103.m4s", 2, b"SEGDATA-103").await;

    let tooldir = tempfile::tempdir()?;
    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    fast(&mut config);
    config.key = Some("feedf00dfeedf00dfeedf00dfeedf00d".into());
    config.kid = Some("9eb4050de44b4802932e27d75083e266".into());
    config.mp4decrypt_path = Some(fake_mp4decrypt(tooldir.path()));

    let created = manager.create(config).await?;
    let dir = root.path().join(created.id.to_string());

    let playlist_path = dir.join("index.m3u8");
    wait_until("segment 104 to reach the playlist", Duration::from_secs(20), || {
        std::fs::read_to_string(&playlist_path)
            .map(|p| p.contains("segment_104.m4s"))
            .unwrap_or(false)
    })
    .await;

    let snapshot = manager.get(created.id).await.unwrap();
    assert_eq!(snapshot.status, StreamStatus::Running, "{:?}", snapshot.error);
    assert!(snapshot.error.is_none());

    let playlist = read_playlist(&dir, "index.m3u8");
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:102"));
    for n in [102u64, 103, 104] {
        assert!(playlist.contains(&format!("segment_{n}.m4s")));
    }
    // the late segment went through the decryption tool and landed on disk
    assert_eq!(std::fs::read(dir.join("segment_103.m4s"))?, b"SEGDATA-103");
    // a 404 never counts toward the failure cap, so no discontinuity either:
    // 103 arrived before 104 was appended
    assert!(!playlist.contains("#EXT-X-DISCONTINUITY"));

    manager.remove(created.id).await;
    Ok(())
}
