use std::time::Duration;

use anyhow::Result;
use wiremock::MockServer;

use hlsgate::{StreamConfig, StreamManager, StreamStatus};

use crate::common::*;

const VOD_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT10S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="1500000" codecs="avc1.64001f" width="1280" height="720">
        <SegmentTemplate initialization="v_init.mp4" media="v_$Number$.m4s" duration="2" timescale="1" startNumber="1"/>
      </Representation>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2">
        <SegmentTemplate initialization="a_init.mp4" media="a_$Number$.m4s" duration="2" timescale="1" startNumber="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

async fn mount_vod_media(server: &MockServer) {
    mount_media(server, "/v_init.mp4", b"INITSEG-video").await;
    mount_media(server, "/a_init.mp4", b"INITSEG-audio").await;
    for n in 1..=5u64 {
        mount_media(server, &format!("/v_{n}.m4s"), format!("SEGDATA-v{n}").as_bytes()).await;
        mount_media(server, &format!("/a_{n}.m4s"), format!("SEGDATA-a{n}").as_bytes()).await;
    }
}

fn fast(config: &mut StreamConfig) {
    config.poll_interval = 0.05;
}

#[tokio::test]
async fn static_stream_converts_to_completion() -> Result<()> {
    let server = MockServer::start().await;
    mount_manifest(&server, VOD_MPD).await;
    mount_vod_media(&server).await;

    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    fast(&mut config);

    let created = manager.create(config).await?;
    assert!(!created.status.is_terminal());
    assert_eq!(created.hls_url, format!("/hls/{}/master.m3u8", created.id));

    wait_for_status(&manager, created.id, StreamStatus::Stopped, Duration::from_secs(15)).await;

    let snapshot = manager.get(created.id).await.unwrap();
    assert!(snapshot.error.is_none());
    assert!(!snapshot.live);
    assert_eq!(snapshot.video.as_ref().unwrap().representation_id, "v1");
    assert_eq!(snapshot.audio.as_ref().unwrap().representation_id, "a1");
    assert_eq!(snapshot.last_sequence, Some(5));

    let dir = root.path().join(created.id.to_string());
    let master = read_playlist(&dir, "master.m3u8");
    assert!(master.contains("#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"audio\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/index.m3u8\""));
    assert!(master.contains("BANDWIDTH=1628000"));
    assert!(master.contains("RESOLUTION=1280x720"));
    assert!(master.contains("AUDIO=\"aud\""));
    assert!(master.contains("\nindex.m3u8"));

    for (subdir, prefix) in [("", "v"), ("audio", "a")] {
        let variant_dir = if subdir.is_empty() { dir.clone() } else { dir.join(subdir) };
        let playlist = read_playlist(&variant_dir, "index.m3u8");

        assert_eq!(playlist.matches("#EXTINF:2.000,").count(), 5, "{prefix} playlist");
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:1"));
        assert!(playlist.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
        for n in 1..=5u64 {
            assert!(playlist.contains(&format!("segment_{n}.m4s")));
        }
        assert_playlist_files_exist(&variant_dir, &playlist);

        // the wire format must be valid HLS
        let parsed = m3u8_rs::parse_media_playlist_res(playlist.as_bytes())
            .expect("generated playlist must parse");
        assert_eq!(parsed.segments.len(), 5);
        assert_eq!(parsed.media_sequence, 1);
        assert!(parsed.end_list);

        // segment numbers appear in strictly increasing order
        let numbers: Vec<u64> = parsed
            .segments
            .iter()
            .map(|s| {
                s.uri
                    .trim_start_matches("segment_")
                    .trim_end_matches(".m4s")
                    .parse()
                    .unwrap()
            })
            .collect();
        let mut sorted = numbers.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(numbers, sorted, "{prefix} playlist ordering");
    }

    // master parses as well
    m3u8_rs::parse_master_playlist_res(master.as_bytes()).expect("master must parse");
    Ok(())
}

const LADDER_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s" duration="2" timescale="1"/>
      <Representation id="v-500k" bandwidth="500000" codecs="avc1.64001e" width="640" height="360"/>
      <Representation id="v-1m" bandwidth="1000000" codecs="avc1.64001f" width="1280" height="720"/>
      <Representation id="v-2m" bandwidth="2000000" codecs="avc1.640020" width="1920" height="1080"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

#[tokio::test]
async fn representation_id_override_is_honored() -> Result<()> {
    let server = MockServer::start().await;
    mount_manifest(&server, LADDER_MPD).await;
    // only the forced representation's media is mounted; requests for any
    // other rung would 404 and stall the conversion
    mount_media(&server, "/v-1m/init.mp4", b"INITSEG-1m").await;
    for n in 1..=2u64 {
        mount_media(&server, &format!("/v-1m/{n}.m4s"), format!("SEGDATA-{n}").as_bytes()).await;
    }

    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    fast(&mut config);
    config.representation_id = Some("v-1m".into());

    let created = manager.create(config).await?;
    wait_for_status(&manager, created.id, StreamStatus::Stopped, Duration::from_secs(15)).await;

    let snapshot = manager.get(created.id).await.unwrap();
    let video = snapshot.video.unwrap();
    assert_eq!(video.representation_id, "v-1m");
    assert_eq!(video.bandwidth, 1_000_000);
    assert!(snapshot.audio.is_none());

    let dir = root.path().join(created.id.to_string());
    let master = read_playlist(&dir, "master.m3u8");
    assert!(master.contains("BANDWIDTH=1000000"));
    assert!(!master.contains("#EXT-X-MEDIA:"));
    Ok(())
}

const KEYED_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc" cenc:default_KID="9eb4050d-e44b-4802-932e-27d75083e266"/>
      <Representation id="v1" bandwidth="1000000" codecs="avc1.64001f" width="1280" height="720">
        <SegmentTemplate initialization="v_init.mp4" media="v_$Number$.m4s" duration="2" timescale="1" startNumber="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

#[tokio::test]
async fn repeated_decryption_failure_turns_the_session_to_error() -> Result<()> {
    let server = MockServer::start().await;
    mount_manifest(&server, KEYED_MPD).await;
    // the init decrypts fine; media payloads make the tool exit non-zero
    mount_media(&server, "/v_init.mp4", b"INITSEG-video").await;
    mount_media(&server, "/v_1.m4s", b"BADPAYLOAD-1").await;
    mount_media(&server, "/v_2.m4s", b"BADPAYLOAD-2").await;

    let tooldir = tempfile::tempdir()?;
    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    fast(&mut config);
    config.key = Some("feedf00dfeedf00dfeedf00dfeedf00d".into());
    config.mp4decrypt_path = Some(fake_mp4decrypt(tooldir.path()));

    let created = manager.create(config).await?;
    wait_for_status(&manager, created.id, StreamStatus::Error, Duration::from_secs(30)).await;

    let snapshot = manager.get(created.id).await.unwrap();
    let error = snapshot.error.unwrap();
    assert!(error.contains("decryption failed"), "error was: {error}");
    assert!(error.contains("10 consecutive"), "error was: {error}");

    // nothing was ever appended, so no media playlist was published
    let dir = root.path().join(created.id.to_string());
    assert!(!dir.join("index.m3u8").exists());
    Ok(())
}

#[tokio::test]
async fn kid_is_inferred_from_manifest_content_protection() -> Result<()> {
    let server = MockServer::start().await;
    mount_manifest(&server, KEYED_MPD).await;
    mount_media(&server, "/v_init.mp4", b"INITSEG-video").await;
    mount_media(&server, "/v_1.m4s", b"SEGDATA-1").await;
    mount_media(&server, "/v_2.m4s", b"SEGDATA-2").await;

    let tooldir = tempfile::tempdir()?;
    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    fast(&mut config);
    // no kid given: the manifest's default_KID must be used
    config.key = Some("feedf00dfeedf00dfeedf00dfeedf00d".into());
    config.mp4decrypt_path = Some(fake_mp4decrypt(tooldir.path()));

    let created = manager.create(config).await?;
    wait_for_status(&manager, created.id, StreamStatus::Stopped, Duration::from_secs(15)).await;

    let dir = root.path().join(created.id.to_string());
    let playlist = read_playlist(&dir, "index.m3u8");
    assert!(playlist.contains("segment_2.m4s"));
    assert_eq!(
        std::fs::read(dir.join("segment_1.m4s"))?,
        b"SEGDATA-1",
        "decrypted bytes must round-trip through the tool"
    );
    Ok(())
}
