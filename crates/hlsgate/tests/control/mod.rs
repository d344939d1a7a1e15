use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;
use wiremock::MockServer;

use hlsgate::{GatewayError, StreamConfig, StreamManager, StreamStatus};

use crate::common::*;

#[tokio::test]
async fn invalid_config_is_rejected_before_a_session_exists() -> Result<()> {
    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;

    let result = manager.create(StreamConfig::new("not a url")).await;
    assert!(matches!(result, Err(GatewayError::Config(_))));
    assert!(manager.list().await.is_empty());

    let mut config = StreamConfig::new("https://example.com/live.mpd");
    config.key = Some("tooshort".into());
    assert!(matches!(
        manager.create(config).await,
        Err(GatewayError::Config(_))
    ));
    Ok(())
}

#[tokio::test]
async fn unknown_ids_are_reported_as_missing() -> Result<()> {
    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;

    assert!(manager.get(Uuid::new_v4()).await.is_none());
    assert!(!manager.remove(Uuid::new_v4()).await);
    Ok(())
}

#[tokio::test]
async fn list_reflects_created_sessions() -> Result<()> {
    let server = MockServer::start().await;
    mount_manifest(
        &server,
        r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT2S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="1000" codecs="avc1.64001f">
        <SegmentTemplate initialization="init.mp4" media="seg_$Number$.m4s" duration="2" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#,
    )
    .await;
    mount_media(&server, "/init.mp4", b"INITSEG").await;
    mount_media(&server, "/seg_1.m4s", b"SEGDATA-1").await;

    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    config.poll_interval = 0.05;
    config.label = Some("demo".into());

    let created = manager.create(config).await?;
    let listed = manager.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);
    assert_eq!(listed[0].label.as_deref(), Some("demo"));

    wait_for_status(&manager, created.id, StreamStatus::Stopped, Duration::from_secs(15)).await;

    // a completed session stays listed until removed; its files persist after
    assert!(manager.remove(created.id).await);
    assert!(manager.list().await.is_empty());
    assert!(root
        .path()
        .join(created.id.to_string())
        .join("master.m3u8")
        .exists());
    Ok(())
}

#[tokio::test]
async fn output_dir_override_redirects_session_files() -> Result<()> {
    let server = MockServer::start().await;
    mount_manifest(
        &server,
        r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT2S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="1000" codecs="avc1.64001f">
        <SegmentTemplate initialization="init.mp4" media="seg_$Number$.m4s" duration="2" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#,
    )
    .await;
    mount_media(&server, "/init.mp4", b"INITSEG").await;
    mount_media(&server, "/seg_1.m4s", b"SEGDATA-1").await;

    let root = tempfile::tempdir()?;
    let custom = tempfile::tempdir()?;
    let custom_dir = custom.path().join("redirected");

    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    config.poll_interval = 0.05;
    config.output_dir = Some(custom_dir.clone());

    let created = manager.create(config).await?;
    // the advertised URL is unchanged; the file route resolves it per stream
    assert_eq!(created.hls_url, format!("/hls/{}/master.m3u8", created.id));
    assert_eq!(manager.output_dir(created.id).await, Some(custom_dir.clone()));

    wait_for_status(&manager, created.id, StreamStatus::Stopped, Duration::from_secs(15)).await;

    assert!(custom_dir.join("master.m3u8").exists());
    assert!(custom_dir.join("index.m3u8").exists());
    assert!(custom_dir.join("segment_1.m4s").exists());
    assert!(!root.path().join(created.id.to_string()).exists());

    assert!(manager.remove(created.id).await);
    assert!(manager.output_dir(created.id).await.is_none());
    // overridden output survives removal like any other output directory
    assert!(custom_dir.join("master.m3u8").exists());
    Ok(())
}

#[tokio::test]
async fn key_without_any_kid_fails_the_session_at_startup() -> Result<()> {
    let server = MockServer::start().await;
    // no ContentProtection in the manifest, and no kid in the config
    mount_manifest(
        &server,
        r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT2S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="1000" codecs="avc1.64001f">
        <SegmentTemplate initialization="init.mp4" media="seg_$Number$.m4s" duration="2" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#,
    )
    .await;
    mount_media(&server, "/init.mp4", b"INITSEG").await;
    mount_media(&server, "/seg_1.m4s", b"SEGDATA-1").await;

    let root = tempfile::tempdir()?;
    let manager = StreamManager::new(root.path())?;
    let mut config = StreamConfig::new(manifest_url(&server));
    config.poll_interval = 0.05;
    config.key = Some("feedf00dfeedf00dfeedf00dfeedf00d".into());

    let created = manager.create(config).await?;
    wait_for_status(&manager, created.id, StreamStatus::Error, Duration::from_secs(15)).await;

    let snapshot = manager.get(created.id).await.unwrap();
    assert!(snapshot.error.unwrap().contains("KID"));
    Ok(())
}
