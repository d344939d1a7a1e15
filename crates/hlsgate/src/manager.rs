//! Directory of running sessions, keyed by stream id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::error::Result;
use crate::model::StreamSnapshot;
use crate::session::StreamSession;

pub struct StreamManager {
    base_output_dir: PathBuf,
    sessions: Mutex<HashMap<Uuid, Arc<StreamSession>>>,
}

impl StreamManager {
    pub fn new(base_output_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_output_dir = base_output_dir.into();
        std::fs::create_dir_all(&base_output_dir)?;
        Ok(Self {
            base_output_dir,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Validates the config, starts a session for it, and returns the
    /// initial snapshot (status `starting`).
    pub async fn create(&self, config: StreamConfig) -> Result<StreamSnapshot> {
        config.validate()?;

        let id = Uuid::new_v4();
        let output_dir = config
            .output_dir
            .clone()
            .unwrap_or_else(|| self.base_output_dir.join(id.to_string()));

        let session = StreamSession::new(id, config, output_dir);
        StreamSession::spawn(&session).await;

        let snapshot = session.snapshot();
        self.sessions.lock().await.insert(id, session);
        info!(stream = %id, mpd_url = %snapshot.mpd_url, "stream created");
        Ok(snapshot)
    }

    pub async fn get(&self, id: Uuid) -> Option<StreamSnapshot> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|session| session.snapshot())
    }

    /// Resolves the directory a stream's HLS files live in, honoring any
    /// per-stream `output_dir` override.
    pub async fn output_dir(&self, id: Uuid) -> Option<PathBuf> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|session| session.output_dir().to_path_buf())
    }

    pub async fn list(&self) -> Vec<StreamSnapshot> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|session| session.snapshot())
            .collect()
    }

    /// Cancels the session, waits for its task to terminate, and forgets
    /// it. Output files stay on disk. Returns whether the id existed.
    pub async fn remove(&self, id: Uuid) -> bool {
        let session = self.sessions.lock().await.remove(&id);
        match session {
            Some(session) => {
                session.shutdown().await;
                info!(stream = %id, "stream removed");
                true
            }
            None => false,
        }
    }

    /// Stops every session; used on daemon shutdown.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in sessions {
            session.shutdown().await;
        }
    }
}
