//! Live DASH to HLS transmuxing gateway.
//!
//! Ingests MPEG-DASH manifests (static and dynamic), continuously fetches
//! their media segments, decrypts CENC content with caller-supplied keys
//! through an external `mp4decrypt`-compatible tool, and re-exposes each
//! stream as an fMP4 HLS variant pair (video + audio) on disk. Many
//! conversions run concurrently in one process, each in its own session,
//! managed through [`StreamManager`].

pub mod config;
pub mod dash;
pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod manager;
pub mod model;
pub mod session;

pub use config::StreamConfig;
pub use error::{GatewayError, Result};
pub use manager::StreamManager;
pub use model::{StreamSnapshot, StreamStatus, TrackKind, VariantInfo};
pub use session::StreamSession;
