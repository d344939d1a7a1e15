//! fMP4 HLS output: playlist rendering and the per-stream writer.

pub mod playlist;
pub mod writer;

pub use writer::{MasterTrack, MultiVariantWriter, VariantWriter};
