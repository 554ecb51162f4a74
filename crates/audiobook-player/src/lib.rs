//! Chaptered audio-book playback engine.
//!
//! A [`controller::Player`] drives one decoder session and one rendering pipeline per
//! playback attempt, joined by an in-process PCM [`transport::Transport`]. All access to
//! the decode library goes through the process-wide [`guard`].

pub mod chapters;
pub mod config;
pub mod container;
pub mod controller;
pub mod decode;
pub mod device;
pub mod error;
pub mod guard;
pub mod metadata;
pub mod pipeline;
pub mod playback;
pub mod position;
pub mod queue;
pub mod resample;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use config::PlaybackConfig;
pub use controller::{PlaybackObserver, Player};
pub use error::{ContainerError, MetadataError, PlayError, StartError};
