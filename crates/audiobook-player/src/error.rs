//! Error types for the playback engine boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Failure opening a container through the decode library.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("open {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecognised container: {0}")]
    Probe(#[from] symphonia::core::errors::Error),
    #[error("no decodable audio track")]
    NoAudioTrack,
}

/// Failure reading track metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Open(#[from] ContainerError),
}

/// Fatal-to-attempt failure while starting a decoder session.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a decoder session is already running")]
    Busy,
    #[error("failed to open container: {0}")]
    Open(#[source] ContainerError),
    #[error("failed to initialise decoder: {0}")]
    DecoderInit(String),
    #[error("transport closed before decoding started")]
    TransportOpen,
    #[error("failed to spawn decoder thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("decoder thread exited during startup")]
    Disconnected,
}

/// Failure of a `Player` operation.
#[derive(Debug, Error)]
pub enum PlayError {
    #[error("player is shutting down")]
    ShuttingDown,
    #[error("no track has been played yet")]
    NoCurrentTrack,
    #[error("rendering pipeline: {0:#}")]
    Render(anyhow::Error),
    #[error(transparent)]
    Decoder(#[from] StartError),
}
