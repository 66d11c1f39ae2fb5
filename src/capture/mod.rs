//! Packet capture: frame decoding, capture files and live capture sessions.

pub mod backend;
pub mod decode;
pub mod reader;
pub mod session;

use std::path::PathBuf;

use thiserror::Error;

pub use backend::{default_backend, ReplayBackend, UnavailableBackend};
#[cfg(feature = "live-capture")]
pub use backend::PcapBackend;
pub use decode::{decode_frame, DecodeError, LinkType, RawFrame};
pub use reader::{is_capture_file, read_capture_file, write_capture_file};
pub use session::{
    CaptureBackend, CaptureManager, CaptureOptions, CaptureStatus, CaptureSummary, PacketSource,
    SourceEvent,
};

/// Errors that can occur while reading captures or running a capture session
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Capture file error: {0}")]
    FileError(#[from] pcap_file::PcapError),
    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("Unsupported link type: {0}")]
    UnsupportedLinkType(String),
    #[error("A capture is already running")]
    AlreadyRunning,
    #[error("No capture is running")]
    NotRunning,
    #[error("Live capture unavailable: {0}")]
    Unavailable(String),
    #[error("Capture device error: {0}")]
    Device(String),
    #[error("Capture worker failed: {0}")]
    Worker(String),
}

#[cfg(feature = "live-capture")]
impl From<pcap::Error> for CaptureError {
    fn from(err: pcap::Error) -> Self {
        CaptureError::Device(err.to_string())
    }
}
