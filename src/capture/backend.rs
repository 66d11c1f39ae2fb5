//! Capture backends.
//!
//! - [`ReplayBackend`] replays a capture file as if it were live traffic.
//! - [`UnavailableBackend`] lists interfaces but refuses to capture; it is
//!   the default when the crate is built without the `live-capture` feature.
//! - `PcapBackend` captures through libpcap (`live-capture` feature).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::capture::decode::RawFrame;
use crate::capture::reader::read_capture_file;
use crate::capture::session::{CaptureBackend, CaptureOptions, PacketSource, SourceEvent};
use crate::capture::CaptureError;

/// The live backend this build supports
#[cfg(feature = "live-capture")]
pub fn default_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(PcapBackend)
}

/// The live backend this build supports
#[cfg(not(feature = "live-capture"))]
pub fn default_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(UnavailableBackend)
}

/// Replays the frames of a capture file
#[derive(Debug, Clone)]
pub struct ReplayBackend {
    path: PathBuf,
}

impl ReplayBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

struct ReplaySource {
    frames: VecDeque<RawFrame>,
}

impl PacketSource for ReplaySource {
    fn next_frame(&mut self) -> Result<SourceEvent, CaptureError> {
        Ok(self
            .frames
            .pop_front()
            .map_or(SourceEvent::Exhausted, SourceEvent::Frame))
    }
}

impl CaptureBackend for ReplayBackend {
    fn open(&self, options: &CaptureOptions) -> Result<Box<dyn PacketSource>, CaptureError> {
        if options.filter.is_some() {
            debug!("Replay ignores capture filter {:?}", options.filter);
        }
        let frames = read_capture_file(&self.path)?;
        Ok(Box::new(ReplaySource {
            frames: frames.into(),
        }))
    }

    fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string());
        Ok(vec![format!("replay:{}", name)])
    }
}

/// Backend for builds without live capture support
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableBackend;

impl CaptureBackend for UnavailableBackend {
    fn open(&self, _options: &CaptureOptions) -> Result<Box<dyn PacketSource>, CaptureError> {
        Err(CaptureError::Unavailable(
            "built without the live-capture feature".to_string(),
        ))
    }

    fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir("/sys/class/net")? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(feature = "live-capture")]
pub use self::live::PcapBackend;

#[cfg(feature = "live-capture")]
mod live {
    use super::*;
    use crate::capture::decode::LinkType;
    use chrono::{TimeZone, Utc};
    use log::info;
    use pcap::{Active, Capture, Device};

    const SNAPLEN: i32 = 65535;
    const READ_TIMEOUT_MS: i32 = 500;

    /// Captures from a network interface through libpcap
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PcapBackend;

    struct PcapSource {
        capture: Capture<Active>,
        link_type: LinkType,
    }

    impl PacketSource for PcapSource {
        fn next_frame(&mut self) -> Result<SourceEvent, CaptureError> {
            match self.capture.next_packet() {
                Ok(packet) => {
                    let timestamp = Utc
                        .timestamp_opt(
                            packet.header.ts.tv_sec as i64,
                            (packet.header.ts.tv_usec as u32).saturating_mul(1000),
                        )
                        .single()
                        .unwrap_or_else(Utc::now);
                    Ok(SourceEvent::Frame(RawFrame {
                        timestamp,
                        link_type: self.link_type,
                        data: packet.data.to_vec(),
                        original_len: packet.header.len,
                    }))
                }
                Err(pcap::Error::TimeoutExpired) => Ok(SourceEvent::Idle),
                Err(pcap::Error::NoMorePackets) => Ok(SourceEvent::Exhausted),
                Err(e) => Err(e.into()),
            }
        }
    }

    impl CaptureBackend for PcapBackend {
        fn open(&self, options: &CaptureOptions) -> Result<Box<dyn PacketSource>, CaptureError> {
            let device = match &options.interface {
                Some(name) => Device::from(name.as_str()),
                None => Device::lookup()?.ok_or_else(|| {
                    CaptureError::Device("no default capture interface".to_string())
                })?,
            };
            let name = device.name.clone();

            let mut capture = Capture::from_device(device)?
                .promisc(true)
                .snaplen(SNAPLEN)
                .timeout(READ_TIMEOUT_MS)
                .open()?;
            if let Some(filter) = &options.filter {
                capture.filter(filter, true)?;
            }

            let link_type = match capture.get_datalink().0 {
                1 => LinkType::Ethernet,
                12 | 101 => LinkType::RawIp,
                other => {
                    return Err(CaptureError::UnsupportedLinkType(format!(
                        "libpcap link type {}",
                        other
                    )))
                }
            };

            info!("Opened {} for capture", name);
            Ok(Box::new(PcapSource { capture, link_type }))
        }

        fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
            Ok(Device::list()?.into_iter().map(|device| device.name).collect())
        }
    }
}
