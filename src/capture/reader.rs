//! Reading and writing capture files.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::{debug, warn};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use pcap_file::pcapng::{Block, PcapNgReader};

use crate::capture::decode::{LinkType, RawFrame};
use crate::capture::CaptureError;
use crate::utils::{duration_since_epoch, timestamp_from_duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pcap,
    PcapNg,
}

fn format_of(path: &Path) -> Option<Format> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "pcap" => Some(Format::Pcap),
        "pcapng" => Some(Format::PcapNg),
        _ => None,
    }
}

/// Whether `path` names a `.pcap` or `.pcapng` file (by extension, any case)
pub fn is_capture_file(path: &Path) -> bool {
    format_of(path).is_some()
}

/// Read every frame from a capture file.
///
/// A file cut off mid-record yields the frames before the damage.
pub fn read_capture_file(path: &Path) -> Result<Vec<RawFrame>, CaptureError> {
    let format = format_of(path).ok_or_else(|| CaptureError::UnsupportedFormat(path.to_path_buf()))?;
    let file = BufReader::new(File::open(path)?);

    let frames = match format {
        Format::Pcap => read_pcap(file, path)?,
        Format::PcapNg => read_pcapng(file, path)?,
    };
    debug!("Read {} frames from {}", frames.len(), path.display());
    Ok(frames)
}

fn read_pcap(file: BufReader<File>, path: &Path) -> Result<Vec<RawFrame>, CaptureError> {
    let mut reader = PcapReader::new(file)?;
    let datalink = reader.header().datalink;
    let link_type = LinkType::from_datalink(datalink)
        .ok_or_else(|| CaptureError::UnsupportedLinkType(format!("{:?}", datalink)))?;

    let mut frames = Vec::new();
    while let Some(packet) = reader.next_packet() {
        match packet {
            Ok(packet) => frames.push(RawFrame {
                timestamp: timestamp_from_duration(packet.timestamp),
                link_type,
                data: packet.data.into_owned(),
                original_len: packet.orig_len,
            }),
            Err(e) => {
                warn!("Stopped reading {} after {} frames: {}", path.display(), frames.len(), e);
                break;
            }
        }
    }
    Ok(frames)
}

fn read_pcapng(file: BufReader<File>, path: &Path) -> Result<Vec<RawFrame>, CaptureError> {
    let mut reader = PcapNgReader::new(file)?;
    // Link type of each interface, in declaration order
    let mut interfaces: Vec<Option<LinkType>> = Vec::new();
    let mut frames = Vec::new();
    let mut unsupported = 0u64;

    while let Some(block) = reader.next_block() {
        let block = match block {
            Ok(block) => block,
            Err(e) => {
                warn!("Stopped reading {} after {} frames: {}", path.display(), frames.len(), e);
                break;
            }
        };
        match block {
            Block::InterfaceDescription(idb) => {
                interfaces.push(LinkType::from_datalink(idb.linktype));
            }
            Block::EnhancedPacket(epb) => {
                match interfaces.get(epb.interface_id as usize).copied().flatten() {
                    Some(link_type) => frames.push(RawFrame {
                        timestamp: timestamp_from_duration(epb.timestamp),
                        link_type,
                        data: epb.data.into_owned(),
                        original_len: epb.original_len,
                    }),
                    None => unsupported += 1,
                }
            }
            Block::SimplePacket(spb) => match interfaces.first().copied().flatten() {
                // Simple packets carry no timestamp.
                Some(link_type) => frames.push(RawFrame {
                    timestamp: timestamp_from_duration(Default::default()),
                    link_type,
                    data: spb.data.into_owned(),
                    original_len: spb.original_len,
                }),
                None => unsupported += 1,
            },
            _ => {}
        }
    }

    if unsupported > 0 {
        warn!(
            "Skipped {} frames with unsupported link types in {}",
            unsupported,
            path.display()
        );
    }
    Ok(frames)
}

/// Write frames as a classic pcap file.
///
/// The file takes the link type of the first frame; frames of any other link
/// type are left out.
pub fn write_capture_file(path: &Path, frames: &[RawFrame]) -> Result<usize, CaptureError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let link_type = frames
        .first()
        .map(|frame| frame.link_type)
        .unwrap_or(LinkType::Ethernet);
    let header = PcapHeader {
        datalink: link_type.to_datalink(),
        ..PcapHeader::default()
    };
    let mut writer = PcapWriter::with_header(BufWriter::new(File::create(path)?), header)?;

    let mut written = 0;
    for frame in frames.iter().filter(|frame| frame.link_type == link_type) {
        let packet = PcapPacket::new(
            duration_since_epoch(frame.timestamp),
            frame.original_len.max(frame.data.len() as u32),
            &frame.data,
        );
        writer.write_packet(&packet)?;
        written += 1;
    }
    writer.into_writer().flush()?;

    Ok(written)
}
