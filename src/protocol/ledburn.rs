//! LedBurn: frames split into UDP segments addressed by strip and pixel offset.
//!
//! Header layout (24 bytes, multi-byte fields little-endian):
//!
//! | bytes  | field                 |
//! |--------|-----------------------|
//! | 0..7   | magic `LedBurn`       |
//! | 7      | version (0)           |
//! | 8..12  | frame id              |
//! | 12..16 | segments in frame     |
//! | 16..20 | segment id            |
//! | 20..22 | strip id              |
//! | 22..24 | first pixel           |
//!
//! followed by RGB triples. Segments can be lost or reordered, and senders
//! can restart with a new frame id.

use log::{debug, info};
use std::time::Instant;

use crate::config::{LedBurnConfig, Topology};
use crate::frame::{FrameBuffers, PixelFrame};

pub const MAGIC: &[u8; 7] = b"LedBurn";
pub const VERSION: u8 = 0;
pub const HEADER_SIZE: usize = 24;

/// Segment tracker capacity per configured strip.
pub const SEGMENTS_PER_STRIP: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedBurnError {
    #[error("packet too short: {0} bytes, header alone is 24")]
    TooShort(usize),

    #[error("not a LedBurn packet")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("payload of {0} bytes is not a whole number of pixels")]
    PartialPixel(usize),

    #[error("frame has {count} segments, at most {capacity} are supported")]
    TooManySegments { count: u32, capacity: usize },

    #[error("segment {id} out of range for a frame of {count} segments")]
    SegmentOutOfRange { id: u32, count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub segments_in_frame: u32,
    pub segment_id: u32,
    pub strip_id: u16,
    pub pixel_id: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

impl<'a> Packet<'a> {
    /// Check framing and split a datagram into header and pixel payload.
    pub fn parse(buf: &'a [u8]) -> Result<Self, LedBurnError> {
        if buf.len() < HEADER_SIZE {
            return Err(LedBurnError::TooShort(buf.len()));
        }
        if &buf[..7] != MAGIC {
            return Err(LedBurnError::BadMagic);
        }
        if buf[7] != VERSION {
            return Err(LedBurnError::UnsupportedVersion(buf[7]));
        }
        let payload = &buf[HEADER_SIZE..];
        if payload.len() % 3 != 0 {
            return Err(LedBurnError::PartialPixel(payload.len()));
        }

        let header = PacketHeader {
            frame_id: read_u32(buf, 8),
            segments_in_frame: read_u32(buf, 12),
            segment_id: read_u32(buf, 16),
            strip_id: read_u16(buf, 20),
            pixel_id: read_u16(buf, 22),
        };
        Ok(Packet { header, payload })
    }

    pub fn pixel_count(&self) -> usize {
        self.payload.len() / 3
    }
}

/// How an incoming frame id relates to the one being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Current,
    /// Belongs to a frame that was already superseded
    Stale { diff: i64 },
    /// Newer frame, or a sender restart
    Resync { diff: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Duplicate,
    Partial,
    Complete,
}

/// Which segments of the frame being assembled have arrived.
#[derive(Debug)]
pub struct SegmentTracker {
    frame_id: u32,
    received: Vec<bool>,
    received_count: u32,
    ready: bool,
}

impl SegmentTracker {
    pub fn new(capacity: usize) -> Self {
        SegmentTracker {
            frame_id: 0,
            received: vec![false; capacity],
            received_count: 0,
            ready: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.received.len()
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn reset(&mut self, frame_id: u32) {
        self.frame_id = frame_id;
        self.received_count = 0;
        self.received.fill(false);
    }

    pub fn reconcile(&self, frame_id: u32, stale_window: i64) -> Reconcile {
        let diff = i64::from(frame_id) - i64::from(self.frame_id);
        if diff == 0 {
            Reconcile::Current
        } else if diff < 0 && diff > -stale_window {
            Reconcile::Stale { diff }
        } else {
            Reconcile::Resync { diff }
        }
    }

    /// Mark a segment of the current frame as received.
    ///
    /// On the last missing segment the frame becomes ready and the tracker
    /// moves on to the next frame id.
    pub fn record(&mut self, segment_id: u32, segments_in_frame: u32) -> Record {
        let Some(seen) = self.received.get_mut(segment_id as usize) else {
            return Record::Duplicate;
        };
        if *seen {
            return Record::Duplicate;
        }
        *seen = true;
        self.received_count += 1;

        if self.received_count >= segments_in_frame {
            self.reset(self.frame_id.wrapping_add(1));
            self.ready = true;
            Record::Complete
        } else {
            Record::Partial
        }
    }

    /// Consume the ready flag.
    pub fn take_ready(&mut self) -> bool {
        std::mem::take(&mut self.ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    Stale { diff: i64 },
    Accepted { resynced: bool, record: Record },
}

/// Builds whole frames out of LedBurn segments and hands them to the frame buffers.
#[derive(Debug)]
pub struct SegmentAssembler {
    topology: Topology,
    tracker: SegmentTracker,
    staging: PixelFrame,
    stale_window: i64,
    blank_on_resync: bool,
}

impl SegmentAssembler {
    pub fn new(topology: Topology, config: &LedBurnConfig) -> Self {
        SegmentAssembler {
            topology,
            tracker: SegmentTracker::new(topology.strips * SEGMENTS_PER_STRIP),
            staging: PixelFrame::black(topology.pixel_count()),
            stale_window: config.stale_window(),
            blank_on_resync: config.blank_on_resync,
        }
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &SegmentTracker {
        &self.tracker
    }

    /// Frame being assembled.
    #[cfg(test)]
    pub fn staging(&self) -> &PixelFrame {
        &self.staging
    }

    pub fn set_policy(&mut self, config: &LedBurnConfig) {
        self.stale_window = config.stale_window();
        self.blank_on_resync = config.blank_on_resync;
    }

    fn check_segments(&self, header: &PacketHeader) -> Result<(), LedBurnError> {
        let capacity = self.tracker.capacity();
        if header.segments_in_frame as usize > capacity {
            return Err(LedBurnError::TooManySegments {
                count: header.segments_in_frame,
                capacity,
            });
        }
        if header.segment_id >= header.segments_in_frame {
            return Err(LedBurnError::SegmentOutOfRange {
                id: header.segment_id,
                count: header.segments_in_frame,
            });
        }
        Ok(())
    }

    pub fn accept(
        &mut self,
        packet: &Packet<'_>,
        frames: &mut FrameBuffers,
        now: Instant,
    ) -> Result<SegmentOutcome, LedBurnError> {
        let header = &packet.header;
        self.check_segments(header)?;

        let resynced = match self.tracker.reconcile(header.frame_id, self.stale_window) {
            Reconcile::Current => false,
            Reconcile::Stale { diff } => return Ok(SegmentOutcome::Stale { diff }),
            Reconcile::Resync { diff } => {
                info!(
                    "New frame reference point: old frame id {}, new frame id {}, diff {}",
                    self.tracker.frame_id(),
                    header.frame_id,
                    diff
                );
                self.resync(header.frame_id, frames, now);
                true
            }
        };

        self.paint(packet);

        let record = self.tracker.record(header.segment_id, header.segments_in_frame);
        if self.tracker.take_ready() {
            frames.accept_pixels(&self.staging, now);
        }
        Ok(SegmentOutcome::Accepted { resynced, record })
    }

    fn resync(&mut self, frame_id: u32, frames: &mut FrameBuffers, now: Instant) {
        // Show what we already have of the abandoned frame
        if self.tracker.received_count() > 0 {
            frames.accept_pixels(&self.staging, now);
        }
        self.tracker.reset(frame_id);

        if self.blank_on_resync {
            self.staging.clear();
            frames.accept_pixels(&self.staging, now);
        }
    }

    fn paint(&mut self, packet: &Packet<'_>) {
        let strip = usize::from(packet.header.strip_id);
        let pixel = usize::from(packet.header.pixel_id);
        let Some(start) = self.topology.index(strip, pixel) else {
            debug!(
                "Segment addresses strip {} pixel {} outside the {}x{} layout",
                strip, pixel, self.topology.strips, self.topology.pixels_per_strip
            );
            return;
        };

        let count = packet
            .pixel_count()
            .min(self.topology.pixels_per_strip - pixel);
        self.staging.write_run(start, &packet.payload[..count * 3]);
    }
}

#[cfg(test)]
pub(crate) fn encode_packet(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&header.frame_id.to_le_bytes());
    buf.extend_from_slice(&header.segments_in_frame.to_le_bytes());
    buf.extend_from_slice(&header.segment_id.to_le_bytes());
    buf.extend_from_slice(&header.strip_id.to_le_bytes());
    buf.extend_from_slice(&header.pixel_id.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}
