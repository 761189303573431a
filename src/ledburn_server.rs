use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::ledburn::{Packet, Record, SegmentOutcome};
use crate::state::SharedFrames;
use crate::stats::Stats;

const POLL: Duration = Duration::from_millis(100);

/// Largest datagram accepted; a segment never needs more.
const DATAGRAM_SIZE: usize = 65536;

pub fn bind(addr: &str) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).context(format!("Failed to bind to {}", addr))?;
    socket
        .set_read_timeout(Some(POLL))
        .context("Failed to set socket read timeout")?;
    Ok(socket)
}

pub struct LedBurnServer {
    frames: SharedFrames,
    stats: Arc<Stats>,
}

impl LedBurnServer {
    pub fn new(frames: SharedFrames, stats: Arc<Stats>) -> Self {
        LedBurnServer { frames, stats }
    }

    /// Feed one datagram into segment assembly. Nothing is ever sent back.
    pub fn handle_datagram(&self, data: &[u8], source: SocketAddr, now: Instant) {
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("[ledburn] Dropping packet from {}: {}", source, e);
                self.stats.record_dropped_packet();
                return;
            }
        };

        let header = packet.header;
        let outcome = self.frames.lock().accept_segment(&packet, now);
        match outcome {
            Ok(SegmentOutcome::Stale { diff }) => {
                debug!(
                    "[ledburn] Ignoring segment {} of old frame {} (diff {})",
                    header.segment_id, header.frame_id, diff
                );
            }
            Ok(SegmentOutcome::Accepted { record: Record::Duplicate, .. }) => {
                trace!(
                    "[ledburn] Duplicate segment {} of frame {}",
                    header.segment_id, header.frame_id
                );
            }
            Ok(SegmentOutcome::Accepted { record: Record::Partial, .. }) => {}
            Ok(SegmentOutcome::Accepted { record: Record::Complete, .. }) => {
                trace!(
                    "[ledburn] Frame {} complete ({} segments)",
                    header.frame_id, header.segments_in_frame
                );
                self.stats.record_ledburn_frame();
            }
            Err(e) => {
                warn!("[ledburn] Dropping segment from {}: {}", source, e);
                self.stats.record_dropped_packet();
            }
        }
    }
}

/// Receive LedBurn segments until `running` is cleared.
pub fn run(socket: UdpSocket, server: LedBurnServer, running: Arc<AtomicBool>) {
    if let Ok(addr) = socket.local_addr() {
        info!("✓ LedBurn server listening on udp://{}", addr);
    }

    let mut datagram = vec![0u8; DATAGRAM_SIZE];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut datagram) {
            Ok((len, source)) => server.handle_datagram(&datagram[..len], source, Instant::now()),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!("[ledburn] Receive failed: {}", e);
                thread::sleep(POLL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::ledburn::{encode_packet, PacketHeader};

    fn server() -> (LedBurnServer, SharedFrames, Arc<Stats>) {
        let mut config = Config::default();
        config.strips = 2;
        config.pixels_per_strip = 4;
        let frames = SharedFrames::new(&config, Instant::now());
        let stats = Arc::new(Stats::default());
        (LedBurnServer::new(frames.clone(), Arc::clone(&stats)), frames, stats)
    }

    fn source() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    fn segment(frame_id: u32, segment_id: u32, strip_id: u16) -> Vec<u8> {
        let header = PacketHeader {
            frame_id,
            segments_in_frame: 2,
            segment_id,
            strip_id,
            pixel_id: 0,
        };
        encode_packet(&header, &[strip_id as u8 + 1; 12])
    }

    #[test]
    fn test_malformed_packets_are_counted() {
        let (server, frames, stats) = server();
        server.handle_datagram(b"not a ledburn packet at all", source(), Instant::now());
        server.handle_datagram(&[0; 4], source(), Instant::now());

        assert_eq!(stats.snapshot().dropped_packets, 2);
        assert_eq!(frames.lock().assembler().tracker().received_count(), 0);
    }

    #[test]
    fn test_bounds_violations_are_dropped() {
        let (server, _frames, stats) = server();
        let header = PacketHeader {
            frame_id: 0,
            segments_in_frame: 2,
            segment_id: 2,
            strip_id: 0,
            pixel_id: 0,
        };
        server.handle_datagram(&encode_packet(&header, &[]), source(), Instant::now());
        assert_eq!(stats.snapshot().dropped_packets, 1);
    }

    #[test]
    fn test_complete_frames_are_counted() {
        let (server, frames, stats) = server();
        let now = Instant::now();
        server.handle_datagram(&segment(0, 0, 0), source(), now);
        server.handle_datagram(&segment(0, 0, 0), source(), now);
        assert_eq!(stats.snapshot().ledburn_frames, 0);

        server.handle_datagram(&segment(0, 1, 1), source(), now);
        assert_eq!(stats.snapshot().ledburn_frames, 1);
        assert_eq!(stats.snapshot().dropped_packets, 0);

        let state = frames.lock();
        assert_eq!(state.buffers().frame_count(), 1);
        assert_eq!(state.buffers().next().pixels()[0], [1, 1, 1]);
        assert_eq!(state.buffers().next().pixels()[4], [2, 2, 2]);
    }

    #[test]
    fn test_udp_loop_receives_segments() {
        let (server, frames, _) = server();
        let socket = bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = Arc::clone(&running);
            thread::spawn(move || run(socket, server, running))
        };

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&segment(0, 0, 0), addr).unwrap();
        sender.send_to(&segment(0, 1, 1), addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.lock().buffers().frame_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(frames.lock().buffers().frame_count(), 1);

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
