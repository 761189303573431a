use anyhow::{Context, Result};
use log::{debug, error, info, log_enabled, trace, warn, Level};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SharedConfig;
use crate::protocol::opc::{config_reply, decode_message, Command, Message, SYSTEM_ID_FADECANDY};
use crate::state::SharedFrames;
use crate::stats::Stats;

const RECV_BUFFER_SIZE: usize = 16384; // 16KB

/// Largest datagram the UDP listener accepts.
const DATAGRAM_SIZE: usize = 65536;

const POLL: Duration = Duration::from_millis(100);

fn hex_prefix(data: &[u8]) -> String {
    data.iter()
        .take(30)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Executes OPC commands against the shared frame state.
pub struct OpcHandler {
    frames: SharedFrames,
    config: SharedConfig,
    stats: Arc<Stats>,
}

impl OpcHandler {
    pub fn new(frames: SharedFrames, config: SharedConfig, stats: Arc<Stats>) -> Self {
        OpcHandler { frames, config, stats }
    }

    /// Run one command. Returns the bytes to send back, if any.
    pub fn handle(&self, message: &Message<'_>, now: Instant) -> Option<Vec<u8>> {
        match message.command() {
            Command::SetPixels(data) => {
                if log_enabled!(Level::Trace) {
                    trace!(
                        "[opc] Received: channel={}, byte_count={}, pixel_count={}, first bytes: {}",
                        message.channel,
                        data.len(),
                        data.len() / 3,
                        hex_prefix(data)
                    );
                }
                self.frames.lock().accept_frame(data, now);
                self.stats.record_opc_frame();
                None
            }
            Command::GetConfig => {
                debug!("[opc] Sending config");
                Some(config_reply(&self.config.status_json()))
            }
            Command::UnsupportedSystem(SYSTEM_ID_FADECANDY) => {
                warn!("[opc] Received Fadecandy system command, only LEDscape commands are supported");
                None
            }
            Command::UnsupportedSystem(system_id) => {
                warn!("[opc] Received system command for unsupported system id {}", system_id);
                None
            }
            Command::UnsupportedSystemCommand(command) => {
                warn!("[opc] Received unsupported LEDscape command {}", command);
                None
            }
            Command::Truncated(len) => {
                warn!("[opc] System command with {} byte payload is too short", len);
                None
            }
            Command::Unsupported(command) => {
                debug!("[opc] Ignoring unsupported command {}", command);
                None
            }
        }
    }

    /// Run every complete message at the front of `buffer` and remove it.
    /// A trailing partial message stays in the buffer.
    pub fn drain_messages(&self, buffer: &mut Vec<u8>, now: Instant) -> Vec<Vec<u8>> {
        let mut consumed = 0;
        let mut replies = Vec::new();
        while let Some((size, message)) = decode_message(&buffer[consumed..]) {
            if let Some(reply) = self.handle(&message, now) {
                replies.push(reply);
            }
            consumed += size;
        }
        buffer.drain(..consumed);
        replies
    }
}

pub fn bind_tcp(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).context(format!("Failed to bind to {}", addr))?;

    // Set nonblocking so accept() can check running flag periodically
    listener
        .set_nonblocking(true)
        .context("Failed to set listener to non-blocking mode")?;
    Ok(listener)
}

pub fn bind_udp(addr: &str) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).context(format!("Failed to bind to {}", addr))?;
    socket
        .set_read_timeout(Some(POLL))
        .context("Failed to set socket read timeout")?;
    Ok(socket)
}

/// Accept OPC stream clients, one thread each, until `running` is cleared.
pub fn run_tcp(listener: TcpListener, handler: Arc<OpcHandler>, running: Arc<AtomicBool>) {
    if let Ok(addr) = listener.local_addr() {
        info!("✓ OPC server listening on tcp://{}", addr);
    }

    let mut clients = Vec::new();
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                info!("✓ Client connected from {}", peer_addr);
                let handler = Arc::clone(&handler);
                let running = Arc::clone(&running);
                clients.push(thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &handler, &running) {
                        error!("Error handling client {}: {}", peer_addr, e);
                    }
                    info!("Client {} disconnected", peer_addr);
                }));
                clients.retain(|client| !client.is_finished());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                thread::sleep(POLL);
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                thread::sleep(POLL);
            }
        }
    }

    for client in clients {
        let _ = client.join();
    }
}

/// Serve one stream connection with non-blocking reads.
fn handle_client(mut stream: TcpStream, handler: &OpcHandler, running: &AtomicBool) -> Result<()> {
    stream
        .set_nonblocking(true)
        .context("Failed to set socket to non-blocking mode")?;

    let mut buffer = Vec::new();
    let mut read_buf = vec![0u8; RECV_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        // Read all available data
        loop {
            match stream.read(&mut read_buf) {
                Ok(0) => return Ok(()),
                Ok(n) => buffer.extend_from_slice(&read_buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        for reply in handler.drain_messages(&mut buffer, Instant::now()) {
            write_reply(&mut stream, &reply)?;
        }

        // Small sleep to avoid busy-looping
        thread::sleep(Duration::from_millis(1));
    }

    Ok(())
}

fn write_reply(stream: &mut TcpStream, reply: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < reply.len() {
        match stream.write(&reply[written..]) {
            Ok(0) => anyhow::bail!("connection closed while sending reply"),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Receive OPC datagrams until `running` is cleared. Each datagram carries
/// whole messages; replies go back to the sender.
pub fn run_udp(socket: UdpSocket, handler: Arc<OpcHandler>, running: Arc<AtomicBool>) {
    if let Ok(addr) = socket.local_addr() {
        info!("✓ OPC server listening on udp://{}", addr);
    }

    let mut datagram = vec![0u8; DATAGRAM_SIZE];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut datagram) {
            Ok((len, source)) => handle_datagram(&socket, &handler, &datagram[..len], source),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!("[opc] UDP receive failed: {}", e);
                thread::sleep(POLL);
            }
        }
    }
}

fn handle_datagram(socket: &UdpSocket, handler: &OpcHandler, data: &[u8], source: SocketAddr) {
    let mut buffer = data.to_vec();
    for reply in handler.drain_messages(&mut buffer, Instant::now()) {
        if let Err(e) = socket.send_to(&reply, source) {
            warn!("[opc] Failed to reply to {}: {}", source, e);
        }
    }
    if !buffer.is_empty() {
        debug!("[opc] Ignoring {} trailing bytes from {}", buffer.len(), source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::opc::{encode_message, CMD_SET_PIXELS, CMD_SYSTEM_EXCLUSIVE};

    fn handler(config: Config) -> (OpcHandler, SharedFrames, Arc<Stats>) {
        let frames = SharedFrames::new(&config, Instant::now());
        let stats = Arc::new(Stats::default());
        let handler = OpcHandler::new(frames.clone(), SharedConfig::new(config), Arc::clone(&stats));
        (handler, frames, stats)
    }

    fn one_pixel() -> Config {
        let mut config = Config::default();
        config.strips = 1;
        config.pixels_per_strip = 1;
        config
    }

    #[test]
    fn test_set_pixels_becomes_next_frame() {
        let (handler, frames, stats) = handler(one_pixel());
        let mut buffer = vec![0, 0, 0x00, 0x03, 1, 2, 3];

        let replies = handler.drain_messages(&mut buffer, Instant::now());
        assert!(replies.is_empty());
        assert!(buffer.is_empty());

        let state = frames.lock();
        assert_eq!(state.buffers().frame_count(), 1);
        assert_eq!(state.buffers().next().pixels(), &[[1, 2, 3]]);
        assert_eq!(stats.snapshot().opc_frames, 1);
    }

    #[test]
    fn test_get_config_reply() {
        let config = one_pixel();
        let expected = config.status_json();
        let (handler, frames, _) = handler(config);

        let mut buffer = encode_message(0, CMD_SYSTEM_EXCLUSIVE, &[0, 2, 1]);
        let replies = handler.drain_messages(&mut buffer, Instant::now());

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].last(), Some(&0));
        assert_eq!(&replies[0][..replies[0].len() - 1], expected.as_bytes());
        assert_eq!(frames.lock().buffers().frame_count(), 0);
    }

    #[test]
    fn test_partial_message_waits_for_rest() {
        let (handler, frames, _) = handler(one_pixel());
        let message = encode_message(0, CMD_SET_PIXELS, &[9, 9, 9]);
        let mut buffer = encode_message(0, CMD_SET_PIXELS, &[1, 1, 1]);
        buffer.extend_from_slice(&message[..5]);

        handler.drain_messages(&mut buffer, Instant::now());
        assert_eq!(buffer, &message[..5]);
        assert_eq!(frames.lock().buffers().frame_count(), 1);

        buffer.extend_from_slice(&message[5..]);
        handler.drain_messages(&mut buffer, Instant::now());
        assert!(buffer.is_empty());
        assert_eq!(frames.lock().buffers().frame_count(), 2);
    }

    #[test]
    fn test_unsupported_commands_change_nothing() {
        let (handler, frames, stats) = handler(one_pixel());
        let mut buffer = encode_message(0, 9, &[1, 2, 3]);
        buffer.extend(encode_message(0, CMD_SYSTEM_EXCLUSIVE, &[0, 1, 1]));
        buffer.extend(encode_message(0, CMD_SYSTEM_EXCLUSIVE, &[0, 2, 7]));
        buffer.extend(encode_message(0, CMD_SYSTEM_EXCLUSIVE, &[0]));

        assert!(handler.drain_messages(&mut buffer, Instant::now()).is_empty());
        assert!(buffer.is_empty());
        assert_eq!(frames.lock().buffers().frame_count(), 0);
        assert_eq!(stats.snapshot().opc_frames, 0);
    }

    /// Read a NUL-terminated status reply.
    fn read_config_reply(client: &mut TcpStream) -> Vec<u8> {
        let mut reply = Vec::new();
        let mut chunk = [0u8; 1024];
        while reply.last() != Some(&0) {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed the connection");
            reply.extend_from_slice(&chunk[..n]);
        }
        reply
    }

    fn start_tcp(handler: OpcHandler) -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let listener = bind_tcp("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let server = {
            let running = Arc::clone(&running);
            let handler = Arc::new(handler);
            thread::spawn(move || run_tcp(listener, handler, running))
        };
        (addr, running, server)
    }

    #[test]
    fn test_closed_client_leaves_others_working() {
        let (handler, frames, stats) = handler(one_pixel());
        let (addr, running, server) = start_tcp(handler);

        let mut first = TcpStream::connect(addr).unwrap();
        let mut second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // A whole frame, then a header whose body never arrives
        let mut request = encode_message(0, CMD_SET_PIXELS, &[1, 2, 3]);
        request.extend_from_slice(&[0, CMD_SET_PIXELS, 0x00, 0x03, 9]);
        first.write_all(&request).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.snapshot().opc_frames == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.snapshot().opc_frames, 1);
        drop(first);

        let mut request = encode_message(0, CMD_SET_PIXELS, &[7, 8, 9]);
        request.extend(encode_message(0, CMD_SYSTEM_EXCLUSIVE, &[0, 2, 1]));
        second.write_all(&request).unwrap();

        let reply = read_config_reply(&mut second);
        assert!(reply.starts_with(b"{"));
        assert_eq!(stats.snapshot().opc_frames, 2);
        assert_eq!(frames.lock().buffers().next().pixels(), &[[7, 8, 9]]);

        running.store(false, Ordering::Relaxed);
        drop(second);
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_client_round_trip() {
        let (handler, frames, _) = handler(one_pixel());
        let (addr, running, server) = start_tcp(handler);

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut request = encode_message(0, CMD_SET_PIXELS, &[4, 5, 6]);
        request.extend(encode_message(0, CMD_SYSTEM_EXCLUSIVE, &[0, 2, 1]));
        client.write_all(&request).unwrap();

        let reply = read_config_reply(&mut client);
        assert!(reply.starts_with(b"{"));
        assert_eq!(frames.lock().buffers().next().pixels(), &[[4, 5, 6]]);

        running.store(false, Ordering::Relaxed);
        drop(client);
        server.join().unwrap();
    }
}
