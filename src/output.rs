use anyhow::{bail, Context, Result};
use log::{debug, error, info, trace, warn};
use serialport::SerialPort;
use std::io::Write;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::config::{OutputConfig, Topology};
use crate::frame::Rgb;
use crate::pixel_format::PixelFormat;
use crate::protocol::SerialProtocol;

/// Longest `wait` blocks for a submission that a dead worker will never finish.
const WAIT_LIMIT: Duration = Duration::from_secs(1);

/// Pixel buffer handed to a sink, addressed by strip and pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFrame {
    topology: Topology,
    pixels: Vec<Rgb>,
}

impl SinkFrame {
    pub fn new(topology: Topology) -> Self {
        SinkFrame {
            topology,
            pixels: vec![[0; 3]; topology.pixel_count()],
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Set one pixel. Returns false for addresses outside the sink.
    #[inline]
    pub fn set(&mut self, strip: usize, pixel: usize, rgb: Rgb) -> bool {
        match self.topology.index(strip, pixel) {
            Some(index) => {
                self.pixels[index] = rgb;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn get(&self, strip: usize, pixel: usize) -> Option<Rgb> {
        self.topology.index(strip, pixel).map(|index| self.pixels[index])
    }

    pub fn strip(&self, strip: usize) -> &[Rgb] {
        let width = self.topology.pixels_per_strip;
        self.pixels
            .get(strip * width..(strip + 1) * width)
            .unwrap_or(&[])
    }

    pub fn fill(&mut self, rgb: Rgb) {
        self.pixels.fill(rgb);
    }
}

/// Hardware that displays rendered frames.
///
/// The render thread writes into [`OutputSink::frame_mut`], waits for the
/// previous submission to finish and then calls [`OutputSink::draw`].
pub trait OutputSink: Send {
    fn topology(&self) -> Topology;

    /// Back buffer for the next frame.
    fn frame_mut(&mut self) -> &mut SinkFrame;

    /// A submitted frame is still being transmitted.
    fn is_busy(&self) -> bool;

    /// Block until the previous submission is done.
    fn wait(&self);

    /// Submit the back buffer and swap buffers.
    fn draw(&mut self);
}

/// Frames handed to workers that have not been written out yet.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn start(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn is_busy(&self) -> bool {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) > 0
    }

    fn wait(&self) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut count, timeout) = self
            .idle
            .wait_timeout_while(count, WAIT_LIMIT, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() {
            warn!("Serial outputs did not finish a frame within {:?}", WAIT_LIMIT);
            *count = 0;
        }
    }
}

/// Sink driving serial LED controllers, one worker thread per port.
pub struct SerialSink {
    topology: Topology,
    frames: [SinkFrame; 2],
    active: usize,
    in_flight: Arc<InFlight>,
    outputs: Vec<SerialOutput>,
}

impl SerialSink {
    /// Open every configured output. Ports that fail to open are logged and
    /// skipped; having none at all is an error.
    pub fn open(topology: Topology, configs: &[OutputConfig]) -> Result<Self> {
        let in_flight = Arc::new(InFlight::default());
        let mut outputs = Vec::new();

        for config in configs {
            match SerialOutput::new(config.clone(), topology, Arc::clone(&in_flight)) {
                Ok(output) => outputs.push(output),
                Err(e) => error!("✗ Failed to open {}: {:#}", config.port, e),
            }
        }

        if outputs.is_empty() {
            bail!("No outputs could be opened");
        }

        Ok(SerialSink {
            topology,
            frames: [SinkFrame::new(topology), SinkFrame::new(topology)],
            active: 0,
            in_flight,
            outputs,
        })
    }

    /// Per-port counters of frames written, for the statistics thread.
    pub fn frame_counters(&self) -> Vec<(String, Arc<AtomicU64>)> {
        self.outputs
            .iter()
            .map(|o| (o.config.port.clone(), Arc::clone(&o.frames_sent)))
            .collect()
    }
}

impl OutputSink for SerialSink {
    fn topology(&self) -> Topology {
        self.topology
    }

    fn frame_mut(&mut self) -> &mut SinkFrame {
        &mut self.frames[self.active]
    }

    fn is_busy(&self) -> bool {
        self.in_flight.is_busy()
    }

    fn wait(&self) {
        self.in_flight.wait();
    }

    fn draw(&mut self) {
        let frame = &self.frames[self.active];
        for output in &self.outputs {
            let strip = frame.strip(output.config.strip);
            let pixels = strip.get(output.range.clone()).unwrap_or(&[]);
            output.send_frame(pixels.to_vec());
        }
        self.active ^= 1;
    }
}

/// One serial port with its dedicated writer thread.
struct SerialOutput {
    config: OutputConfig,
    range: Range<usize>,
    sender: SyncSender<Vec<Rgb>>,
    in_flight: Arc<InFlight>,
    frames_sent: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    worker_handle: Option<thread::JoinHandle<()>>,
}

impl SerialOutput {
    fn new(config: OutputConfig, topology: Topology, in_flight: Arc<InFlight>) -> Result<Self> {
        let port = open_standard_port(&config)?;
        let range = config.pixel_range(topology.pixels_per_strip);

        // Capacity 1: a frame arriving while one is queued is skipped
        let (sender, receiver) = mpsc::sync_channel::<Vec<Rgb>>(1);

        let frames_sent = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            port,
            name: config.port.clone(),
            protocol: config.protocol,
            format: config.pixel_format.unwrap_or_default(),
            led_count: range.len(),
            in_flight: Arc::clone(&in_flight),
            frames_sent: Arc::clone(&frames_sent),
            running: Arc::clone(&running),
        };
        let worker_handle = thread::spawn(move || worker.run(receiver));

        info!(
            "✓ Opened {} (strip {}, pixels {}..{}, {:?} @ {} baud)",
            config.port, config.strip, range.start, range.end, config.protocol, config.baud_rate
        );

        Ok(SerialOutput {
            config,
            range,
            sender,
            in_flight,
            frames_sent,
            running,
            worker_handle: Some(worker_handle),
        })
    }

    /// Queue a frame for the worker (non-blocking, skip-ahead).
    fn send_frame(&self, pixels: Vec<Rgb>) {
        self.in_flight.start();
        match self.sender.try_send(pixels) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("{} busy, frame skipped", self.config.port);
                self.in_flight.finish();
            }
            Err(TrySendError::Disconnected(_)) => self.in_flight.finish(),
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_standard_port(config: &OutputConfig) -> Result<Box<dyn SerialPort>> {
    let mut port = serialport::new(&config.port, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .context(format!("Failed to open serial port {}", config.port))?;

    // Bounded writes so a stuck controller cannot hang the worker forever
    port.set_timeout(Duration::from_millis(1000))
        .context("Failed to set serial port timeout")?;

    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("Failed to set DTR on {}: {}", config.port, e);
    }

    // Allow device to initialize
    thread::sleep(Duration::from_millis(100));

    Ok(port)
}

struct Worker {
    port: Box<dyn SerialPort>,
    name: String,
    protocol: SerialProtocol,
    format: PixelFormat,
    led_count: usize,
    in_flight: Arc<InFlight>,
    frames_sent: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Block on the queue and write each frame to the port. Exits on the
    /// first serial error, leaving the other outputs running.
    fn run(mut self, receiver: Receiver<Vec<Rgb>>) {
        let mut pixel_data = Vec::new();
        let mut frame = Vec::new();

        while self.running.load(Ordering::Relaxed) {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(pixels) => {
                    let result = self.write(&pixels, &mut pixel_data, &mut frame);
                    self.in_flight.finish();
                    match result {
                        Ok(()) => {
                            self.frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!("✗ Serial error on {}: {}", self.name, e);
                            error!("✗ Output {} is now disconnected", self.name);
                            break;
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Release anything queued behind the last frame
        while receiver.try_recv().is_ok() {
            self.in_flight.finish();
        }

        // Try to turn off LEDs on exit (best effort)
        let blank = vec![[0; 3]; self.led_count];
        if self.write(&blank, &mut pixel_data, &mut frame).is_ok() {
            debug!("Blanked {}", self.name);
        }
    }

    fn write(&mut self, pixels: &[Rgb], pixel_data: &mut Vec<u8>, frame: &mut Vec<u8>) -> std::io::Result<()> {
        pixel_data.clear();
        self.format.write_pixels(pixels, pixel_data);
        self.protocol.encode_into(frame, pixel_data, self.format.stride());

        if log::log_enabled!(log::Level::Trace) {
            let hex: String = frame
                .iter()
                .take(48)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            trace!(
                "[{}] Sending frame: {} bytes ({} pixels), starts {}",
                self.name,
                frame.len(),
                pixels.len(),
                hex
            );
        }

        self.port.write_all(frame)?;
        self.port.flush()
    }
}

/// Sink that keeps every drawn frame in memory.
#[cfg(test)]
pub(crate) struct MemorySink {
    frame: SinkFrame,
    pub drawn: Vec<SinkFrame>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new(topology: Topology) -> Self {
        MemorySink {
            frame: SinkFrame::new(topology),
            drawn: Vec::new(),
        }
    }
}

#[cfg(test)]
impl OutputSink for MemorySink {
    fn topology(&self) -> Topology {
        self.frame.topology()
    }

    fn frame_mut(&mut self) -> &mut SinkFrame {
        &mut self.frame
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn wait(&self) {}

    fn draw(&mut self) {
        self.drawn.push(self.frame.clone());
    }
}
