//! Output color synthesis and the render loop.
//!
//! Every tick blends `previous` into `current` by the pacing progress,
//! applies the gamma table and spreads the rounding error of the 16-bit
//! intermediate over the following frames.

use log::{info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{RenderFlags, SharedConfig, Topology};
use crate::frame::{Pace, PixelFrame, Progress, Rgb, STALL_THRESHOLD};
use crate::lut::GammaTable;
use crate::output::{OutputSink, SinkFrame};
use crate::state::SharedFrames;
use crate::stats::Stats;

/// Render time at startup, before the first report.
const INITIAL_AVERAGE_US: u64 = 2000;

/// Dithering is skipped when frames take this long to render.
const DITHER_LIMIT_US: u64 = 10_000;

/// One 60Hz refresh; the dither suppression window covers this much time.
const SUPPRESSION_BUDGET_US: u64 = 16_667;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Sleep while waiting for the stream to (re)start.
const PRIMING_WAIT: Duration = Duration::from_millis(10);

/// Sleep when the current interval ran out and nothing new arrived.
const EXHAUSTED_WAIT: Duration = Duration::from_millis(1);

const TEST_PATTERN_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DitherCell {
    pub carry: [i16; 3],
    /// Frame index at which dithering last changed the output
    pub last_effect: [u32; 3],
}

/// Rounding error carried per pixel and channel.
#[derive(Debug, Clone)]
pub struct DitherState {
    cells: Vec<DitherCell>,
}

impl DitherState {
    pub fn new(pixel_count: usize) -> Self {
        DitherState {
            cells: vec![DitherCell::default(); pixel_count],
        }
    }

    #[cfg(test)]
    pub fn cells(&self) -> &[DitherCell] {
        &self.cells
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DitherWindow {
    pub frame: u32,
    /// Frames a carry may go without a visible effect
    pub window: u32,
}

/// Per-tick render switches, resolved against the current timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOptions {
    pub interpolate: bool,
    pub lut: bool,
    pub dither: Option<DitherWindow>,
}

#[derive(Debug, Clone, Copy)]
pub struct PassSettings<'a> {
    pub interpolate: bool,
    pub lut: Option<&'a GammaTable>,
    pub dither: Option<DitherWindow>,
}

/// Weighted mix of two 8-bit values as a 16-bit intermediate.
#[inline]
fn blend(previous: u8, current: u8, progress: Progress) -> u32 {
    let mixed = u32::from(previous) * progress.inverse() + u32::from(current) * progress.value();
    (mixed * 257) >> 16
}

#[inline]
fn widen(value: u8) -> u32 {
    u32::from(value) * 257
}

/// Nearest 8-bit value of a 16-bit intermediate.
#[inline]
fn quantize(value: i32) -> u8 {
    ((value.clamp(0, 0xFFFF) + 128) / 257) as u8
}

#[inline]
fn dither_channel(value: u32, carry: &mut i16, last_effect: &mut u32, window: DitherWindow) -> u8 {
    let target = value as i32;
    let dithered = target + i32::from(*carry);
    let out = quantize(dithered);

    if out != quantize(target) {
        *last_effect = window.frame;
    }

    if window.frame.wrapping_sub(*last_effect) > window.window {
        *carry = 0;
        *last_effect = window.frame;
    } else {
        *carry = (dithered - i32::from(out) * 257).clamp(-128, 128) as i16;
    }
    out
}

#[inline]
fn shade_pixel(
    previous: &Rgb,
    current: &Rgb,
    progress: Progress,
    settings: &PassSettings<'_>,
    cell: &mut DitherCell,
) -> Rgb {
    let mut rgb = [0u8; 3];
    for c in 0..3 {
        let mut value = if settings.interpolate {
            blend(previous[c], current[c], progress)
        } else {
            widen(current[c])
        };
        if let Some(lut) = settings.lut {
            value = u32::from(lut.correct(c, value as u16));
        }
        rgb[c] = match settings.dither {
            Some(window) => dither_channel(value, &mut cell.carry[c], &mut cell.last_effect[c], window),
            None => quantize(value as i32),
        };
    }
    rgb
}

/// Render one frame of `topology` into `out`.
pub fn render_pass(
    topology: Topology,
    previous: &PixelFrame,
    current: &PixelFrame,
    progress: Progress,
    settings: &PassSettings<'_>,
    dither: &mut DitherState,
    out: &mut SinkFrame,
) {
    let width = topology.pixels_per_strip;
    if width == 0 {
        return;
    }

    let rows = previous
        .pixels()
        .chunks(width)
        .zip(current.pixels().chunks(width))
        .zip(dither.cells.chunks_mut(width))
        .take(topology.strips);

    for (strip, ((previous_row, current_row), cells)) in rows.enumerate() {
        let pixels = previous_row.iter().zip(current_row).zip(cells.iter_mut());
        for (pixel, ((previous, current), cell)) in pixels.enumerate() {
            out.set(strip, pixel, shade_pixel(previous, current, progress, settings, cell));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingReport {
    pub average_us: u64,
    pub possible_fps: f64,
    pub actual_fps: f64,
    pub samples: u32,
}

/// Rolling render-time average over one-second windows.
#[derive(Debug)]
pub struct FrameTiming {
    window_start: Instant,
    samples: u32,
    busy: Duration,
    average_us: u64,
    frame_index: u32,
}

impl FrameTiming {
    pub fn new(now: Instant) -> Self {
        FrameTiming {
            window_start: now,
            samples: 0,
            busy: Duration::ZERO,
            average_us: INITIAL_AVERAGE_US,
            frame_index: 0,
        }
    }

    #[cfg(test)]
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn dithering_allowed(&self) -> bool {
        self.average_us < DITHER_LIMIT_US
    }

    pub fn suppression_window(&self) -> u32 {
        (SUPPRESSION_BUDGET_US / self.average_us.max(1)) as u32
    }

    /// Account for one rendered frame. Returns a report when a window closes.
    pub fn record(&mut self, render_time: Duration, now: Instant) -> Option<TimingReport> {
        self.frame_index = self.frame_index.wrapping_add(1);
        self.samples += 1;
        self.busy += render_time;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < REPORT_INTERVAL {
            return None;
        }

        self.average_us = (self.busy.as_micros() / u128::from(self.samples)) as u64;
        let report = TimingReport {
            average_us: self.average_us,
            possible_fps: 1.0e6 / self.average_us.max(1) as f64,
            actual_fps: f64::from(self.samples) / elapsed.as_secs_f64(),
            samples: self.samples,
        };

        self.window_start = now;
        self.samples = 0;
        self.busy = Duration::ZERO;
        Some(report)
    }

    pub fn pass_options(&self, flags: RenderFlags) -> PassOptions {
        PassOptions {
            interpolate: flags.interpolation,
            lut: flags.lut,
            dither: (flags.dithering && self.dithering_allowed()).then(|| DitherWindow {
                frame: self.frame_index,
                window: self.suppression_window(),
            }),
        }
    }
}

/// What the render loop does after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle(Duration),
    Retry,
    Rendered,
}

pub struct Renderer<S: OutputSink> {
    frames: SharedFrames,
    config: SharedConfig,
    sink: S,
    timing: FrameTiming,
    stats: Arc<Stats>,
}

impl<S: OutputSink> Renderer<S> {
    pub fn new(frames: SharedFrames, config: SharedConfig, sink: S, stats: Arc<Stats>) -> Self {
        let topology = frames.lock().topology();
        if sink.topology() != topology {
            warn!(
                "Output drives {} strips of {} pixels, frames hold {} strips of {} pixels",
                sink.topology().strips,
                sink.topology().pixels_per_strip,
                topology.strips,
                topology.pixels_per_strip
            );
        }
        Renderer {
            frames,
            config,
            sink,
            timing: FrameTiming::new(Instant::now()),
            stats,
        }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn tick(&mut self, now: Instant) -> Tick {
        let started = Instant::now();
        let mut state = self.frames.lock();

        let generation = self.config.generation();
        if generation != state.generation() {
            state.reconfigure(&self.config.snapshot(), generation, now);
        }

        match state.pace(now) {
            Pace::Priming => Tick::Idle(PRIMING_WAIT),
            Pace::Stalled => {
                info!("No new frames for {:?}, waiting for the stream to resume", STALL_THRESHOLD);
                Tick::Idle(PRIMING_WAIT)
            }
            Pace::Exhausted => Tick::Idle(EXHAUSTED_WAIT),
            Pace::Advanced => Tick::Retry,
            Pace::Render(progress) => {
                let options = self.timing.pass_options(self.config.render_flags());
                state.render_into(self.sink.frame_mut(), progress, options);
                if self.sink.is_busy() {
                    trace!("Waiting for the previous frame to finish");
                }
                self.sink.wait();
                self.sink.draw();
                drop(state);

                self.stats.record_rendered_frame();
                if let Some(report) = self.timing.record(started.elapsed(), Instant::now()) {
                    info!(
                        "[render] {} usec avg frame time, possible FPS {:.2}, actual FPS {:.2}, {} samples",
                        report.average_us, report.possible_fps, report.actual_fps, report.samples
                    );
                }
                Tick::Rendered
            }
        }
    }

    /// Render until `running` is cleared, then turn the strips off.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::Relaxed) {
            match self.tick(Instant::now()) {
                Tick::Idle(wait) => thread::sleep(wait),
                Tick::Retry | Tick::Rendered => {}
            }
        }
        self.show(&[0; 3]);
        self.sink.wait();
    }

    /// Red, green, blue and black for a second each.
    pub fn play_test_pattern(&mut self, running: &AtomicBool) {
        for color in [[255, 0, 0], [0, 255, 0], [0, 0, 255], [0, 0, 0]] {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            info!("Test pattern {:?}", color);
            self.show(&color);
            thread::sleep(TEST_PATTERN_STEP);
        }
    }

    fn show(&mut self, color: &Rgb) {
        self.sink.wait();
        self.sink.frame_mut().fill(*color);
        self.sink.draw();
    }
}
