//! Triple-buffered frame history and the pacing clock.
//!
//! Frames arrive as `next`, get promoted to `current` and finally become
//! `previous`. The render thread blends `previous` into `current` over the
//! time that passed between their arrivals, so playback follows the sender's
//! actual frame rate.

use std::mem;
use std::time::{Duration, Instant};

pub type Rgb = [u8; 3];

/// Frames that must have arrived before blending is meaningful
/// (a previous, a current and a pending frame).
pub const PRIMING_FRAMES: u64 = 3;

/// Playback is suspended once the current frame has been on screen this long.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Fixed-point one for [`Progress`].
pub const PROGRESS_ONE: u32 = 0x10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFrame {
    pixels: Vec<Rgb>,
}

impl PixelFrame {
    pub fn black(pixel_count: usize) -> Self {
        PixelFrame {
            pixels: vec![[0; 3]; pixel_count],
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn clear(&mut self) {
        self.pixels.fill([0; 3]);
    }

    /// Replace the contents with raw RGB bytes, clipping extra data and
    /// zero-filling whatever the data does not cover.
    pub fn load_bytes(&mut self, data: &[u8]) {
        let mut chunks = data.chunks(3);
        for pixel in self.pixels.iter_mut() {
            *pixel = match chunks.next() {
                Some(chunk) => {
                    let mut rgb = [0u8; 3];
                    rgb[..chunk.len()].copy_from_slice(chunk);
                    rgb
                }
                None => [0; 3],
            };
        }
    }

    /// Copy whole RGB triples into the frame starting at pixel `start`.
    /// Pixels past the end of the frame are dropped.
    pub fn write_run(&mut self, start: usize, data: &[u8]) -> usize {
        let Some(dst) = self.pixels.get_mut(start..) else {
            return 0;
        };
        let mut written = 0;
        for (pixel, chunk) in dst.iter_mut().zip(data.chunks_exact(3)) {
            pixel.copy_from_slice(chunk);
            written += 1;
        }
        written
    }

    pub fn copy_from(&mut self, other: &PixelFrame) {
        let n = self.pixels.len().min(other.pixels.len());
        self.pixels[..n].copy_from_slice(&other.pixels[..n]);
        self.pixels[n..].fill([0; 3]);
    }
}

/// Position between `previous` and `current`, as a 16.16 fixed-point fraction in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress(u32);

impl Progress {
    pub const START: Progress = Progress(0);
    pub const END: Progress = Progress(PROGRESS_ONE);

    pub fn from_times(elapsed: Duration, interval: Duration) -> Self {
        let interval_us = interval.as_micros();
        if interval_us == 0 {
            return Progress::END;
        }
        let scaled = (elapsed.as_micros() << 16) / interval_us;
        Progress(scaled.min(u128::from(PROGRESS_ONE)) as u32)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn inverse(self) -> u32 {
        PROGRESS_ONE - self.0
    }
}

/// What the render thread should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Not enough frames have arrived yet
    Priming,
    /// The source went quiet; the frame count was reset
    Stalled,
    /// The current interval is over and nothing new is pending
    Exhausted,
    /// A pending frame was promoted; ask again
    Advanced,
    Render(Progress),
}

#[derive(Debug)]
struct Slot {
    frame: PixelFrame,
    arrived: Instant,
}

#[derive(Debug)]
pub struct FrameBuffers {
    previous: Slot,
    current: Slot,
    next: Slot,
    frame_count: u64,
    /// `next` holds a frame that was not promoted yet
    pending: bool,
    promoted_at: Instant,
}

impl FrameBuffers {
    pub fn new(pixel_count: usize, now: Instant) -> Self {
        let slot = || Slot {
            frame: PixelFrame::black(pixel_count),
            arrived: now,
        };
        FrameBuffers {
            previous: slot(),
            current: slot(),
            next: slot(),
            frame_count: 0,
            pending: false,
            promoted_at: now,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.current.frame.len()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// A frame is waiting to be promoted and enough history exists to blend towards it.
    pub fn has_next(&self) -> bool {
        self.pending && self.frame_count >= PRIMING_FRAMES
    }

    pub fn is_primed(&self) -> bool {
        self.frame_count >= PRIMING_FRAMES
    }

    pub fn previous(&self) -> &PixelFrame {
        &self.previous.frame
    }

    pub fn current(&self) -> &PixelFrame {
        &self.current.frame
    }

    #[cfg(test)]
    pub fn next(&self) -> &PixelFrame {
        &self.next.frame
    }

    /// Gap between the arrivals of the previous and the current frame.
    pub fn interval(&self) -> Duration {
        self.current
            .arrived
            .saturating_duration_since(self.previous.arrived)
    }

    /// Store raw RGB bytes as the next frame.
    pub fn accept_frame(&mut self, data: &[u8], now: Instant) {
        self.make_room(now);
        self.next.frame.load_bytes(data);
        self.finish_accept(now);
    }

    /// Store an already assembled frame as the next frame.
    pub fn accept_pixels(&mut self, frame: &PixelFrame, now: Instant) {
        self.make_room(now);
        self.next.frame.copy_from(frame);
        self.finish_accept(now);
    }

    fn make_room(&mut self, now: Instant) {
        // An unconsumed frame in `next` gets promoted instead of overwritten
        if self.pending {
            self.rotate(now);
        }
    }

    fn finish_accept(&mut self, now: Instant) {
        self.next.arrived = now;
        self.frame_count += 1;
        self.pending = true;
    }

    /// current → previous, next → current, and the old previous buffer becomes next.
    fn rotate(&mut self, now: Instant) {
        mem::swap(&mut self.previous, &mut self.current);
        mem::swap(&mut self.current, &mut self.next);
        self.pending = false;
        self.promoted_at = now;
    }

    /// Forget the history so blending waits for fresh frames.
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.pending = false;
    }

    /// Decide what the render thread does at `now`.
    pub fn pace(&mut self, now: Instant) -> Pace {
        if !self.is_primed() {
            return Pace::Priming;
        }

        let elapsed = now.saturating_duration_since(self.promoted_at);
        if elapsed > STALL_THRESHOLD {
            self.reset();
            return Pace::Stalled;
        }

        let interval = self.interval();
        if elapsed > interval || interval.as_micros() == 0 {
            if self.has_next() {
                self.rotate(now);
                return Pace::Advanced;
            }
            return Pace::Exhausted;
        }

        Pace::Render(Progress::from_times(elapsed, interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn frame_of(value: u8, pixels: usize) -> Vec<u8> {
        vec![value; pixels * 3]
    }

    /// Buffers with frames 1, 2 and 3 arriving 20ms apart, starting at `t0`.
    fn primed(t0: Instant) -> FrameBuffers {
        let mut buffers = FrameBuffers::new(2, t0);
        buffers.accept_frame(&frame_of(1, 2), t0);
        buffers.accept_frame(&frame_of(2, 2), t0 + 20 * MS);
        buffers.accept_frame(&frame_of(3, 2), t0 + 40 * MS);
        buffers
    }

    #[test]
    fn test_load_bytes_clips_and_pads() {
        let mut frame = PixelFrame::black(2);
        frame.load_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(frame.pixels(), &[[1, 2, 3], [4, 5, 6]]);

        frame.load_bytes(&[9, 8, 7, 6]);
        assert_eq!(frame.pixels(), &[[9, 8, 7], [6, 0, 0]]);

        frame.load_bytes(&[]);
        assert_eq!(frame.pixels(), &[[0, 0, 0], [0, 0, 0]]);
    }

    #[test]
    fn test_write_run_stays_in_bounds() {
        let mut frame = PixelFrame::black(3);
        assert_eq!(frame.write_run(2, &[1, 1, 1, 2, 2, 2]), 1);
        assert_eq!(frame.pixels()[2], [1, 1, 1]);
        assert_eq!(frame.write_run(3, &[5, 5, 5]), 0);
        assert_eq!(frame.write_run(7, &[5, 5, 5]), 0);
    }

    #[test]
    fn test_priming_needs_three_frames() {
        let t0 = Instant::now();
        let mut buffers = FrameBuffers::new(2, t0);
        assert_eq!(buffers.pace(t0), Pace::Priming);

        buffers.accept_frame(&frame_of(1, 2), t0);
        buffers.accept_frame(&frame_of(2, 2), t0 + 20 * MS);
        assert!(!buffers.has_next());
        assert_eq!(buffers.pace(t0 + 30 * MS), Pace::Priming);

        buffers.accept_frame(&frame_of(3, 2), t0 + 40 * MS);
        assert!(buffers.has_next());
        assert_eq!(buffers.previous().pixels()[0], [1, 1, 1]);
        assert_eq!(buffers.current().pixels()[0], [2, 2, 2]);
        assert_eq!(buffers.next().pixels()[0], [3, 3, 3]);
        assert_eq!(buffers.interval(), 20 * MS);
    }

    #[test]
    fn test_render_progress_tracks_elapsed_time() {
        let t0 = Instant::now();
        let mut buffers = primed(t0);

        assert_eq!(buffers.pace(t0 + 40 * MS), Pace::Render(Progress::START));
        assert_eq!(
            buffers.pace(t0 + 50 * MS),
            Pace::Render(Progress(PROGRESS_ONE / 2))
        );
        assert_eq!(buffers.pace(t0 + 60 * MS), Pace::Render(Progress::END));
    }

    #[test]
    fn test_exhausted_interval_promotes_pending_frame() {
        let t0 = Instant::now();
        let mut buffers = primed(t0);

        assert_eq!(buffers.pace(t0 + 61 * MS), Pace::Advanced);
        assert!(!buffers.has_next());
        assert_eq!(buffers.previous().pixels()[0], [2, 2, 2]);
        assert_eq!(buffers.current().pixels()[0], [3, 3, 3]);

        // The new interval starts at the promotion
        assert_eq!(buffers.pace(t0 + 71 * MS), Pace::Render(Progress(PROGRESS_ONE / 2)));
        assert_eq!(buffers.pace(t0 + 82 * MS), Pace::Exhausted);
    }

    #[test]
    fn test_late_frame_after_promotion_is_not_rotated_over() {
        let t0 = Instant::now();
        let mut buffers = primed(t0);
        assert_eq!(buffers.pace(t0 + 61 * MS), Pace::Advanced);

        buffers.accept_frame(&frame_of(4, 2), t0 + 65 * MS);
        assert_eq!(buffers.current().pixels()[0], [3, 3, 3]);
        assert_eq!(buffers.next().pixels()[0], [4, 4, 4]);
        assert!(buffers.has_next());
        assert_eq!(buffers.frame_count(), 4);
    }

    #[test]
    fn test_arrival_promotes_unconsumed_frame() {
        let t0 = Instant::now();
        let mut buffers = primed(t0);

        buffers.accept_frame(&frame_of(4, 2), t0 + 60 * MS);
        assert_eq!(buffers.previous().pixels()[0], [2, 2, 2]);
        assert_eq!(buffers.current().pixels()[0], [3, 3, 3]);
        assert_eq!(buffers.next().pixels()[0], [4, 4, 4]);
        assert_eq!(buffers.pace(t0 + 60 * MS), Pace::Render(Progress::START));
    }

    #[test]
    fn test_stall_resets_frame_count() {
        let t0 = Instant::now();
        let mut buffers = primed(t0);

        assert_eq!(buffers.pace(t0 + 40 * MS + STALL_THRESHOLD + MS), Pace::Stalled);
        assert_eq!(buffers.frame_count(), 0);
        assert!(!buffers.has_next());
        assert_eq!(buffers.pace(t0 + 40 * MS + STALL_THRESHOLD + MS), Pace::Priming);
    }

    #[test]
    fn test_zero_interval_never_divides() {
        let t0 = Instant::now();
        let mut buffers = FrameBuffers::new(1, t0);
        for value in 1..=3 {
            buffers.accept_frame(&[value, value, value], t0);
        }
        assert_eq!(buffers.pace(t0), Pace::Advanced);
        assert_eq!(buffers.pace(t0), Pace::Exhausted);
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(Progress::from_times(30 * MS, 20 * MS), Progress::END);
        assert_eq!(Progress::from_times(MS, Duration::ZERO), Progress::END);
        assert_eq!(Progress::from_times(5 * MS, 20 * MS).value(), PROGRESS_ONE / 4);
        assert_eq!(Progress::from_times(5 * MS, 20 * MS).inverse(), PROGRESS_ONE * 3 / 4);
    }
}
