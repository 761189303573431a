use log::info;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REPORT_PERIOD: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(100);

/// Counters shared by the servers and the render thread.
#[derive(Debug, Default)]
pub struct Stats {
    opc_frames: AtomicU64,
    ledburn_frames: AtomicU64,
    dropped_packets: AtomicU64,
    rendered_frames: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub opc_frames: u64,
    pub ledburn_frames: u64,
    pub dropped_packets: u64,
    pub rendered_frames: u64,
}

impl Stats {
    pub fn record_opc_frame(&self) {
        self.opc_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ledburn_frame(&self) {
        self.ledburn_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_packet(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rendered_frame(&self) {
        self.rendered_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            opc_frames: self.opc_frames.load(Ordering::Relaxed),
            ledburn_frames: self.ledburn_frames.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            rendered_frames: self.rendered_frames.load(Ordering::Relaxed),
        }
    }
}

fn per_second(delta: u64, period: Duration) -> f64 {
    delta as f64 / period.as_secs_f64()
}

/// One report line covering the counters gathered since `last`.
fn format_report(
    current: &Snapshot,
    last: &Snapshot,
    outputs: &[(String, u64)],
    period: Duration,
) -> String {
    let mut line = format!(
        "[Stats] OPC: {:.1} fps, LedBurn: {:.1} fps, dropped: {}, rendered: {:.1} fps",
        per_second(current.opc_frames - last.opc_frames, period),
        per_second(current.ledburn_frames - last.ledburn_frames, period),
        current.dropped_packets - last.dropped_packets,
        per_second(current.rendered_frames - last.rendered_frames, period),
    );
    for (port, delta) in outputs {
        line.push_str(&format!(", {}: {:.1} fps", port, per_second(*delta, period)));
    }
    line
}

/// Log frame rates every few seconds until `running` is cleared.
pub fn spawn_stats_thread(
    stats: Arc<Stats>,
    output_counters: Vec<(String, Arc<AtomicU64>)>,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last = stats.snapshot();
        let mut last_sent: Vec<u64> = vec![0; output_counters.len()];
        let mut window_start = Instant::now();

        while running.load(Ordering::Relaxed) {
            thread::sleep(POLL);
            let elapsed = window_start.elapsed();
            if elapsed < REPORT_PERIOD {
                continue;
            }

            let current = stats.snapshot();
            let outputs: Vec<(String, u64)> = output_counters
                .iter()
                .zip(last_sent.iter_mut())
                .map(|((port, counter), last)| {
                    let sent = counter.load(Ordering::Relaxed);
                    let delta = sent - *last;
                    *last = sent;
                    (port.clone(), delta)
                })
                .collect();

            info!("{}", format_report(&current, &last, &outputs, elapsed));

            last = current;
            window_start = Instant::now();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::default();
        stats.record_opc_frame();
        stats.record_opc_frame();
        stats.record_ledburn_frame();
        stats.record_dropped_packet();
        stats.record_rendered_frame();

        assert_eq!(
            stats.snapshot(),
            Snapshot {
                opc_frames: 2,
                ledburn_frames: 1,
                dropped_packets: 1,
                rendered_frames: 1,
            }
        );
    }

    #[test]
    fn test_report_line() {
        let last = Snapshot::default();
        let current = Snapshot {
            opc_frames: 250,
            ledburn_frames: 0,
            dropped_packets: 3,
            rendered_frames: 1000,
        };
        let outputs = vec![("/dev/ttyACM0".to_string(), 200)];
        let line = format_report(&current, &last, &outputs, REPORT_PERIOD);
        assert_eq!(
            line,
            "[Stats] OPC: 50.0 fps, LedBurn: 0.0 fps, dropped: 3, rendered: 200.0 fps, /dev/ttyACM0: 40.0 fps"
        );
    }

    #[test]
    fn test_thread_stops_with_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_stats_thread(Arc::new(Stats::default()), Vec::new(), Arc::clone(&running));
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
