//! Frame state shared by the protocol servers and the render thread.

use log::info;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::{Config, Topology, WhitePoint};
use crate::frame::{FrameBuffers, Pace, Progress};
use crate::lut::GammaTable;
use crate::output::SinkFrame;
use crate::protocol::ledburn::{LedBurnError, Packet, SegmentAssembler, SegmentOutcome};
use crate::render::{render_pass, DitherState, PassOptions, PassSettings};

/// Everything the render pass needs, owned in one place so that a single
/// lock covers buffers, segment assembly, the gamma table and dither carries.
#[derive(Debug)]
pub struct FrameState {
    topology: Topology,
    buffers: FrameBuffers,
    assembler: SegmentAssembler,
    lut: GammaTable,
    white_point: WhitePoint,
    lum_power: f32,
    dither: DitherState,
    /// Configuration generation this state was built from
    generation: u64,
}

impl FrameState {
    pub fn new(config: &Config, now: Instant) -> Self {
        let topology = config.topology();
        FrameState {
            topology,
            buffers: FrameBuffers::new(topology.pixel_count(), now),
            assembler: SegmentAssembler::new(topology, &config.ledburn),
            lut: GammaTable::from_config(&config.render),
            white_point: config.render.white_point,
            lum_power: config.render.lum_power,
            dither: DitherState::new(topology.pixel_count()),
            generation: 0,
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn buffers(&self) -> &FrameBuffers {
        &self.buffers
    }

    #[cfg(test)]
    pub fn assembler(&self) -> &SegmentAssembler {
        &self.assembler
    }

    /// Bring the state in line with a changed configuration.
    ///
    /// A new topology reallocates every buffer and restarts priming; new color
    /// settings rebuild the gamma table.
    pub fn reconfigure(&mut self, config: &Config, generation: u64, now: Instant) {
        let topology = config.topology();
        if topology != self.topology {
            info!(
                "Reallocating buffers for {} strips of {} pixels",
                topology.strips, topology.pixels_per_strip
            );
            self.topology = topology;
            self.buffers = FrameBuffers::new(topology.pixel_count(), now);
            self.assembler = SegmentAssembler::new(topology, &config.ledburn);
            self.dither = DitherState::new(topology.pixel_count());
        } else {
            self.assembler.set_policy(&config.ledburn);
        }

        let render = &config.render;
        if render.white_point != self.white_point || render.lum_power != self.lum_power {
            info!(
                "Rebuilding lookup table: white point ({}, {}, {}), lum power {}",
                render.white_point.red, render.white_point.green, render.white_point.blue, render.lum_power
            );
            self.lut = GammaTable::from_config(render);
            self.white_point = render.white_point;
            self.lum_power = render.lum_power;
        }

        self.generation = generation;
    }

    /// A whole frame of raw RGB bytes, as delivered by OPC.
    pub fn accept_frame(&mut self, data: &[u8], now: Instant) {
        self.buffers.accept_frame(data, now);
    }

    pub fn accept_segment(&mut self, packet: &Packet<'_>, now: Instant) -> Result<SegmentOutcome, LedBurnError> {
        self.assembler.accept(packet, &mut self.buffers, now)
    }

    pub fn pace(&mut self, now: Instant) -> Pace {
        self.buffers.pace(now)
    }

    pub fn render_into(&mut self, out: &mut SinkFrame, progress: Progress, options: PassOptions) {
        if out.topology() != self.topology {
            out.fill([0; 3]);
        }

        let settings = PassSettings {
            interpolate: options.interpolate,
            lut: options.lut.then_some(&self.lut),
            dither: options.dither,
        };
        render_pass(
            self.topology,
            self.buffers.previous(),
            self.buffers.current(),
            progress,
            &settings,
            &mut self.dither,
            out,
        );
    }
}

#[derive(Clone)]
pub struct SharedFrames {
    inner: Arc<Mutex<FrameState>>,
}

impl SharedFrames {
    pub fn new(config: &Config, now: Instant) -> Self {
        SharedFrames {
            inner: Arc::new(Mutex::new(FrameState::new(config, now))),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
