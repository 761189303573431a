use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::pixel_format::PixelFormat;
use crate::protocol::SerialProtocol;

/// Upper bound on pixels per strip supported by the segment tracker and the serial framing.
pub const MAX_PIXELS_PER_STRIP: usize = 1500;

/// Number of strips the output hardware can address.
pub const MAX_STRIPS: usize = 48;

/// Largest frame an OPC message can carry (16-bit length field).
pub const MAX_OPC_FRAME_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub strips: usize,
    pub pixels_per_strip: usize,
    pub render: RenderConfig,
    pub ledburn: LedBurnConfig,
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// OPC over TCP
    pub tcp_port: u16,
    /// OPC over UDP
    pub udp_port: u16,
    /// LedBurn segmented frames over UDP
    pub ledburn_port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RenderConfig {
    pub interpolation: bool,
    pub dithering: bool,
    pub lut: bool,
    /// Gamma exponent applied by the lookup table
    pub lum_power: f32,
    pub white_point: WhitePoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct WhitePoint {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LedBurnConfig {
    /// Frame rate senders are expected to run at
    pub expected_fps: u32,
    /// How many seconds of older frame ids count as reordering rather than a sender restart
    pub stale_window_secs: u32,
    /// Draw black after a sender restart instead of keeping the last partial frame
    pub blank_on_resync: bool,
}

/// One serial-attached LED controller driving (part of) a single strip.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputConfig {
    pub port: String,
    pub protocol: SerialProtocol,
    pub baud_rate: u32,
    pub strip: usize,
    #[serde(default)]
    pub offset: usize,
    /// Defaults to the rest of the strip after `offset`
    pub led_count: Option<usize>,
    pub pixel_format: Option<PixelFormat>,
}

/// Strip layout of the pixel buffers. Pixels are stored strip-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub strips: usize,
    pub pixels_per_strip: usize,
}

impl Topology {
    pub fn new(strips: usize, pixels_per_strip: usize) -> Self {
        Topology { strips, pixels_per_strip }
    }

    pub fn pixel_count(&self) -> usize {
        self.strips * self.pixels_per_strip
    }

    pub fn index(&self, strip: usize, pixel: usize) -> Option<usize> {
        if strip < self.strips && pixel < self.pixels_per_strip {
            Some(strip * self.pixels_per_strip + pixel)
        } else {
            None
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: NetworkConfig::default(),
            strips: MAX_STRIPS,
            pixels_per_strip: 176,
            render: RenderConfig::default(),
            ledburn: LedBurnConfig::default(),
            outputs: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            tcp_port: 7890,
            udp_port: 7890,
            ledburn_port: 2000,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            interpolation: true,
            dithering: true,
            lut: true,
            lum_power: 2.0,
            white_point: WhitePoint { red: 0.9, green: 1.0, blue: 1.0 },
        }
    }
}

impl WhitePoint {
    pub fn as_array(&self) -> [f32; 3] {
        [self.red, self.green, self.blue]
    }
}

impl Default for LedBurnConfig {
    fn default() -> Self {
        LedBurnConfig {
            expected_fps: 50,
            stale_window_secs: 10,
            blank_on_resync: false,
        }
    }
}

impl LedBurnConfig {
    /// Number of frame ids behind the current one that are treated as late packets.
    pub fn stale_window(&self) -> i64 {
        i64::from(self.expected_fps) * i64::from(self.stale_window_secs)
    }
}

impl OutputConfig {
    /// Pixel range of the strip this output drives, clipped to the strip length.
    pub fn pixel_range(&self, pixels_per_strip: usize) -> std::ops::Range<usize> {
        let start = self.offset.min(pixels_per_strip);
        let count = self.led_count.unwrap_or(pixels_per_strip - start);
        start..start.saturating_add(count).min(pixels_per_strip)
    }
}

impl Config {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .context(format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&data)
            .context(format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn topology(&self) -> Topology {
        Topology::new(self.strips, self.pixels_per_strip)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pixels_per_strip == 0 || self.pixels_per_strip > MAX_PIXELS_PER_STRIP {
            bail!(
                "pixels per strip must be between 1 and {}, got {}",
                MAX_PIXELS_PER_STRIP,
                self.pixels_per_strip
            );
        }
        if self.strips == 0 || self.strips > MAX_STRIPS {
            bail!("strip count must be between 1 and {}, got {}", MAX_STRIPS, self.strips);
        }

        let render = &self.render;
        if !(render.lum_power.is_finite() && render.lum_power > 0.0) {
            bail!("lum_power must be a positive number, got {}", render.lum_power);
        }
        for (name, value) in [
            ("red", render.white_point.red),
            ("green", render.white_point.green),
            ("blue", render.white_point.blue),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                bail!("{} balance must be a non-negative number, got {}", name, value);
            }
        }

        if self.ledburn.expected_fps == 0 {
            bail!("ledburn expected_fps must be at least 1");
        }

        for output in &self.outputs {
            if output.strip >= self.strips {
                bail!(
                    "output {} drives strip {} but only {} strips are configured",
                    output.port,
                    output.strip,
                    self.strips
                );
            }
            if output.pixel_range(self.pixels_per_strip).is_empty() {
                bail!("output {} has no pixels to drive", output.port);
            }
        }
        Ok(())
    }

    /// Whether a whole frame fits in a single OPC message.
    pub fn fits_opc_message(&self) -> bool {
        self.topology().pixel_count() * 3 <= MAX_OPC_FRAME_BYTES
    }

    /// Serialized configuration snapshot served to OPC clients.
    pub fn status_json(&self) -> String {
        let status = StatusSnapshot {
            outputs: self.outputs.iter().map(|o| o.port.as_str()).collect(),
            strips: self.strips,
            leds_per_strip: self.pixels_per_strip,
            tcp_port: self.network.tcp_port,
            udp_port: self.network.udp_port,
            ledburn_port: self.network.ledburn_port,
            enable_interpolation: self.render.interpolation,
            enable_dithering: self.render.dithering,
            enable_lookup_table: self.render.lut,
            lum_curve_power: self.render.lum_power,
            white_point: self.render.white_point,
            blank_on_resync: self.ledburn.blank_on_resync,
        };
        // Plain data with string keys cannot fail to serialize
        serde_json::to_string_pretty(&status).unwrap_or_default() + "\n"
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusSnapshot<'a> {
    outputs: Vec<&'a str>,
    strips: usize,
    leds_per_strip: usize,
    tcp_port: u16,
    udp_port: u16,
    ledburn_port: u16,
    enable_interpolation: bool,
    enable_dithering: bool,
    enable_lookup_table: bool,
    lum_curve_power: f32,
    white_point: WhitePoint,
    blank_on_resync: bool,
}

/// Render switches read by the render thread each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFlags {
    pub interpolation: bool,
    pub dithering: bool,
    pub lut: bool,
}

struct ConfigState {
    config: Config,
    json: String,
    /// Bumped on every accepted change
    generation: u64,
}

/// Configuration shared between the render thread and the protocol servers.
///
/// When both locks are needed the frame state is locked first.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<Mutex<ConfigState>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        let json = config.status_json();
        SharedConfig {
            inner: Arc::new(Mutex::new(ConfigState {
                config,
                json,
                generation: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConfigState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Config {
        self.lock().config.clone()
    }

    pub fn render_flags(&self) -> RenderFlags {
        let state = self.lock();
        RenderFlags {
            interpolation: state.config.render.interpolation,
            dithering: state.config.render.dithering,
            lut: state.config.render.lut,
        }
    }

    pub fn status_json(&self) -> String {
        self.lock().json.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Apply a change, validate it and regenerate the status text.
    ///
    /// The render thread picks the change up through [`SharedConfig::generation`].
    pub fn update(&self, change: impl FnOnce(&mut Config)) -> Result<Config> {
        let mut state = self.lock();
        let mut config = state.config.clone();
        change(&mut config);
        config.validate()?;
        state.json = config.status_json();
        state.config = config.clone();
        state.generation += 1;
        Ok(config)
    }
}
