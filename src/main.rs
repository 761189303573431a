use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

mod config;
mod frame;
mod ledburn_server;
mod lut;
mod opc_server;
mod output;
mod pixel_format;
mod protocol;
mod reload;
mod render;
mod state;
mod stats;

use config::{Config, SharedConfig};
use ledburn_server::LedBurnServer;
use opc_server::OpcHandler;
use output::SerialSink;
use reload::ConfigReloader;
use render::Renderer;
use state::SharedFrames;
use stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dimensions {
    width: usize,
    height: usize,
}

fn parse_dimensions(arg: &str) -> Result<Dimensions, String> {
    let (width, height) = arg
        .split_once('x')
        .ok_or_else(|| format!("expected <width>x<height>, got {}", arg))?;
    let width = width.trim().parse().map_err(|_| format!("invalid width in {}", arg))?;
    let height = height.trim().parse().map_err(|_| format!("invalid height in {}", arg))?;
    Ok(Dimensions { width, height })
}

#[derive(Parser, Debug, Clone)]
#[command(name = "pixel_server")]
#[command(about = "Pixel server\n\nReceives frames over OPC (TCP/UDP) and LedBurn (UDP), renders them with interpolation, gamma correction and dithering, and drives serial LED strips.", long_about = None)]
struct Cli {
    /// Path to configuration file (JSON)
    config: Option<PathBuf>,

    /// OPC TCP port
    #[arg(short = 'p', long)]
    tcp_port: Option<u16>,

    /// OPC UDP port
    #[arg(short = 'P', long)]
    udp_port: Option<u16>,

    /// LedBurn UDP port
    #[arg(long)]
    ledburn_port: Option<u16>,

    /// Pixels per strip
    #[arg(short = 'c', long, conflicts_with = "dimensions")]
    count: Option<usize>,

    /// Pixels per strip as a <width>x<height> matrix
    #[arg(short = 'd', long, value_parser = parse_dimensions)]
    dimensions: Option<Dimensions>,

    /// Number of strips
    #[arg(short = 's', long)]
    strips: Option<usize>,

    #[arg(short = 'i', long)]
    no_interpolation: bool,

    #[arg(short = 't', long)]
    no_dithering: bool,

    /// Disable the gamma / white balance lookup table
    #[arg(short = 'l', long)]
    no_lut: bool,

    /// Gamma exponent
    #[arg(short = 'L', long)]
    lum_power: Option<f32>,

    #[arg(short = 'r', long)]
    red_bal: Option<f32>,

    #[arg(short = 'g', long)]
    green_bal: Option<f32>,

    #[arg(short = 'b', long)]
    blue_bal: Option<f32>,

    /// Draw black when a LedBurn sender restarts
    #[arg(long)]
    blank_on_resync: bool,

    /// Show red, green, blue and black before rendering starts
    #[arg(long)]
    test_pattern: bool,

    /// Enable debug output (statistics)
    #[arg(long)]
    debug: bool,

    /// Enable detailed debug (hex dumps every frame)
    #[arg(long)]
    ddebug: bool,
}

impl Cli {
    /// Override configuration file values with the flags that were given.
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.tcp_port {
            config.network.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            config.network.udp_port = port;
        }
        if let Some(port) = self.ledburn_port {
            config.network.ledburn_port = port;
        }
        if let Some(count) = self.count {
            config.pixels_per_strip = count;
        }
        if let Some(dimensions) = self.dimensions {
            config.pixels_per_strip = dimensions.width * dimensions.height;
        }
        if let Some(strips) = self.strips {
            config.strips = strips;
        }

        let render = &mut config.render;
        if self.no_interpolation {
            render.interpolation = false;
        }
        if self.no_dithering {
            render.dithering = false;
        }
        if self.no_lut {
            render.lut = false;
        }
        if let Some(power) = self.lum_power {
            render.lum_power = power;
        }
        if let Some(red) = self.red_bal {
            render.white_point.red = red;
        }
        if let Some(green) = self.green_bal {
            render.white_point.green = green;
        }
        if let Some(blue) = self.blue_bal {
            render.white_point.blue = blue;
        }
        if self.blank_on_resync {
            config.ledburn.blank_on_resync = true;
        }
    }

    fn log_level(&self) -> &'static str {
        if self.ddebug {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level()))
        .target(env_logger::Target::Stderr)
        .init();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    if !config.fits_opc_message() {
        warn!(
            "{} strips of {} pixels do not fit in one OPC message; only LedBurn can fill the whole frame",
            config.strips, config.pixels_per_strip
        );
    }
    info!(
        "Allocating buffers for {} strips of {} pixels",
        config.strips, config.pixels_per_strip
    );

    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(Stats::default());
    let frames = SharedFrames::new(&config, Instant::now());
    let shared_config = SharedConfig::new(config.clone());

    let sink = SerialSink::open(config.topology(), &config.outputs)?;
    let output_counters = sink.frame_counters();

    // Set up Ctrl-C handler with graceful shutdown
    let handler_running = Arc::clone(&running);
    let result = ctrlc::set_handler(move || {
        info!("Shutting down...");
        handler_running.store(false, Ordering::Relaxed);
    });
    if let Err(e) = result {
        warn!("Could not set Ctrl-C handler: {}", e);
    }

    let host = &config.network.host;
    let tcp = opc_server::bind_tcp(&format!("{}:{}", host, config.network.tcp_port))?;
    let udp = opc_server::bind_udp(&format!("{}:{}", host, config.network.udp_port))?;
    let ledburn = ledburn_server::bind(&format!("{}:{}", host, config.network.ledburn_port))?;

    let opc = Arc::new(OpcHandler::new(frames.clone(), shared_config.clone(), Arc::clone(&stats)));
    let mut threads = Vec::new();
    {
        let (opc, running) = (Arc::clone(&opc), Arc::clone(&running));
        threads.push(thread::spawn(move || opc_server::run_tcp(tcp, opc, running)));
    }
    {
        let (opc, running) = (Arc::clone(&opc), Arc::clone(&running));
        threads.push(thread::spawn(move || opc_server::run_udp(udp, opc, running)));
    }
    {
        let server = LedBurnServer::new(frames.clone(), Arc::clone(&stats));
        let running = Arc::clone(&running);
        threads.push(thread::spawn(move || ledburn_server::run(ledburn, server, running)));
    }
    if let Some(path) = &cli.config {
        let overrides = cli.clone();
        let reloader = ConfigReloader::new(path, move |config| overrides.apply(config))?;
        threads.push(reload::spawn_reload_thread(
            reloader,
            shared_config.clone(),
            Arc::clone(&running),
        ));
    }
    if cli.debug || cli.ddebug {
        threads.push(stats::spawn_stats_thread(
            Arc::clone(&stats),
            output_counters,
            Arc::clone(&running),
        ));
    }

    let mut renderer = Renderer::new(frames, shared_config, sink, stats);
    if cli.test_pattern {
        renderer.play_test_pattern(&running);
    }

    let render_running = Arc::clone(&running);
    let render = thread::Builder::new()
        .name("render".to_string())
        .spawn(move || renderer.run(&render_running))
        .context("Failed to start render thread")?;

    info!("(Press Ctrl-C to stop)");
    let _ = render.join();
    for handle in threads {
        let _ = handle.join();
    }

    info!("✓ Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("16x11"), Ok(Dimensions { width: 16, height: 11 }));
        assert!(parse_dimensions("16").is_err());
        assert!(parse_dimensions("ax2").is_err());
        assert!(parse_dimensions("2x").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "pixel_server", "-p", "9000", "--ledburn-port", "2001", "-d", "8x4", "-s", "2", "-t", "-L", "2.2",
            "-r", "1.0", "--blank-on-resync",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.network.tcp_port, 9000);
        assert_eq!(config.network.udp_port, 7890);
        assert_eq!(config.network.ledburn_port, 2001);
        assert_eq!(config.pixels_per_strip, 32);
        assert_eq!(config.strips, 2);
        assert!(!config.render.dithering);
        assert!(config.render.interpolation);
        assert_eq!(config.render.lum_power, 2.2);
        assert_eq!(config.render.white_point.red, 1.0);
        assert!(config.ledburn.blank_on_resync);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_count_conflicts_with_dimensions() {
        assert!(Cli::try_parse_from(["pixel_server", "-c", "10", "-d", "2x2"]).is_err());
    }

    #[test]
    fn test_log_level_follows_flags() {
        let cli = Cli::try_parse_from(["pixel_server", "--debug"]).unwrap();
        assert_eq!(cli.log_level(), "debug");
        let cli = Cli::try_parse_from(["pixel_server", "--debug", "--ddebug"]).unwrap();
        assert_eq!(cli.log_level(), "trace");
        let cli = Cli::try_parse_from(["pixel_server", "config.json"]).unwrap();
        assert_eq!(cli.log_level(), "info");
        assert_eq!(cli.config, Some(PathBuf::from("config.json")));
    }
}
