use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, SharedConfig};

const CHECK_PERIOD: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_millis(100);

/// Watches the configuration file and applies edits to the render and LedBurn
/// settings while the server runs. Network, topology and output changes need a restart.
pub struct ConfigReloader {
    path: PathBuf,
    contents: String,
    overrides: Box<dyn Fn(&mut Config) + Send>,
}

impl ConfigReloader {
    /// `overrides` is re-applied to every reloaded file so command line flags keep precedence.
    pub fn new(path: &Path, overrides: impl Fn(&mut Config) + Send + 'static) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read config file {}", path.display()))?;
        Ok(ConfigReloader {
            path: path.to_path_buf(),
            contents,
            overrides: Box::new(overrides),
        })
    }

    /// Re-read the file and apply it when its content changed.
    ///
    /// Returns the new configuration generation when a change was applied.
    pub fn poll(&mut self, shared: &SharedConfig) -> Result<Option<u64>> {
        let contents = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file {}", self.path.display()))?;
        if contents == self.contents {
            return Ok(None);
        }
        self.contents = contents;

        let mut loaded: Config = serde_json::from_str(&self.contents)
            .context(format!("Failed to parse config file {}", self.path.display()))?;
        (self.overrides)(&mut loaded);

        let current = shared.snapshot();
        if loaded.network != current.network
            || loaded.topology() != current.topology()
            || loaded.outputs != current.outputs
        {
            warn!(
                "Network, strip layout and output changes in {} take effect after a restart",
                self.path.display()
            );
        }
        if loaded.render == current.render && loaded.ledburn == current.ledburn {
            return Ok(None);
        }

        shared
            .update(|config| {
                config.render = loaded.render;
                config.ledburn = loaded.ledburn;
            })
            .context(format!("Rejected config change in {}", self.path.display()))?;
        Ok(Some(shared.generation()))
    }
}

/// Check the configuration file every second until `running` is cleared.
pub fn spawn_reload_thread(
    mut reloader: ConfigReloader,
    shared: SharedConfig,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_check = Instant::now();
        while running.load(Ordering::Relaxed) {
            thread::sleep(POLL);
            if last_check.elapsed() < CHECK_PERIOD {
                continue;
            }
            last_check = Instant::now();

            match reloader.poll(&shared) {
                Ok(Some(generation)) => {
                    info!("Reloaded {} (generation {})", reloader.path.display(), generation)
                }
                Ok(None) => {}
                Err(e) => warn!("{:#}", e),
            }
        }
    })
}
