use anyhow::{Context, Result};
use fusion::{FusionConfig, World};
use std::sync::Once;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_subscriber::{fmt, EnvFilter};

static TRACING: Once = Once::new();

/// One world name in a private shm directory.
pub struct Harness {
    name: String,
    dir: TempDir,
}

impl Harness {
    pub fn new(name: &str) -> Result<Self> {
        TRACING.call_once(|| {
            let _ = fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
        Ok(Self {
            name: name.to_owned(),
            dir: TempDir::new().context("creating shm directory")?,
        })
    }

    pub fn config(&self) -> FusionConfig {
        FusionConfig {
            shm_dir: self.dir.path().to_path_buf(),
            heartbeat_interval: Duration::from_millis(100),
            ..FusionConfig::default()
        }
    }

    /// Enters the world as one more member.
    pub fn member(&self) -> Result<World> {
        World::enter(&self.name, self.config())
            .with_context(|| format!("entering world {}", self.name))
    }
}

/// Polls until `condition` holds, failing after `timeout`.
pub fn eventually(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
