//! Helpers shared by the unit tests: a private shm directory per test and
//! polling for conditions the watch threads settle asynchronously.

use crate::{FusionConfig, World};
use std::path::PathBuf;
use std::sync::Once;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_subscriber::{fmt, EnvFilter};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A world name bound to its own temporary shm directory.
pub(crate) struct TestWorld {
    name: String,
    dir: TempDir,
}

impl TestWorld {
    pub fn new(name: &str) -> Self {
        init_tracing();
        Self {
            name: name.to_owned(),
            dir: TempDir::new().expect("tempdir"),
        }
    }

    /// Config pointing at the test directory with a fast heartbeat.
    pub fn config(&self) -> FusionConfig {
        FusionConfig {
            shm_dir: self.dir.path().to_path_buf(),
            heartbeat_interval: Duration::from_millis(100),
            ..FusionConfig::default()
        }
    }

    /// Enters the world as a new member.
    pub fn enter(&self) -> World {
        World::enter(&self.name, self.config()).expect("enter world")
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub(crate) fn assert_no_file(t: &TestWorld, file: &str) {
    assert!(!t.path(file).exists(), "{file} should be gone");
}
