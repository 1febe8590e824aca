use once_cell::sync::OnceCell;

use crate::{core::Reactors, logger};

static ENGINE_ENV: OnceCell<EngineEnvironment> = OnceCell::new();

/// Process-wide bootstrap of the engine: logging and the reactor set. The
/// callers own the CLI; this is configured programmatically.
#[derive(Debug, Clone)]
pub struct EngineEnvironment {
    /// number of reactors to start with
    pub reactor_count: u32,
    /// default log level when RUST_LOG is not set
    pub log_level: String,
}

impl Default for EngineEnvironment {
    fn default() -> Self {
        Self {
            reactor_count: 2,
            log_level: "info".into(),
        }
    }
}

impl EngineEnvironment {
    pub fn new(reactor_count: u32) -> Self {
        Self {
            reactor_count,
            ..Default::default()
        }
    }

    /// Initialize the environment. Only the first call takes effect; the
    /// reactor set of a running process cannot be re-created.
    pub fn init(self) -> &'static EngineEnvironment {
        ENGINE_ENV.get_or_init(|| {
            logger::init_logger(&self.log_level);
            Reactors::init(self.reactor_count);
            info!(
                "engine environment initialized with {} reactors",
                self.reactor_count
            );
            self
        })
    }

    /// the active environment, if initialized
    pub fn global() -> Option<&'static EngineEnvironment> {
        ENGINE_ENV.get()
    }
}
