pub mod defaults;
pub mod paths;
pub mod service;
pub mod settings;
pub mod validation;

pub use paths::AppPaths;
pub use service::{engine_config_from_value, ConfigError, ConfigService};
pub use settings::EngineConfig;
