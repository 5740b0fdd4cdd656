pub mod config;

pub use config::{
  apply_cli_overrides, load_config_file, load_default_config, load_layered_config, validate_config, AppConfig,
  CliOverrides, DeviceSection, MatmulSection, SimulationSection,
};
