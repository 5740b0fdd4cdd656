use env_logger::{Builder, Env};

/// Initialise logging at `info`, overridable through `RUST_LOG`.
pub fn init_log() {
  init_log_with(false);
}

/// Quiet runs only report warnings and errors unless `RUST_LOG` says otherwise.
pub fn init_log_with(quiet: bool) {
  let default = if quiet { "warn" } else { "info" };
  let _ = Builder::from_env(Env::default().default_filter_or(default))
    .format_timestamp(None)
    .try_init();
}
