pub mod inject;
pub mod model;
pub mod records;

pub use inject::{launch_core, HOST_ID};
pub use records::CoreAction;
pub use model::{model_step, run_until, RunEnd, RunSummary, Watchdog};
