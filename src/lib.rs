pub mod arch;
pub mod error;
pub mod host;
pub mod planner;
pub mod simulator;

pub use error::{CapacityError, ConfigError, DeviceError, Fault, Result};
pub use planner::{DataFormat, MathFidelity, MatmulParams, MatmulShape, MatmulVariant, TilingOptions};
pub use simulator::utils::log;
pub use simulator::{Device, MatmulRunner, RunReport, SimDevice};
