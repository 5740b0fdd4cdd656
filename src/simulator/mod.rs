pub mod config;
pub mod device;
pub mod sim;
pub mod simulator;
pub mod utils;

pub use device::{Device, SimDevice};
pub use simulator::MatmulRunner;
pub use utils::log;
pub use utils::report::{CoreEvent, RunReport};
