pub mod cb;
pub mod compute;
pub mod dram;
pub mod main;
pub mod noc;
pub mod reader;
pub mod semaphore;
pub mod task;
pub mod worker;
pub mod writer;

pub use main::{create_simulation, MeshSimulation};
pub use task::{CoreStats, MeshState, MeshTiming, SharedMeshState};
