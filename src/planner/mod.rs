pub mod args;
pub mod coord;
pub mod partition;
pub mod program;
pub mod shape;
pub mod staging;
pub mod subblock;
pub mod topology;

pub use coord::{CoreCoord, CoreRange, CoreRangeSet};
pub use partition::{split_work_to_cores, BlockPartition, WorkSplit};
pub use program::{build_program, Program, ProgramCache, ProgramKey, TaskArtifact};
pub use shape::{DataFormat, MathFidelity, MatmulParams, MatmulShape, MatmulVariant, TilingOptions};
pub use subblock::get_subblock_sizes;
pub use topology::{CoreRole, GridTopology, McastAxis, McastRole};
