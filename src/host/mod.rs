pub mod layout;
pub mod vectors;

pub use layout::{tilize, untilize, TiledMatrix};
pub use vectors::{allclose, pcc, random_vector, reference_matmul};
