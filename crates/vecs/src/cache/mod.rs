mod exact;
mod vector_index;

pub use exact::ExactCache;
pub use vector_index::{VectorIndex, N_PROBE, NUM_CLUSTERS};
