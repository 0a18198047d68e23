pub mod sealer;
pub mod vector_index;

pub use sealer::BlobSealer;
pub use vector_index::{IndexTxn, VectorIndex, VectorIndexStore};
