pub mod dwt_mlead;
pub mod iforest;
pub mod normalize;
pub mod wavelet;

// Re-exports for convenience
pub use dwt_mlead::top_discords;
pub use iforest::IsolationForest;
pub use normalize::normalize;
pub use wavelet::{HaarLevel, haar_decompose};
