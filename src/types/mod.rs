pub mod linalg;
pub mod pose;

pub use linalg::*;
pub use pose::Pose;
