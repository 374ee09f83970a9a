pub mod metric;
pub mod rotation;
pub mod scalar;

pub use metric::{Direction, Metric};
pub use rotation::RandomRotation;
