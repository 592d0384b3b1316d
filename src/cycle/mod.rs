pub mod executor;
pub mod result;

pub use executor::CycleExecutor;
pub use result::{AttemptRecord, CycleResult};
