pub mod types;

pub use types::{AppError, ProbeError};

pub type AppResult<T> = Result<T, AppError>;
