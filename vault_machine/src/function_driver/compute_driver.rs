#[cfg(feature = "interpreter")]
pub mod interpreter;
