pub mod daemon;
pub mod log;
pub mod term;
