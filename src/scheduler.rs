pub(crate) mod cadence;
pub mod daemon;
