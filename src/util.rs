pub mod retry;
pub(crate) mod text;
