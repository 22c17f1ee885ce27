#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub(crate) mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod inference;
pub mod observability;
pub mod pipeline;
pub mod replay;
pub mod scheduler;
pub(crate) mod schema;
pub mod store;
pub mod util;
