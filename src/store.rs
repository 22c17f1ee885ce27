pub mod dao;
pub mod memory;
pub mod models;
pub mod pg;

pub use dao::{EnrichmentDao, ImportOutcome};
pub use memory::MemoryEnrichmentDao;
pub use pg::PgEnrichmentDao;
