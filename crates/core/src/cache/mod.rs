pub mod analysis;
pub mod file_state;

pub use analysis::AnalysisCaches;
pub use file_state::FileStateCache;
