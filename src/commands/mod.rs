pub mod curation;
pub mod graph;
pub mod run;
pub mod stats;
pub mod status;
