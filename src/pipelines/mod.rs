pub mod consensus_genome;
pub mod executor;
pub mod plan;
pub mod run;
