pub mod configs;
pub mod data;
pub mod loss;
pub mod metadata;
pub mod runner;
pub mod snapshot;
pub mod wrn;
