// Business domains
pub mod sources;
