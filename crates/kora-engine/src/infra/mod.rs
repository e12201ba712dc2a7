pub mod audit;
pub mod sink;
