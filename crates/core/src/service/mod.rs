pub mod engine;
pub mod stocks;
