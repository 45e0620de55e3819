pub mod connectivity;
pub mod engine;
pub mod position;
