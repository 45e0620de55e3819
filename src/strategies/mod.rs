pub mod threshold;
pub mod traits;
