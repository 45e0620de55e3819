// src/strategies/traits.rs
use crate::types::{Decision, Position, PriceTick};

pub trait Strategy: Send + Sync {
    fn name(&self) -> String;

    // Decide what to do with the current position at this tick. Must not
    // perform I/O.
    fn on_tick(&self, tick: &PriceTick, position: &Position) -> Decision;
}
