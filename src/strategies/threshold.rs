// src/strategies/threshold.rs
use crate::strategies::traits::Strategy;
use crate::types::{Action, Decision, Position, PriceTick};
use crate::utils::precision::percent_change;
use rust_decimal::Decimal;

/// Maps a price and a position to an exit decision.
///
/// Both bounds are inclusive: a move of exactly `min_profit` percent (or
/// exactly `-max_loss` percent) is a breach. All math is `Decimal`, so the
/// boundary is never lost to float rounding.
pub fn evaluate(
    current_price: Decimal,
    position: &Position,
    min_profit: Decimal,
    max_loss: Decimal,
) -> Decision {
    let entry_price = match position {
        Position::Flat => return Decision::hold(current_price, None),
        Position::Long { entry_price, .. } => *entry_price,
    };

    let pct = percent_change(entry_price, current_price);

    let action = if pct >= min_profit {
        Action::ExitProfit
    } else if pct <= -max_loss {
        Action::ExitLoss
    } else {
        Action::Hold
    };

    Decision {
        action,
        trigger_price: current_price,
        percent_change: Some(pct),
    }
}

pub struct ThresholdStrategy {
    min_profit: Decimal,
    max_loss: Decimal,
}

impl ThresholdStrategy {
    /// # Arguments
    /// * `min_profit` - gain in percent that closes the position (e.g. `0.2`).
    /// * `max_loss` - loss in percent that closes the position (e.g. `5.0`).
    pub fn new(min_profit: Decimal, max_loss: Decimal) -> Self {
        Self {
            min_profit,
            max_loss,
        }
    }
}

impl Strategy for ThresholdStrategy {
    fn name(&self) -> String {
        format!("threshold(+{}% / -{}%)", self.min_profit, self.max_loss)
    }

    fn on_tick(&self, tick: &PriceTick, position: &Position) -> Decision {
        evaluate(tick.price, position, self.min_profit, self.max_loss)
    }
}
