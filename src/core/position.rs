// src/core/position.rs
use crate::error::TrackerError;
use crate::types::{Fill, Position, Side};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Single source of truth for the held position. Only confirmed fills move
/// it; the trading loop is the only caller, so no locking.
#[derive(Debug)]
pub struct PositionTracker {
    coin_symbol: String,
    position: Position,
    realized_pnl: Decimal,
    /// Remainders below this after a sell are exchange dust and close the
    /// position.
    dust_threshold: Decimal,
    applied: HashSet<String>,
}

impl PositionTracker {
    pub fn new(coin_symbol: impl Into<String>, dust_threshold: Decimal) -> Self {
        Self {
            coin_symbol: coin_symbol.into(),
            position: Position::Flat,
            realized_pnl: Decimal::ZERO,
            dust_threshold,
            applied: HashSet::new(),
        }
    }

    pub fn set_dust_threshold(&mut self, dust_threshold: Decimal) {
        self.dust_threshold = dust_threshold;
    }

    /// Seeds the tracker from a stored snapshot at start-up.
    pub fn restore(&mut self, position: Position) {
        info!("Restored position: {}", position);
        self.position = position;
    }

    pub fn current(&self) -> Position {
        self.position
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Option<Decimal> {
        match self.position {
            Position::Long {
                entry_price,
                quantity,
            } => Some((price - entry_price) * quantity),
            Position::Flat => None,
        }
    }

    pub fn on_fill_confirmed(&mut self, fill: &Fill) -> Result<Position, TrackerError> {
        if self.applied.contains(&fill.order_id) {
            return Err(TrackerError::DuplicateFill(fill.order_id.clone()));
        }
        if fill.price <= Decimal::ZERO || fill.quantity <= Decimal::ZERO {
            return Err(TrackerError::InvalidFill(fill.order_id.clone()));
        }

        let next = match fill.side {
            Side::Buy => self.apply_buy(fill)?,
            Side::Sell => self.apply_sell(fill)?,
        };

        self.applied.insert(fill.order_id.clone());
        self.position = next;
        debug!("Position after fill {}: {}", fill.order_id, next);
        Ok(next)
    }

    fn apply_buy(&self, fill: &Fill) -> Result<Position, TrackerError> {
        // Commission taken in the bought coin reduces what we actually hold.
        let received = match &fill.commission_asset {
            Some(asset) if asset.eq_ignore_ascii_case(&self.coin_symbol) => {
                fill.quantity - fill.commission
            }
            _ => fill.quantity,
        };

        let next = match self.position {
            Position::Flat => Position::long(fill.price, received),
            Position::Long {
                entry_price,
                quantity,
            } => {
                let total = quantity + received;
                let cost = entry_price * quantity + fill.price * received;
                Position::long(cost / total, total)
            }
        };
        next.ok_or_else(|| TrackerError::InvalidFill(fill.order_id.clone()))
    }

    fn apply_sell(&mut self, fill: &Fill) -> Result<Position, TrackerError> {
        let (entry_price, quantity) = match self.position {
            Position::Flat => return Err(TrackerError::SellWhileFlat(fill.order_id.clone())),
            Position::Long {
                entry_price,
                quantity,
            } => (entry_price, quantity),
        };

        if fill.quantity > quantity {
            return Err(TrackerError::Oversell {
                order_id: fill.order_id.clone(),
                held: quantity,
            });
        }

        self.realized_pnl += (fill.price - entry_price) * fill.quantity;

        let remaining = quantity - fill.quantity;
        if remaining.is_zero() {
            return Ok(Position::Flat);
        }
        if remaining < self.dust_threshold {
            warn!(
                "Leaving {} {} of dust after order {}",
                remaining, self.coin_symbol, fill.order_id
            );
            return Ok(Position::Flat);
        }
        Ok(Position::Long {
            entry_price,
            quantity: remaining,
        })
    }
}
