// src/types.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// One price observation for the traded pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub pair: String,
    pub price: Decimal,
    pub timestamp: u64,
}

/// Holding state for the configured pair.
///
/// `Long` is built through [`Position::long`], which rejects non-positive
/// quantities and prices. Deserialization goes through the same check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", try_from = "StoredPosition")]
pub enum Position {
    #[default]
    Flat,
    Long {
        entry_price: Decimal,
        quantity: Decimal,
    },
}

impl Position {
    pub fn long(entry_price: Decimal, quantity: Decimal) -> Option<Self> {
        if entry_price > Decimal::ZERO && quantity > Decimal::ZERO {
            Some(Position::Long {
                entry_price,
                quantity,
            })
        } else {
            None
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, Position::Flat)
    }

    pub fn entry_price(&self) -> Option<Decimal> {
        match self {
            Position::Long { entry_price, .. } => Some(*entry_price),
            Position::Flat => None,
        }
    }

    pub fn quantity(&self) -> Option<Decimal> {
        match self {
            Position::Long { quantity, .. } => Some(*quantity),
            Position::Flat => None,
        }
    }
}

/// Unchecked wire shape of [`Position`].
#[derive(Deserialize)]
#[serde(tag = "state")]
enum StoredPosition {
    Flat,
    Long {
        entry_price: Decimal,
        quantity: Decimal,
    },
}

impl TryFrom<StoredPosition> for Position {
    type Error = String;

    fn try_from(raw: StoredPosition) -> Result<Self, Self::Error> {
        match raw {
            StoredPosition::Flat => Ok(Position::Flat),
            StoredPosition::Long {
                entry_price,
                quantity,
            } => Position::long(entry_price, quantity).ok_or_else(|| {
                format!(
                    "long position needs positive price and quantity, got {} @ {}",
                    quantity, entry_price
                )
            }),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Flat => write!(f, "FLAT"),
            Position::Long {
                entry_price,
                quantity,
            } => write!(f, "LONG {} @ {}", quantity, entry_price),
        }
    }
}

/// Confirmed execution of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub timestamp: u64,
}

/// Order submitted to a binding. `price = Some` is limit IOC, `None` market.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Hold,
    ExitProfit,
    ExitLoss,
}

impl Action {
    pub fn is_exit(&self) -> bool {
        !matches!(self, Action::Hold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub trigger_price: Decimal,
    /// `None` while flat.
    pub percent_change: Option<Decimal>,
}

impl Decision {
    pub fn hold(trigger_price: Decimal, percent_change: Option<Decimal>) -> Self {
        Self {
            action: Action::Hold,
            trigger_price,
            percent_change,
        }
    }
}

/// Exchange trading rules for a symbol (LOT_SIZE, PRICE_FILTER, NOTIONAL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            step_size: Decimal::ZERO,
            tick_size: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "Info",
            Level::Success => "Success",
            Level::Warning => "Warning",
            Level::Error => "Error",
        }
    }
}

/// Notification payloads. Every variant carries only what a reader of the
/// alert needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    TradingStarted {
        pair: String,
        live: bool,
        position: Position,
        balances: Vec<(String, Decimal)>,
        collated: Option<(String, Decimal)>,
    },
    ConnectionLost {
        reason: String,
    },
    ConnectionRestored {
        attempt: u32,
    },
    RetryExhausted {
        attempts: u32,
    },
    OrderPlaced {
        pair: String,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    },
    OrderFilled {
        pair: String,
        fill: Fill,
        realized_pnl: Decimal,
    },
    OrderFailed {
        pair: String,
        side: Side,
        reason: String,
    },
    ThresholdBreached {
        pair: String,
        action: Action,
        price: Decimal,
        entry_price: Decimal,
        percent_change: Decimal,
    },
    TradingHalted {
        reason: String,
    },
}

impl Event {
    pub fn level(&self) -> Level {
        match self {
            Event::OrderPlaced { .. } => Level::Info,
            Event::TradingStarted { .. }
            | Event::ConnectionRestored { .. }
            | Event::OrderFilled { .. }
            | Event::ThresholdBreached { .. } => Level::Success,
            Event::ConnectionLost { .. } | Event::OrderFailed { .. } => Level::Warning,
            Event::RetryExhausted { .. } | Event::TradingHalted { .. } => Level::Error,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Event::TradingStarted { .. } => "Trading started",
            Event::ConnectionLost { .. } => "Connection lost",
            Event::ConnectionRestored { .. } => "Connection restored",
            Event::RetryExhausted { .. } => "Reconnection attempts exhausted",
            Event::OrderPlaced { .. } => "Order placed",
            Event::OrderFilled { .. } => "Order filled",
            Event::OrderFailed { .. } => "Order failed",
            Event::ThresholdBreached { .. } => "Threshold breached",
            Event::TradingHalted { .. } => "Trading halted",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::TradingStarted {
                pair,
                live,
                position,
                balances,
                collated,
            } => {
                write!(
                    f,
                    "{} on {} ({}), position {}",
                    self.title(),
                    pair,
                    if *live { "live" } else { "paper" },
                    position
                )?;
                for (asset, amount) in balances {
                    write!(f, ", {} {}", amount.round_dp(8), asset)?;
                }
                if let Some((asset, total)) = collated {
                    write!(f, ", collated {} {}", total.round_dp(8), asset)?;
                }
                Ok(())
            }
            Event::ConnectionLost { reason } => write!(f, "{}: {}", self.title(), reason),
            Event::ConnectionRestored { attempt } => {
                write!(f, "{} after attempt {}", self.title(), attempt)
            }
            Event::RetryExhausted { attempts } => {
                write!(f, "{} ({} attempts)", self.title(), attempts)
            }
            Event::OrderPlaced {
                pair,
                side,
                quantity,
                price,
            } => write!(
                f,
                "{} {} {} {} @ {}",
                self.title(),
                side.as_str(),
                quantity,
                pair,
                price
            ),
            Event::OrderFilled {
                pair,
                fill,
                realized_pnl,
            } => write!(
                f,
                "{} {} {} {} @ {} (order {}, realized P&L {})",
                self.title(),
                fill.side.as_str(),
                fill.quantity,
                pair,
                fill.price,
                fill.order_id,
                realized_pnl.round_dp(8)
            ),
            Event::OrderFailed { pair, side, reason } => write!(
                f,
                "{} {} {}: {}",
                self.title(),
                side.as_str(),
                pair,
                reason
            ),
            Event::ThresholdBreached {
                pair,
                action,
                price,
                entry_price,
                percent_change,
            } => write!(
                f,
                "{} on {}: {:?} at {} (entry {}, {:+}%)",
                self.title(),
                pair,
                action,
                price,
                entry_price,
                percent_change.round_dp(4)
            ),
            Event::TradingHalted { reason } => write!(f, "{}: {}", self.title(), reason),
        }
    }
}

// --- Dashboard feed ---

#[derive(Debug, Clone)]
pub enum UiEvent {
    TickerUpdate(PriceTick),
    Decision(Decision),
    Position(Position),
    Notice(Event),
}
