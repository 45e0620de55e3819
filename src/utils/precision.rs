// src/utils/precision.rs
use rust_decimal::Decimal;

/// Rounds a quantity DOWN to the nearest multiple of `step_size`, so an order
/// never asks for more than is held. `10.999` with step `1` gives `10`.
pub fn normalize_quantity(amount: Decimal, step_size: Decimal) -> Decimal {
    if step_size.is_zero() {
        return amount;
    }
    ((amount / step_size).floor() * step_size).normalize()
}

/// Rounds a price to the NEAREST multiple of `tick_size`. `100.16` with tick
/// `0.1` gives `100.2`.
pub fn normalize_price(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }
    ((price / tick_size).round() * tick_size).normalize()
}

/// Signed percentage move from `base` to `current`.
pub fn percent_change(base: Decimal, current: Decimal) -> Decimal {
    (current - base) / base * Decimal::ONE_HUNDRED
}
