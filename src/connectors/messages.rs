// src/connectors/messages.rs
use rust_decimal::Decimal;
use serde::Deserialize;

/// Trade event from wss://stream.binance.<tld>:9443/ws/<symbol>@trade
/// Binance uses one-letter field names, mapped with `rename`.
#[derive(Debug, Deserialize)]
pub struct BinanceTradeEvent {
    #[serde(rename = "e")]
    pub event_type: String, // "trade"

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "p")]
    pub price: Decimal,

    #[serde(rename = "T")]
    pub trade_time: u64,
}

/// Body of every non-2xx REST response.
#[derive(Debug, Deserialize)]
pub struct BinanceApiError {
    pub code: i64,
    pub msg: String,
}

/// `POST /api/v3/order` with `newOrderRespType=FULL`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceOrderResponse {
    pub symbol: String,
    pub order_id: u64,
    pub status: String,
    pub executed_qty: Decimal,
    pub cummulative_quote_qty: Decimal,
    pub transact_time: u64,
    #[serde(default)]
    pub fills: Vec<BinanceOrderFill>,
}

/// `GET /api/v3/order`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceQueriedOrder {
    pub order_id: u64,
    pub status: String,
    pub side: String,
    pub executed_qty: Decimal,
    pub cummulative_quote_qty: Decimal,
    pub update_time: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceOrderFill {
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
}

#[derive(Debug, Deserialize)]
pub struct BinanceBalance {
    pub asset: String,
    pub free: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BinanceAccountInfo {
    pub balances: Vec<BinanceBalance>,
}

#[derive(Debug, Deserialize)]
pub struct BinanceTickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BinanceExchangeInfo {
    pub symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct BinanceSymbolInfo {
    pub symbol: String,
    pub filters: Vec<BinanceSymbolFilter>,
}

/// Only the filters the order sizing needs; everything else is `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum BinanceSymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize { step_size: Decimal },
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    PriceFilter { tick_size: Decimal },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional { min_notional: Decimal },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional { min_notional: Decimal },
    #[serde(other)]
    Other,
}
