use crate::error::ExchangeError;
use crate::types::{Fill, OrderRequest, PriceTick, SymbolFilters};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Capability set any exchange binding must provide to be driven by the
/// connectivity manager.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Fresh handshake: reachability plus credential check.
    async fn connect(&mut self) -> ExchangeResult<()>;

    /// Starts pushing ticks for `symbol` into `sender`. The binding must drop
    /// the sender when the underlying stream ends, and stop when the
    /// receiver is gone.
    async fn subscribe_ticker(
        &mut self,
        symbol: &str,
        sender: mpsc::Sender<PriceTick>,
    ) -> ExchangeResult<()>;

    async fn fetch_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    async fn get_balance(&self, asset: &str) -> ExchangeResult<Decimal>;

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters>;

    /// Places an order and returns its confirmed execution.
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Fill>;

    /// Looks an order up by the id we gave it. `Ok(None)` when the exchange
    /// never saw it or nothing executed.
    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<Fill>>;
}
