// src/connectors/paper.rs
use crate::connectors::traits::{ExchangeClient, ExchangeResult};
use crate::error::ExchangeError;
use crate::types::{Fill, OrderRequest, PriceTick, Side, SymbolFilters};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Real market data from `inner`, simulated orders and balances.
///
/// Orders fill completely at the requested limit price. Market orders (no
/// price) are refused because there is no book to fill against.
pub struct PaperClient<C> {
    inner: C,
    base_asset: String,
    quote_asset: String,
    balances: Mutex<HashMap<String, Decimal>>,
    fills: Mutex<HashMap<String, Fill>>,
}

impl<C: ExchangeClient> PaperClient<C> {
    pub fn new(inner: C, base_asset: &str, quote_asset: &str, quote_balance: Decimal) -> Self {
        let mut balances = HashMap::new();
        balances.insert(quote_asset.to_uppercase(), quote_balance);
        Self {
            inner,
            base_asset: base_asset.to_uppercase(),
            quote_asset: quote_asset.to_uppercase(),
            balances: Mutex::new(balances),
            fills: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds a simulated holding, e.g. the coin behind a restored position.
    pub fn with_balance(self, asset: &str, amount: Decimal) -> Self {
        if let Ok(mut balances) = self.balances.lock() {
            balances.insert(asset.to_uppercase(), amount);
        }
        self
    }

    fn balance_of(&self, asset: &str) -> Decimal {
        self.balances
            .lock()
            .map(|b| b.get(&asset.to_uppercase()).copied().unwrap_or(Decimal::ZERO))
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl<C: ExchangeClient> ExchangeClient for PaperClient<C> {
    async fn connect(&mut self) -> ExchangeResult<()> {
        self.inner.connect().await
    }

    async fn subscribe_ticker(
        &mut self,
        symbol: &str,
        sender: mpsc::Sender<PriceTick>,
    ) -> ExchangeResult<()> {
        self.inner.subscribe_ticker(symbol, sender).await
    }

    async fn fetch_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.inner.fetch_price(symbol).await
    }

    async fn get_balance(&self, asset: &str) -> ExchangeResult<Decimal> {
        Ok(self.balance_of(asset))
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        self.inner.symbol_filters(symbol).await
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Fill> {
        let price = request.price.ok_or_else(|| ExchangeError::OrderRejected {
            code: None,
            reason: "paper trading needs a limit price".into(),
        })?;
        let quantity = request.quantity;
        if quantity <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(ExchangeError::OrderRejected {
                code: None,
                reason: format!("invalid quantity {} or price {}", quantity, price),
            });
        }

        let notional = quantity * price;
        {
            let mut balances = self
                .balances
                .lock()
                .map_err(|_| ExchangeError::Decode("paper balances poisoned".into()))?;

            let base = balances.get(&self.base_asset).copied().unwrap_or_default();
            let quote = balances.get(&self.quote_asset).copied().unwrap_or_default();

            let (new_base, new_quote) = match request.side {
                Side::Buy if quote < notional => return Err(insufficient()),
                Side::Sell if base < quantity => return Err(insufficient()),
                Side::Buy => (base + quantity, quote - notional),
                Side::Sell => (base - quantity, quote + notional),
            };
            balances.insert(self.base_asset.clone(), new_base);
            balances.insert(self.quote_asset.clone(), new_quote);
        }

        info!(
            "Paper {}: {} {} at {} (notional {})",
            request.side.as_str(),
            quantity,
            request.symbol,
            price,
            notional.round_dp(8)
        );

        let fill = Fill {
            order_id: format!("paper-{}", Uuid::new_v4().simple()),
            side: request.side,
            price,
            quantity,
            commission: Decimal::ZERO,
            commission_asset: None,
            timestamp: Utc::now().timestamp_millis() as u64,
        };
        if let Ok(mut fills) = self.fills.lock() {
            fills.insert(request.client_order_id.clone(), fill.clone());
        }
        Ok(fill)
    }

    async fn query_order(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<Fill>> {
        Ok(self
            .fills
            .lock()
            .ok()
            .and_then(|f| f.get(client_order_id).cloned()))
    }
}

fn insufficient() -> ExchangeError {
    ExchangeError::OrderRejected {
        code: Some(-2010),
        reason: "insufficient paper balance".into(),
    }
}
