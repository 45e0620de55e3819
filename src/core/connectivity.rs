// src/core/connectivity.rs
//! Keeps the exchange session alive for one pair: price stream, balances and
//! order placement, with bounded reconnection when the transport drops.

use crate::config::AppConfig;
use crate::connectors::traits::ExchangeClient;
use crate::error::{ConnectivityError, ExchangeError};
use crate::notify::Notifier;
use crate::types::{Event, Fill, OrderRequest, Position, PriceTick, Side, SymbolFilters};
use crate::utils::precision::{normalize_price, normalize_quantity};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const TICK_BUFFER: usize = 1024;

/// Price offset for limit IOC orders so they cross the spread.
const SLIPPAGE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Failed)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        )
    }
}

/// Capped exponential backoff with a per-episode attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnection attempts per failure episode. `0` disables retrying.
    pub limit: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limit: config.binance_retries,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based): `min(base * 2^(k-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor)).min(self.max_delay)
    }
}

pub struct ConnectivityManager {
    client: Box<dyn ExchangeClient>,
    pair: String,
    coin: String,
    policy: RetryPolicy,
    state: ConnectionState,
    ticks: Option<mpsc::Receiver<PriceTick>>,
    filters: SymbolFilters,
    notifier: Notifier,
}

impl ConnectivityManager {
    pub fn new(client: Box<dyn ExchangeClient>, config: &AppConfig, notifier: Notifier) -> Self {
        Self {
            client,
            pair: config.pair(),
            coin: config.coin_symbol.to_uppercase(),
            policy: RetryPolicy::from_config(config),
            state: ConnectionState::Disconnected,
            ticks: None,
            filters: SymbolFilters::default(),
            notifier,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn filters(&self) -> SymbolFilters {
        self.filters
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// Initial handshake. Network failures go through the same retry budget
    /// as a dropped connection; credential failures never retry.
    pub async fn open(&mut self) -> Result<(), ConnectivityError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        info!("Connecting to exchange for {}", self.pair);
        self.transition(ConnectionState::Connecting);
        match self.handshake().await {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                info!(
                    "Connected. Filters: step {}, tick {}, min notional {}",
                    self.filters.step_size, self.filters.tick_size, self.filters.min_notional
                );
                Ok(())
            }
            Err(e @ ConnectivityError::Auth(_)) => {
                self.transition(ConnectionState::Failed);
                error!("Exchange rejected credentials: {}", e);
                Err(e)
            }
            Err(e) => {
                self.transition(ConnectionState::Failed);
                warn!("Initial connection failed: {}", e);
                self.reconnect(e).await
            }
        }
    }

    /// Next price update in emission order. Suspends until one arrives;
    /// a closed stream triggers recovery first.
    pub async fn next_tick(&mut self) -> Result<PriceTick, ConnectivityError> {
        loop {
            let received = match self.ticks.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };
            match received {
                Some(tick) => return Ok(tick),
                None => {
                    warn!("Price stream for {} closed", self.pair);
                    self.recover(ConnectivityError::StreamClosed).await?;
                }
            }
        }
    }

    /// A tick that is already buffered, if any.
    pub fn try_next_tick(&mut self) -> Option<PriceTick> {
        self.ticks.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Sells the held quantity, capped by the free coin balance, as a limit
    /// IOC slightly below `reference_price`.
    pub async fn place_exit(
        &mut self,
        position: &Position,
        reference_price: Decimal,
    ) -> Result<Fill, ConnectivityError> {
        let held = position
            .quantity()
            .ok_or_else(|| ConnectivityError::OrderRejected("no position to exit".into()))?;

        let free = match self.client.get_balance(&self.coin).await {
            Ok(free) => free,
            Err(e) => return self.interrupted(e, None).await,
        };
        if free < held {
            warn!(
                "Free {} balance {} is below tracked quantity {}",
                self.coin, free, held
            );
        }

        let quantity = normalize_quantity(held.min(free), self.filters.step_size);
        let price = normalize_price(
            reference_price * (Decimal::ONE - SLIPPAGE),
            self.filters.tick_size,
        );
        self.check_size(quantity, price)?;
        self.submit(Side::Sell, quantity, price).await
    }

    /// Buys `quote_amount` worth of the coin as a limit IOC slightly above
    /// `reference_price`.
    pub async fn place_entry(
        &mut self,
        quote_amount: Decimal,
        reference_price: Decimal,
    ) -> Result<Fill, ConnectivityError> {
        let price = normalize_price(
            reference_price * (Decimal::ONE + SLIPPAGE),
            self.filters.tick_size,
        );
        if price <= Decimal::ZERO {
            return Err(ConnectivityError::OrderRejected(format!(
                "invalid entry price {}",
                price
            )));
        }
        let quantity = normalize_quantity(quote_amount / price, self.filters.step_size);
        self.check_size(quantity, price)?;
        self.submit(Side::Buy, quantity, price).await
    }

    pub async fn balance(&self, asset: &str) -> Result<Decimal, ConnectivityError> {
        Ok(self.client.get_balance(asset).await?)
    }

    pub async fn price(&self, symbol: &str) -> Result<Decimal, ConnectivityError> {
        Ok(self.client.fetch_price(symbol).await?)
    }

    pub fn close(&mut self) {
        self.ticks = None;
        if self.state.can_transition_to(ConnectionState::Disconnected) {
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn check_size(&self, quantity: Decimal, price: Decimal) -> Result<(), ConnectivityError> {
        if quantity <= Decimal::ZERO {
            return Err(ConnectivityError::OrderRejected(format!(
                "quantity is zero after rounding to step {}",
                self.filters.step_size
            )));
        }
        let notional = quantity * price;
        if notional < self.filters.min_notional {
            return Err(ConnectivityError::OrderRejected(format!(
                "notional {} below minimum {}",
                notional.round_dp(8),
                self.filters.min_notional
            )));
        }
        Ok(())
    }

    async fn submit(
        &mut self,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Fill, ConnectivityError> {
        let request = OrderRequest {
            client_order_id: Uuid::new_v4().simple().to_string(),
            symbol: self.pair.clone(),
            side,
            quantity,
            price: Some(price),
        };
        info!(
            "Placing {} {} {} @ {} (client id {})",
            side.as_str(),
            quantity,
            self.pair,
            price,
            request.client_order_id
        );
        self.notifier.notify(Event::OrderPlaced {
            pair: self.pair.clone(),
            side,
            quantity,
            price,
        });

        match self.client.place_order(&request).await {
            Ok(fill) => Ok(fill),
            Err(e) => self.interrupted(e, Some(&request)).await,
        }
    }

    /// Maps a failed exchange call during order handling. Transport errors
    /// reconnect first; an interrupted order is then looked up by its client
    /// id in case the exchange executed it anyway.
    async fn interrupted(
        &mut self,
        err: ExchangeError,
        request: Option<&OrderRequest>,
    ) -> Result<Fill, ConnectivityError> {
        let transport = match err {
            ExchangeError::Auth(msg) => return Err(ConnectivityError::Auth(msg)),
            ExchangeError::OrderRejected { reason, .. } => {
                return Err(ConnectivityError::OrderRejected(reason))
            }
            other => other,
        };

        warn!("Exchange call failed during order handling: {}", transport);
        self.recover(transport.clone().into()).await?;

        let Some(request) = request else {
            return Err(ConnectivityError::OrderFailed(transport.to_string()));
        };
        match self
            .client
            .query_order(&self.pair, &request.client_order_id)
            .await
        {
            Ok(Some(fill)) => {
                info!(
                    "Order {} executed despite the interruption (exchange id {})",
                    request.client_order_id, fill.order_id
                );
                Ok(fill)
            }
            Ok(None) => Err(ConnectivityError::OrderFailed(format!(
                "{} (order {} not on exchange)",
                transport, request.client_order_id
            ))),
            Err(lookup) => Err(ConnectivityError::OrderFailed(format!(
                "{} (lookup of order {} failed: {})",
                transport, request.client_order_id, lookup
            ))),
        }
    }

    async fn handshake(&mut self) -> Result<(), ConnectivityError> {
        self.ticks = None;
        self.client.connect().await?;
        self.filters = self.client.symbol_filters(&self.pair).await?;
        let (tx, rx) = mpsc::channel(TICK_BUFFER);
        self.client.subscribe_ticker(&self.pair, tx).await?;
        self.ticks = Some(rx);
        Ok(())
    }

    /// One failure episode: report the loss, then reconnect within budget.
    async fn recover(&mut self, cause: ConnectivityError) -> Result<(), ConnectivityError> {
        self.ticks = None;
        if self.state != ConnectionState::Failed {
            self.transition(ConnectionState::Failed);
        }
        self.notifier.notify(Event::ConnectionLost {
            reason: cause.to_string(),
        });
        self.reconnect(cause).await
    }

    async fn reconnect(&mut self, cause: ConnectivityError) -> Result<(), ConnectivityError> {
        if self.policy.limit == 0 {
            error!("Connection lost and retries are disabled: {}", cause);
            return Err(cause);
        }

        let mut last = cause.to_string();
        for attempt in 1..=self.policy.limit {
            let delay = self.policy.delay_for(attempt);
            warn!(
                attempt,
                limit = self.policy.limit,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::time::sleep(delay).await;

            self.transition(ConnectionState::Connecting);
            match self.handshake().await {
                Ok(()) => {
                    self.transition(ConnectionState::Connected);
                    info!("Reconnected to exchange on attempt {}", attempt);
                    self.notifier
                        .notify(Event::ConnectionRestored { attempt });
                    return Ok(());
                }
                Err(e @ ConnectivityError::Auth(_)) => {
                    self.transition(ConnectionState::Failed);
                    error!("Reconnection rejected credentials: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    self.transition(ConnectionState::Failed);
                    warn!(attempt, error = %e, "Reconnection attempt failed");
                    last = e.to_string();
                }
            }
        }

        let attempts = self.policy.limit;
        error!("Giving up after {} reconnection attempts", attempts);
        self.notifier.notify(Event::RetryExhausted { attempts });
        Err(ConnectivityError::RetryExhausted { attempts, last })
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "Unexpected connection state change");
        }
        debug!(from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::mock::{MockExchange, MockHandle, Session};
    use rust_decimal_macros::dec;

    fn manager(retries: u32) -> (ConnectivityManager, MockHandle, mpsc::Receiver<Event>) {
        let mut config = AppConfig::for_tests();
        config.binance_retries = retries;
        let exchange = MockExchange::new();
        let handle = exchange.handle();
        handle.state().filters = SymbolFilters {
            step_size: dec!(0.001),
            tick_size: dec!(0.01),
            min_notional: dec!(5),
        };
        let (notifier, events) = Notifier::channel(64);
        (
            ConnectivityManager::new(Box::new(exchange), &config, notifier),
            handle,
            events,
        )
    }

    fn drain(events: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            out.push(e);
        }
        out
    }

    fn down() -> ExchangeError {
        ExchangeError::Network("connection refused".into())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            limit: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        };
        let delays: Vec<u64> = (1..=7)
            .map(|k| policy.delay_for(k).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(policy.delay_for(200), Duration::from_millis(30_000));
    }

    #[test]
    fn state_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[tokio::test]
    async fn open_connects_and_loads_filters() {
        let (mut mgr, handle, _events) = manager(2);
        handle.push_session(Session::open(vec![dec!(100)]));

        mgr.open().await.unwrap();

        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.filters().step_size, dec!(0.001));
        assert_eq!(mgr.next_tick().await.unwrap().price, dec!(100));
        assert_eq!(handle.connect_calls(), 1);
    }

    #[tokio::test]
    async fn open_with_bad_credentials_never_retries() {
        let (mut mgr, handle, _events) = manager(3);
        handle.fail_connects(vec![Err(ExchangeError::Auth("invalid key".into()))]);

        let err = mgr.open().await.unwrap_err();

        assert!(matches!(err, ConnectivityError::Auth(_)));
        assert_eq!(handle.connect_calls(), 1);
        assert_eq!(mgr.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn ticks_arrive_in_emission_order_without_dedup() {
        let (mut mgr, handle, _events) = manager(0);
        handle.push_session(Session::open(vec![dec!(1), dec!(3), dec!(3), dec!(2)]));
        mgr.open().await.unwrap();

        let mut prices = Vec::new();
        for _ in 0..4 {
            prices.push(mgr.next_tick().await.unwrap().price);
        }
        assert_eq!(prices, vec![dec!(1), dec!(3), dec!(3), dec!(2)]);
        assert!(mgr.try_next_tick().is_none());
    }

    #[tokio::test]
    async fn exhausts_exactly_the_configured_attempts() {
        let (mut mgr, handle, mut events) = manager(2);
        handle.fail_connects(vec![Ok(()), Err(down()), Err(down())]);
        handle.push_session(Session::closing(vec![dec!(100)]));
        mgr.open().await.unwrap();

        assert_eq!(mgr.next_tick().await.unwrap().price, dec!(100));
        let err = mgr.next_tick().await.unwrap_err();

        assert!(matches!(
            err,
            ConnectivityError::RetryExhausted { attempts: 2, .. }
        ));
        assert_eq!(handle.connect_calls(), 3);
        assert_eq!(mgr.state(), ConnectionState::Failed);
        assert_eq!(
            drain(&mut events),
            vec![
                Event::ConnectionLost {
                    reason: "market data stream closed".into()
                },
                Event::RetryExhausted { attempts: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn zero_retries_surfaces_the_failure_immediately() {
        let (mut mgr, handle, mut events) = manager(0);
        handle.push_session(Session::closing(vec![]));
        mgr.open().await.unwrap();

        let err = mgr.next_tick().await.unwrap_err();

        assert_eq!(err, ConnectivityError::StreamClosed);
        assert_eq!(handle.connect_calls(), 1);
        assert_eq!(
            drain(&mut events),
            vec![Event::ConnectionLost {
                reason: "market data stream closed".into()
            }]
        );
    }

    #[tokio::test]
    async fn successful_reconnect_resets_the_budget() {
        let (mut mgr, handle, mut events) = manager(1);
        handle.push_session(Session::closing(vec![dec!(1)]));
        handle.push_session(Session::closing(vec![dec!(2)]));
        handle.push_session(Session::open(vec![dec!(3)]));
        mgr.open().await.unwrap();

        for expected in [dec!(1), dec!(2), dec!(3)] {
            assert_eq!(mgr.next_tick().await.unwrap().price, expected);
        }

        assert_eq!(handle.connect_calls(), 3);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        let restored: Vec<Event> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, Event::ConnectionRestored { .. }))
            .collect();
        assert_eq!(
            restored,
            vec![
                Event::ConnectionRestored { attempt: 1 },
                Event::ConnectionRestored { attempt: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn auth_failure_during_reconnect_stops_retrying() {
        let (mut mgr, handle, _events) = manager(5);
        handle.fail_connects(vec![Ok(()), Err(ExchangeError::Auth("key revoked".into()))]);
        handle.push_session(Session::closing(vec![]));
        mgr.open().await.unwrap();

        let err = mgr.next_tick().await.unwrap_err();

        assert!(matches!(err, ConnectivityError::Auth(_)));
        assert_eq!(handle.connect_calls(), 2);
    }

    #[tokio::test]
    async fn exit_is_capped_by_free_balance_and_priced_below_the_tick() {
        let (mut mgr, handle, _events) = manager(0);
        handle.set_balance("BTC", dec!(0.4999));
        mgr.open().await.unwrap();

        let position = Position::long(dec!(100), dec!(0.5)).unwrap();
        let fill = mgr.place_exit(&position, dec!(110)).await.unwrap();

        let orders = handle.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].quantity, dec!(0.499));
        assert_eq!(orders[0].price, Some(dec!(109.89)));
        assert_eq!(fill.quantity, dec!(0.499));
    }

    #[tokio::test]
    async fn entry_spends_the_quote_amount_above_the_tick() {
        let (mut mgr, handle, _events) = manager(0);
        mgr.open().await.unwrap();

        let fill = mgr.place_entry(dec!(20), dec!(100)).await.unwrap();

        let orders = handle.orders();
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].price, Some(dec!(100.1)));
        assert_eq!(orders[0].quantity, dec!(0.199));
        assert_eq!(fill.side, Side::Buy);
    }

    #[tokio::test]
    async fn below_min_notional_never_reaches_the_exchange() {
        let (mut mgr, handle, _events) = manager(0);
        handle.set_balance("BTC", dec!(1));
        mgr.open().await.unwrap();

        let position = Position::long(dec!(100), dec!(0.04)).unwrap();
        let err = mgr.place_exit(&position, dec!(100)).await.unwrap_err();

        assert!(matches!(err, ConnectivityError::OrderRejected(_)));
        assert!(handle.orders().is_empty());
    }

    #[tokio::test]
    async fn interrupted_order_that_executed_is_reconciled() {
        let (mut mgr, handle, mut events) = manager(2);
        handle.set_balance("BTC", dec!(1));
        let executed = Fill {
            order_id: "8001".into(),
            side: Side::Sell,
            price: dec!(109.9),
            quantity: dec!(0.5),
            commission: Decimal::ZERO,
            commission_asset: None,
            timestamp: 1,
        };
        handle.script_order(Err(ExchangeError::Network("connection reset".into())));
        handle.execute_behind_next_error(executed.clone());
        mgr.open().await.unwrap();

        let position = Position::long(dec!(100), dec!(0.5)).unwrap();
        let fill = mgr.place_exit(&position, dec!(110)).await.unwrap();

        assert_eq!(fill, executed);
        assert_eq!(handle.connect_calls(), 2);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(
            drain(&mut events),
            vec![
                Event::OrderPlaced {
                    pair: "BTCUSDT".into(),
                    side: Side::Sell,
                    quantity: dec!(0.5),
                    price: dec!(109.89),
                },
                Event::ConnectionLost {
                    reason: "network error: connection reset".into()
                },
                Event::ConnectionRestored { attempt: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn interrupted_order_not_on_exchange_fails_after_reconnect() {
        let (mut mgr, handle, _events) = manager(2);
        handle.set_balance("BTC", dec!(1));
        handle.script_order(Err(ExchangeError::Network("timeout".into())));
        mgr.open().await.unwrap();

        let position = Position::long(dec!(100), dec!(0.5)).unwrap();
        let err = mgr.place_exit(&position, dec!(110)).await.unwrap_err();

        assert!(matches!(err, ConnectivityError::OrderFailed(_)));
        assert!(err.is_order_recoverable());
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn interrupted_order_without_retries_is_fatal() {
        let (mut mgr, handle, _events) = manager(0);
        handle.set_balance("BTC", dec!(1));
        handle.script_order(Err(ExchangeError::Network("timeout".into())));
        mgr.open().await.unwrap();

        let position = Position::long(dec!(100), dec!(0.5)).unwrap();
        let err = mgr.place_exit(&position, dec!(110)).await.unwrap_err();

        assert_eq!(err, ConnectivityError::Network("timeout".into()));
        assert!(!err.is_order_recoverable());
    }

    #[tokio::test]
    async fn exchange_rejection_is_recoverable() {
        let (mut mgr, handle, _events) = manager(0);
        handle.set_balance("BTC", dec!(1));
        handle.script_order(Err(ExchangeError::OrderRejected {
            code: Some(-2010),
            reason: "insufficient balance".into(),
        }));
        mgr.open().await.unwrap();

        let position = Position::long(dec!(100), dec!(0.5)).unwrap();
        let err = mgr.place_exit(&position, dec!(110)).await.unwrap_err();

        assert_eq!(
            err,
            ConnectivityError::OrderRejected("insufficient balance".into())
        );
        assert_eq!(handle.connect_calls(), 1);
    }
}
