// src/connectors/mock.rs
//! Scripted exchange for tests. Every knob lives behind a shared handle so a
//! test can keep steering it after the client has been moved into a manager.

use crate::connectors::traits::{ExchangeClient, ExchangeResult};
use crate::error::ExchangeError;
use crate::types::{Fill, OrderRequest, PriceTick, SymbolFilters};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

/// Ticks delivered by one subscription. With `keep_open = false` the stream
/// closes right after the last tick.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub ticks: Vec<Decimal>,
    pub keep_open: bool,
}

impl Session {
    pub fn closing(ticks: Vec<Decimal>) -> Self {
        Self {
            ticks,
            keep_open: false,
        }
    }

    pub fn open(ticks: Vec<Decimal>) -> Self {
        Self {
            ticks,
            keep_open: true,
        }
    }
}

const PENDING: &str = "*";

#[derive(Default)]
pub struct MockState {
    pub connect_results: VecDeque<ExchangeResult<()>>,
    pub subscribe_results: VecDeque<ExchangeResult<()>>,
    pub sessions: VecDeque<Session>,
    pub order_results: VecDeque<ExchangeResult<Fill>>,
    /// Client order ids the exchange "saw" even though the call failed.
    pub executed_behind_error: HashMap<String, Fill>,
    pub balances: HashMap<String, Decimal>,
    pub prices: HashMap<String, Decimal>,
    pub filters: SymbolFilters,
    pub connect_calls: u32,
    pub subscribe_calls: u32,
    pub orders: Vec<OrderRequest>,
    pub live_sender: Option<mpsc::Sender<PriceTick>>,
    /// When set, orders are recorded but only answered once the gate is
    /// released.
    pub order_gate: Option<Arc<Notify>>,
    next_order_id: u64,
}

#[derive(Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub fn connect_calls(&self) -> u32 {
        self.state().connect_calls
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.state().orders.clone()
    }

    pub fn push_session(&self, session: Session) {
        self.state().sessions.push_back(session);
    }

    pub fn fail_connects(&self, results: Vec<ExchangeResult<()>>) {
        self.state().connect_results.extend(results);
    }

    pub fn script_order(&self, result: ExchangeResult<Fill>) {
        self.state().order_results.push_back(result);
    }

    /// The next order that fails with a network error has in fact executed
    /// as `fill`; a later `query_order` will find it.
    pub fn execute_behind_next_error(&self, fill: Fill) {
        self.state().executed_behind_error.insert(PENDING.into(), fill);
    }

    /// Holds every following order in flight until the returned gate is
    /// notified, once per order.
    pub fn hold_orders(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().order_gate = Some(gate.clone());
        gate
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.state().balances.insert(asset.to_string(), amount);
    }

    /// Sends a tick on the currently open stream.
    pub fn push_tick(&self, price: Decimal) {
        if let Some(tx) = self.state().live_sender.as_ref() {
            let _ = tx.try_send(tick(price));
        }
    }
}

pub fn tick(price: Decimal) -> PriceTick {
    PriceTick {
        pair: "BTCUSDT".into(),
        price,
        timestamp: 0,
    }
}

pub struct MockExchange {
    handle: MockHandle,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            handle: MockHandle::default(),
        }
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn connect(&mut self) -> ExchangeResult<()> {
        let mut st = self.handle.state();
        st.connect_calls += 1;
        st.connect_results.pop_front().unwrap_or(Ok(()))
    }

    async fn subscribe_ticker(
        &mut self,
        _symbol: &str,
        sender: mpsc::Sender<PriceTick>,
    ) -> ExchangeResult<()> {
        let mut st = self.handle.state();
        st.subscribe_calls += 1;
        if let Some(Err(e)) = st.subscribe_results.pop_front() {
            return Err(e);
        }
        let session = st.sessions.pop_front().unwrap_or_else(|| Session::open(vec![]));
        for price in session.ticks {
            let _ = sender.try_send(tick(price));
        }
        st.live_sender = if session.keep_open {
            Some(sender)
        } else {
            None
        };
        Ok(())
    }

    async fn fetch_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.handle
            .state()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Decode(format!("no price for {}", symbol)))
    }

    async fn get_balance(&self, asset: &str) -> ExchangeResult<Decimal> {
        Ok(self
            .handle
            .state()
            .balances
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn symbol_filters(&self, _symbol: &str) -> ExchangeResult<SymbolFilters> {
        Ok(self.handle.state().filters)
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Fill> {
        let gate = {
            let mut st = self.handle.state();
            st.orders.push(request.clone());
            st.order_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut st = self.handle.state();
        st.next_order_id += 1;
        let id = st.next_order_id;
        match st.order_results.pop_front() {
            Some(result) => {
                if let Err(ExchangeError::Network(_)) = &result {
                    if let Some(fill) = st.executed_behind_error.remove(PENDING) {
                        st.executed_behind_error
                            .insert(request.client_order_id.clone(), fill);
                    }
                }
                result
            }
            None => Ok(Fill {
                order_id: format!("mock-{}", id),
                side: request.side,
                price: request.price.unwrap_or(Decimal::ONE),
                quantity: request.quantity,
                commission: Decimal::ZERO,
                commission_asset: None,
                timestamp: 0,
            }),
        }
    }

    async fn query_order(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<Fill>> {
        Ok(self
            .handle
            .state()
            .executed_behind_error
            .get(client_order_id)
            .cloned())
    }
}
