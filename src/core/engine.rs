// src/core/engine.rs
use crate::config::AppConfig;
use crate::core::connectivity::ConnectivityManager;
use crate::core::position::PositionTracker;
use crate::error::EngineError;
use crate::notify::Notifier;
use crate::storage::PositionStore;
use crate::strategies::traits::Strategy;
use crate::types::{Action, Decision, Event, Fill, Position, PriceTick, Side, UiEvent};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct TradingEngine<S> {
    config: AppConfig,
    connectivity: ConnectivityManager,
    tracker: PositionTracker,
    strategy: S,
    notifier: Notifier,
    ui_sender: Option<mpsc::Sender<UiEvent>>,
    store: Option<PositionStore>,
    /// Exit being worked on. Announcements go out once per breach, not on
    /// every retry tick.
    pending_exit: Option<PendingExit>,
}

#[derive(Debug, Clone, Copy)]
struct PendingExit {
    action: Action,
    failures: u32,
}

impl<S> TradingEngine<S>
where
    S: Strategy,
{
    pub fn new(
        config: AppConfig,
        connectivity: ConnectivityManager,
        strategy: S,
        notifier: Notifier,
    ) -> Self {
        let tracker = PositionTracker::new(config.coin_symbol.to_uppercase(), Decimal::ZERO);
        Self {
            config,
            connectivity,
            tracker,
            strategy,
            notifier,
            ui_sender: None,
            store: None,
            pending_exit: None,
        }
    }

    pub fn with_store(mut self, store: PositionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ui(mut self, ui_sender: mpsc::Sender<UiEvent>) -> Self {
        self.ui_sender = Some(ui_sender);
        self
    }

    pub fn position(&self) -> Position {
        self.tracker.current()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.tracker.realized_pnl()
    }

    /// Runs until cancelled (`Ok`) or until a fatal error. Either way a
    /// `TradingHalted` notification goes out last.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), EngineError> {
        let result = self.run_inner(&cancel).await;
        let reason = match &result {
            Ok(()) => {
                info!("Engine stopped");
                "stopped".to_string()
            }
            Err(e) => {
                error!("Engine halted: {}", e);
                e.to_string()
            }
        };
        self.notifier.notify(Event::TradingHalted { reason });
        self.connectivity.close();
        result
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        info!(
            "Engine starting: {} on {} ({})",
            self.strategy.name(),
            self.connectivity.pair(),
            if self.config.live_trading { "live" } else { "paper" }
        );

        tokio::select! {
            opened = self.connectivity.open() => opened?,
            _ = cancel.cancelled() => return Ok(()),
        }
        self.tracker
            .set_dust_threshold(self.connectivity.filters().step_size);
        self.restore().await?;
        self.report_start().await;

        loop {
            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                tick = self.connectivity.next_tick() => tick?,
            };
            let tick = self.coalesce(tick);
            self.on_tick(&tick).await?;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.sleep_duration()) => {}
            }
        }
    }

    /// Skips ticks that piled up during the sleep; only the newest matters.
    fn coalesce(&mut self, mut tick: PriceTick) -> PriceTick {
        let mut skipped = 0usize;
        while let Some(newer) = self.connectivity.try_next_tick() {
            tick = newer;
            skipped += 1;
        }
        if skipped > 0 {
            debug!("Skipped {} stale ticks", skipped);
        }
        tick
    }

    async fn on_tick(&mut self, tick: &PriceTick) -> Result<(), EngineError> {
        self.send_ui_event(UiEvent::TickerUpdate(tick.clone()));

        let position = self.tracker.current();
        if position.is_flat() && self.config.auto_enter {
            return self.enter(tick).await;
        }

        let decision = self.strategy.on_tick(tick, &position);
        self.send_ui_event(UiEvent::Decision(decision));

        match decision.percent_change {
            Some(pct) => debug!(
                "{} at {} ({:+}% from entry, unrealized {})",
                tick.pair,
                tick.price,
                pct.round_dp(4),
                self.tracker
                    .unrealized_pnl(tick.price)
                    .unwrap_or_default()
                    .round_dp(8)
            ),
            None => debug!("{} at {} (flat)", tick.pair, tick.price),
        }

        if decision.action.is_exit() {
            self.exit(tick, &position, &decision).await?;
        } else {
            self.pending_exit = None;
        }
        Ok(())
    }

    async fn exit(
        &mut self,
        tick: &PriceTick,
        position: &Position,
        decision: &Decision,
    ) -> Result<(), EngineError> {
        let entry_price = position.entry_price().unwrap_or_default();
        let percent_change = decision.percent_change.unwrap_or_default();
        info!(
            "{:?} on {}: price {} vs entry {} ({:+}%)",
            decision.action,
            tick.pair,
            tick.price,
            entry_price,
            percent_change.round_dp(4)
        );
        let announced = matches!(
            self.pending_exit,
            Some(PendingExit { action, .. }) if action == decision.action
        );
        if !announced {
            self.pending_exit = Some(PendingExit {
                action: decision.action,
                failures: 0,
            });
            self.notifier.notify(Event::ThresholdBreached {
                pair: tick.pair.clone(),
                action: decision.action,
                price: tick.price,
                entry_price,
                percent_change,
            });
        }

        match self.connectivity.place_exit(position, tick.price).await {
            Ok(fill) => {
                self.pending_exit = None;
                self.apply(fill).await
            }
            Err(e) if e.is_order_recoverable() => {
                let failures = match self.pending_exit.as_mut() {
                    Some(pending) => {
                        pending.failures += 1;
                        pending.failures
                    }
                    None => 1,
                };
                if failures == 1 {
                    self.order_failed(Side::Sell, e.to_string());
                } else {
                    warn!(
                        "Exit on {} still failing after {} attempts: {}",
                        tick.pair, failures, e
                    );
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enter(&mut self, tick: &PriceTick) -> Result<(), EngineError> {
        info!(
            "Flat on {}, entering with {} {}",
            tick.pair, self.config.order_size, self.config.fiat_symbol
        );
        match self
            .connectivity
            .place_entry(self.config.order_size, tick.price)
            .await
        {
            Ok(fill) => self.apply(fill).await,
            Err(e) if e.is_order_recoverable() => {
                self.order_failed(Side::Buy, e.to_string());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(&mut self, fill: Fill) -> Result<(), EngineError> {
        let realized_before = self.tracker.realized_pnl();
        let position = self.tracker.on_fill_confirmed(&fill)?;
        let realized_pnl = self.tracker.realized_pnl() - realized_before;

        info!(
            "Filled {} {} @ {} (order {}), now {}",
            fill.side.as_str(),
            fill.quantity,
            fill.price,
            fill.order_id,
            position
        );
        self.notifier.notify(Event::OrderFilled {
            pair: self.connectivity.pair().to_string(),
            fill,
            realized_pnl,
        });
        self.send_ui_event(UiEvent::Position(position));

        if let Some(store) = &self.store {
            store.save(&position).await?;
        }
        Ok(())
    }

    fn order_failed(&self, side: Side, reason: String) {
        warn!("{} order on {} failed: {}", side.as_str(), self.connectivity.pair(), reason);
        self.notifier.notify(Event::OrderFailed {
            pair: self.connectivity.pair().to_string(),
            side,
            reason,
        });
    }

    async fn restore(&mut self) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            if let Some(state) = store.load().await? {
                self.tracker.restore(state.position);
            }
        }
        Ok(())
    }

    /// Logs and announces the held balances and their total in `repr_coin`.
    /// Balance lookups here are informational, so failures only warn.
    async fn report_start(&mut self) {
        let fiat = self.config.fiat_symbol.to_uppercase();
        let coin = self.config.coin_symbol.to_uppercase();
        let repr = self.config.repr_coin.to_uppercase();

        let mut balances = Vec::new();
        for asset in [&fiat, &coin] {
            match self.connectivity.balance(asset).await {
                Ok(amount) => balances.push((asset.clone(), amount)),
                Err(e) => warn!("Could not read {} balance: {}", asset, e),
            }
        }

        let mut collated = Some(Decimal::ZERO);
        for (asset, amount) in &balances {
            let value = if *asset == repr {
                Some(*amount)
            } else if amount.is_zero() {
                Some(Decimal::ZERO)
            } else {
                match self.connectivity.price(&format!("{}{}", asset, repr)).await {
                    Ok(price) => Some(price * amount),
                    Err(e) => {
                        warn!("Could not value {} in {}: {}", asset, repr, e);
                        None
                    }
                }
            };
            collated = collated.zip(value).map(|(total, v)| total + v);
        }
        if balances.is_empty() {
            collated = None;
        }

        let position = self.tracker.current();
        for (asset, amount) in &balances {
            info!("Holding {} {}", amount.round_dp(8), asset);
        }
        if let Some(total) = collated {
            info!("Collated balance: {} {}", total.round_dp(8), repr);
        }

        self.notifier.notify(Event::TradingStarted {
            pair: self.connectivity.pair().to_string(),
            live: self.config.live_trading,
            position,
            balances,
            collated: collated.map(|total| (repr, total)),
        });
        self.send_ui_event(UiEvent::Position(position));
    }

    fn send_ui_event(&self, event: UiEvent) {
        let Some(sender) = &self.ui_sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("UI channel closed");
            }
        }
    }
}
