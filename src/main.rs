// src/main.rs
use crate::config::AppConfig;
use crate::connectors::binance::BinanceClient;
use crate::connectors::paper::PaperClient;
use crate::connectors::traits::ExchangeClient;
use crate::core::connectivity::ConnectivityManager;
use crate::core::engine::TradingEngine;
use crate::notify::{DiscordWebhook, LogSink, NotificationSink, Notifier};
use crate::storage::PositionStore;
use crate::strategies::threshold::ThresholdStrategy;
use crate::tui::UiSink;
use anyhow::Context;
use dotenvy::dotenv;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod connectors;
mod core;
mod error;
mod logging;
mod notify;
mod storage;
mod strategies;
mod tui;
mod types;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // 1. Configuration and logging
    let config = AppConfig::new().context("invalid configuration")?;
    let _log_guard = logging::init(&config.log_dir, !config.tui)
        .with_context(|| format!("cannot create log dir {}", config.log_dir.display()))?;
    let pair = config.pair();

    if !config.tui {
        println!("========================================");
        println!("       THRESHOLD TRADER - v0.1.0");
        println!("========================================");
        println!("Pair:   {}", pair);
        println!(
            "Mode:   {}",
            if config.live_trading {
                "LIVE TRADING"
            } else {
                "PAPER TRADING"
            }
        );
        println!("Exit:   +{}% / -{}%", config.min_profit, config.max_loss);
        println!("========================================");
    }
    info!("Configuration loaded: {:?}", config.credentials());

    // 2. Exchange binding
    let store = config.state_file.clone().map(PositionStore::new);
    let binance = BinanceClient::new(config.credentials(), config.binance_tld);
    let client: Box<dyn ExchangeClient> = if config.live_trading {
        warn!("Live trading enabled, orders will hit the exchange");
        Box::new(binance)
    } else {
        let mut paper = PaperClient::new(
            binance,
            &config.coin_symbol,
            &config.fiat_symbol,
            config.paper_balance,
        );
        // A restored position needs coin behind it to be sellable.
        // A bad file is reported by the engine, which halts with a notice.
        if let Some(store) = &store {
            match store.load().await {
                Ok(Some(state)) => {
                    if let Some(quantity) = state.position.quantity() {
                        paper = paper.with_balance(&config.coin_symbol, quantity);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Cannot seed paper balance from state file: {}", e),
            }
        }
        Box::new(paper)
    };

    // 3. Notifications and dashboard feed
    let (ui_tx, ui_rx) = if config.tui {
        let (tx, rx) = mpsc::channel(256);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(LogSink)];
    if let Some(url) = &config.discord_webhook_url {
        sinks.push(Box::new(DiscordWebhook::new(url.clone())?));
    }
    if let Some(tx) = &ui_tx {
        sinks.push(Box::new(UiSink::new(tx.clone())));
    }
    let (notifier, dispatcher) = Notifier::spawn(sinks, 256);

    // 4. Engine
    let connectivity = ConnectivityManager::new(client, &config, notifier.clone());
    let strategy = ThresholdStrategy::new(config.min_profit, config.max_loss);
    let mut engine = TradingEngine::new(config, connectivity, strategy, notifier);
    if let Some(store) = store {
        engine = engine.with_store(store);
    }
    if let Some(tx) = ui_tx {
        engine = engine.with_ui(tx);
    }

    // 5. Shutdown wiring
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            signal_token.cancel();
        }
    });

    let tui_task = ui_rx.map(|rx| tokio::spawn(tui::run(rx, pair, cancel.clone())));

    let result = engine.run(cancel.clone()).await;
    cancel.cancel();

    if let Some(task) = tui_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Dashboard error: {}", e),
            Err(e) => error!("Dashboard task failed: {}", e),
        }
    }

    info!(
        "Final position {}, realized P&L {}",
        engine.position(),
        engine.realized_pnl().round_dp(8)
    );
    // Dropping the engine releases the last notifier handles.
    drop(engine);
    if tokio::time::timeout(Duration::from_secs(5), dispatcher)
        .await
        .is_err()
    {
        warn!("Timed out delivering pending notifications");
    }

    result.map_err(Into::into)
}
