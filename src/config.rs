// src/config.rs

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tld {
    Com,
    Us,
}

impl Tld {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tld::Com => "com",
            Tld::Us => "us",
        }
    }
}

/// API key pair. Only the exchange binding reads it.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() || self.api_secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .finish()
    }
}

fn mask(key: &str) -> String {
    if key.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("{}***", key.chars().take(4).collect::<String>())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub binance_api_key: String,
    #[serde(default)]
    pub binance_api_secret: String,
    pub binance_tld: Tld,
    /// Reconnection budget per failure episode. 0 disables automatic retry.
    pub binance_retries: u32,
    pub fiat_symbol: String,
    pub coin_symbol: String,
    pub repr_coin: String,
    /// Seconds between evaluation cycles.
    pub sleep_time: f64,
    /// Percent.
    pub min_profit: Decimal,
    /// Percent.
    pub max_loss: Decimal,
    pub discord_webhook_url: Option<String>,
    pub live_trading: bool,
    pub auto_enter: bool,
    /// Quote amount spent on an automatic entry.
    pub order_size: Decimal,
    pub paper_balance: Decimal,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub state_file: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub tui: bool,
}

impl AppConfig {
    /// Defaults, then `trader.*` (any format the config crate knows), then
    /// `TRADER_*` environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(Some("trader"))
    }

    pub fn load(file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("binance_tld", "com")?
            .set_default("binance_retries", 0)?
            .set_default("fiat_symbol", "USDT")?
            .set_default("coin_symbol", "BTC")?
            .set_default("repr_coin", "USDT")?
            .set_default("sleep_time", 1.0)?
            .set_default("min_profit", "0.2")?
            .set_default("max_loss", "5.0")?
            .set_default("live_trading", false)?
            .set_default("auto_enter", false)?
            .set_default("order_size", "20")?
            .set_default("paper_balance", "1000")?
            .set_default("reconnect_base_delay_ms", 1000)?
            .set_default("reconnect_max_delay_ms", 30000)?
            .set_default("log_dir", ".logs")?
            .set_default("tui", false)?;

        if let Some(name) = file {
            builder = builder.add_source(File::with_name(name).required(false));
        }

        let config = builder
            .add_source(Environment::with_prefix("TRADER").try_parsing(true))
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Message(msg.to_string()))
        };

        if self.fiat_symbol.trim().is_empty() || self.coin_symbol.trim().is_empty() {
            return fail("fiat_symbol and coin_symbol must not be empty");
        }
        if self.fiat_symbol.eq_ignore_ascii_case(&self.coin_symbol) {
            return fail("fiat_symbol and coin_symbol must differ");
        }
        if self.repr_coin.trim().is_empty() {
            return fail("repr_coin must not be empty");
        }
        if !(self.sleep_time.is_finite() && self.sleep_time > 0.0) {
            return fail("sleep_time must be a positive number of seconds");
        }
        if self.min_profit <= Decimal::ZERO {
            return fail("min_profit must be a positive percentage");
        }
        if self.max_loss <= Decimal::ZERO {
            return fail("max_loss must be a positive percentage");
        }
        if self.auto_enter && self.order_size <= Decimal::ZERO {
            return fail("order_size must be positive when auto_enter is on");
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return fail("reconnect_base_delay_ms must not exceed reconnect_max_delay_ms");
        }
        if self.live_trading && self.credentials().is_empty() {
            return fail("live trading requires binance_api_key and binance_api_secret");
        }
        Ok(())
    }

    /// Exchange symbol, e.g. `BTCUSDT`.
    pub fn pair(&self) -> String {
        format!(
            "{}{}",
            self.coin_symbol.to_uppercase(),
            self.fiat_symbol.to_uppercase()
        )
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.binance_api_key.clone(),
            api_secret: self.binance_api_secret.clone(),
        }
    }

    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs_f64(self.sleep_time)
    }
}

#[cfg(test)]
impl AppConfig {
    pub fn for_tests() -> Self {
        use rust_decimal_macros::dec;
        Self {
            binance_api_key: String::new(),
            binance_api_secret: String::new(),
            binance_tld: Tld::Com,
            binance_retries: 2,
            fiat_symbol: "USDT".into(),
            coin_symbol: "BTC".into(),
            repr_coin: "USDT".into(),
            sleep_time: 0.001,
            min_profit: dec!(0.2),
            max_loss: dec!(5.0),
            discord_webhook_url: None,
            live_trading: false,
            auto_enter: false,
            order_size: dec!(20),
            paper_balance: dec!(1000),
            reconnect_base_delay_ms: 1,
            reconnect_max_delay_ms: 4,
            state_file: None,
            log_dir: PathBuf::from(".logs"),
            tui: false,
        }
    }
}
