// src/connectors/binance.rs
use crate::config::{Credentials, Tld};
use crate::connectors::messages::{
    BinanceAccountInfo, BinanceApiError, BinanceExchangeInfo, BinanceOrderResponse,
    BinanceQueriedOrder, BinanceSymbolFilter, BinanceTickerPrice, BinanceTradeEvent,
};
use crate::connectors::traits::{ExchangeClient, ExchangeResult};
use crate::error::ExchangeError;
use crate::types::{Fill, OrderRequest, PriceTick, Side, SymbolFilters};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// Binance pings every 3 minutes; silence longer than this means the socket is dead.
const READ_TIMEOUT: Duration = Duration::from_secs(240);
const RECV_WINDOW_MS: &str = "5000";

pub struct BinanceClient {
    credentials: Credentials,
    http_client: Client,
    base_rest_url: String,
    base_ws_url: String,
}

impl BinanceClient {
    pub fn new(credentials: Credentials, tld: Tld) -> Self {
        Self::with_base_urls(
            credentials,
            format!("https://api.binance.{}", tld.as_str()),
            format!("wss://stream.binance.{}:9443/ws", tld.as_str()),
        )
    }

    pub fn with_base_urls(credentials: Credentials, rest: String, ws: String) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            credentials,
            http_client,
            base_rest_url: rest,
            base_ws_url: ws,
        }
    }

    fn sign_and_build_query(&self, params: Vec<(&str, String)>) -> ExchangeResult<String> {
        let mut params = params;
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query_string = serde_urlencoded::to_string(&params)
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|_| ExchangeError::Auth("invalid secret key length".into()))?;
        mac.update(query_string.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}&signature={}", query_string, signature))
    }

    async fn send_signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        if self.credentials.is_empty() {
            return Err(ExchangeError::Auth("missing API credentials".into()));
        }
        let full_query = self.sign_and_build_query(params)?;
        let url = format!("{}{}?{}", self.base_rest_url, endpoint, full_query);

        let response = self
            .http_client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await?;

        decode_response(response).await
    }

    async fn send_public_request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> ExchangeResult<T> {
        let url = format!("{}{}", self.base_rest_url, endpoint);
        let response = self.http_client.get(&url).query(params).send().await?;
        decode_response(response).await
    }
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> ExchangeResult<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let api_error = serde_json::from_str::<BinanceApiError>(&body).ok();
        return Err(classify_error(status, api_error));
    }

    Ok(serde_json::from_str::<T>(&body)?)
}

/// Maps an HTTP failure onto the connectivity taxonomy.
pub fn classify_error(status: StatusCode, api_error: Option<BinanceApiError>) -> ExchangeError {
    let (code, msg) = match api_error {
        Some(e) => (Some(e.code), e.msg),
        None => (None, status.to_string()),
    };

    // -1022 bad signature, -2014 bad key format, -2015 invalid key/IP/permissions.
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        || matches!(code, Some(-1022) | Some(-2014) | Some(-2015))
    {
        return ExchangeError::Auth(msg);
    }

    // 429/418 are rate-limit bans; the server side is fine to retry later.
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
    {
        return ExchangeError::Network(format!("{}: {}", status, msg));
    }

    ExchangeError::OrderRejected { code, reason: msg }
}

/// Turns a FULL order response into a fill, or a rejection when nothing
/// executed.
pub fn fill_from_response(side: Side, resp: BinanceOrderResponse) -> ExchangeResult<Fill> {
    if resp.executed_qty <= Decimal::ZERO {
        return Err(ExchangeError::OrderRejected {
            code: None,
            reason: format!("order {} {} without execution", resp.order_id, resp.status),
        });
    }

    let price = resp.cummulative_quote_qty / resp.executed_qty;
    let commission_asset = resp.fills.first().map(|f| f.commission_asset.clone());
    let commission = resp
        .fills
        .iter()
        .filter(|f| Some(&f.commission_asset) == commission_asset.as_ref())
        .map(|f| f.commission)
        .sum();

    Ok(Fill {
        order_id: resp.order_id.to_string(),
        side,
        price,
        quantity: resp.executed_qty,
        commission,
        commission_asset,
        timestamp: resp.transact_time,
    })
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn connect(&mut self) -> ExchangeResult<()> {
        let _: serde_json::Value = self.send_public_request("/api/v3/ping", &[]).await?;

        if self.credentials.is_empty() {
            warn!("No API credentials configured, market data only");
            return Ok(());
        }

        // Reachable but refusing a signed call means the keys are wrong.
        match self
            .send_signed_request::<BinanceAccountInfo>(Method::GET, "/api/v3/account", vec![])
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::OrderRejected { reason, .. }) => Err(ExchangeError::Auth(format!(
                "couldn't access Binance API, keys may be wrong or lack permissions: {}",
                reason
            ))),
            Err(e) => Err(e),
        }
    }

    async fn subscribe_ticker(
        &mut self,
        symbol: &str,
        sender: mpsc::Sender<PriceTick>,
    ) -> ExchangeResult<()> {
        let ws_url = format!("{}/{}@trade", self.base_ws_url, symbol.to_lowercase());
        let url = Url::parse(&ws_url).map_err(|e| ExchangeError::Network(e.to_string()))?;

        let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ExchangeError::Network("websocket connect timeout".into())),
        };
        info!("WebSocket connected for {}", symbol);

        let symbol = symbol.to_uppercase();
        tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();

            loop {
                let next = tokio::select! {
                    _ = sender.closed() => {
                        debug!("Tick receiver dropped, closing stream for {}", symbol);
                        break;
                    }
                    next = timeout(READ_TIMEOUT, read.next()) => next,
                };

                let message = match next {
                    Ok(Some(Ok(m))) => m,
                    Ok(Some(Err(e))) => {
                        error!("WebSocket error for {}: {}", symbol, e);
                        break;
                    }
                    Ok(None) => {
                        warn!("WebSocket stream ended for {}", symbol);
                        break;
                    }
                    Err(_) => {
                        warn!("WebSocket silent for {:?} on {}", READ_TIMEOUT, symbol);
                        break;
                    }
                };

                match message {
                    Message::Text(text) => {
                        let trade = match serde_json::from_str::<BinanceTradeEvent>(&text) {
                            Ok(t) => t,
                            Err(e) => {
                                debug!("Skipping non-trade message: {}", e);
                                continue;
                            }
                        };
                        if trade.event_type != "trade" || trade.price <= Decimal::ZERO {
                            continue;
                        }
                        let tick = PriceTick {
                            pair: trade.symbol,
                            price: trade.price,
                            timestamp: trade.trade_time,
                        };
                        if sender.send(tick).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(data) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!("Failed to answer ping for {}: {}", symbol, e);
                            break;
                        }
                    }
                    Message::Close(frame) => {
                        info!("WebSocket closed by server for {}: {:?}", symbol, frame);
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping `sender` here is what tells the manager the stream is gone.
            info!("WebSocket task finished for {}", symbol);
        });

        Ok(())
    }

    async fn fetch_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let ticker: BinanceTickerPrice = self
            .send_public_request("/api/v3/ticker/price", &[("symbol", symbol)])
            .await?;
        debug!("Ticker price {} = {}", ticker.symbol, ticker.price);
        Ok(ticker.price)
    }

    async fn get_balance(&self, asset: &str) -> ExchangeResult<Decimal> {
        let resp: BinanceAccountInfo = self
            .send_signed_request(Method::GET, "/api/v3/account", vec![])
            .await?;

        Ok(resp
            .balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        let info: BinanceExchangeInfo = self
            .send_public_request("/api/v3/exchangeInfo", &[("symbol", symbol)])
            .await?;

        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| ExchangeError::Decode(format!("symbol {} not listed", symbol)))?;

        let mut filters = SymbolFilters::default();
        for f in symbol_info.filters {
            match f {
                BinanceSymbolFilter::LotSize { step_size } => filters.step_size = step_size,
                BinanceSymbolFilter::PriceFilter { tick_size } => filters.tick_size = tick_size,
                BinanceSymbolFilter::Notional { min_notional }
                | BinanceSymbolFilter::MinNotional { min_notional } => {
                    filters.min_notional = min_notional
                }
                BinanceSymbolFilter::Other => {}
            }
        }
        Ok(filters)
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Fill> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("quantity", request.quantity.normalize().to_string()),
            ("newOrderRespType", "FULL".to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];

        // LIMIT IOC fills what it can at the protected price and cancels the
        // rest, so the order never rests on the book.
        match request.price {
            Some(p) => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "IOC".to_string()));
                params.push(("price", p.normalize().to_string()));
            }
            None => {
                warn!("Sending MARKET order without price protection");
                params.push(("type", "MARKET".to_string()));
            }
        }

        info!(
            "Sending order {}: {} {} {} @ {:?}",
            request.client_order_id,
            request.side.as_str(),
            request.quantity,
            request.symbol,
            request.price
        );

        let resp: BinanceOrderResponse = self
            .send_signed_request(Method::POST, "/api/v3/order", params)
            .await?;
        debug!("Order response: {:?}", resp);

        fill_from_response(request.side, resp)
    }

    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<Fill>> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];

        let order: BinanceQueriedOrder = match self
            .send_signed_request(Method::GET, "/api/v3/order", params)
            .await
        {
            Ok(o) => o,
            // -2013: Order does not exist.
            Err(ExchangeError::OrderRejected {
                code: Some(-2013), ..
            }) => return Ok(None),
            Err(e) => return Err(e),
        };
        debug!("Queried order {}: {:?}", client_order_id, order);

        if order.executed_qty <= Decimal::ZERO {
            return Ok(None);
        }
        let side = if order.side.eq_ignore_ascii_case("BUY") {
            Side::Buy
        } else {
            Side::Sell
        };

        // The query endpoint carries no commission breakdown.
        Ok(Some(Fill {
            order_id: order.order_id.to_string(),
            side,
            price: order.cummulative_quote_qty / order.executed_qty,
            quantity: order.executed_qty,
            commission: Decimal::ZERO,
            commission_asset: None,
            timestamp: order.update_time,
        }))
    }
}
