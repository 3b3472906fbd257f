// =============================================================================
// Notifier — per-channel signal fan-out with individual ok/err results
// =============================================================================
//
// Channels are read from the strategy's notification_config JSON:
//   { "telegram": {"enabled": true, "bot_token": "..", "chat_id": ".."},
//     "browser":  {"enabled": true} }
//
// The browser channel persists a row for the dashboard panel; telegram
// goes out over HTTP. Each channel reports its own outcome so the worker
// can mark an order `sent` as soon as any channel succeeds.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::store::Store;

/// Outcome of one channel delivery.
#[derive(Debug, Clone, Default)]
pub struct ChannelResult {
    pub ok: bool,
    pub error: Option<String>,
}

impl ChannelResult {
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// A signal event to broadcast.
#[derive(Debug, Clone)]
pub struct SignalNote {
    pub strategy_id: i64,
    pub strategy_name: String,
    pub symbol: String,
    pub signal_type: String,
    pub price: f64,
    pub amount: f64,
    pub direction: String,
    pub extra: Value,
}

/// Capability for notification fan-out.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `note` on every enabled channel; the map carries one entry
    /// per attempted channel.
    async fn notify(&self, note: &SignalNote, config: &Value) -> HashMap<String, ChannelResult>;
}

/// The bundled notifier: telegram + persisted browser rows.
pub struct SignalNotifier {
    store: Store,
    http: reqwest::Client,
    telegram_api_base: String,
}

impl SignalNotifier {
    pub fn new(store: Store) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            store,
            http,
            telegram_api_base: "https://api.telegram.org".to_string(),
        }
    }

    fn channel_enabled(config: &Value, channel: &str) -> bool {
        config
            .get(channel)
            .and_then(|c| c.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn format_message(note: &SignalNote) -> String {
        format!(
            "[{}] {} {} {} @ {:.8} amount {:.8}",
            note.strategy_name, note.symbol, note.direction, note.signal_type, note.price,
            note.amount
        )
    }

    async fn send_telegram(&self, note: &SignalNote, config: &Value) -> ChannelResult {
        let tg = &config["telegram"];
        let bot_token = tg["bot_token"].as_str().unwrap_or("");
        let chat_id = tg["chat_id"].as_str().unwrap_or("");
        if bot_token.is_empty() || chat_id.is_empty() {
            return ChannelResult::failure("telegram config missing bot_token/chat_id");
        }

        let url = format!("{}/bot{}/sendMessage", self.telegram_api_base, bot_token);
        let body = json!({
            "chat_id": chat_id,
            "text": Self::format_message(note),
        });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => ChannelResult::success(),
            Ok(resp) => ChannelResult::failure(format!("telegram http {}", resp.status())),
            Err(e) => ChannelResult::failure(format!("telegram send failed: {e}")),
        }
    }

    async fn send_browser(&self, note: &SignalNote) -> ChannelResult {
        let title = format!("{} | {}", note.signal_type, note.symbol);
        let payload = json!({
            "strategy_id": note.strategy_id,
            "strategy_name": note.strategy_name,
            "symbol": note.symbol,
            "signal_type": note.signal_type,
            "price": note.price,
            "amount": note.amount,
            "direction": note.direction,
            "extra": note.extra,
        });
        match self
            .store
            .insert_notification(
                note.strategy_id,
                &note.symbol,
                &note.signal_type,
                "browser",
                &title,
                &Self::format_message(note),
                &payload,
            )
            .await
        {
            Ok(_) => ChannelResult::success(),
            Err(e) => ChannelResult::failure(format!("browser persist failed: {e}")),
        }
    }
}

#[async_trait]
impl Notifier for SignalNotifier {
    async fn notify(&self, note: &SignalNote, config: &Value) -> HashMap<String, ChannelResult> {
        let mut results = HashMap::new();

        if Self::channel_enabled(config, "telegram") {
            let res = self.send_telegram(note, config).await;
            if !res.ok {
                warn!(strategy_id = note.strategy_id, error = ?res.error, "telegram channel failed");
            }
            results.insert("telegram".to_string(), res);
        }
        if Self::channel_enabled(config, "browser") {
            let res = self.send_browser(note).await;
            if !res.ok {
                warn!(strategy_id = note.strategy_id, error = ?res.error, "browser channel failed");
            }
            results.insert("browser".to_string(), res);
        }

        debug!(
            strategy_id = note.strategy_id,
            signal = %note.signal_type,
            channels = results.len(),
            "notification dispatched"
        );
        results
    }
}
