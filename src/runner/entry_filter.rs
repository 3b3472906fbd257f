// =============================================================================
// AI entry filter — optional gate in front of open_* signals
// =============================================================================
//
// When enabled in ai_model_config, every open signal is checked against an
// external analysis service. BUY permits open_long, SELL permits
// open_short, HOLD and direction mismatches reject. Rejections never stop
// the runner; they persist a browser notification and skip the order.
// =============================================================================

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::types::SignalType;

/// Why an entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRejectReason {
    AiHold,
    DirectionMismatch,
    AnalysisError,
    MissingAiDecision,
}

impl EntryRejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiHold => "ai_hold",
            Self::DirectionMismatch => "direction_mismatch",
            Self::AnalysisError => "analysis_error",
            Self::MissingAiDecision => "missing_ai_decision",
        }
    }
}

/// Filter outcome.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub allowed: bool,
    pub reason: Option<EntryRejectReason>,
    pub decision: String,
}

impl FilterVerdict {
    pub fn allow(decision: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: None,
            decision: decision.into(),
        }
    }

    pub fn reject(reason: EntryRejectReason, decision: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            decision: decision.into(),
        }
    }
}

/// Capability for the optional entry gate.
#[async_trait]
pub trait EntryFilter: Send + Sync {
    async fn allow(
        &self,
        strategy_id: i64,
        symbol: &str,
        signal_type: SignalType,
        ai_model_config: &Value,
    ) -> FilterVerdict;
}

/// Whether the strategy opted into the entry filter. Several key spellings
/// are accepted for compatibility with older configs.
pub fn entry_filter_enabled(ai_model_config: &Value) -> bool {
    const KEYS: &[&str] = &[
        "entry_ai_filter_enabled",
        "entryAiFilterEnabled",
        "ai_filter_enabled",
        "aiFilterEnabled",
        "enable_ai_filter",
        "enableAiFilter",
    ];
    for key in KEYS {
        match ai_model_config.get(key) {
            Some(Value::Bool(b)) => return *b,
            Some(Value::String(s)) => {
                match s.trim().to_lowercase().as_str() {
                    "1" | "true" | "yes" | "y" | "on" | "enabled" => return true,
                    "0" | "false" | "no" | "n" | "off" | "disabled" => return false,
                    _ => {}
                }
            }
            Some(Value::Number(n)) => return n.as_i64().unwrap_or(0) != 0,
            _ => {}
        }
    }
    false
}

/// Pull a trade decision out of an analysis payload and normalize it to
/// BUY / SELL / HOLD (empty when absent).
pub fn extract_decision(analysis: &Value) -> String {
    const PATHS: &[&[&str]] = &[
        &["final_decision", "decision"],
        &["trader_decision", "decision"],
        &["decision"],
        &["final", "decision"],
    ];
    let mut raw = String::new();
    for path in PATHS {
        let mut cursor = analysis;
        let mut ok = true;
        for key in *path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            if let Some(s) = cursor.as_str() {
                if !s.trim().is_empty() {
                    raw = s.trim().to_string();
                    break;
                }
            }
        }
    }

    let s = raw.to_uppercase();
    if s.is_empty() {
        return String::new();
    }
    if s.contains("BUY") || s.contains("LONG") {
        return "BUY".to_string();
    }
    if s.contains("SELL") || s.contains("SHORT") {
        return "SELL".to_string();
    }
    if s.contains("HOLD") || s.contains("WAIT") || s.contains("NEUTRAL") {
        return "HOLD".to_string();
    }
    String::new()
}

/// Map a normalized decision onto an open signal.
pub fn verdict_for(signal_type: SignalType, decision: &str) -> FilterVerdict {
    if decision.is_empty() {
        return FilterVerdict::reject(EntryRejectReason::MissingAiDecision, "");
    }
    let expected = match signal_type {
        SignalType::OpenLong => "BUY",
        SignalType::OpenShort => "SELL",
        _ => return FilterVerdict::allow(decision),
    };
    if decision == expected {
        FilterVerdict::allow(decision)
    } else if decision == "HOLD" {
        FilterVerdict::reject(EntryRejectReason::AiHold, decision)
    } else {
        FilterVerdict::reject(EntryRejectReason::DirectionMismatch, decision)
    }
}

/// Entry filter backed by an HTTP analysis service. The endpoint comes
/// from ai_model_config ("api_url"); absence of the endpoint or any call
/// failure rejects with `analysis_error`.
pub struct AnalysisEntryFilter {
    http: reqwest::Client,
}

impl AnalysisEntryFilter {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self { http }
    }
}

impl Default for AnalysisEntryFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntryFilter for AnalysisEntryFilter {
    async fn allow(
        &self,
        strategy_id: i64,
        symbol: &str,
        signal_type: SignalType,
        ai_model_config: &Value,
    ) -> FilterVerdict {
        let api_url = ai_model_config
            .get("api_url")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if api_url.is_empty() {
            return FilterVerdict::reject(EntryRejectReason::AnalysisError, "");
        }

        let market = ai_model_config
            .get("market")
            .and_then(|v| v.as_str())
            .unwrap_or("Crypto");
        let model = ai_model_config.get("model").and_then(|v| v.as_str());
        let language = ai_model_config
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("en-US");

        let body = json!({
            "market": market,
            "symbol": symbol,
            "language": language,
            "model": model,
        });

        let analysis: Value = match self.http.post(api_url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(strategy_id, symbol, error = %e, "analysis response unreadable");
                    return FilterVerdict::reject(EntryRejectReason::AnalysisError, "");
                }
            },
            Ok(resp) => {
                warn!(strategy_id, symbol, status = %resp.status(), "analysis call rejected");
                return FilterVerdict::reject(EntryRejectReason::AnalysisError, "");
            }
            Err(e) => {
                warn!(strategy_id, symbol, error = %e, "analysis call failed");
                return FilterVerdict::reject(EntryRejectReason::AnalysisError, "");
            }
        };

        if analysis.get("error").map_or(false, |e| !e.is_null()) {
            return FilterVerdict::reject(EntryRejectReason::AnalysisError, "");
        }

        let decision = extract_decision(&analysis);
        let verdict = verdict_for(signal_type, &decision);
        debug!(
            strategy_id,
            symbol,
            signal = %signal_type,
            decision = %verdict.decision,
            allowed = verdict.allowed,
            "entry filter verdict"
        );
        verdict
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_flag_spellings() {
        assert!(entry_filter_enabled(&json!({"entry_ai_filter_enabled": true})));
        assert!(entry_filter_enabled(&json!({"enableAiFilter": "yes"})));
        assert!(entry_filter_enabled(&json!({"ai_filter_enabled": "on"})));
        assert!(!entry_filter_enabled(&json!({"entry_ai_filter_enabled": "off"})));
        assert!(!entry_filter_enabled(&json!({})));
    }

    #[test]
    fn decision_extraction_paths_and_synonyms() {
        assert_eq!(
            extract_decision(&json!({"final_decision": {"decision": "buy"}})),
            "BUY"
        );
        assert_eq!(
            extract_decision(&json!({"trader_decision": {"decision": "go short"}})),
            "SELL"
        );
        assert_eq!(extract_decision(&json!({"decision": "WAIT"})), "HOLD");
        assert_eq!(extract_decision(&json!({"decision": "LONG"})), "BUY");
        assert_eq!(extract_decision(&json!({})), "");
    }

    #[test]
    fn verdict_mapping() {
        let v = verdict_for(SignalType::OpenLong, "BUY");
        assert!(v.allowed);

        let v = verdict_for(SignalType::OpenShort, "SELL");
        assert!(v.allowed);

        let v = verdict_for(SignalType::OpenLong, "HOLD");
        assert_eq!(v.reason, Some(EntryRejectReason::AiHold));

        let v = verdict_for(SignalType::OpenLong, "SELL");
        assert_eq!(v.reason, Some(EntryRejectReason::DirectionMismatch));

        let v = verdict_for(SignalType::OpenShort, "BUY");
        assert_eq!(v.reason, Some(EntryRejectReason::DirectionMismatch));

        let v = verdict_for(SignalType::OpenLong, "");
        assert_eq!(v.reason, Some(EntryRejectReason::MissingAiDecision));
    }

    #[tokio::test]
    async fn missing_endpoint_rejects_with_analysis_error() {
        let filter = AnalysisEntryFilter::new();
        let verdict = filter
            .allow(1, "BTC/USDT", SignalType::OpenLong, &json!({}))
            .await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(EntryRejectReason::AnalysisError));
    }
}
