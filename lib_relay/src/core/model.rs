//! Upstream trade frames in, significant-move payloads out.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value of the `e` field on trade frames.
pub const TRADE_EVENT: &str = "trade";

#[derive(Debug, Deserialize)]
struct TradeFrame<'a> {
    #[serde(rename = "e", borrow)]
    event_type: Cow<'a, str>,
    #[serde(rename = "p", borrow, default)]
    price: Option<Cow<'a, str>>,
}

/// A parsed trade. `price_text` is the exchange's own spelling of `price`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade<'a> {
    pub price_text: Cow<'a, str>,
    pub price: f64,
}

#[derive(Debug, Error)]
pub enum TradeParseError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("trade frame without a price")]
    MissingPrice,
    #[error("unparseable price '{0}'")]
    InvalidPrice(String),
}

/// Parses an upstream frame.
///
/// `Ok(None)` means a well-formed frame of another event type, which callers skip silently.
pub fn parse_trade(raw: &str) -> Result<Option<Trade<'_>>, TradeParseError> {
    let frame: TradeFrame<'_> = serde_json::from_str(raw)?;
    if frame.event_type != TRADE_EVENT {
        return Ok(None);
    }

    let price_text = frame.price.ok_or(TradeParseError::MissingPrice)?;
    let price = price_text
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        .ok_or_else(|| TradeParseError::InvalidPrice(price_text.to_string()))?;

    Ok(Some(Trade { price_text, price }))
}

/// Kind tag of an outbound event, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "S")]
    SignificantMove,
}

/// The payload forwarded to the broadcast tier: `{"type":"S","p":"<price>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(rename = "p")]
    price: String,
}

impl OutboundEvent {
    pub fn significant_move(price: impl Into<String>) -> Self {
        Self {
            kind: EventKind::SignificantMove,
            price: price.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn price(&self) -> &str {
        &self.price
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exchange_trade_frame() {
        let raw = r#"{"e":"trade","E":1718000000123,"T":1718000000120,"s":"BTCUSDT","t":5012345,"p":"67012.40","q":"0.003","X":"MARKET","m":true}"#;
        let trade = parse_trade(raw).unwrap().unwrap();
        assert_eq!(trade.price_text, "67012.40");
        assert_eq!(trade.price, 67012.4);
    }

    #[test]
    fn other_event_types_are_skipped() {
        let raw = r#"{"e":"aggTrade","p":"1.0"}"#;
        assert!(parse_trade(raw).unwrap().is_none());
        let raw = r#"{"e":"depthUpdate","b":[],"a":[]}"#;
        assert!(parse_trade(raw).unwrap().is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(parse_trade("not json"), Err(TradeParseError::Json(_))));
        assert!(matches!(parse_trade(r#"{"result":null,"id":1}"#), Err(TradeParseError::Json(_))));
        assert!(matches!(parse_trade(r#"{"e":"trade"}"#), Err(TradeParseError::MissingPrice)));
        assert!(matches!(
            parse_trade(r#"{"e":"trade","p":"abc"}"#),
            Err(TradeParseError::InvalidPrice(_))
        ));
        assert!(matches!(
            parse_trade(r#"{"e":"trade","p":"NaN"}"#),
            Err(TradeParseError::InvalidPrice(_))
        ));
    }

    #[test]
    fn outbound_payload_is_bit_exact() {
        let event = OutboundEvent::significant_move("100.30");
        assert_eq!(event.to_json().unwrap(), r#"{"type":"S","p":"100.30"}"#);
        assert_eq!(event.kind(), EventKind::SignificantMove);
        assert_eq!(event.price(), "100.30");
    }
}
