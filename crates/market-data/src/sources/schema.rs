//! Provider response layouts
//!
//! Unknown fields are ignored; a missing or unparseable required field is an
//! error. Prices may arrive as JSON numbers or numeric strings.

use chrono::{DateTime, NaiveDate, Utc};
use config::{SchemaKind, SourceConfig};
use serde_json::Value;
use std::collections::BTreeMap;

/// One day of a provider's historical series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub close: f64,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSchema {
    kind: SchemaKind,
    price_pointer: Option<String>,
    pair: Option<String>,
}

impl ResponseSchema {
    pub fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            price_pointer: None,
            pair: None,
        }
    }

    pub fn from_config(source: &SourceConfig) -> Self {
        Self {
            kind: source.schema,
            price_pointer: source.price_pointer.clone(),
            pair: source.pair.clone(),
        }
    }

    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.price_pointer = Some(pointer.into());
        self
    }

    pub fn with_pair(mut self, pair: impl Into<String>) -> Self {
        self.pair = Some(pair.into());
        self
    }

    pub fn supports_historical(&self) -> bool {
        matches!(
            self.kind,
            SchemaKind::Coingecko | SchemaKind::Kraken | SchemaKind::Binance
        )
    }

    pub fn parse_spot(&self, body: &Value) -> Result<f64, String> {
        let raw = match self.kind {
            SchemaKind::Coingecko => field(body, "/bitcoin/usd")?,
            SchemaKind::Coinbase => field(body, "/data/amount")?,
            SchemaKind::Binance => field(body, "/price")?,
            SchemaKind::Bitstamp => field(body, "/last")?,
            SchemaKind::Kraken => field(kraken_pair(body, self.pair.as_deref())?, "/c/0")?,
            SchemaKind::JsonPointer => {
                let pointer = self
                    .price_pointer
                    .as_deref()
                    .ok_or_else(|| "price_pointer is not configured".to_string())?;
                field(body, pointer)?
            }
        };
        price(raw)
    }

    /// One bar per UTC day, oldest first
    pub fn parse_historical(&self, body: &Value) -> Result<Vec<DailyBar>, String> {
        match self.kind {
            SchemaKind::Coingecko => coingecko_history(body),
            SchemaKind::Kraken => {
                let rows = kraken_pair(body, self.pair.as_deref())?;
                ohlc_rows(rows, TimeUnit::Seconds)
            }
            SchemaKind::Binance => ohlc_rows(body, TimeUnit::Milliseconds),
            other => Err(format!("{:?} responses carry no historical series", other)),
        }
    }
}

fn field<'a>(body: &'a Value, pointer: &str) -> Result<&'a Value, String> {
    body.pointer(pointer)
        .ok_or_else(|| format!("missing field {}", pointer))
}

/// Positive finite price from a number or numeric string
fn price(value: &Value) -> Result<f64, String> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(p) if p.is_finite() && p > 0.0 => Ok(p),
        Some(p) => Err(format!("non-positive price {}", p)),
        None => Err(format!("not a price: {}", value)),
    }
}

fn kraken_pair<'a>(body: &'a Value, pair: Option<&str>) -> Result<&'a Value, String> {
    if let Some(errors) = body.get("error").and_then(Value::as_array) {
        if !errors.is_empty() {
            let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(format!("provider error: {}", joined.join(", ")));
        }
    }

    let result = body
        .get("result")
        .and_then(Value::as_object)
        .ok_or_else(|| "missing field /result".to_string())?;

    match pair {
        Some(pair) => result
            .get(pair)
            .ok_or_else(|| format!("missing pair {}", pair)),
        None => result
            .iter()
            .find(|(key, _)| key.as_str() != "last")
            .map(|(_, v)| v)
            .ok_or_else(|| "empty result".to_string()),
    }
}

#[derive(Clone, Copy)]
enum TimeUnit {
    Seconds,
    Milliseconds,
}

fn timestamp_date(value: &Value, unit: TimeUnit) -> Result<NaiveDate, String> {
    let raw = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| format!("not a timestamp: {}", value))?;
    let datetime = match unit {
        TimeUnit::Seconds => DateTime::<Utc>::from_timestamp(raw, 0),
        TimeUnit::Milliseconds => DateTime::<Utc>::from_timestamp_millis(raw),
    };
    datetime
        .map(|dt| dt.date_naive())
        .ok_or_else(|| format!("timestamp out of range: {}", raw))
}

/// `[[time, open, high, low, close, ...], ...]`
fn ohlc_rows(body: &Value, unit: TimeUnit) -> Result<Vec<DailyBar>, String> {
    let rows = body
        .as_array()
        .ok_or_else(|| "expected an array of OHLC rows".to_string())?;

    let mut bars = BTreeMap::new();
    for row in rows {
        let cols = row
            .as_array()
            .filter(|c| c.len() >= 5)
            .ok_or_else(|| format!("malformed OHLC row: {}", row))?;
        let date = timestamp_date(&cols[0], unit)?;
        let high = price(&cols[2])?;
        let low = price(&cols[3])?;
        let close = price(&cols[4])?;
        if low > high {
            return Err(format!("low {} above high {} on {}", low, high, date));
        }
        bars.insert(
            date,
            DailyBar {
                date,
                close,
                high: Some(high),
                low: Some(low),
            },
        );
    }
    Ok(bars.into_values().collect())
}

/// `{"prices": [[ms, price], ...]}` sampled intraday; the last sample of each
/// UTC day is its close
fn coingecko_history(body: &Value) -> Result<Vec<DailyBar>, String> {
    let samples = field(body, "/prices")?
        .as_array()
        .ok_or_else(|| "/prices is not an array".to_string())?;

    let mut parsed = Vec::with_capacity(samples.len());
    for sample in samples {
        let pair = sample
            .as_array()
            .filter(|p| p.len() >= 2)
            .ok_or_else(|| format!("malformed price sample: {}", sample))?;
        let ms = pair[0]
            .as_i64()
            .or_else(|| pair[0].as_f64().map(|f| f as i64))
            .ok_or_else(|| format!("not a timestamp: {}", pair[0]))?;
        parsed.push((ms, price(&pair[1])?));
    }
    parsed.sort_by_key(|(ms, _)| *ms);

    // (close, high, low, samples) per day
    let mut days: BTreeMap<NaiveDate, (f64, f64, f64, usize)> = BTreeMap::new();
    for (ms, p) in parsed {
        let date = timestamp_date(&Value::from(ms), TimeUnit::Milliseconds)?;
        days.entry(date)
            .and_modify(|(close, high, low, count)| {
                *close = p;
                *high = high.max(p);
                *low = low.min(p);
                *count += 1;
            })
            .or_insert((p, p, p, 1));
    }

    // A single sample carries no intraday range; coarse ranges (one point
    // per day beyond 90 days) leave high/low unset.
    Ok(days
        .into_iter()
        .map(|(date, (close, high, low, count))| {
            let ranged = count >= 2;
            DailyBar {
                date,
                close,
                high: ranged.then_some(high),
                low: ranged.then_some(low),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_spot_layouts() {
        let cases = [
            (ResponseSchema::new(SchemaKind::Coingecko), json!({"bitcoin": {"usd": 60123.5}})),
            (
                ResponseSchema::new(SchemaKind::Coinbase),
                json!({"data": {"amount": "60123.5", "base": "BTC", "currency": "USD"}}),
            ),
            (ResponseSchema::new(SchemaKind::Binance), json!({"symbol": "BTCUSDT", "price": "60123.50000000"})),
            (ResponseSchema::new(SchemaKind::Bitstamp), json!({"last": "60123.5", "volume": "1"})),
            (
                ResponseSchema::new(SchemaKind::Kraken),
                json!({"error": [], "result": {"XXBTZUSD": {"c": ["60123.5", "0.01"]}}}),
            ),
            (
                ResponseSchema::new(SchemaKind::JsonPointer).with_pointer("/ticker/last"),
                json!({"ticker": {"last": 60123.5}}),
            ),
        ];

        for (schema, body) in cases {
            assert_eq!(schema.parse_spot(&body), Ok(60123.5), "{:?}", schema);
        }
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let schema = ResponseSchema::new(SchemaKind::Coinbase);
        assert!(schema.parse_spot(&json!({"data": {}})).is_err());
        assert!(schema.parse_spot(&json!({"data": {"amount": "abc"}})).is_err());
        assert!(schema.parse_spot(&json!({"data": {"amount": "0"}})).is_err());
        assert!(schema.parse_spot(&json!({"data": {"amount": "-5"}})).is_err());

        let pointer_only = ResponseSchema::new(SchemaKind::JsonPointer);
        assert!(pointer_only.parse_spot(&json!({"price": 1.0})).is_err());
    }

    #[test]
    fn test_kraken_error_and_pair_selection() {
        let schema = ResponseSchema::new(SchemaKind::Kraken).with_pair("XXBTZUSD");
        let err = schema
            .parse_spot(&json!({"error": ["EGeneral:Too many requests"], "result": {}}))
            .unwrap_err();
        assert!(err.contains("Too many requests"));

        let body = json!({"error": [], "result": {"XXBTZEUR": {"c": ["1"]}}});
        assert!(schema.parse_spot(&body).is_err());
    }

    #[test]
    fn test_coingecko_history_collapses_to_last_sample_per_day() {
        // 2024-01-01T00:00Z = 1704067200000
        let day = 86_400_000_i64;
        let t0 = 1_704_067_200_000_i64;
        let body = json!({
            "prices": [
                [t0 + day + 3_600_000, 61000.0],
                [t0 + 3_600_000, 60000.0],
                [t0 + 7_200_000, 60500.0],
                [t0 + 10_800_000, 59800.0],
                [t0 + day + 7_200_000, 61500.0],
            ],
            "market_caps": []
        });

        let bars = ResponseSchema::new(SchemaKind::Coingecko)
            .parse_historical(&body)
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0], DailyBar { date: date(1), close: 59800.0, high: Some(60500.0), low: Some(59800.0) });
        assert_eq!(bars[1].date, date(2));
        assert_eq!(bars[1].close, 61500.0);
    }

    #[test]
    fn test_coingecko_daily_granularity_has_no_range() {
        let day = 86_400_000_i64;
        let t0 = 1_704_067_200_000_i64;
        let prices: Vec<Value> = (0..30)
            .map(|i| {
                let p = if i % 2 == 0 { 60000.0 } else { 61800.0 };
                json!([t0 + i * day, p])
            })
            .collect();
        let body = json!({ "prices": prices });

        let bars = ResponseSchema::new(SchemaKind::Coingecko)
            .parse_historical(&body)
            .unwrap();
        assert_eq!(bars.len(), 30);
        assert!(bars.iter().all(|b| b.high.is_none() && b.low.is_none()));
        assert_eq!(bars[1].close, 61800.0);
    }

    #[test]
    fn test_ohlc_history() {
        let kraken = json!({"error": [], "result": {
            "XXBTZUSD": [
                [1704153600, "61000.0", "62000.0", "60000.0", "61500.0", "61200.0", "100.0", 1000],
                [1704067200, "60000.0", "61200.0", "59000.0", "61000.0", "60500.0", "120.0", 1100]
            ],
            "last": 1704153600
        }});
        let bars = ResponseSchema::new(SchemaKind::Kraken).parse_historical(&kraken).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, date(1));
        assert_eq!(bars[0].close, 61000.0);
        assert_eq!(bars[1].high, Some(62000.0));

        let binance = json!([
            [1704067200000_i64, "60000.0", "61200.0", "59000.0", "61000.0", "1.0", 1704153599999_i64]
        ]);
        let bars = ResponseSchema::new(SchemaKind::Binance).parse_historical(&binance).unwrap();
        assert_eq!(bars, vec![DailyBar { date: date(1), close: 61000.0, high: Some(61200.0), low: Some(59000.0) }]);
    }

    #[test]
    fn test_spot_only_schemas_reject_history() {
        assert!(!ResponseSchema::new(SchemaKind::Bitstamp).supports_historical());
        assert!(ResponseSchema::new(SchemaKind::Bitstamp)
            .parse_historical(&json!({}))
            .is_err());
    }
}
