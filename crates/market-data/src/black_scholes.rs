//! Black-Scholes premium engine
//!
//! Closed-form European option pricing. The standard normal CDF uses
//! Abramowitz & Stegun 26.2.17 (absolute error below 7.5e-8), which is
//! exactly symmetric, so put-call parity holds to rounding error.

use chrono::{DateTime, Utc};
use std::f64::consts::PI;

use crate::error::{OracleError, Result};
use crate::types::{BSInputs, Greeks, OptionType, PremiumQuote, VolatilityEstimate};

const SECONDS_PER_DAY: f64 = 86_400.0;

pub fn norm_pdf(x: f64) -> f64 {
    (1.0 / (2.0 * PI).sqrt()) * (-0.5 * x * x).exp()
}

pub fn norm_cdf(x: f64) -> f64 {
    let k = 1.0 / (1.0 + 0.2316419 * x.abs());
    let poly = k * (0.319381530
        + k * (-0.356563782
        + k * (1.781477937
        + k * (-1.821255978
        + k * 1.330274429))));

    let approx = 1.0 - norm_pdf(x) * poly;

    if x >= 0.0 {
        approx
    } else {
        1.0 - approx
    }
}

/// Reject inputs for which the closed form is undefined
pub fn validate(input: &BSInputs) -> Result<()> {
    let fields = [
        ("spot", input.spot),
        ("strike", input.strike),
        ("time to expiry", input.time),
        ("volatility", input.vol),
        ("risk-free rate", input.rate),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(OracleError::InvalidInput(format!("{} must be finite", name)));
        }
    }
    if input.spot <= 0.0 {
        return Err(OracleError::InvalidInput("spot must be positive".into()));
    }
    if input.strike <= 0.0 {
        return Err(OracleError::InvalidInput("strike must be positive".into()));
    }
    if input.time <= 0.0 {
        return Err(OracleError::InvalidInput(
            "time to expiry must be positive; expired options settle elsewhere".into(),
        ));
    }
    if input.vol <= 0.0 {
        return Err(OracleError::InvalidInput("volatility must be positive".into()));
    }
    Ok(())
}

/// `(d1, d2)` for already validated inputs
pub fn d1_d2(input: &BSInputs) -> (f64, f64) {
    let s = input.spot;
    let k = input.strike;
    let t = input.time;
    let v = input.vol;
    let r = input.rate;

    let d1 = ((s / k).ln() + (r + 0.5 * v * v) * t) / (v * t.sqrt());
    let d2 = d1 - v * t.sqrt();

    (d1, d2)
}

pub fn black_scholes_price(input: &BSInputs) -> Result<f64> {
    validate(input)?;

    let (d1, d2) = d1_d2(input);
    let s = input.spot;
    let k = input.strike;
    let t = input.time;
    let r = input.rate;

    let price = match input.option_type {
        OptionType::Call => s * norm_cdf(d1) - k * (-r * t).exp() * norm_cdf(d2),
        OptionType::Put => k * (-r * t).exp() * norm_cdf(-d2) - s * norm_cdf(-d1),
    };

    Ok(price.max(0.0))
}

pub fn intrinsic_value(spot: f64, strike: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

pub fn black_scholes_greeks(input: &BSInputs) -> Result<Greeks> {
    validate(input)?;

    let (d1, d2) = d1_d2(input);
    let s = input.spot;
    let k = input.strike;
    let t = input.time;
    let v = input.vol;
    let r = input.rate;

    let pdf = norm_pdf(d1);
    let sqrt_t = t.sqrt();
    let discount = (-r * t).exp();

    let delta = match input.option_type {
        OptionType::Call => norm_cdf(d1),
        OptionType::Put => norm_cdf(d1) - 1.0,
    };

    let gamma = pdf / (s * v * sqrt_t);

    let vega = s * pdf * sqrt_t;

    let theta = match input.option_type {
        OptionType::Call => -(s * pdf * v) / (2.0 * sqrt_t) - r * k * discount * norm_cdf(d2),
        OptionType::Put => -(s * pdf * v) / (2.0 * sqrt_t) + r * k * discount * norm_cdf(-d2),
    };

    let rho = match input.option_type {
        OptionType::Call => k * t * discount * norm_cdf(d2),
        OptionType::Put => -k * t * discount * norm_cdf(-d2),
    };

    Ok(Greeks {
        delta,
        gamma,
        vega,
        theta,
        rho,
    })
}

/// Turns a consensus price and a volatility estimate into a [`PremiumQuote`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PremiumEngine {
    risk_free_rate: f64,
    /// Days per year for expiry conversion
    day_count: f64,
}

impl PremiumEngine {
    pub fn new(risk_free_rate: f64, day_count: f64) -> Self {
        Self {
            risk_free_rate,
            day_count,
        }
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    /// Closed-form premium for explicit inputs
    pub fn price(
        &self,
        option_type: OptionType,
        spot: f64,
        strike: f64,
        time_to_expiry_years: f64,
        risk_free_rate: f64,
        volatility: f64,
    ) -> Result<f64> {
        black_scholes_price(&BSInputs {
            spot,
            strike,
            time: time_to_expiry_years,
            vol: volatility,
            rate: risk_free_rate,
            option_type,
        })
    }

    /// Year fraction between `now` and `expiry`; negative once expired
    pub fn time_to_expiry(&self, expiry: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let seconds = (expiry - now).num_milliseconds() as f64 / 1000.0;
        seconds / (SECONDS_PER_DAY * self.day_count)
    }

    /// Full quote for an absolute expiry
    pub fn quote(
        &self,
        option_type: OptionType,
        spot: f64,
        strike: f64,
        expiry: DateTime<Utc>,
        volatility: &VolatilityEstimate,
        now: DateTime<Utc>,
    ) -> Result<PremiumQuote> {
        let vol = volatility.value.ok_or_else(|| OracleError::InsufficientData {
            window_days: volatility.window_days,
            methodology: volatility.methodology.to_string(),
            available: volatility.sample_count,
            required: volatility.window_days as usize,
        })?;

        let input = BSInputs {
            spot,
            strike,
            time: self.time_to_expiry(expiry, now),
            vol,
            rate: self.risk_free_rate,
            option_type,
        };
        let premium = black_scholes_price(&input)?;
        let greeks = black_scholes_greeks(&input)?;

        Ok(PremiumQuote {
            underlying_price: spot,
            strike,
            time_to_expiry_years: input.time,
            risk_free_rate: self.risk_free_rate,
            volatility_used: volatility.clone(),
            option_type,
            premium,
            intrinsic_value: intrinsic_value(spot, strike, option_type),
            greeks,
            computed_at: now,
        })
    }
}
