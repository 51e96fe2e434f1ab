//! # Significance Filter
//!
//! Reduces a high-frequency trade stream to the price moves that matter. A move is
//! significant when the absolute distance from the last reported price reaches the
//! configured minimum tick size.
//!
//! The filter is per symbol: each instrument owns its own `SignificanceFilter` and with it
//! its own `FilterState`. Nothing else reads or writes that state.
//!
//! The comparison runs on `f64`; the price text received from the exchange is what gets
//! forwarded, so reformatting never alters the published digits.

/// Last reported price of one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterState {
    last_emitted: Option<f64>,
}

impl FilterState {
    /// The baseline every new trade is compared against. `None` until the first trade.
    pub fn last_emitted(&self) -> Option<f64> {
        self.last_emitted
    }
}

/// A trade far enough from the previous report to be published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificantMove {
    pub price: f64,
    /// Signed distance from the previous baseline.
    pub delta: f64,
}

#[derive(Debug, Clone)]
pub struct SignificanceFilter {
    min_tick_size: f64,
    state: FilterState,
}

impl SignificanceFilter {
    pub fn new(min_tick_size: f64) -> Self {
        Self {
            min_tick_size,
            state: FilterState::default(),
        }
    }

    pub fn min_tick_size(&self) -> f64 {
        self.min_tick_size
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Feeds one trade price.
    ///
    /// The first observation only records the baseline and never emits. Afterwards a move
    /// is emitted, and becomes the new baseline, iff `|price - baseline| >= min_tick_size`.
    /// Non-finite prices are ignored and leave the state untouched.
    pub fn observe(&mut self, price: f64) -> Option<SignificantMove> {
        if !price.is_finite() {
            return None;
        }

        let Some(last) = self.state.last_emitted else {
            self.state.last_emitted = Some(price);
            return None;
        };

        let delta = price - last;
        if delta.abs() >= self.min_tick_size {
            self.state.last_emitted = Some(price);
            Some(SignificantMove { price, delta })
        } else {
            None
        }
    }
}
