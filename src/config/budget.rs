// src/config/budget.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_requests_per_window() -> u32 {
    60
}
fn default_window_size_minutes() -> f64 {
    15.0
}
fn default_safety_margin() -> f64 {
    0.9
}

/// Per-endpoint request budget, as written in config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_size_minutes")]
    pub window_size_minutes: f64,
    /// Fraction of the provider limit we allow ourselves, in (0, 1].
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_size_minutes: default_window_size_minutes(),
            safety_margin: default_safety_margin(),
        }
    }
}

impl BudgetConfig {
    pub fn new(requests_per_window: u32, window_size_minutes: f64, safety_margin: f64) -> Self {
        Self {
            requests_per_window,
            window_size_minutes,
            safety_margin,
        }
        .sanitized()
    }

    /// Replace out-of-range values with defaults instead of failing startup.
    pub fn sanitized(mut self) -> Self {
        if self.requests_per_window == 0 {
            self.requests_per_window = default_requests_per_window();
        }
        if !self.window_size_minutes.is_finite() || self.window_size_minutes <= 0.0 {
            self.window_size_minutes = default_window_size_minutes();
        }
        if !self.safety_margin.is_finite() || self.safety_margin <= 0.0 || self.safety_margin > 1.0
        {
            self.safety_margin = 1.0;
        }
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_size_minutes * 60.0)
    }

    /// `floor(limit * margin)`, never below one call per window.
    pub fn effective_cap(&self) -> u32 {
        let cap = (f64::from(self.requests_per_window) * self.safety_margin).floor() as u32;
        cap.max(1)
    }
}
