//! Multi-window spike detection with a volatility gate.
//!
//! The detector is a pure function over the price history ring: it
//! holds no state of its own, so the session can run it on every tick
//! and also on demand for the dashboard's spike-status endpoint.

use serde::Serialize;

use crate::price::PriceHistory;

/// Detection parameters, taken from the bot config.
#[derive(Debug, Clone)]
pub struct SpikeParams {
    /// Lookback windows in seconds.
    pub windows_seconds: Vec<u64>,
    /// Minimum |change| to signal a spike, percent.
    pub threshold_pct: f64,
    /// Secondary floor on |change|, percent. 0 disables.
    pub min_strength_pct: f64,
    pub use_volatility_filter: bool,
    /// Maximum coefficient of variation before spikes are suppressed.
    pub max_volatility_cv: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeDirection {
    Up,
    Down,
}

/// Change measured over one lookback window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowChange {
    pub window_sec: u64,
    pub base_price: f64,
    pub change_pct: f64,
}

/// Full detector output for one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct SpikeReport {
    pub current_price: f64,
    /// Largest-magnitude change across evaluated windows.
    pub max_change_pct: f64,
    /// Window that produced it; 0 when nothing was evaluable.
    pub max_change_window_sec: u64,
    pub volatility_cv: f64,
    pub is_volatility_filtered: bool,
    /// Per-window breakdown for the dashboard.
    pub windows: Vec<WindowChange>,
    pub is_spike: bool,
    pub direction: Option<SpikeDirection>,
}

impl SpikeReport {
    fn quiet(current_price: f64) -> Self {
        Self {
            current_price,
            max_change_pct: 0.0,
            max_change_window_sec: 0,
            volatility_cv: 0.0,
            is_volatility_filtered: false,
            windows: Vec::new(),
            is_spike: false,
            direction: None,
        }
    }
}

/// Sample standard deviation over mean, as a percentage. 0 with fewer
/// than two samples or a non-positive mean.
fn coefficient_of_variation(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt() / mean * 100.0
}

/// Evaluate all configured windows at `(now_ms, price)`.
pub fn detect(history: &PriceHistory, now_ms: i64, price: f64, params: &SpikeParams) -> SpikeReport {
    if history.len() < 2 || price <= 0.0 {
        return SpikeReport::quiet(price);
    }

    let mut windows: Vec<u64> = params.windows_seconds.clone();
    windows.sort_unstable();
    windows.dedup();

    let mut evaluated: Vec<WindowChange> = Vec::with_capacity(windows.len());
    for (i, &window_sec) in windows.iter().enumerate() {
        let target_ts = now_ms - (window_sec as i64) * 1000;
        let Some(base) = history.price_at_or_before(target_ts) else {
            continue;
        };
        if base.price <= 0.0 {
            continue;
        }
        // When one old sample would serve several windows, attribute it
        // to the longest window it predates and skip the shorter ones.
        if let Some(&next_window) = windows.get(i + 1) {
            if base.ts_ms <= now_ms - (next_window as i64) * 1000 {
                continue;
            }
        }
        evaluated.push(WindowChange {
            window_sec,
            base_price: base.price,
            change_pct: (price - base.price) / base.price * 100.0,
        });
    }

    if evaluated.is_empty() {
        return SpikeReport::quiet(price);
    }

    // Ascending window order: strict comparison keeps the shorter
    // window on magnitude ties.
    let mut best = evaluated[0];
    for w in &evaluated[1..] {
        if w.change_pct.abs() > best.change_pct.abs() {
            best = *w;
        }
    }

    // Volatility gate over the shortest configured window.
    let shortest = windows.first().copied().unwrap_or(0);
    let samples: Vec<f64> = history
        .samples_in_range(now_ms - (shortest as i64) * 1000, now_ms)
        .map(|p| p.price)
        .collect();
    let volatility_cv = coefficient_of_variation(&samples);
    let is_volatility_filtered =
        params.use_volatility_filter && volatility_cv > params.max_volatility_cv;

    let magnitude = best.change_pct.abs();
    let is_spike = magnitude >= params.threshold_pct
        && magnitude >= params.min_strength_pct
        && !is_volatility_filtered;

    let direction = if best.change_pct > 0.0 {
        Some(SpikeDirection::Up)
    } else if best.change_pct < 0.0 {
        Some(SpikeDirection::Down)
    } else {
        None
    };

    SpikeReport {
        current_price: price,
        max_change_pct: best.change_pct,
        max_change_window_sec: best.window_sec,
        volatility_cv,
        is_volatility_filtered,
        windows: evaluated,
        is_spike,
        direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(windows: &[u64], threshold: f64, max_cv: f64) -> SpikeParams {
        SpikeParams {
            windows_seconds: windows.to_vec(),
            threshold_pct: threshold,
            min_strength_pct: 0.0,
            use_volatility_filter: true,
            max_volatility_cv: max_cv,
        }
    }

    #[test]
    fn test_downward_spike_detected() {
        let mut h = PriceHistory::new(100);
        h.append(0, 0.500);
        h.append(30_000, 0.500);
        h.append(600_000, 0.500);

        let report = detect(&h, 601_000, 0.482, &params(&[600], 3.0, 10.0));
        assert!(report.is_spike);
        assert_eq!(report.direction, Some(SpikeDirection::Down));
        assert_eq!(report.max_change_window_sec, 600);
        assert!((report.max_change_pct - (-3.6)).abs() < 0.01);
    }

    #[test]
    fn test_below_threshold_is_quiet() {
        let mut h = PriceHistory::new(100);
        h.append(0, 0.500);
        h.append(600_000, 0.500);
        let report = detect(&h, 601_000, 0.495, &params(&[600], 3.0, 10.0));
        assert!(!report.is_spike);
        assert!((report.max_change_pct - (-1.0)).abs() < 0.01);
    }

    #[test]
    fn test_shorter_window_wins_ties() {
        let mut h = PriceHistory::new(100);
        // Flat forever, so every window sees the same baseline price.
        for i in 0..40 {
            h.append(i * 100_000, 0.500);
        }
        let now = 4_000_000;
        let report = detect(&h, now, 0.530, &params(&[600, 1800, 3600], 3.0, 100.0));
        assert!(report.is_spike);
        assert_eq!(report.max_change_window_sec, 600);
    }

    #[test]
    fn test_volatility_gate_suppresses_spike() {
        let mut h = PriceHistory::new(200);
        // Noisy sawtooth inside the window: high CV.
        for i in 0..120 {
            let price = if i % 2 == 0 { 0.30 } else { 0.70 };
            h.append(i * 5_000, price);
        }
        h.append(0, 0.50); // ignored; ts clamps keep order

        let p = params(&[600], 3.0, 5.0);
        let report = detect(&h, 600_000, 0.54, &p);
        assert!(report.is_volatility_filtered);
        assert!(!report.is_spike, "gated spikes must not signal");
        assert!(report.volatility_cv > p.max_volatility_cv);
    }

    #[test]
    fn test_too_little_history_returns_quietly() {
        let h = PriceHistory::new(10);
        let report = detect(&h, 1_000_000, 0.5, &params(&[600], 3.0, 10.0));
        assert!(!report.is_spike);
        assert_eq!(report.max_change_window_sec, 0);
        assert!(report.windows.is_empty());

        let mut one = PriceHistory::new(10);
        one.append(0, 0.5);
        let report = detect(&one, 1_000_000, 0.5, &params(&[600], 3.0, 10.0));
        assert!(!report.is_spike);
    }

    #[test]
    fn test_single_old_sample_attributed_to_longest_window() {
        let mut h = PriceHistory::new(10);
        h.append(0, 0.500);
        h.append(4_000_000, 0.540); // current tick already recorded

        let report = detect(&h, 4_000_000, 0.540, &params(&[600, 1800, 3600], 3.0, 100.0));
        assert_eq!(report.windows.len(), 1);
        assert_eq!(report.windows[0].window_sec, 3600);
        assert!((report.max_change_pct - 8.0).abs() < 0.01);
    }

    #[test]
    fn test_min_strength_floor() {
        let mut h = PriceHistory::new(100);
        h.append(0, 0.500);
        h.append(600_000, 0.500);
        let mut p = params(&[600], 3.0, 100.0);
        p.min_strength_pct = 5.0;
        let report = detect(&h, 601_000, 0.482, &p);
        // 3.6% clears the threshold but not the strength floor.
        assert!(!report.is_spike);
    }

    #[test]
    fn test_cv_of_constant_series_is_zero() {
        assert_eq!(coefficient_of_variation(&[0.5, 0.5, 0.5]), 0.0);
        assert_eq!(coefficient_of_variation(&[0.5]), 0.0);
        assert!(coefficient_of_variation(&[0.4, 0.6]) > 0.0);
    }
}
