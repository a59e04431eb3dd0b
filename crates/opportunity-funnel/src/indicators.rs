//! Technical indicator math used by the deep dive. Pure functions over
//! close/bar slices; callers handle insufficient-data returns.

use broker_gateway::Bar;

/// Exponential Moving Average over the full series.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.is_empty() {
        return vec![];
    }
    let multiplier = 2.0 / (period as f64 + 1.0);

    if data.len() < period {
        return vec![data.iter().sum::<f64>() / data.len() as f64];
    }

    let mut result = Vec::with_capacity(data.len());
    let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;
    result.push(seed);
    for value in &data[1..] {
        let prev = *result.last().unwrap();
        result.push((value - prev) * multiplier + prev);
    }
    result
}

/// Relative Strength Index (Wilder smoothing).
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in closes[..=period].windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    for pair in closes[period..].windows(2) {
        let delta = pair[1] - pair[0];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD(fast, slow, signal) at the latest bar.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if closes.len() < slow + signal_period {
        return None;
    }
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);
    let len = fast_ema.len().min(slow_ema.len());
    if len == 0 {
        return None;
    }
    let macd_series: Vec<f64> = fast_ema[fast_ema.len() - len..]
        .iter()
        .zip(&slow_ema[slow_ema.len() - len..])
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema(&macd_series, signal_period);
    let line = *macd_series.last()?;
    let signal = *signal_series.last()?;
    Some(Macd {
        line,
        signal,
        histogram: line - signal,
    })
}

/// Average True Range over `period` sessions.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }
    let recent = &true_ranges[true_ranges.len() - period..];
    Some(recent.iter().sum::<f64>() / period as f64)
}

/// Standard deviation of daily returns over the series.
pub fn return_sigma(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    Some(variance.sqrt())
}
