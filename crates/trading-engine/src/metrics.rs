/// Per-cycle engine telemetry, logged on an interval.
pub struct EngineMetrics {
    pub cycles_run: u64,
    pub opportunities_found: u64,
    pub signals_generated: u64,
    pub signals_dropped_confidence: u64,
    pub signals_dropped_risk: u64,
    pub signals_dropped_pdt: u64,
    pub trades_executed: u64,
    pub trades_failed: u64,
    pub protections_remediated: u64,
    pub gap_alerts: u64,
    log_interval_cycles: u64,
}

impl EngineMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            opportunities_found: 0,
            signals_generated: 0,
            signals_dropped_confidence: 0,
            signals_dropped_risk: 0,
            signals_dropped_pdt: 0,
            trades_executed: 0,
            trades_failed: 0,
            protections_remediated: 0,
            gap_alerts: 0,
            log_interval_cycles,
        }
    }

    pub fn finish_cycle(&mut self) {
        self.cycles_run += 1;
        if self.log_interval_cycles > 0 && self.cycles_run % self.log_interval_cycles == 0 {
            self.log_summary();
        }
    }

    pub fn log_summary(&self) {
        tracing::info!(
            cycles = self.cycles_run,
            opportunities = self.opportunities_found,
            signals = self.signals_generated,
            dropped_confidence = self.signals_dropped_confidence,
            dropped_risk = self.signals_dropped_risk,
            dropped_pdt = self.signals_dropped_pdt,
            executed = self.trades_executed,
            failed = self.trades_failed,
            remediations = self.protections_remediated,
            gap_alerts = self.gap_alerts,
            "engine metrics summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_counter_advances() {
        let mut metrics = EngineMetrics::new(0);
        metrics.finish_cycle();
        metrics.finish_cycle();
        assert_eq!(metrics.cycles_run, 2);
    }
}
