use serde::Serialize;

pub const MIN_PERIOD_HALF_WAVES: u32 = 5;
// Exclusive.
pub const PERIOD_HALF_WAVES_LIMIT: u32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodOption {
    #[serde(rename = "periodInHalfWaves")]
    pub period_half_waves: u32,
    #[serde(rename = "dutyCycle")]
    pub duty_cycle: f64,
    pub error: f64,
}

/// Rounds down to whole half-waves, so the result never exceeds `intended`.
pub fn effective_duty_cycle(intended: f64, period_half_waves: u32) -> f64 {
    let period = f64::from(period_half_waves);
    let on_half_waves = (intended * period / 100.0).floor();
    100.0 * on_half_waves / period
}

pub fn candidate_periods() -> impl Iterator<Item = u32> {
    (MIN_PERIOD_HALF_WAVES..PERIOD_HALF_WAVES_LIMIT).step_by(2)
}

pub fn period_option(intended: f64, period_half_waves: u32) -> PeriodOption {
    let duty_cycle = effective_duty_cycle(intended, period_half_waves);
    PeriodOption {
        period_half_waves,
        duty_cycle,
        error: (intended - duty_cycle).abs(),
    }
}

pub fn ranked_periods(intended: f64) -> Vec<PeriodOption> {
    let mut options: Vec<PeriodOption> = candidate_periods()
        .map(|period| period_option(intended, period))
        .collect();
    options.sort_by(|a, b| a.error.total_cmp(&b.error));
    options
}

// Exact ties go to the shorter period.
pub fn best_period(intended: f64) -> PeriodOption {
    let mut best = period_option(intended, MIN_PERIOD_HALF_WAVES);
    for period in candidate_periods().skip(1) {
        let option = period_option(intended, period);
        if option.error < best.error {
            best = option;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIODS: [u32; 7] = [5, 7, 9, 11, 13, 15, 17];

    fn intended_grid() -> impl Iterator<Item = f64> {
        (0..=200).map(|step| f64::from(step) * 0.5)
    }

    #[test]
    fn candidates_are_the_odd_periods_below_nineteen() {
        assert_eq!(candidate_periods().collect::<Vec<_>>(), PERIODS.to_vec());
    }

    #[test]
    fn quantization_never_overshoots() {
        for period in PERIODS {
            for intended in intended_grid() {
                let achieved = effective_duty_cycle(intended, period);
                assert!(
                    achieved <= intended,
                    "period {period}: {achieved} > {intended}"
                );
                assert!(achieved >= 0.0);
            }
        }
    }

    #[test]
    fn fifty_percent_at_seven_half_waves() {
        let achieved = effective_duty_cycle(50.0, 7);
        assert!((achieved - 300.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn bounds_are_exact() {
        for period in PERIODS {
            assert_eq!(effective_duty_cycle(0.0, period), 0.0);
            assert_eq!(effective_duty_cycle(100.0, period), 100.0);
        }
        assert_eq!(best_period(0.0).period_half_waves, 5);
        assert_eq!(best_period(100.0).period_half_waves, 5);
        assert_eq!(best_period(100.0).error, 0.0);
    }

    #[test]
    fn best_period_for_fifty_percent() {
        // 5 -> 40, 7 -> 42.86, 9 -> 44.44, 11 -> 45.45, 13 -> 46.15, 15 -> 46.67, 17 -> 47.06
        let best = best_period(50.0);
        assert_eq!(best.period_half_waves, 17);
        assert!((best.duty_cycle - 800.0 / 17.0).abs() < 1e-12);
        assert!((best.error - (50.0 - 800.0 / 17.0)).abs() < 1e-12);
    }

    #[test]
    fn best_period_is_minimal_and_prefers_shorter_on_tie() {
        for intended in intended_grid() {
            let best = best_period(intended);
            assert!(PERIODS.contains(&best.period_half_waves));
            for period in PERIODS {
                let other = period_option(intended, period);
                assert!(best.error <= other.error);
                if other.error == best.error {
                    assert!(best.period_half_waves <= period);
                }
            }
        }
    }

    #[test]
    fn exact_tie_returns_smallest_period() {
        // 60% is exact at 5 and 15 half-waves.
        let best = best_period(60.0);
        assert_eq!(best.period_half_waves, 5);
        assert_eq!(best.error, 0.0);
    }

    #[test]
    fn ranked_periods_are_stable_on_ties() {
        let ranked = ranked_periods(60.0);
        assert_eq!(ranked.len(), 7);
        assert_eq!(ranked[0].period_half_waves, 5);
        assert_eq!(ranked[1].period_half_waves, 15);
        assert_eq!(ranked[0], best_period(60.0));
        assert!(ranked.windows(2).all(|pair| pair[0].error <= pair[1].error));
    }
}
