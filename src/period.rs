//! Time periods (spec §4.6 "OutsideCheckPeriod", referenced but not its
//! own numbered component). A period is a set of valid Unix-second
//! ranges; an empty set means "always valid" (the common 24x7 default).

#[derive(Debug, Clone, Default)]
pub struct TimePeriod {
    pub name: String,
    /// Sorted, non-overlapping `[start, end)` ranges. Empty means always valid.
    pub ranges: Vec<(f64, f64)>,
}

impl TimePeriod {
    pub fn always(name: impl Into<String>) -> Self {
        Self { name: name.into(), ranges: Vec::new() }
    }

    pub fn is_inside(&self, now: f64) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|(start, end)| now >= *start && now < *end)
    }

    /// Next boundary of this period's validity window at or after `now`,
    /// capped at `now + 86400` (open-question resolution: see
    /// `next_check` scheduling notes).
    pub fn next_valid_end(&self, now: f64) -> f64 {
        const CAP: f64 = 86400.0;
        if self.ranges.is_empty() {
            return now + CAP;
        }
        let mut candidates: Vec<f64> = self
            .ranges
            .iter()
            .flat_map(|(start, end)| [*start, *end])
            .filter(|t| *t > now)
            .collect();
        candidates.sort_by(|a, b| a.partial_cmp(b).unwrap());
        candidates.into_iter().next().unwrap_or(now + CAP).min(now + CAP).max(now + 1.0)
    }
}
