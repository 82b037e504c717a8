use std::fmt;

/// Counters for one scrape invocation (not persisted; the checkpoint is the
/// durable record of progress).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Units fetched from the source and written as new artifacts
    pub units_fetched: u64,
    /// Units whose artifact was already on disk, so no request was made
    pub units_replayed: u64,
    /// Units that ended in failure (after retries, or one queue attempt)
    pub units_failed: u64,
    /// Records contained in fetched units
    pub records: u64,
}

impl ScrapeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch(&mut self, records: usize) {
        self.units_fetched += 1;
        self.records += records as u64;
    }

    pub fn record_replay(&mut self) {
        self.units_replayed += 1;
    }

    pub fn record_failure(&mut self) {
        self.units_failed += 1;
    }

    pub fn units(&self) -> u64 {
        self.units_fetched + self.units_replayed
    }
}

impl fmt::Display for ScrapeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Units fetched:      {}", self.units_fetched)?;
        writeln!(f, "Units from disk:    {}", self.units_replayed)?;
        writeln!(f, "Failed attempts:    {}", self.units_failed)?;
        write!(f, "Records collected:  {}", self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_zero() {
        let stats = ScrapeStats::new();
        assert_eq!(stats.units(), 0);
        assert_eq!(stats.units_failed, 0);
        assert_eq!(stats.records, 0);
    }

    #[test]
    fn mixed_operations() {
        let mut stats = ScrapeStats::new();
        stats.record_fetch(10);
        stats.record_fetch(5);
        stats.record_replay();
        stats.record_failure();

        assert_eq!(stats.units_fetched, 2);
        assert_eq!(stats.units_replayed, 1);
        assert_eq!(stats.units(), 3);
        assert_eq!(stats.records, 15);
        assert_eq!(stats.units_failed, 1);
    }

    #[test]
    fn display_lists_every_counter() {
        let mut stats = ScrapeStats::new();
        stats.record_fetch(3);
        let text = stats.to_string();
        assert!(text.contains("Units fetched:      1"));
        assert!(text.contains("Records collected:  3"));
    }
}
