//! Progress display for harvest runs.

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::icons;
use crate::model::Outcome;
use crate::orchestrator::RunEvent;

/// Renders [`RunEvent`]s as a growing progress bar; messages print above it.
pub struct RunProgress {
    bar: ProgressBar,
    counts: BTreeMap<Outcome, usize>,
}

impl RunProgress {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(0))
    }

    /// Same accounting without drawing anything.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden()))
    }

    fn with_bar(bar: ProgressBar) -> Self {
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({elapsed})")
        {
            bar.set_style(style.progress_chars("█▓░"));
        }
        bar.set_message("Starting");
        Self {
            bar,
            counts: BTreeMap::new(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    fn record(&mut self, outcome: Outcome) {
        *self.counts.entry(outcome).or_insert(0) += 1;
        self.bar.inc(1);
        self.bar.set_message(format!(
            "{} resolved, {} partial, {} not found, {} blocked",
            self.count(Outcome::Resolved),
            self.count(Outcome::Partial),
            self.count(Outcome::NotFound),
            self.count(Outcome::Blocked),
        ));
    }

    pub fn handle(&mut self, event: RunEvent) {
        match event {
            RunEvent::BatchStarted { batch, items } => {
                self.bar.inc_length(items as u64);
                tracing::debug!("Batch {} started with {} items", batch, items);
            }
            RunEvent::ItemResolved {
                key,
                outcome,
                attempts,
            } => {
                if outcome == Outcome::Error {
                    self.bar.println(format!(
                        "{} {} failed after {} attempts",
                        icons::error(),
                        key,
                        attempts
                    ));
                }
                self.record(outcome);
            }
            RunEvent::ItemReused { outcome, .. } => self.record(outcome),
            RunEvent::SessionRotated { reason } => {
                self.bar.println(format!(
                    "{} Rotating browser session ({})",
                    icons::dim_arrow(),
                    reason.as_str()
                ));
            }
            RunEvent::Cooldown { duration } => {
                self.bar.println(format!(
                    "{} Blocked; cooling down for {}s",
                    icons::warn(),
                    duration.as_secs()
                ));
            }
            RunEvent::BatchCompleted {
                batch,
                written,
                failed,
            } => {
                if failed > 0 {
                    self.bar.println(format!(
                        "{} Batch {}: {} rows written, {} failed",
                        icons::error(),
                        batch,
                        written,
                        failed
                    ));
                }
            }
            RunEvent::BudgetExhausted => {
                self.bar.println(format!(
                    "{} Time budget exhausted; stopping after this batch",
                    icons::warn()
                ));
            }
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RowKey;

    #[test]
    fn counts_items_across_batches() {
        let mut progress = RunProgress::hidden();
        progress.handle(RunEvent::BatchStarted { batch: 1, items: 2 });
        progress.handle(RunEvent::ItemResolved {
            key: RowKey::new("Ads", 2),
            outcome: Outcome::Resolved,
            attempts: 1,
        });
        progress.handle(RunEvent::ItemReused {
            key: RowKey::new("Ads", 3),
            outcome: Outcome::Resolved,
        });
        progress.handle(RunEvent::BatchStarted { batch: 2, items: 1 });
        progress.handle(RunEvent::ItemResolved {
            key: RowKey::new("Ads", 4),
            outcome: Outcome::Blocked,
            attempts: 3,
        });

        assert_eq!(progress.position(), 3);
        assert_eq!(progress.count(Outcome::Resolved), 2);
        assert_eq!(progress.count(Outcome::Blocked), 1);
        progress.finish();
    }
}
