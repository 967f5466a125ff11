//! Progress reporting for export jobs
//!
//! Shows a progress bar while records or units are delivered. The bar is
//! optional so tests and `--no-progress` runs stay quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

/// Progress tracker for one job
pub struct ProgressTracker {
    /// Items delivered so far
    processed: AtomicU64,
    start_time: Instant,
    /// What is being counted, e.g. `records` or `units`
    unit: &'static str,
    bar: Option<ProgressBar>,
}

impl ProgressTracker {
    /// Create a new progress tracker
    ///
    /// # Arguments
    /// * `total` - Total number of items if known (None for unknown)
    /// * `unit` - Label of the counted items
    /// * `enable_bar` - Whether to display a progress bar
    pub fn new(total: Option<u64>, unit: &'static str, enable_bar: bool) -> Self {
        let bar = enable_bar.then(|| match total {
            Some(n) => {
                let bar = ProgressBar::new(n);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                {
                    bar.set_style(style.progress_chars("#>-"));
                }
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                let template = format!("{{spinner:.green}} {{pos}} {unit} {{msg}}");
                if let Ok(style) = ProgressStyle::default_spinner().template(&template) {
                    bar.set_style(style);
                }
                bar
            }
        });

        Self {
            processed: AtomicU64::new(0),
            start_time: Instant::now(),
            unit,
            bar,
        }
    }

    /// Update progress with the running total
    pub fn update(&self, count: u64) {
        self.processed.store(count, Ordering::Relaxed);

        if let Some(ref bar) = self.bar {
            bar.set_position(count);

            let elapsed = self.start_time.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                let speed = count as f64 / elapsed;
                bar.set_message(format!("({:.0} {}/sec)", speed, self.unit));
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Finish and clear the progress bar
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}
