use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-line progress bar on stdout, redrawn at most once per percent.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    total: usize,
    last_displayed: AtomicUsize,
    label: String,
}

impl ProgressTracker {
    const BAR_WIDTH: usize = 30;
    const NAME_WIDTH: usize = 36;

    pub fn new(total: usize, label: &str) -> Self {
        Self { total: total.max(1), last_displayed: AtomicUsize::new(0), label: label.to_string() }
    }

    pub fn set_current(&self, current: usize, tensor_name: &str) {
        let current = current.min(self.total);
        let percent = current * 100 / self.total;
        let last_percent = self.last_displayed.load(Ordering::Relaxed) * 100 / self.total;

        if current > 1 && percent == last_percent && current < self.total {
            return;
        }
        self.last_displayed.store(current, Ordering::Relaxed);

        print!("\r{}", render_line(&self.label, current, self.total, tensor_name));
        io::stdout().flush().unwrap_or(());
        if current == self.total {
            println!();
        }
    }
}

fn render_line(label: &str, current: usize, total: usize, tensor_name: &str) -> String {
    let filled = current * ProgressTracker::BAR_WIDTH / total;
    let bar = "█".repeat(filled) + &"░".repeat(ProgressTracker::BAR_WIDTH - filled);
    format!("{label}: [{bar}] {current}/{total} {}", fit_name(tensor_name, ProgressTracker::NAME_WIDTH))
}

/// Pads or cuts `name` to exactly `width` characters.
fn fit_name(name: &str, width: usize) -> String {
    if name.chars().count() > width {
        let cut: String = name.chars().take(width.saturating_sub(2)).collect();
        format!("{cut}..")
    } else {
        format!("{name:width$}")
    }
}
