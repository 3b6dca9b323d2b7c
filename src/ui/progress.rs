//! Progress reporting for long commands. Bars hide themselves when
//! stdout is not a terminal.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use filetrail::migrate::MigrationProgress;

pub struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    pub fn new(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_message(message.to_string());
        if console::Term::stdout().is_term() {
            pb.enable_steady_tick(Duration::from_millis(100));
        }
        Self { pb }
    }

    pub fn finish_with_message(&self, msg: &str) {
        self.pb.finish_with_message(msg.to_string());
    }
}

/// One bar driven across all migration phases.
pub struct MigrationBar {
    pb: ProgressBar,
}

impl MigrationBar {
    pub fn new() -> Self {
        let pb = if console::Term::stdout().is_term() {
            let pb = ProgressBar::new(1);
            pb.set_style(
                ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb
        } else {
            ProgressBar::hidden()
        };
        Self { pb }
    }

    pub fn update(&self, progress: &MigrationProgress) {
        self.pb.set_length(progress.total.max(1) as u64);
        self.pb.set_position(progress.current as u64);
        self.pb
            .set_message(format!("{}: {}", progress.phase, progress.message));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
