//! Progress display for a build run.
//!
//! An indicatif bar counts finished formulae. When the terminal understands
//! OSC 9;4 (Ghostty, WezTerm, Windows Terminal, ConEmu) the same progress is
//! mirrored into the tab/taskbar indicator.

use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::io::{self, IsTerminal, Write};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum ProgressState {
    Off = 0,
    Normal = 2,
    Error = 3,
}

fn set_terminal_progress(progress: u8, state: ProgressState) {
    let progress = progress.min(100);
    eprint!("\x1b]9;4;{};{}\x1b\\", state as u8, progress);
    let _ = io::stderr().flush();
}

/// Progress is drawn only for an interactive stderr without `NO_COLOR`.
pub fn should_show_progress() -> bool {
    io::stderr().is_terminal() && env::var_os("NO_COLOR").is_none()
}

pub struct BuildProgress {
    bar: ProgressBar,
    native: bool,
    start_time: Instant,
    total: usize,
    done: usize,
    failed: bool,
}

impl BuildProgress {
    pub fn new(total: usize, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(total as u64);
            let template = "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}";
            if let Ok(style) = ProgressStyle::default_bar().template(template) {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            bar,
            native: visible,
            start_time: Instant::now(),
            total,
            done: 0,
            failed: false,
        }
    }

    pub fn started(&self, name: &str) {
        self.bar.set_message(format!("building {name}"));
    }

    pub fn finished(&mut self, name: &str, ok: bool) {
        self.done += 1;
        self.failed |= !ok;
        self.bar.inc(1);
        if !ok {
            self.bar.println(format!("✗ {name}"));
        }
        if self.native {
            let state = if self.failed {
                ProgressState::Error
            } else {
                ProgressState::Normal
            };
            set_terminal_progress(self.percent(), state);
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.done as f64 / self.total as f64) * 100.0).min(100.0) as u8
    }

    pub fn format_elapsed(&self) -> String {
        let elapsed = self.start_time.elapsed();
        let ms = elapsed.as_millis();
        if ms < 1000 {
            format!("{ms}ms")
        } else {
            format!("{:.1}s", elapsed.as_secs_f64())
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Drop for BuildProgress {
    fn drop(&mut self) {
        if self.native {
            set_terminal_progress(0, ProgressState::Off);
        }
    }
}
