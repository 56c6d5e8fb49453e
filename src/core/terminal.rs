use console::{Emoji, style};

use crate::core::batch::JobSnapshot;
use crate::core::persist::Notice;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

/// Surface a storage notice with the matching severity.
pub fn print_notice(notice: &Notice) {
    match notice {
        Notice::Info(msg) => print_info(msg),
        Notice::Warning(msg) => print_warn(msg),
        Notice::Error(msg) => print_error(msg),
    }
}

/// One-line progress report, redrawn in place.
pub fn progress_line(snapshot: &JobSnapshot) -> String {
    let status = &snapshot.status;
    format!(
        "[{:>5.1}%] {}/{}  ok {}  failed {}  concurrency {}  {}",
        status.percent(),
        status.processed,
        status.total,
        style(status.success).green(),
        style(status.failed).red(),
        snapshot.concurrency,
        style(snapshot.phase.as_str()).dim()
    )
}

pub fn print_progress(snapshot: &JobSnapshot) {
    print!("\r\x1b[2K{}", progress_line(snapshot));
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

/// A titled block of help text.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, about: &str) -> Self {
        self.lines
            .push(format!("  {:<28} {}", style(name).green().bold(), about));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(format!("  {}", text));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("  {}: {}", style(label).bold().cyan(), value));
        self
    }

    pub fn hint(mut self, example: &str) -> Self {
        self.lines
            .push(format!("  {} {}", style("$").dim(), style(example).cyan()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn print(&self) {
        println!("\n{}", style(&self.title).bold().underlined());
        for line in &self.lines {
            println!("{}", line);
        }
    }
}

pub fn print_banner() {
    // #f59e0b -> #ef4444 across the word
    let start = (245u32, 158u32, 11u32);
    let end = (239u32, 68u32, 68u32);
    let word = "promptbatch";
    let steps = word.chars().count().saturating_sub(1).max(1) as u32;

    println!();
    print!("  ");
    for (i, ch) in word.chars().enumerate() {
        let t = i as u32 * 1000 / steps;
        let mix = |a: u32, b: u32| (a * (1000 - t) + b * t) / 1000;
        print!(
            "\x1b[1;38;2;{};{};{}m{}",
            mix(start.0, end.0),
            mix(start.1, end.1),
            mix(start.2, end.2),
            ch
        );
    }
    println!("\x1b[0m");
    println!("  {}", style("One prompt, every row.").dim());
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("Done.").bold().cyan());
}
