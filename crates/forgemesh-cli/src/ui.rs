//! Terminal output helpers for subcommands.

use colored::Colorize;

/// Brand banner: ">> ForgeMesh"
pub fn banner() {
    println!("  {} {}", ">>".bright_cyan().bold(), "ForgeMesh".bold());
}

pub fn blank() {
    println!();
}

/// Print a success message.
pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// Print an error message.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value);
}

/// Hint line in dimmed text.
pub fn hint(msg: &str) {
    println!("  {} {}", "hint:".dimmed(), msg.dimmed());
}
