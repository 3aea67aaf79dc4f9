//! Terminal output helpers
//!
//! Everything but command results goes to stderr: `rde connect` owns
//! stdout for the relayed byte stream.

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

fn print_prefixed(color: Color, prefix: &str, msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(color),
        Print(prefix),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with a cross prefix
pub fn print_error(msg: &str) {
    print_prefixed(Color::Red, "✗ ", msg);
}

/// Print a warning in yellow
pub fn print_warning(msg: &str) {
    print_prefixed(Color::Yellow, "⚠ ", msg);
}

pub fn print_info(msg: &str) {
    print_prefixed(Color::Cyan, "ℹ ", msg);
}
