use std::env;

/// ANSI colors for operator-facing output
pub struct Colors;

impl Colors {
    /// Success - #5FADEB
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    /// Values and progress - #4A9BD9
    pub const SECONDARY: &'static str = "\x1b[38;2;74;155;217m";
    /// Labels - #808080
    pub const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    /// Errors - #FF3B30
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    /// Warnings - #FF9500
    pub const WARNING: &'static str = "\x1b[38;2;255;149;0m";
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
}

pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "!";
    pub const INFO: &'static str = "ℹ";
    pub const ARROW: &'static str = "→";
    pub const BULLET: &'static str = "•";
}

/// Human output of the `deptnet` CLI. Structured logs go through `tracing`;
/// this is only for what the operator reads on the terminal.
pub struct Logger;

impl Logger {
    fn paint(color: &str, text: &str) -> String {
        if should_use_colors() {
            format!("{}{}{}", color, text, Colors::RESET)
        } else {
            text.to_string()
        }
    }

    pub fn success(message: &str) {
        println!("{}", Self::paint(Colors::MAIN, &format!("{} {}", Symbols::SUCCESS, message)));
    }

    /// Errors go to stderr
    pub fn error(message: &str) {
        eprintln!("{}", Self::paint(Colors::ERROR, &format!("{} {}", Symbols::ERROR, message)));
    }

    pub fn warning(message: &str) {
        println!("{}", Self::paint(Colors::WARNING, &format!("{} {}", Symbols::WARNING, message)));
    }

    pub fn info(message: &str) {
        println!("{}", Self::paint(Colors::SECONDARY, &format!("{} {}", Symbols::INFO, message)));
    }

    /// Key-value line, e.g. "  bridge → dept-acme01"
    pub fn detail(label: &str, value: &str) {
        println!(
            "  {} {} {}",
            Self::paint(Colors::DIM_GRAY, label),
            Symbols::ARROW,
            Self::paint(Colors::SECONDARY, value)
        );
    }

    /// Pass/fail line used by diagnose and teardown reports
    pub fn check(label: &str, ok: bool) {
        let (color, symbol) = if ok {
            (Colors::MAIN, Symbols::SUCCESS)
        } else {
            (Colors::ERROR, Symbols::ERROR)
        };
        println!("  {} {}", Self::paint(color, symbol), label);
    }

    pub fn section(title: &str) {
        let bold = format!("{}{}", Colors::BOLD, Colors::MAIN);
        println!("\n{}", Self::paint(&bold, title));
    }

    pub fn item(message: &str) {
        println!("  {} {}", Self::paint(Colors::DIM_GRAY, Symbols::BULLET), message);
    }

    pub fn error_with_hint(error: &str, hint: &str) {
        Self::error(error);
        eprintln!("  {} {}", Self::paint(Colors::DIM_GRAY, Symbols::ARROW), hint);
    }
}

/// Colors are off when NO_COLOR is set or stdout is not a terminal
pub fn should_use_colors() -> bool {
    env::var("NO_COLOR").is_err() && console::Term::stdout().is_term()
}
