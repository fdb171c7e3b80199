//! ANSI color support.
//!
//! Colors are used only when both stdout and stderr are terminals and
//! `NO_COLOR` is unset.

use std::env;
use std::io::{self, IsTerminal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Green,
    Yellow,
    Red,
    Dim,
}

impl Style {
    fn code(self) -> &'static str {
        match self {
            Style::Green => "32",
            Style::Yellow => "33",
            Style::Red => "31",
            Style::Dim => "2",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColorSupport {
    enabled: bool,
}

impl ColorSupport {
    pub fn detect() -> Self {
        let enabled = env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal() && io::stderr().is_terminal();
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn green(&self, text: &str) -> String {
        self.paint(Style::Green, text)
    }

    pub fn yellow(&self, text: &str) -> String {
        self.paint(Style::Yellow, text)
    }

    pub fn red(&self, text: &str) -> String {
        self.paint(Style::Red, text)
    }

    pub fn dim(&self, text: &str) -> String {
        self.paint(Style::Dim, text)
    }

    fn paint(&self, style: Style, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{}m{}\x1b[0m", style.code(), text)
        } else {
            text.to_string()
        }
    }
}
