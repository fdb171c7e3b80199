//! Error reports with the cause chain and a suggested fix.

use std::error::Error;

use stow_core::StowError;

use super::colors::ColorSupport;

pub struct ErrorFormatter {
    colors: ColorSupport,
}

impl ErrorFormatter {
    pub fn new() -> Self {
        Self {
            colors: ColorSupport::detect(),
        }
    }

    pub fn with_colors(colors: ColorSupport) -> Self {
        Self { colors }
    }

    /// `error: ...`, one `caused by:` line per source, then `help:` if
    /// the innermost error has a known fix
    pub fn format_error(&self, error: &StowError) -> String {
        let mut output = format!("{}: {}", self.colors.red("error"), error);

        let mut source = error.source();
        while let Some(err) = source {
            output.push('\n');
            output.push_str(&format!("{}: {}", self.colors.dim("caused by"), err));
            source = err.source();
        }

        if let Some(suggestion) = error.suggestion() {
            output.push_str("\n\n");
            output.push_str(&format!("{}: {}", self.colors.dim("help"), suggestion));
        }

        output
    }

    pub fn format_simple(&self, message: &str) -> String {
        format!("{}: {}", self.colors.red("error"), message)
    }
}

impl Default for ErrorFormatter {
    fn default() -> Self {
        Self::new()
    }
}
