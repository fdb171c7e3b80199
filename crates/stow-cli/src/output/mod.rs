//! Terminal output: status lines on stdout, errors on stderr.

pub mod colors;
pub mod errors;

use colors::ColorSupport;

/// Prints command results with consistent markers
pub struct OutputHandler {
    colors: ColorSupport,
}

impl OutputHandler {
    pub fn new() -> Self {
        Self {
            colors: ColorSupport::detect(),
        }
    }

    /// Plain output without colors, for tests and pipes
    pub fn plain() -> Self {
        Self {
            colors: ColorSupport::disabled(),
        }
    }

    pub fn info(&self, message: &str) {
        println!("{}", message);
    }

    /// Secondary detail
    pub fn detail(&self, message: &str) {
        println!("  {}", self.colors.dim(message));
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", self.colors.green("✓"), message);
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {}", self.colors.yellow("⚠"), message);
    }
}

impl Default for OutputHandler {
    fn default() -> Self {
        Self::new()
    }
}
