//! Human and JSON output for the `atlaspub` commands

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Formats command results for the terminal
pub trait OutputFormatter: Send + Sync {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    /// One line of run progress; `percent` is in `[0, 100]`
    fn progress(&self, percent: f64, message: &str);
    fn print_json(&self, value: &serde_json::Value);
}

/// Checkmarks and indentation; `quiet` drops informational lines
pub struct HumanFormatter {
    pub quiet: bool,
}

impl OutputFormatter for HumanFormatter {
    fn success(&self, message: &str) {
        println!("\u{2713} {}", message);
    }
    fn error(&self, message: &str) {
        eprintln!("\u{2717} Error: {}", message);
    }
    fn warn(&self, message: &str) {
        eprintln!("\u{26a0} Warning: {}", message);
    }
    fn info(&self, message: &str) {
        if !self.quiet {
            println!("  {}", message);
        }
    }
    fn progress(&self, percent: f64, message: &str) {
        if !self.quiet {
            println!("  [{:>3.0}%] {}", percent, message);
        }
    }
    fn print_json(&self, _value: &serde_json::Value) {}
}

/// Machine-readable output: results on stdout, diagnostics on stderr
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn success(&self, message: &str) {
        println!("{}", serde_json::json!({"success": true, "message": message}));
    }
    fn error(&self, message: &str) {
        eprintln!("{}", serde_json::json!({"success": false, "error": message}));
    }
    fn warn(&self, message: &str) {
        eprintln!("{}", serde_json::json!({"level": "warning", "message": message}));
    }
    fn info(&self, _message: &str) {}
    fn progress(&self, percent: f64, message: &str) {
        eprintln!(
            "{}",
            serde_json::json!({"event": "progress", "percent": percent, "message": message})
        );
    }
    fn print_json(&self, value: &serde_json::Value) {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }
}

pub fn get_formatter(format: OutputFormat, quiet: bool) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Human => Box::new(HumanFormatter { quiet }),
    }
}
