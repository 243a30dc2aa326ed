//! CLI surface of the demo binary.
//!
//! ```ignore
//! use baymax::cli::{parse_args, CliCommand};
//!
//! match parse_args(std::env::args()) {
//!     CliCommand::Report { subject } => { /* ... */ }
//!     _ => {}
//! }
//! ```

pub mod args;
pub mod version;

pub use args::{parse_args, CliCommand};
pub use version::{version_string, VERSION};

/// Usage text printed for `--help` and invalid invocations.
pub const USAGE: &str = "\
Usage:
  baymax login
  baymax persons
  baymax stream <subject-id> <image>...
  baymax report <subject-id>
  baymax analyze <image>
  baymax --version

Environment:
  BAYMAX_API_URL            REST base (default http://127.0.0.1:8000/api)
  BAYMAX_WS_URL             WebSocket origin (default ws://127.0.0.1:8000)
  BAYMAX_FRAME_INTERVAL_MS  pause between frames (default 500)
  RUST_LOG                  log filter (default baymax=info)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_lists_every_command() {
        for command in ["login", "persons", "stream", "report", "analyze", "--version"] {
            assert!(USAGE.contains(command), "missing {}", command);
        }
    }
}
