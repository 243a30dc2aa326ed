//! Command-line argument parsing for the demo binary.

use std::path::PathBuf;

/// Parsed CLI command to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Show version information
    Version,
    /// Show usage
    Help,
    /// Prompt for credentials and store the token pair
    Login,
    /// Stream the given image files as frames for a subject
    Stream { subject: i64, frames: Vec<PathBuf> },
    /// Print the behavior report of a subject
    Report { subject: i64 },
    /// List monitored persons and their subject ids
    Persons,
    /// Analyse a single image file outside any session
    Analyze { image: PathBuf },
    /// Arguments that don't form a command; carries the reason
    Invalid(String),
}

/// Parse command-line arguments (program name first) into a command.
///
/// # Examples
///
/// ```
/// use baymax::cli::args::{parse_args, CliCommand};
///
/// let args = vec!["baymax".to_string(), "report".to_string(), "7".to_string()];
/// assert_eq!(parse_args(args.into_iter()), CliCommand::Report { subject: 7 });
/// ```
pub fn parse_args<I>(args: I) -> CliCommand
where
    I: Iterator<Item = String>,
{
    // Skip the program name
    let mut args = args.skip(1);

    let Some(command) = args.next() else {
        return CliCommand::Help;
    };

    match command.as_str() {
        "--version" | "-V" => CliCommand::Version,
        "--help" | "-h" | "help" => CliCommand::Help,
        "login" => CliCommand::Login,
        "stream" => match parse_subject(args.next()) {
            Ok(subject) => {
                let frames: Vec<PathBuf> = args.map(PathBuf::from).collect();
                if frames.is_empty() {
                    CliCommand::Invalid("stream needs at least one image file".to_string())
                } else {
                    CliCommand::Stream { subject, frames }
                }
            }
            Err(reason) => CliCommand::Invalid(reason),
        },
        "report" => match parse_subject(args.next()) {
            Ok(subject) => CliCommand::Report { subject },
            Err(reason) => CliCommand::Invalid(reason),
        },
        "persons" => CliCommand::Persons,
        "analyze" => match args.next() {
            Some(image) => CliCommand::Analyze {
                image: PathBuf::from(image),
            },
            None => CliCommand::Invalid("analyze needs an image file".to_string()),
        },
        other => CliCommand::Invalid(format!("unknown command '{}'", other)),
    }
}

fn parse_subject(raw: Option<String>) -> Result<i64, String> {
    let raw = raw.ok_or_else(|| "missing subject id".to_string())?;
    raw.parse::<i64>()
        .map_err(|_| format!("subject id must be a number, got '{}'", raw))
}
