use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rsperf")]
#[command(about = "Record and report samples of Linux perf events")]
#[command(version)]
pub struct Cli {
    /// Log debug messages
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Command to run; omit to list the available commands
    pub command: Option<String>,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s)
        && !d.is_zero()
    {
        return Ok(d);
    }

    // Bare numbers are seconds, fractions allowed
    if let Ok(secs) = s.parse::<f64>()
        && secs.is_finite()
        && secs > 0.0
    {
        return Ok(Duration::from_secs_f64(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 500ms, 10s, 2m, 1.5",
        s
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("0.5"), Ok(Duration::from_millis(500)));
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("0ms").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_cli_passes_command_args_through() {
        let cli = Cli::parse_from(["rsperf", "-v", "record", "-e", "cpu-clock", "-a"]);
        assert!(cli.verbose);
        assert_eq!(cli.command.as_deref(), Some("record"));
        assert_eq!(cli.args, vec!["-e", "cpu-clock", "-a"]);
    }

    #[derive(Parser, Debug)]
    struct WithDuration {
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    }

    #[test]
    fn test_zero_duration_is_rejected_at_parse_time() {
        assert!(WithDuration::try_parse_from(["x", "--duration", "0"]).is_err());
        let parsed = WithDuration::try_parse_from(["x", "--duration", "1.5"]).unwrap();
        assert_eq!(parsed.duration, Some(Duration::from_millis(1500)));
    }
}
