//! Command-line argument definitions for the jukestream binary.

use clap::Parser;

/// Chat-driven media jukebox: download, moderate and broadcast viewer
/// submissions to RTMP.
///
/// All service configuration comes from the environment (see the crate
/// README); the command line only controls log verbosity.
#[derive(Debug, Parser)]
#[command(name = "jukestream", version, about)]
pub struct Args {
    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default() {
        let args = Args::parse_from(["jukestream"]);
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
    }

    #[test]
    fn test_args_verbose_counts() {
        let args = Args::parse_from(["jukestream", "-vv"]);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_args_quiet() {
        let args = Args::parse_from(["jukestream", "--quiet"]);
        assert!(args.quiet);
    }

    #[test]
    fn test_args_quiet_conflicts_with_verbose() {
        let result = Args::try_parse_from(["jukestream", "--quiet", "-v"]);
        assert!(result.is_err());
    }
}
