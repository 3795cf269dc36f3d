//! Command-line arguments

use clap::Parser;
use std::path::PathBuf;

use crate::config::default_settings_path;

#[derive(Clone, Debug, Parser)]
#[command(
    author,
    version,
    about = "Pairsync - keep one directory in step with a single peer"
)]
pub struct Args {
    /// Directory to synchronize
    pub dir: PathBuf,

    /// Settings file (role, peer address, ignore rules)
    #[arg(long, default_value_os_t = default_settings_path())]
    pub settings: PathBuf,

    /// Log every step to stderr
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_is_required() {
        assert!(Args::try_parse_from(["pairsync"]).is_err());
    }

    #[test]
    fn flags_parse() {
        let argv = ["pairsync", "--debug", "--settings", "/tmp/s.toml", "work"];
        let args = Args::try_parse_from(argv).unwrap();
        assert!(args.debug);
        assert_eq!(args.settings, PathBuf::from("/tmp/s.toml"));
        assert_eq!(args.dir, PathBuf::from("work"));
    }

    #[test]
    fn settings_default_to_user_config() {
        let args = Args::try_parse_from(["pairsync", "."]).unwrap();
        assert_eq!(args.settings, default_settings_path());
        assert!(!args.debug);
    }
}
