//! CLI entry point (spec §6): one optional path argument, an optional
//! initial page index. Initializes logging, loads configuration from disk,
//! constructs the core and drives it just enough to exercise `open` +
//! `display` from the command line; a real UI shell is the embedder's job
//! (this crate's headless core is also usable as a library, see
//! `rust_manga_core::ReaderCore`).
//!
//! Exit code 42 is the documented restart request (spec §6): the embedder's
//! process supervisor is expected to relaunch the binary when it sees this
//! code, which `ReaderCore::configure` triggers by setting
//! `restart_required` after a `decode_workers` or rendering-backend change
//! that can't be applied live.

use std::path::PathBuf;

use rust_manga_core::config::Config;
use rust_manga_core::core::ReaderCore;

/// Distinguished exit code requesting a process restart (spec §6).
const RESTART_EXIT_CODE: i32 = 42;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

struct CliArgs {
    path: Option<PathBuf>,
    initial_page: usize,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> CliArgs {
    args.next(); // argv[0]
    let path = args.next().map(PathBuf::from);
    let initial_page = args.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    CliArgs { path, initial_page }
}

fn main() {
    init_logging();

    let args = parse_args(std::env::args());
    let config = Config::load_or_default();
    let core = ReaderCore::new(config);

    let Some(path) = args.path else {
        tracing::info!("no path given; core constructed but idle");
        return;
    };

    match core.open(&path) {
        Ok(()) => {
            core.display(args.initial_page);
            tracing::info!(page = core.current_page(), "opened and displaying");
        }
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to open path");
            std::process::exit(1);
        }
    }

    if core.restart_required() {
        std::process::exit(RESTART_EXIT_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_page() {
        let args = parse_args(vec!["bin".to_string(), "/tmp/book.cbz".to_string(), "5".to_string()].into_iter());
        assert_eq!(args.path, Some(PathBuf::from("/tmp/book.cbz")));
        assert_eq!(args.initial_page, 5);
    }

    #[test]
    fn defaults_page_to_zero_when_omitted() {
        let args = parse_args(vec!["bin".to_string(), "/tmp/book.cbz".to_string()].into_iter());
        assert_eq!(args.initial_page, 0);
    }

    #[test]
    fn no_path_is_fine() {
        let args = parse_args(vec!["bin".to_string()].into_iter());
        assert_eq!(args.path, None);
    }
}
