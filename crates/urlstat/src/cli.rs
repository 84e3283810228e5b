//! Exposes the command line application.
use std::future::Future;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use futures::channel::mpsc;
use urlstat_service::config::Config;
use urlstat_service::dispatch::CancellationToken;
use urlstat_service::fetch::SubstringCounter;
use urlstat_service::pipeline::{Pipeline, UrlStat};

use crate::input;
use crate::logging;

/// Counts how often a pattern occurs in the documents behind a list of URLs.
///
/// URLs are read line by line from `--input`, or from `stdin` if no input file is given. For
/// every URL, a line `<url>: <count>` is printed as soon as its document is processed, followed
/// by the sum of all counts at the end.
///
/// Press Ctrl-C to stop reading URLs. Downloads that are already running are still finished and
/// reported. Press Ctrl-C a second time to exit right away.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The text to count. Overrides the configured pattern.
    #[arg(long, short)]
    pattern: Option<String>,

    /// The maximum number of concurrent downloads. Overrides the configured concurrency.
    #[arg(long, short = 'n')]
    concurrency: Option<NonZeroUsize>,

    /// Path to a file with one URL per line. Defaults to `stdin`.
    #[arg(long, short, value_name = "FILE")]
    input: Option<PathBuf>,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// Applies the values given on the command line on top of `config`.
    fn apply(&self, config: &mut Config) {
        if let Some(ref pattern) = self.pattern {
            config.pattern = pattern.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    cli.apply(&mut config);

    // SAFETY: No other threads have been started at this point.
    unsafe { logging::init_logging(&config) };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("urlstat")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    let result = runtime.block_on(run(cli.input.as_deref(), config));

    // A blocked read from `stdin` would otherwise keep the runtime alive.
    runtime.shutdown_background();
    result
}

fn format_stat(stat: &UrlStat) -> String {
    match &stat.result {
        Ok(count) => format!("{}: {}", stat.url, count),
        Err(err) => format!("Cannot fetch from {}: {}", stat.url, err),
    }
}

/// Cancels `cancel` on the first interrupt and returns on the second one.
///
/// Fails if listening for interrupts fails, in which case nothing is cancelled.
async fn watch_interrupts<F, Fut>(mut interrupted: F, cancel: CancellationToken) -> io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    interrupted().await?;
    tracing::info!("Interrupted, waiting for running downloads. Press Ctrl-C again to exit");
    cancel.cancel();

    interrupted().await
}

async fn exit_on_interrupt(cancel: CancellationToken) {
    match watch_interrupts(tokio::signal::ctrl_c, cancel).await {
        Ok(()) => {
            tracing::warn!("Interrupted again, exiting without waiting for running downloads");
            std::process::exit(130);
        }
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to listen for Ctrl-C"
            );
        }
    }
}

async fn run(input: Option<&Path>, config: Config) -> Result<()> {
    let counter =
        SubstringCounter::from_config(&config).context("failed to create the HTTP client")?;
    tracing::info!(
        pattern = counter.pattern(),
        concurrency = config.concurrency.get(),
        "Counting pattern occurrences"
    );

    let (urls, receiver) = mpsc::channel(config.input_buffer.get());
    let feeder = input::spawn_feeder(input, urls).await?;

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(exit_on_interrupt(cancel.clone()));

    let pipeline = Pipeline::new(counter, config.concurrency);
    let summary = pipeline
        .run(receiver, cancel, |stat: &UrlStat| println!("{}", format_stat(stat)))
        .await;
    interrupt.abort();

    println!("Total: {}", summary.total);
    tracing::info!(
        processed = summary.processed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "Done"
    );

    if summary.cancelled {
        feeder.abort();
        return Ok(());
    }

    let read = feeder
        .await
        .context("input reader panicked")?
        .context("failed to read URLs")?;
    tracing::debug!(read, "Input exhausted");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::CommandFactory;
    use tokio::sync::Semaphore;
    use urlstat_service::fetch::FetchError;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from(["urlstat", "--pattern", "Rust", "-n", "12"]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.pattern, "Rust");
        assert_eq!(config.concurrency.get(), 12);
        assert!(cli.config().is_none());
    }

    #[test]
    fn test_no_overrides() {
        let cli = Cli::parse_from(["urlstat", "--input", "urls.txt"]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.pattern, "Go");
        assert_eq!(config.concurrency.get(), 5);
        assert_eq!(cli.input.as_deref(), Some(Path::new("urls.txt")));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(Cli::try_parse_from(["urlstat", "--concurrency", "0"]).is_err());
    }

    #[tokio::test]
    async fn test_second_interrupt_ends_watch() {
        let signals = Arc::new(Semaphore::new(0));
        let cancel = CancellationToken::new();

        let interrupted = {
            let signals = Arc::clone(&signals);
            move || {
                let signals = Arc::clone(&signals);
                async move {
                    let permit = signals.acquire().await.map_err(io::Error::other)?;
                    permit.forget();
                    Ok::<_, io::Error>(())
                }
            }
        };
        let watcher = tokio::spawn(watch_interrupts(interrupted, cancel.clone()));

        tokio::task::yield_now().await;
        assert!(!cancel.is_cancelled());

        signals.add_permits(1);
        cancel.cancelled().await;
        tokio::task::yield_now().await;
        assert!(!watcher.is_finished());

        signals.add_permits(1);
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_interrupt_listener_does_not_cancel() {
        let cancel = CancellationToken::new();

        let result = watch_interrupts(
            || async { Err(io::Error::other("no signal handler")) },
            cancel.clone(),
        )
        .await;

        assert!(result.is_err());
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_format_stat() {
        let ok = UrlStat {
            url: "https://golang.org".into(),
            result: Ok(42),
        };
        assert_eq!(format_stat(&ok), "https://golang.org: 42");

        let failed = UrlStat {
            url: "https://golang.org".into(),
            result: Err(FetchError::ConnectionFailed("refused".into())),
        };
        assert_eq!(
            format_stat(&failed),
            "Cannot fetch from https://golang.org: connection failed: refused"
        );
    }
}
