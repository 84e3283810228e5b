//! Reading URLs from a file or `stdin`.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use futures::SinkExt;
use futures::channel::mpsc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

/// Sends every non-blank line of `reader` to `urls`, trimmed.
///
/// Sending waits while the channel is full, so the reader never runs further ahead than the
/// channel capacity. Stops early when the receiving side is gone. Returns the number of URLs sent.
pub async fn feed_lines<R>(reader: R, mut urls: mpsc::Sender<String>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0;

    while let Some(line) = lines.next_line().await? {
        let url = line.trim();
        if url.is_empty() {
            continue;
        }

        if urls.send(url.to_owned()).await.is_err() {
            tracing::debug!("URL intake closed, stopped reading input");
            break;
        }
        sent += 1;
    }

    Ok(sent)
}

/// Starts feeding the lines of the file at `path`, or of `stdin` if there is none, into `urls`.
pub async fn spawn_feeder(
    path: Option<&Path>,
    urls: mpsc::Sender<String>,
) -> Result<JoinHandle<io::Result<usize>>> {
    let handle = match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open input file {}", path.display()))?;
            tokio::spawn(feed_lines(BufReader::new(file), urls))
        }
        None => tokio::spawn(feed_lines(BufReader::new(tokio::io::stdin()), urls)),
    };

    Ok(handle)
}
