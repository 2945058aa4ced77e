//! Child process output plumbing

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;

use super::LineSink;

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Merge stdout and stderr of a child into one line channel
pub fn merge_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx);
    }
    rx
}

/// Forward every output line to the sink while accumulating the full text
pub async fn collect_output(child: &mut Child, sink: &LineSink) -> String {
    let mut rx = merge_output(child);
    let mut log = String::new();
    while let Some(line) = rx.recv().await {
        log.push_str(&line);
        log.push('\n');
        let _ = sink.send(line);
    }
    log
}
