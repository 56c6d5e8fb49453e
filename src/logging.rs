use std::io::Write;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Fans formatted log lines out to a broadcast channel and, unless
/// suppressed, to stderr.
#[derive(Clone)]
pub(crate) struct TeeMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_console: bool,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            sender: self.sender.clone(),
            suppress_console: self.suppress_console,
        }
    }
}

pub(crate) struct TeeWriter {
    sender: broadcast::Sender<String>,
    suppress_console: bool,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(msg); // no receivers is fine
        if !self.suppress_console {
            std::io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_console {
            std::io::stderr().flush()?;
        }
        Ok(())
    }
}

pub(crate) fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}

/// Install the global subscriber. Returns the sender every log line is
/// broadcast on.
pub(crate) fn init(level: &str, suppress_console: bool) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(500);
    let make_writer = TeeMakeWriter {
        sender: log_tx.clone(),
        suppress_console,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_ansi(!suppress_console)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_tx
}

/// Append every broadcast log line to `path` until the sender goes away.
pub(crate) async fn spawn_file_sink(
    mut rx: broadcast::Receiver<String>,
    path: &Path,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(line) => {
                    if file.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = file.flush().await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level(" WARN "), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn writer_broadcasts_each_write() {
        let (tx, mut rx) = broadcast::channel(4);
        let make = TeeMakeWriter {
            sender: tx,
            suppress_console: true,
        };
        let mut writer = make.make_writer();
        writer.write_all(b"row 3 failed\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "row 3 failed\n");
    }

    #[tokio::test]
    async fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run.log");
        let (tx, rx) = broadcast::channel(4);
        let task = spawn_file_sink(rx, &path).await.unwrap();
        tx.send("first\n".to_string()).unwrap();
        tx.send("second\n".to_string()).unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
