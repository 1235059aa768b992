use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
};

use super::{EventRegister, LogLine};
use crate::message::MachineId;

const CHANNEL_CAPACITY: usize = 1000;

enum LogCommand {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Writes a machine's event log to `<dir>/<machine>_log.txt`, one line per event.
///
/// Lines are handed to a background writer task; [`EventRegister::flush`] waits
/// until everything sent before it reached the file.
#[derive(Clone)]
pub struct LogFileRegister {
    path: Arc<PathBuf>,
    log_sender: mpsc::Sender<LogCommand>,
}

impl LogFileRegister {
    pub fn log_path(dir: &Path, machine: &MachineId) -> PathBuf {
        dir.join(format!("{machine}_log.txt"))
    }

    /// Creates (or truncates) the log file. Must be called within a tokio runtime.
    pub async fn create(dir: &Path, machine: &MachineId) -> io::Result<Self> {
        let path = Self::log_path(dir, machine);
        let file = File::create(&path).await?;
        let path = Arc::new(path);
        let (log_sender, log_recv) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(Self::record_lines(
            BufWriter::new(file),
            log_recv,
            path.clone(),
        ));
        Ok(Self { path, log_sender })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn record_lines(
        mut file: BufWriter<File>,
        mut log_recv: mpsc::Receiver<LogCommand>,
        path: Arc<PathBuf>,
    ) {
        while let Some(cmd) = log_recv.recv().await {
            match cmd {
                LogCommand::Line(mut line) => {
                    line.push('\n');
                    if let Err(err) = file.write_all(line.as_bytes()).await {
                        tracing::error!(path = ?path, error = %err, "Failed writing event log");
                    }
                }
                LogCommand::Flush(reply) => {
                    if let Err(err) = file.flush().await {
                        tracing::error!(path = ?path, error = %err, "Failed flushing event log");
                    }
                    let _ = reply.send(());
                }
            }
        }
        if let Err(err) = file.flush().await {
            tracing::error!(path = ?path, error = %err, "Failed flushing event log");
        }
    }
}

impl EventRegister for LogFileRegister {
    fn register<'a>(&'a self, line: &'a LogLine) -> BoxFuture<'a, ()> {
        async move {
            if self
                .log_sender
                .send(LogCommand::Line(line.to_string()))
                .await
                .is_err()
            {
                tracing::warn!(path = ?self.path, "Event log writer is gone, dropping line");
            }
        }
        .boxed()
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        async move {
            let (reply, done) = oneshot::channel();
            if self.log_sender.send(LogCommand::Flush(reply)).await.is_ok() {
                let _ = done.await;
            }
        }
        .boxed()
    }

    fn trait_clone(&self) -> Box<dyn EventRegister> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::tracing::{EventKind, EventRecord};

    #[tokio::test]
    #[test_log::test]
    async fn writes_parseable_lines() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        let machine = MachineId::new("machine3")?;
        let register = LogFileRegister::create(dir.path(), &machine).await?;
        assert_eq!(register.path(), dir.path().join("machine3_log.txt").as_path());

        let init = LogLine::Init {
            machine: machine.clone(),
            wall_time: Utc::now(),
            tick_rate: 2,
        };
        let event = LogLine::Event(EventRecord {
            machine: machine.clone(),
            wall_time: Utc::now(),
            logical_clock: 1,
            kind: EventKind::Internal,
        });
        register.register(&init).await;
        register.register(&event).await;
        register.flush().await;

        let contents = tokio::fs::read_to_string(register.path()).await?;
        let lines = contents
            .lines()
            .map(str::parse::<LogLine>)
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(lines.len(), 2);
        assert!(matches!(lines[0], LogLine::Init { tick_rate: 2, .. }));
        assert_eq!(lines[1].as_event().map(|e| e.logical_clock), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_fails() {
        let machine = MachineId::new("machine1").unwrap();
        let dir = Path::new("/nonexistent/dir/for/logs");
        let result = LogFileRegister::create(dir, &machine).await;
        assert!(result.is_err());
    }
}
