//! Durable write-ahead log backed by a single append-only text file.
//!
//! All writers funnel through one dedicated thread so concurrent log calls
//! become a serialized durable stream: each record is appended, flushed,
//! and fsynced before its caller is released. A failure in the write path
//! is fatal to the process, because continuing past an unacknowledged
//! suffix would corrupt record ordering.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::error;

use pact_commit::twopc::{CommitLog, LogRecord, Operation, TxState};

struct AppendWork {
    record: LogRecord,
    done: oneshot::Sender<()>,
}

/// File-backed `CommitLog` with a single-consumer writer thread.
pub struct FileWal {
    path: PathBuf,
    tx: mpsc::Sender<AppendWork>,
}

impl FileWal {
    /// Open (creating if needed) the log at `path` and start its writer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log {}", path.display()))?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("wal-writer".to_string())
            .spawn(move || wal_worker(file, rx))
            .context("spawn wal writer thread")?;

        Ok(Self { path, tx })
    }
}

#[async_trait]
impl CommitLog for FileWal {
    async fn write_op(
        &self,
        tx_id: &str,
        state: TxState,
        op: Operation,
        key: &str,
    ) -> Result<()> {
        let record = LogRecord {
            tx_id: tx_id.to_string(),
            state,
            op,
            key: key.to_string(),
        };
        let (done, ack) = oneshot::channel();
        self.tx
            .send(AppendWork { record, done })
            .map_err(|_| anyhow::anyhow!("wal writer stopped"))?;
        ack.await.context("wal append acknowledgement dropped")?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>> {
        read_log_records(&self.path)
    }
}

fn wal_worker(mut file: File, rx: mpsc::Receiver<AppendWork>) {
    while let Ok(work) = rx.recv() {
        if let Err(err) = append_record(&mut file, &work.record) {
            error!(error = %err, "wal write failed");
            std::process::exit(1);
        }
        let _ = work.done.send(());
    }
}

fn append_record(file: &mut File, record: &LogRecord) -> std::io::Result<()> {
    file.write_all(encode_record(record).as_bytes())?;
    file.flush()?;
    file.sync_all()
}

/// One CSV row per record: `tx_id,state,op,key`. The key is the final field
/// so it may contain commas; tx ids and state/op tokens never do.
fn encode_record(record: &LogRecord) -> String {
    format!(
        "{},{},{},{}\n",
        record.tx_id, record.state, record.op, record.key
    )
}

fn parse_record(line: &str) -> Result<LogRecord> {
    let mut fields = line.splitn(4, ',');
    let (Some(tx_id), Some(state), Some(op), Some(key)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        anyhow::bail!("malformed log row: {line:?}");
    };
    Ok(LogRecord {
        tx_id: tx_id.to_string(),
        state: TxState::parse(state).with_context(|| format!("bad state in log row: {line:?}"))?,
        op: Operation::parse(op).with_context(|| format!("bad op in log row: {line:?}"))?,
        key: key.to_string(),
    })
}

fn read_log_records(path: &Path) -> Result<Vec<LogRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        records.push(parse_record(&line)?);
    }
    Ok(records)
}
