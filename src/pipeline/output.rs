use anyhow::Context as _;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::config::OutputSettings;
use crate::crawler::response::FileCell;
use crate::pipeline::{DataCell, DrainReport, Pipeline, PipelineError};
use crate::storage::{storage_name, DataSink};

enum Message {
    Data(DataCell),
    File { rule_name: String, file: FileCell },
}

enum State {
    Idle,
    Running {
        tx: mpsc::Sender<Message>,
        collector: JoinHandle<DrainReport>,
    },
    Drained,
}

/// Pipeline that batches data cells into a [`DataSink`] and writes files to disk.
///
/// A single collector task owns the buffer, so cells of one spider reach the sink
/// in the order they were collected.
pub struct OutputPipeline {
    spider: String,
    sink: Arc<dyn DataSink>,
    file_dir: PathBuf,
    batch_size: usize,
    buffer: usize,
    state: Mutex<State>,
}

impl OutputPipeline {
    pub fn new(spider: impl Into<String>, sink: Arc<dyn DataSink>, settings: &OutputSettings) -> Self {
        Self {
            spider: spider.into(),
            sink,
            file_dir: settings.file_dir.clone(),
            batch_size: settings.batch_size.max(1),
            buffer: settings.buffer.max(1),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn spider(&self) -> &str {
        &self.spider
    }

    async fn send(&self, message: Message) -> Result<(), PipelineError> {
        let tx = match &*self.state.lock().await {
            State::Running { tx, .. } => tx.clone(),
            State::Idle => return Err(PipelineError::NotStarted),
            State::Drained => return Err(PipelineError::Closed),
        };
        tx.send(message).await.map_err(|_| PipelineError::Closed)
    }
}

#[async_trait]
impl Pipeline for OutputPipeline {
    async fn start(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Running { .. }) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let collector = Collector {
            spider: self.spider.clone(),
            sink: Arc::clone(&self.sink),
            file_dir: self.file_dir.clone(),
            batch_size: self.batch_size,
            buffer: Vec::with_capacity(self.batch_size),
            report: DrainReport::default(),
        };
        *state = State::Running {
            tx,
            collector: tokio::spawn(collector.run(rx)),
        };

        debug!("Output pipeline started for {} ({})", self.spider, self.sink.kind());
        Ok(())
    }

    async fn collect_data(&self, cell: DataCell) -> Result<(), PipelineError> {
        self.send(Message::Data(cell)).await
    }

    async fn collect_file(&self, rule_name: &str, file: FileCell) -> Result<(), PipelineError> {
        self.send(Message::File {
            rule_name: rule_name.to_string(),
            file,
        })
        .await
    }

    async fn drain(&self) -> Result<DrainReport, PipelineError> {
        let previous = std::mem::replace(&mut *self.state.lock().await, State::Drained);
        match previous {
            State::Running { tx, collector } => {
                // Closing the channel lets the collector flush and exit
                drop(tx);
                let report = collector
                    .await
                    .map_err(|e| PipelineError::Collector(e.to_string()))?;
                info!(
                    "Output for {} drained: {} data, {} files, {} failed",
                    self.spider, report.data_written, report.files_written, report.failed
                );
                Ok(report)
            }
            State::Idle => Err(PipelineError::NotStarted),
            State::Drained => Ok(DrainReport::default()),
        }
    }
}

struct Collector {
    spider: String,
    sink: Arc<dyn DataSink>,
    file_dir: PathBuf,
    batch_size: usize,
    buffer: Vec<DataCell>,
    report: DrainReport,
}

impl Collector {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) -> DrainReport {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Data(cell) => {
                    self.buffer.push(cell);
                    if self.buffer.len() >= self.batch_size {
                        self.flush().await;
                    }
                }
                Message::File { rule_name, file } => self.write_file(&rule_name, file).await,
            }
        }
        self.flush().await;
        self.report
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        match self.write_batch(&batch).await {
            Ok(()) => self.report.data_written += batch.len(),
            Err(e) => {
                error!(
                    "Failed to write {} cells for {} to {}: {:#}",
                    batch.len(),
                    self.spider,
                    self.sink.kind(),
                    e
                );
                self.report.failed += batch.len();
            }
        }
    }

    /// Write a batch, reconnecting the sink and retrying once after a failure
    async fn write_batch(&self, batch: &[DataCell]) -> anyhow::Result<()> {
        let Err(e) = self.sink.write_batch(&self.spider, batch).await else {
            return Ok(());
        };
        warn!(
            "Write to {} failed for {}, reconnecting: {:#}",
            self.sink.kind(),
            self.spider,
            e
        );
        self.sink
            .refresh()
            .await
            .with_context(|| format!("Failed to refresh {} output", self.sink.kind()))?;
        self.sink.write_batch(&self.spider, batch).await
    }

    async fn write_file(&mut self, rule_name: &str, file: FileCell) {
        let name = file.name.clone();
        match store_file(&self.file_dir, &self.spider, rule_name, file).await {
            Ok(path) => {
                debug!("Saved file {}", path.display());
                self.report.files_written += 1;
            }
            Err(e) => {
                error!("Failed to save file {} for {}: {}", name, self.spider, e);
                self.report.failed += 1;
            }
        }
    }
}

/// Stream a file to `<root>/<spider>/<rule>/<name>`
async fn store_file(
    root: &Path,
    spider: &str,
    rule_name: &str,
    mut file: FileCell,
) -> std::io::Result<PathBuf> {
    let dir = root.join(storage_name(spider)).join(storage_name(rule_name));
    fs::create_dir_all(&dir).await?;

    let path = dir.join(file_name(&file.name));
    let mut out = fs::File::create(&path).await?;
    tokio::io::copy(&mut file.body, &mut out).await?;
    out.flush().await?;
    Ok(path)
}

/// Keep only the last path component, so names cannot escape the output directory
fn file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => "unnamed".to_string(),
        base => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::response::Item;
    use crate::storage::{MemorySink, MockDataSink, SinkKind};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(dir: &Path, batch_size: usize) -> OutputSettings {
        OutputSettings {
            batch_size,
            file_dir: dir.to_path_buf(),
            ..OutputSettings::default()
        }
    }

    fn cell(n: usize) -> DataCell {
        let mut item = Item::new();
        item.insert("n".into(), Value::from(n));
        DataCell::new("list", item, format!("https://a/{}", n), "https://a/")
    }

    #[tokio::test]
    async fn test_collect_before_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = OutputPipeline::new("books", Arc::new(MemorySink::new()), &settings(dir.path(), 2));
        let error = tokio_test::assert_err!(pipeline.collect_data(cell(0)).await);
        assert!(matches!(error, PipelineError::NotStarted));
        assert!(matches!(pipeline.drain().await, Err(PipelineError::NotStarted)));
    }

    #[tokio::test]
    async fn test_drain_flushes_partial_batches_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let pipeline = OutputPipeline::new("books", sink.clone(), &settings(dir.path(), 3));
        pipeline.start().await.unwrap();

        for n in 0..7 {
            tokio_test::assert_ok!(pipeline.collect_data(cell(n)).await);
        }
        let report = pipeline.drain().await.unwrap();

        assert_eq!(report.data_written, 7);
        assert_eq!(report.failed, 0);
        let stored = sink.cells_for("books").await;
        let order: Vec<u64> = stored.iter().map(|c| c.data["n"].as_u64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_collect_after_drain_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = OutputPipeline::new("books", Arc::new(MemorySink::new()), &settings(dir.path(), 1));
        pipeline.start().await.unwrap();
        pipeline.drain().await.unwrap();

        assert!(matches!(pipeline.collect_data(cell(1)).await, Err(PipelineError::Closed)));
        assert!(matches!(
            pipeline.collect_file("list", FileCell::from_bytes("a.txt", vec![1])).await,
            Err(PipelineError::Closed)
        ));
        assert_eq!(pipeline.drain().await.unwrap(), DrainReport::default());
    }

    #[tokio::test]
    async fn test_files_are_streamed_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = OutputPipeline::new("Books", Arc::new(MemorySink::new()), &settings(dir.path(), 1));
        pipeline.start().await.unwrap();

        pipeline
            .collect_file("cover", FileCell::from_bytes("../../etc/cover.png", b"png-bytes".to_vec()))
            .await
            .unwrap();
        let report = pipeline.drain().await.unwrap();

        assert_eq!(report.files_written, 1);
        let saved = dir.path().join("books").join("cover").join("cover.png");
        assert_eq!(std::fs::read(saved).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockDataSink::new();
        mock.expect_kind().return_const(SinkKind::Postgres);
        mock.expect_write_batch()
            .returning(|_, _| Err(anyhow::anyhow!("database is down")));
        mock.expect_refresh().returning(|| Ok(()));

        let pipeline = OutputPipeline::new("books", Arc::new(mock), &settings(dir.path(), 2));
        pipeline.start().await.unwrap();
        for n in 0..3 {
            pipeline.collect_data(cell(n)).await.unwrap();
        }
        let report = pipeline.drain().await.unwrap();

        assert_eq!(report.data_written, 0);
        assert_eq!(report.failed, 3);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mock = MockDataSink::new();
        mock.expect_kind().return_const(SinkKind::Redis);
        {
            let calls = Arc::clone(&calls);
            mock.expect_write_batch().returning(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("broken pipe"))
                } else {
                    Ok(())
                }
            });
        }
        mock.expect_refresh().times(1).returning(|| Ok(()));

        let pipeline = OutputPipeline::new("books", Arc::new(mock), &settings(dir.path(), 2));
        pipeline.start().await.unwrap();
        for n in 0..2 {
            pipeline.collect_data(cell(n)).await.unwrap();
        }
        let report = pipeline.drain().await.unwrap();

        assert_eq!(report.data_written, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_drops_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockDataSink::new();
        mock.expect_kind().return_const(SinkKind::MongoDb);
        mock.expect_write_batch()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("server selection timeout")));
        mock.expect_refresh()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("connection refused")));

        let pipeline = OutputPipeline::new("books", Arc::new(mock), &settings(dir.path(), 5));
        pipeline.start().await.unwrap();
        pipeline.collect_data(cell(0)).await.unwrap();
        let report = pipeline.drain().await.unwrap();

        assert_eq!(report.data_written, 0);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_file_name_strips_directories() {
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("..\\x.bin"), "x.bin");
        assert_eq!(file_name(".."), "unnamed");
        assert_eq!(file_name("dir/"), "unnamed");
    }
}
