//! Readout persistence.
//!
//! The pipeline treats storage as an opaque seam: anything implementing
//! [`ReadoutWriter`] can receive assembled readouts. The in-tree
//! implementation appends encoded readouts to a framed raw file; table-based
//! backends plug in behind the same trait.

use crate::data::Readout;
use crate::error::{DaqError, DaqResult};
use crate::io::raw::{ContentType, RawObjectWriter};
use crate::net::subscriber::ReadoutSubscriber;
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};

/// The `WriteReadout` persistence contract.
#[async_trait]
pub trait ReadoutWriter: Send {
    async fn write_readout(&mut self, readout: &Readout) -> DaqResult<()>;

    /// Readouts written to the current file.
    fn data_counter(&self) -> u64;

    /// Bytes on disk for the current file.
    fn bytes_written(&self) -> DaqResult<u64>;

    /// Flushes buffers and closes the file handle.
    async fn close(&mut self) -> DaqResult<()>;
}

/// Framed raw-file readout writer.
pub struct ReadoutFileWriter {
    writer: Option<RawObjectWriter>,
}

impl ReadoutFileWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Ok(Self {
            writer: Some(RawObjectWriter::create(path, ContentType::Readout)?),
        })
    }

    /// Bunched (compressed) variant.
    pub fn create_bunched<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Ok(Self {
            writer: Some(RawObjectWriter::create_bunched(path, ContentType::Readout)?),
        })
    }

    fn inner(&self) -> DaqResult<&RawObjectWriter> {
        self.writer
            .as_ref()
            .ok_or_else(|| DaqError::MalformedRecord("writer already closed".into()))
    }
}

#[async_trait]
impl ReadoutWriter for ReadoutFileWriter {
    async fn write_readout(&mut self, readout: &Readout) -> DaqResult<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(&readout.encode()),
            None => Err(DaqError::MalformedRecord("writer already closed".into())),
        }
    }

    fn data_counter(&self) -> u64 {
        self.writer.as_ref().map(|w| w.data_counter()).unwrap_or(0)
    }

    fn bytes_written(&self) -> DaqResult<u64> {
        self.inner()?.bytes_written()
    }

    async fn close(&mut self) -> DaqResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        Ok(())
    }
}

/// How rotated files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEnumerator {
    /// `prefix2024-05-01.13:37.ext`
    Date,
    /// `prefix001.ext`, `prefix002.ext`, ...
    Order,
}

/// File naming and rotation policy for [`WriterSubscriber`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub folder: PathBuf,
    pub file_prefix: String,
    pub file_ext: String,
    pub file_enumerator: Option<FileEnumerator>,
    /// Rotate once the current file exceeds this many MiB.
    pub filesize_lim_mb: Option<u64>,
}

impl WriterConfig {
    fn next_path(&self, file_counter: u32) -> PathBuf {
        let suffix = match self.file_enumerator {
            Some(FileEnumerator::Date) => {
                chrono::Utc::now().format("%Y-%m-%d.%H:%M").to_string()
            }
            Some(FileEnumerator::Order) => format!("{:03}", file_counter),
            None => String::new(),
        };
        self.folder
            .join(format!("{}{}{}", self.file_prefix, suffix, self.file_ext))
    }
}

/// Drains a readout subscription into rotating files.
pub struct WriterSubscriber<F>
where
    F: FnMut(&Path) -> DaqResult<Box<dyn ReadoutWriter>>,
{
    config: WriterConfig,
    factory: F,
    writer: Box<dyn ReadoutWriter>,
    current_path: PathBuf,
    file_counter: u32,
    data_counter: u64,
}

impl<F> WriterSubscriber<F>
where
    F: FnMut(&Path) -> DaqResult<Box<dyn ReadoutWriter>>,
{
    pub fn new(config: WriterConfig, mut factory: F) -> DaqResult<Self> {
        let path = config.next_path(1);
        let writer = factory(&path)?;
        info!("Opened new file, will write readouts to {}", path.display());
        Ok(Self {
            config,
            factory,
            writer,
            current_path: path,
            file_counter: 1,
            data_counter: 0,
        })
    }

    /// Consumes the subscription until the stream closes or the stop signal
    /// fires, then closes the current file. Malformed frames are logged and
    /// skipped.
    pub async fn run(
        mut self,
        mut subscriber: ReadoutSubscriber,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> DaqResult<u64> {
        let mut stopping = false;
        loop {
            let next = tokio::select! {
                next = subscriber.recv() => next,
                res = stop.changed(), if !stopping => {
                    if res.is_err() || *stop.borrow() {
                        stopping = true;
                        subscriber.close(false);
                    }
                    continue;
                }
            };
            match next {
                Some(Ok(readout)) => {
                    if let Err(e) = self.write_and_rotate(&readout).await {
                        // Close whatever we have on disk before giving up.
                        if let Err(close_err) = self.close_current().await {
                            warn!("Close after write failure also failed: {}", close_err);
                        }
                        return Err(e);
                    }
                }
                Some(Err(e)) => warn!("Skipping malformed readout frame: {}", e),
                None => break,
            }
        }
        self.close_current().await?;
        Ok(self.data_counter)
    }

    async fn write_and_rotate(&mut self, readout: &Readout) -> DaqResult<()> {
        self.writer.write_readout(readout).await?;
        self.data_counter += 1;
        self.maybe_rotate().await
    }

    async fn maybe_rotate(&mut self) -> DaqResult<()> {
        let Some(lim_mb) = self.config.filesize_lim_mb else {
            return Ok(());
        };
        if self.writer.bytes_written()? < lim_mb * 1024 * 1024 {
            return Ok(());
        }
        self.close_current().await?;
        self.file_counter += 1;
        let path = self.config.next_path(self.file_counter);
        self.writer = (self.factory)(&path)?;
        self.current_path = path;
        info!(
            "Opened new file, will write readouts to {}",
            self.current_path.display()
        );
        Ok(())
    }

    async fn close_current(&mut self) -> DaqResult<()> {
        let written = self.writer.data_counter();
        self.writer.close().await?;
        info!(
            "Closed file {} after {} readouts",
            self.current_path.display(),
            written
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raw::RawObjectReader;

    #[tokio::test]
    async fn file_writer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readouts.dat");
        let mut writer = ReadoutFileWriter::create(&path).unwrap();
        let readout = Readout::new(1, 100, 2, 3);
        writer.write_readout(&readout).await.unwrap();
        assert_eq!(writer.data_counter(), 1);
        writer.close().await.unwrap();

        let mut reader = RawObjectReader::open(&path).unwrap();
        assert_eq!(reader.content_type(), Some(ContentType::Readout));
        let decoded = Readout::decode(&reader.read_at(0).unwrap()).unwrap();
        assert_eq!(decoded.iro, 1);
        assert_eq!(decoded.time, 100);
    }

    #[test]
    fn order_enumerator_names_files() {
        let config = WriterConfig {
            folder: PathBuf::from("/data"),
            file_prefix: "run42_".into(),
            file_ext: ".dat".into(),
            file_enumerator: Some(FileEnumerator::Order),
            filesize_lim_mb: Some(100),
        };
        assert_eq!(config.next_path(7), PathBuf::from("/data/run42_007.dat"));
    }
}
