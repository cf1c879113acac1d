use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Where an asset's bytes end up.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    /// Written to `<path>.partial` and renamed into place once complete.
    File(PathBuf),
    Memory(MemorySink),
}

/// Shared in-memory destination. Clones see the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(self: &Self) -> Vec<u8> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(self: &Self, bytes: Vec<u8>) {
        *self.buffer.lock().unwrap_or_else(PoisonError::into_inner) = bytes;
    }
}

impl SinkTarget {
    /// Start a fresh write. Anything left over from an earlier attempt is
    /// truncated.
    pub(crate) async fn open(self: &Self) -> io::Result<SinkWriter> {
        match self {
            Self::File(destination) => {
                if let Some(parent) = destination.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).await?;
                    }
                }
                let partial = partial_path(destination);
                let file = File::create(&partial).await?;
                Ok(SinkWriter::File {
                    file,
                    partial,
                    destination: destination.clone(),
                    written: 0,
                })
            }
            Self::Memory(sink) => Ok(SinkWriter::Memory {
                sink: sink.clone(),
                staged: Vec::new(),
            }),
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

pub(crate) enum SinkWriter {
    File {
        file: File,
        partial: PathBuf,
        destination: PathBuf,
        written: u64,
    },
    Memory {
        sink: MemorySink,
        staged: Vec<u8>,
    },
}

impl SinkWriter {
    pub async fn write(self: &mut Self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Self::File { file, written, .. } => {
                file.write_all(chunk).await?;
                *written += chunk.len() as u64;
            }
            Self::Memory { staged, .. } => staged.extend_from_slice(chunk),
        }
        Ok(())
    }

    /// Flush and publish; returns the number of bytes written.
    pub async fn finish(self) -> io::Result<u64> {
        match self {
            Self::File {
                mut file,
                partial,
                destination,
                written,
            } => {
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                fs::rename(&partial, &destination).await?;
                Ok(written)
            }
            Self::Memory { sink, staged } => {
                let written = staged.len() as u64;
                sink.replace(staged);
                Ok(written)
            }
        }
    }

    /// Throw away a write that will not be completed.
    pub async fn discard(self) {
        if let Self::File { file, partial, .. } = self {
            drop(file);
            if let Err(err) = fs::remove_file(&partial).await {
                tracing::debug!(path = %partial.display(), error = %err, "Unable to remove partial file");
            }
        }
    }
}
