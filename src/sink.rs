use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::assembler::CsvEmitter;
use crate::error::{AssembleError, SinkWriteError};
use crate::mapper::OutputRow;
use crate::schema::ColumnLayout;

/// Where the CSV artifact goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Stdout => write!(f, "stdout"),
            OutputTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Whether a failed run may leave a partial artifact behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Nothing becomes visible until the run commits.
    #[default]
    Atomic,
    /// Rows are written as they are produced.
    Streaming,
}

enum Backing {
    /// Renamed over the target on commit, deleted on drop.
    Temp { file: NamedTempFile, path: PathBuf },
    File(BufWriter<File>),
    /// Stdout output held back until commit.
    Buffer(Vec<u8>),
    Stdout(io::Stdout),
}

impl Write for Backing {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Backing::Temp { file, .. } => file.write(buf),
            Backing::File(w) => w.write(buf),
            Backing::Buffer(b) => b.write(buf),
            Backing::Stdout(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Backing::Temp { file, .. } => file.flush(),
            Backing::File(w) => w.flush(),
            Backing::Buffer(_) => Ok(()),
            Backing::Stdout(s) => s.flush(),
        }
    }
}

/// Single writer for a run's rows.
///
/// Dropping an atomic sink without [`RowSink::commit`] discards everything
/// written to it.
pub struct RowSink {
    emitter: CsvEmitter<Backing>,
    target: OutputTarget,
}

impl RowSink {
    pub fn open(target: &OutputTarget, mode: OutputMode, layout: &ColumnLayout) -> Result<Self, SinkWriteError> {
        let sink_error = |source: io::Error| SinkWriteError {
            target: target.to_string(),
            source,
        };
        let backing = match (target, mode) {
            (OutputTarget::Stdout, OutputMode::Atomic) => Backing::Buffer(Vec::new()),
            (OutputTarget::Stdout, OutputMode::Streaming) => Backing::Stdout(io::stdout()),
            (OutputTarget::File(path), OutputMode::Atomic) => {
                let file = NamedTempFile::new_in(parent_dir(path)).map_err(sink_error)?;
                Backing::Temp {
                    file,
                    path: path.clone(),
                }
            }
            (OutputTarget::File(path), OutputMode::Streaming) => {
                Backing::File(BufWriter::new(File::create(path).map_err(sink_error)?))
            }
        };
        Ok(Self {
            emitter: CsvEmitter::new(backing, layout, target.to_string())?,
            target: target.clone(),
        })
    }

    pub fn write_row(&mut self, row: &OutputRow) -> Result<(), AssembleError> {
        self.emitter.write_row(row)
    }

    pub fn write_rows(&mut self, rows: &[OutputRow]) -> Result<(), AssembleError> {
        rows.iter().try_for_each(|row| self.write_row(row))
    }

    /// Make the artifact visible. Returns the number of data rows written.
    pub fn commit(self) -> Result<usize, SinkWriteError> {
        let rows = self.emitter.rows_written();
        let sink_error = |source: io::Error| SinkWriteError {
            target: self.target.to_string(),
            source,
        };
        match self.emitter.finish()? {
            Backing::Temp { file, path } => {
                file.persist(&path).map_err(|e| sink_error(e.error))?;
            }
            Backing::File(mut w) => w.flush().map_err(sink_error)?,
            Backing::Buffer(bytes) => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(&bytes).map_err(sink_error)?;
                stdout.flush().map_err(sink_error)?;
            }
            Backing::Stdout(mut s) => s.flush().map_err(sink_error)?,
        }
        tracing::info!(output = %self.target, rows, "Wrote CSV output");
        Ok(rows)
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
