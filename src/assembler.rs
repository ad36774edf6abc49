use std::io::{self, Write};

use crate::error::{AssembleError, SinkWriteError};
use crate::mapper::OutputRow;
use crate::schema::ColumnLayout;

/// Serializes rows against a fixed column layout, header first.
///
/// Quoting is RFC 4180 style: a cell is quoted only when it holds the
/// delimiter, a quote, or a line break, and quotes are doubled.
pub struct CsvEmitter<W: Write> {
    writer: csv::Writer<W>,
    layout: ColumnLayout,
    target: String,
    rows_written: usize,
}

impl<W: Write> CsvEmitter<W> {
    pub fn new(inner: W, layout: &ColumnLayout, target: impl Into<String>) -> Result<Self, SinkWriteError> {
        let target = target.into();
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(inner);
        writer.write_record(&layout.columns).map_err(|e| SinkWriteError {
            target: target.clone(),
            source: e.into(),
        })?;
        Ok(Self {
            writer,
            layout: layout.clone(),
            target,
            rows_written: 0,
        })
    }

    /// Write one row, checking it has exactly the layout's columns.
    pub fn write_row(&mut self, row: &OutputRow) -> Result<(), AssembleError> {
        if row.fields.len() != self.layout.len() {
            return Err(AssembleError::ColumnCount {
                patient_id: row.patient_id.clone(),
                expected: self.layout.len(),
                actual: row.fields.len(),
            });
        }
        let mut cells = Vec::with_capacity(self.layout.len());
        for column in &self.layout.columns {
            let cell = row.fields.get(column).ok_or_else(|| AssembleError::IncompleteRow {
                patient_id: row.patient_id.clone(),
                column: column.clone(),
            })?;
            cells.push(cell.as_str());
        }
        self.writer.write_record(&cells).map_err(|e| SinkWriteError {
            target: self.target.clone(),
            source: e.into(),
        })?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(self) -> Result<W, SinkWriteError> {
        let target = self.target;
        self.writer.into_inner().map_err(|e| SinkWriteError {
            target,
            source: e.into_error(),
        })
    }
}

/// Serialize rows to CSV text in memory.
pub fn assemble(rows: &[OutputRow], layout: &ColumnLayout) -> Result<String, AssembleError> {
    let mut emitter = CsvEmitter::new(Vec::new(), layout, "memory")?;
    for row in rows {
        emitter.write_row(row)?;
    }
    let bytes = emitter.finish()?;
    String::from_utf8(bytes).map_err(|e| {
        AssembleError::Sink(SinkWriteError {
            target: "memory".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    })
}
