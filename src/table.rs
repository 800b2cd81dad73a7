//! Per-shard metadata table for keyed packaging, stored as Parquet.
//!
//! One row per successfully archived member. The table is built while the shard is filled and
//! written once, after the archive is closed; it is never rewritten afterwards.

use std::path::Path;
use std::sync::Arc;

use parquet::data_type::{ByteArray, ByteArrayType};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

const SCHEMA: &str = "message shard_metadata {
    REQUIRED BINARY key (UTF8);
    REQUIRED BINARY status (UTF8);
    OPTIONAL BINARY error_message (UTF8);
    REQUIRED BINARY caption (UTF8);
    REQUIRED BINARY original_dataset (UTF8);
    REQUIRED BINARY original_split (UTF8);
    REQUIRED BINARY original_metadata (UTF8);
}";

/// One table row. `original_metadata` is stored as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub key: String,
    pub status: String,
    pub error_message: Option<String>,
    pub caption: String,
    pub original_dataset: String,
    pub original_split: String,
    pub original_metadata: Value,
}

/// Rows for one shard.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    rows: Vec<TableRow>,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: TableRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    /// Write the table to `path` via a temporary file in the same directory and an atomic
    /// rename.
    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::msg(format!("table path has no parent: {}", path.display())))?;
        let tmp = tempfile::Builder::new()
            .prefix(".table.")
            .suffix(".parquet.part")
            .tempfile_in(dir)
            .map_err(Error::write_io(dir))?;
        let file = tmp.as_file().try_clone().map_err(Error::write_io(tmp.path()))?;

        let schema = Arc::new(parse_message_type(SCHEMA)?);
        let props = Arc::new(WriterProperties::builder().build());
        let mut writer = SerializedFileWriter::new(file, schema, props)?;
        let mut row_group = writer.next_row_group()?;

        let metadata_json = self
            .rows
            .iter()
            .map(|r| serde_json::to_string(&r.original_metadata))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut column = 0usize;
        while let Some(mut col_writer) = row_group.next_column()? {
            let typed = col_writer.typed::<ByteArrayType>();
            match column {
                0 => typed.write_batch(&self.strings(|r| &r.key), None, None)?,
                1 => typed.write_batch(&self.strings(|r| &r.status), None, None)?,
                2 => {
                    let values: Vec<ByteArray> = self
                        .rows
                        .iter()
                        .filter_map(|r| r.error_message.as_deref().map(ByteArray::from))
                        .collect();
                    let def_levels: Vec<i16> = self
                        .rows
                        .iter()
                        .map(|r| i16::from(r.error_message.is_some()))
                        .collect();
                    typed.write_batch(&values, Some(&def_levels), None)?
                }
                3 => typed.write_batch(&self.strings(|r| &r.caption), None, None)?,
                4 => typed.write_batch(&self.strings(|r| &r.original_dataset), None, None)?,
                5 => typed.write_batch(&self.strings(|r| &r.original_split), None, None)?,
                6 => {
                    let values: Vec<ByteArray> =
                        metadata_json.iter().map(|s| ByteArray::from(s.as_str())).collect();
                    typed.write_batch(&values, None, None)?
                }
                _ => return Err(Error::msg("metadata table schema has unexpected columns")),
            };
            col_writer.close()?;
            column += 1;
        }

        row_group.close()?;
        writer.close()?;

        tmp.as_file().sync_all().map_err(Error::write_io(tmp.path()))?;
        tmp.persist(path)
            .map_err(|err| Error::write_io(path)(err.error))?;
        Ok(())
    }

    fn strings(&self, field: impl Fn(&TableRow) -> &String) -> Vec<ByteArray> {
        self.rows
            .iter()
            .map(|r| ByteArray::from(field(r).as_str()))
            .collect()
    }
}
