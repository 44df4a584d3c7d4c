use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::models::TradeRow;
use crate::normalize::clean_field;

use super::ShardSpec;

/// Restart point inside a shard: the next data row to read and where it starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCursor {
    /// Data rows consumed so far (header excluded); also the offset of the next row.
    pub row: u64,
    pub byte: u64,
    pub line: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Malformed {
    FieldCount,
    Encoding,
    MissingTaxon,
    BadYear,
    BadQuantity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRow {
    Row(TradeRow),
    Malformed { offset: u64, reason: Malformed },
}

#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    year: usize,
    appendix: Option<usize>,
    taxon: usize,
    class: Option<usize>,
    order: Option<usize>,
    family: Option<usize>,
    genus: Option<usize>,
    term: usize,
    quantity: usize,
    unit: Option<usize>,
    importer: usize,
    exporter: usize,
    origin: Option<usize>,
    purpose: usize,
    source: usize,
    reporter_type: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord, path: &Path) -> Result<Self, ShardError> {
        let find = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
        let need = |name: &'static str| find(name).ok_or_else(|| ShardError::MissingColumn { path: path.to_path_buf(), column: name });
        Ok(Self {
            year: need("Year")?,
            appendix: find("Appendix"),
            taxon: need("Taxon")?,
            class: find("Class"),
            order: find("Order"),
            family: find("Family"),
            genus: find("Genus"),
            term: need("Term")?,
            quantity: need("Quantity")?,
            unit: find("Unit"),
            importer: need("Importer")?,
            exporter: need("Exporter")?,
            origin: find("Origin"),
            purpose: need("Purpose")?,
            source: need("Source")?,
            reporter_type: find("Reporter.type"),
        })
    }
}

/// Streams one partition file as typed rows. Memory use is one record at a
/// time; callers batch on top via [`ShardReader::next_batch`].
pub struct ShardReader {
    shard: ShardSpec,
    rdr: csv::Reader<File>,
    columns: ColumnMap,
    width: usize,
    cursor: ShardCursor,
    record: csv::ByteRecord,
    done: bool,
}

impl std::fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReader").field("shard", &self.shard).field("cursor", &self.cursor).finish()
    }
}

impl ShardReader {
    pub fn open(shard: &ShardSpec) -> Result<Self, ShardError> {
        Self::open_at(shard, ShardCursor::default())
    }

    /// Opens the shard and positions it at `cursor` without re-reading earlier rows.
    pub fn open_at(shard: &ShardSpec, cursor: ShardCursor) -> Result<Self, ShardError> {
        let path = &shard.path;
        let file = File::open(path).map_err(|source| ShardError::Io { path: path.clone(), source })?;
        let mut rdr = csv::ReaderBuilder::new().flexible(true).has_headers(true).from_reader(file);
        let headers = rdr.headers().map_err(|source| ShardError::Csv { path: path.clone(), source })?.clone();
        let columns = ColumnMap::from_headers(&headers, path)?;
        let mut start = cursor;
        if cursor.byte > 0 {
            let mut pos = csv::Position::new();
            pos.set_byte(cursor.byte).set_line(cursor.line).set_record(cursor.row + 1);
            rdr.seek(pos).map_err(|source| ShardError::Csv { path: path.clone(), source })?;
        } else {
            let pos = rdr.position();
            start = ShardCursor { row: 0, byte: pos.byte(), line: pos.line() };
        }
        Ok(Self { shard: shard.clone(), rdr, columns, width: headers.len(), cursor: start, record: csv::ByteRecord::new(), done: false })
    }

    pub fn shard(&self) -> &ShardSpec { &self.shard }

    /// Position of the next unread row; safe to persist and pass to [`open_at`](Self::open_at).
    pub fn cursor(&self) -> ShardCursor { self.cursor }

    pub fn is_done(&self) -> bool { self.done }

    /// Reads up to `max` rows into `out`, returning how many were consumed
    /// (valid and malformed). Zero means end of shard.
    pub fn next_batch(&mut self, max: usize, out: &mut Vec<ParsedRow>) -> Result<usize, ShardError> {
        let mut n = 0;
        while n < max {
            match self.next() {
                Some(Ok(row)) => { out.push(row); n += 1; }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(n)
    }

    fn parse_current(&self, offset: u64) -> ParsedRow {
        let malformed = |reason| ParsedRow::Malformed { offset, reason };
        if self.record.len() != self.width {
            return malformed(Malformed::FieldCount);
        }
        let rec = match csv::StringRecord::from_byte_record(self.record.clone()) {
            Ok(r) => r,
            Err(_) => return malformed(Malformed::Encoding),
        };
        let c = &self.columns;
        let get = |i: usize| rec.get(i).map(clean_field).unwrap_or_default();
        let opt = |i: Option<usize>| i.map(get).unwrap_or_default();

        let taxon = get(c.taxon);
        if taxon.is_empty() { return malformed(Malformed::MissingTaxon); }
        let Ok(year) = get(c.year).parse::<i32>() else { return malformed(Malformed::BadYear) };
        let q = get(c.quantity);
        let quantity = if q.is_empty() {
            None
        } else {
            match q.parse::<f64>() {
                Ok(v) if v.is_finite() => Some(v),
                _ => return malformed(Malformed::BadQuantity),
            }
        };
        ParsedRow::Row(TradeRow {
            source_shard: self.shard.id.index,
            source_offset: offset,
            year,
            appendix: opt(c.appendix),
            taxon,
            class: opt(c.class),
            order: opt(c.order),
            family: opt(c.family),
            genus: opt(c.genus),
            term: get(c.term),
            quantity,
            unit: opt(c.unit),
            importer: get(c.importer),
            exporter: get(c.exporter),
            origin: opt(c.origin),
            purpose: get(c.purpose),
            source: get(c.source),
            reporter_type: opt(c.reporter_type),
        })
    }
}

impl Iterator for ShardReader {
    type Item = Result<ParsedRow, ShardError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done { return None; }
        match self.rdr.read_byte_record(&mut self.record) {
            Ok(true) => {
                let offset = self.cursor.row;
                let parsed = self.parse_current(offset);
                let pos = self.rdr.position();
                self.cursor = ShardCursor { row: offset + 1, byte: pos.byte(), line: pos.line() };
                Some(Ok(parsed))
            }
            Ok(false) => { self.done = true; None }
            Err(source) => {
                self.done = true;
                Some(Err(ShardError::Csv { path: self.shard.path.clone(), source }))
            }
        }
    }
}
