//! CSR persistence: a binary round-trip format for this rank's local
//! matrix (via `bincode`, so a solve can be resumed without redoing
//! partitioning/neighbour discovery), and a plain-text format for
//! interop with systems that assemble the matrix outside this crate.

use std::io::{BufRead, BufReader, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SolverError};
use crate::matrix::LocalCsr;

/// The serializable form of a rank's local CSR block plus the partition
/// metadata needed to reconstruct a [`crate::matrix::DistributedMatrix`]
/// (via [`crate::matrix::DistributedMatrix::from_csr`]) without
/// re-deriving it from a full assembly step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrDump {
    pub rank: i32,
    pub counts: Vec<i32>,
    pub displacements: Vec<i32>,
    pub row_ptr: Vec<i32>,
    pub col_idx: Vec<i32>,
    pub values: Vec<f64>,
}

impl CsrDump {
    pub fn new(rank: i32, counts: Vec<i32>, displacements: Vec<i32>, local: &LocalCsr) -> Self {
        Self {
            rank,
            counts,
            displacements,
            row_ptr: local.row_ptr.clone(),
            col_idx: local.col_idx.clone(),
            values: local.values.clone(),
        }
    }

    pub fn into_local_csr(self) -> Result<LocalCsr> {
        LocalCsr::new(self.row_ptr, self.col_idx, self.values)
    }
}

/// Writes a [`CsrDump`] to `writer` in `bincode`'s compact binary form.
pub fn save_csr_format<W: Write>(dump: &CsrDump, mut writer: W) -> Result<()> {
    let bytes = bincode::serialize(dump)?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Reads a [`CsrDump`] back from `reader`.
pub fn load_csr_format<R: std::io::Read>(mut reader: R) -> Result<CsrDump> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let dump = bincode::deserialize(&bytes)?;
    Ok(dump)
}

/// Writes a [`CsrDump`] as whitespace-separated plain text: a header
/// line (`rank size nnz`), the counts line, the displacements line, then
/// one line per nonzero (`row col value`, row local to this rank, col
/// global). Meant for interop with tooling that assembles systems
/// outside this crate, not for performance.
pub fn save_csr_format_text<W: Write>(dump: &CsrDump, mut writer: W) -> Result<()> {
    writeln!(writer, "{} {} {}", dump.rank, dump.counts.len(), dump.values.len())?;
    writeln!(writer, "{}", dump.counts.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(" "))?;
    writeln!(writer, "{}", dump.displacements.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(" "))?;

    let rows = dump.row_ptr.len() - 1;
    for row in 0..rows {
        let start = dump.row_ptr[row] as usize;
        let end = dump.row_ptr[row + 1] as usize;
        for j in start..end {
            writeln!(writer, "{} {} {:.17e}", row, dump.col_idx[j], dump.values[j])?;
        }
    }
    Ok(())
}

fn parse_i32_line(line: &str) -> Result<Vec<i32>> {
    line.split_whitespace()
        .map(|tok| tok.parse::<i32>().map_err(|e| SolverError::Configuration(format!("expected an integer, got {tok:?}: {e}"))))
        .collect()
}

fn parse_f64_line(token: &str) -> Result<f64> {
    token
        .parse::<f64>()
        .map_err(|e| SolverError::Configuration(format!("expected a float, got {token:?}: {e}")))
}

/// Reads back the format [`save_csr_format_text`] writes. Rows are
/// expected in non-decreasing order; any row with no nonzero lines is
/// left empty in the reconstructed `row_ptr`.
pub fn load_csr_format_text<R: std::io::Read>(reader: R) -> Result<CsrDump> {
    let mut lines = BufReader::new(reader).lines();

    let header = lines
        .next()
        .ok_or_else(|| SolverError::Configuration("empty CSR text dump".into()))??;
    let header_fields = parse_i32_line(&header)?;
    let [rank, size, nnz]: [i32; 3] = header_fields
        .try_into()
        .map_err(|_| SolverError::Configuration("header line must have exactly 3 fields: rank size nnz".into()))?;

    let counts_line = lines
        .next()
        .ok_or_else(|| SolverError::Configuration("missing counts line".into()))??;
    let counts = parse_i32_line(&counts_line)?;
    if counts.len() != size as usize {
        return Err(SolverError::Configuration(format!("counts line has {} entries, header declared size {size}", counts.len())));
    }

    let displacements_line = lines
        .next()
        .ok_or_else(|| SolverError::Configuration("missing displacements line".into()))??;
    let displacements = parse_i32_line(&displacements_line)?;
    if displacements.len() != size as usize {
        return Err(SolverError::Configuration(format!(
            "displacements line has {} entries, header declared size {size}",
            displacements.len()
        )));
    }

    let rows_this_rank = counts[rank as usize] as usize;
    let mut row_counts = vec![0i32; rows_this_rank];
    let mut col_idx = Vec::with_capacity(nnz as usize);
    let mut values = Vec::with_capacity(nnz as usize);

    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let row: usize = fields
            .next()
            .ok_or_else(|| SolverError::Configuration("missing row field in nonzero line".into()))?
            .parse()
            .map_err(|e| SolverError::Configuration(format!("invalid row field: {e}")))?;
        let col: i32 = fields
            .next()
            .ok_or_else(|| SolverError::Configuration("missing col field in nonzero line".into()))?
            .parse()
            .map_err(|e| SolverError::Configuration(format!("invalid col field: {e}")))?;
        let value_token = fields.next().ok_or_else(|| SolverError::Configuration("missing value field in nonzero line".into()))?;
        let value = parse_f64_line(value_token)?;

        if row >= rows_this_rank {
            return Err(SolverError::Configuration(format!("row {row} is out of range for {rows_this_rank} local rows")));
        }
        row_counts[row] += 1;
        col_idx.push(col);
        values.push(value);
    }

    if col_idx.len() != nnz as usize {
        return Err(SolverError::Configuration(format!(
            "header declared {nnz} nonzeros, but {} nonzero lines were read",
            col_idx.len()
        )));
    }

    let mut row_ptr = vec![0i32; rows_this_rank + 1];
    for row in 0..rows_this_rank {
        row_ptr[row + 1] = row_ptr[row] + row_counts[row];
    }

    Ok(CsrDump {
        rank,
        counts,
        displacements,
        row_ptr,
        col_idx,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dump() -> CsrDump {
        let local = LocalCsr::new(vec![0, 2, 3], vec![0, 1, 2], vec![2.0, -1.0, 3.0]).unwrap();
        CsrDump::new(1, vec![2, 1], vec![0, 2], &local)
    }

    #[test]
    fn binary_round_trip_preserves_every_field() {
        let dump = sample_dump();
        let mut buf = Vec::new();
        save_csr_format(&dump, &mut buf).unwrap();
        let restored = load_csr_format(buf.as_slice()).unwrap();
        assert_eq!(restored.rank, dump.rank);
        assert_eq!(restored.counts, dump.counts);
        assert_eq!(restored.displacements, dump.displacements);
        assert_eq!(restored.row_ptr, dump.row_ptr);
        assert_eq!(restored.col_idx, dump.col_idx);
        assert_eq!(restored.values, dump.values);
    }

    #[test]
    fn text_round_trip_preserves_every_nonzero() {
        let dump = sample_dump();
        let mut buf = Vec::new();
        save_csr_format_text(&dump, &mut buf).unwrap();
        let restored = load_csr_format_text(buf.as_slice()).unwrap();
        assert_eq!(restored.rank, dump.rank);
        assert_eq!(restored.counts, dump.counts);
        assert_eq!(restored.displacements, dump.displacements);
        assert_eq!(restored.row_ptr, dump.row_ptr);
        assert_eq!(restored.col_idx, dump.col_idx);
        assert_eq!(restored.values, dump.values);
    }

    #[test]
    fn text_format_rejects_inconsistent_header() {
        let text = "0 1 1\n1\n0\n5 0 1.0\n";
        let err = load_csr_format_text(text.as_bytes()).unwrap_err();
        assert!(matches!(err, SolverError::Configuration(_)));
    }
}
