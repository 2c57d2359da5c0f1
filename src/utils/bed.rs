use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use log::info;


/// Half-open BED interval, 0-based start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedInterval {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}


/// Merges low-coverage positions into BED intervals.
/// Input rows are `chrom<TAB>pos<TAB>depth` with 1-based positions, as
/// written by `samtools depth` filtered on depth. Consecutive positions on
/// the same chromosome collapse into one interval.
///
/// # Arguments
///
/// * `reader` - Low-coverage position rows.
///
/// # Returns
/// Intervals in input order.
pub fn low_coverage_intervals<R: BufRead>(reader: R) -> Result<Vec<BedInterval>> {
    let mut intervals: Vec<BedInterval> = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').collect();
        if fields.len() < 2 {
            return Err(anyhow!(
                "Invalid coverage line {}: expected at least 2 fields, found {} in line: '{}'",
                line_no + 1,
                fields.len(),
                line
            ));
        }
        let chrom = fields[0];
        let pos: u64 = fields[1]
            .parse()
            .map_err(|e| anyhow!("Invalid position on coverage line {}: '{}' ({})", line_no + 1, fields[1], e))?;
        if pos == 0 {
            return Err(anyhow!("Invalid position on coverage line {}: positions are 1-based", line_no + 1));
        }

        match intervals.last_mut() {
            Some(last) if last.chrom == chrom && last.end == pos - 1 => {
                last.end = pos;
            }
            _ => intervals.push(BedInterval {
                chrom: chrom.to_string(),
                start: pos - 1,
                end: pos,
            }),
        }
    }

    Ok(intervals)
}


pub fn write_bed<W: Write>(writer: &mut W, intervals: &[BedInterval]) -> std::io::Result<()> {
    for interval in intervals {
        writeln!(writer, "{}\t{}\t{}", interval.chrom, interval.start, interval.end)?;
    }
    writer.flush()
}


/// Entry point of the `mask_regions` module: coverage rows in, BED out.
pub fn mask_regions(sample: &str, coverage: &Path, bed_out: &Path) -> Result<usize> {
    let reader = BufReader::new(
        File::open(coverage).map_err(|e| anyhow!("Cannot open {}: {}", coverage.display(), e))?,
    );
    let intervals = low_coverage_intervals(reader)?;

    let mut writer = BufWriter::new(
        File::create(bed_out).map_err(|e| anyhow!("Cannot create {}: {}", bed_out.display(), e))?,
    );
    write_bed(&mut writer, &intervals)?;

    info!("{}: {} masked region(s) written to {}", sample, intervals.len(), bed_out.display());
    Ok(intervals.len())
}
