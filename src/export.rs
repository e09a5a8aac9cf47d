//! CSV export of a sealed sweep.
//!
//! Two files per measurement, both consumed by the plotting tools:
//!
//! `<name>.csv`, the Vpp series:
//! ```text
//! Angle (degrees),Vpp [V]
//! 0,4.96
//! 1,5.02
//! ```
//!
//! `<name>_FFT.csv`, the waterfall matrix:
//! ```text
//! Start frequency [Hz],End frequency [Hz],Point count,Vertical scale,Vertical offset,Time scale [s]
//! 0,10000,1000,10,-50,0.01
//! Angle (degrees),FFT values
//! 0,31,30,29,...          <- degree, then point-count amplitudes
//! ```
//!
//! The column layout is fixed; readers index the second row for the axis and
//! everything from the fourth row on as data. Incomplete sweeps carry an
//! `_INCOMPLETE` suffix in both file names.

use crate::error::DaqError;
use crate::sweep::{FftAxis, Sweep};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Header of the Vpp series
pub const SCALAR_HEADER: [&str; 2] = ["Angle (degrees)", "Vpp [V]"];

/// Names of the FFT axis values (first row of the matrix)
pub const FFT_AXIS_HEADER: [&str; 6] = [
    "Start frequency [Hz]",
    "End frequency [Hz]",
    "Point count",
    "Vertical scale",
    "Vertical offset",
    "Time scale [s]",
];

/// Column labels preceding the matrix rows (third row)
pub const FFT_COLUMN_LABELS: [&str; 2] = ["Angle (degrees)", "FFT values"];

/// File name suffix for sweeps that did not complete
pub const INCOMPLETE_SUFFIX: &str = "_INCOMPLETE";

/// File name suffix of the FFT matrix
pub const FFT_SUFFIX: &str = "_FFT";

/// Paths written for one measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    /// Vpp series
    pub scalar: PathBuf,
    /// FFT matrix
    pub fft: PathBuf,
}

/// Writes sweeps into an output directory
#[derive(Debug, Clone)]
pub struct Exporter {
    output_dir: PathBuf,
}

impl Exporter {
    /// Exporter writing into `output_dir` (created on first export)
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// File paths for a measurement name.
    ///
    /// The name is reduced to its file stem, so `"run1.csv"` and `"run1"` give
    /// the same files.
    pub fn paths_for(&self, name: &str, complete: bool) -> Result<ExportPaths, DaqError> {
        let stem = Path::new(name.trim())
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DaqError::Export(format!("invalid measurement name '{name}'")))?;
        let suffix = if complete { "" } else { INCOMPLETE_SUFFIX };

        Ok(ExportPaths {
            scalar: self.output_dir.join(format!("{stem}{suffix}.csv")),
            fft: self.output_dir.join(format!("{stem}{FFT_SUFFIX}{suffix}.csv")),
        })
    }

    /// Write both artifacts for a sweep.
    ///
    /// The sweep is validated before any file is created.
    pub fn export(&self, name: &str, sweep: &Sweep) -> Result<ExportPaths, DaqError> {
        validate(sweep)?;
        let paths = self.paths_for(name, sweep.is_complete())?;

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            DaqError::Export(format!(
                "failed to create output directory {}: {e}",
                self.output_dir.display()
            ))
        })?;

        write_scalar_series(sweep, create(&paths.scalar)?)?;
        write_fft_matrix(sweep, create(&paths.fft)?)?;

        info!(
            scalar = %paths.scalar.display(),
            fft = %paths.fft.display(),
            buckets = sweep.len(),
            complete = sweep.is_complete(),
            "Sweep exported"
        );
        Ok(paths)
    }
}

fn create(path: &Path) -> Result<File, DaqError> {
    File::create(path)
        .map_err(|e| DaqError::Export(format!("failed to create {}: {e}", path.display())))
}

/// Check the export invariants: strictly increasing degrees, every spectrum
/// exactly `point_count` long.
pub fn validate(sweep: &Sweep) -> Result<(), DaqError> {
    let expected = sweep.axis().point_count;
    let mut previous: Option<u16> = None;
    for bucket in sweep.buckets() {
        if bucket.spectrum.len() != expected {
            return Err(DaqError::Export(format!(
                "degree {} has {} amplitudes, row needs exactly {}",
                bucket.degree,
                bucket.spectrum.len(),
                expected
            )));
        }
        if previous.is_some_and(|p| bucket.degree <= p) {
            return Err(DaqError::Export(format!(
                "degree {} is out of order",
                bucket.degree
            )));
        }
        previous = Some(bucket.degree);
    }
    Ok(())
}

/// Write the Vpp series.
pub fn write_scalar_series<W: Write>(sweep: &Sweep, writer: W) -> Result<(), DaqError> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(SCALAR_HEADER)?;
    for bucket in sweep.buckets() {
        csv.write_record([bucket.degree.to_string(), bucket.vpp.to_string()])?;
    }
    csv.flush()?;
    Ok(())
}

/// Write the FFT matrix.
pub fn write_fft_matrix<W: Write>(sweep: &Sweep, writer: W) -> Result<(), DaqError> {
    validate(sweep)?;
    let axis = sweep.axis();
    let mut csv = csv::WriterBuilder::new().flexible(true).from_writer(writer);

    csv.write_record(FFT_AXIS_HEADER)?;
    csv.write_record([
        axis.start_frequency_hz.to_string(),
        axis.end_frequency_hz.to_string(),
        axis.point_count.to_string(),
        axis.vertical_scale.to_string(),
        axis.vertical_offset.to_string(),
        axis.time_scale_s.to_string(),
    ])?;
    csv.write_record(FFT_COLUMN_LABELS)?;

    let mut row: Vec<String> = Vec::with_capacity(axis.point_count + 1);
    for bucket in sweep.buckets() {
        row.clear();
        row.push(bucket.degree.to_string());
        row.extend(bucket.spectrum.iter().map(u8::to_string));
        csv.write_record(&row)?;
    }
    csv.flush()?;
    Ok(())
}

/// Vpp series read back from disk
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarSeries {
    /// `(degree, vpp)` pairs in file order
    pub rows: Vec<(u16, f64)>,
}

/// FFT matrix read back from disk
#[derive(Debug, Clone, PartialEq)]
pub struct FftMatrix {
    /// Axis values from the second row
    pub axis: FftAxis,
    /// `(degree, amplitudes)` rows in file order
    pub rows: Vec<(u16, Vec<u8>)>,
}

fn field<'r>(record: &'r csv::StringRecord, index: usize, row: usize) -> Result<&'r str, DaqError> {
    record
        .get(index)
        .ok_or_else(|| DaqError::Export(format!("row {row} is missing column {index}")))
}

fn parse<T: std::str::FromStr>(value: &str, what: &str, row: usize) -> Result<T, DaqError> {
    value
        .trim()
        .parse()
        .map_err(|_| DaqError::Export(format!("row {row}: invalid {what} '{value}'")))
}

fn expect_header(record: Option<csv::StringRecord>, expected: &[&str], row: usize) -> Result<(), DaqError> {
    let record = record.ok_or_else(|| DaqError::Export(format!("missing header row {row}")))?;
    if record.iter().ne(expected.iter().copied()) {
        return Err(DaqError::Export(format!(
            "row {row}: expected header {expected:?}, found {:?}",
            record.iter().collect::<Vec<_>>()
        )));
    }
    Ok(())
}

/// Read a Vpp series written by [`write_scalar_series`].
pub fn read_scalar_series<R: Read>(reader: R) -> Result<ScalarSeries, DaqError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(reader);
    let mut records = csv.records();

    expect_header(records.next().transpose()?, &SCALAR_HEADER, 0)?;

    let mut rows = Vec::new();
    for (index, record) in records.enumerate() {
        let record = record?;
        let row = index + 1;
        let degree = parse(field(&record, 0, row)?, "degree", row)?;
        let vpp = parse(field(&record, 1, row)?, "Vpp", row)?;
        rows.push((degree, vpp));
    }
    Ok(ScalarSeries { rows })
}

/// Read an FFT matrix written by [`write_fft_matrix`], checking every row width.
pub fn read_fft_matrix<R: Read>(reader: R) -> Result<FftMatrix, DaqError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut records = csv.records();

    expect_header(records.next().transpose()?, &FFT_AXIS_HEADER, 0)?;
    let values = records
        .next()
        .transpose()?
        .ok_or_else(|| DaqError::Export("missing FFT axis row".into()))?;
    let axis = FftAxis {
        start_frequency_hz: parse(field(&values, 0, 1)?, "start frequency", 1)?,
        end_frequency_hz: parse(field(&values, 1, 1)?, "end frequency", 1)?,
        point_count: parse(field(&values, 2, 1)?, "point count", 1)?,
        vertical_scale: parse(field(&values, 3, 1)?, "vertical scale", 1)?,
        vertical_offset: parse(field(&values, 4, 1)?, "vertical offset", 1)?,
        time_scale_s: parse(field(&values, 5, 1)?, "time scale", 1)?,
    };
    expect_header(records.next().transpose()?, &FFT_COLUMN_LABELS, 2)?;

    let mut rows = Vec::new();
    for (index, record) in records.enumerate() {
        let record = record?;
        let row = index + 3;
        if record.len() != axis.point_count + 1 {
            return Err(DaqError::Export(format!(
                "row {row} has {} columns, expected {}",
                record.len(),
                axis.point_count + 1
            )));
        }
        let degree = parse(field(&record, 0, row)?, "degree", row)?;
        let amplitudes = record
            .iter()
            .skip(1)
            .map(|v| parse::<u8>(v, "amplitude", row))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push((degree, amplitudes));
    }
    Ok(FftMatrix { axis, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{DegreeBucket, SweepStatus};
    use chrono::Utc;

    fn axis(points: usize) -> FftAxis {
        FftAxis {
            start_frequency_hz: 0.0,
            end_frequency_hz: 10_000.0,
            point_count: points,
            vertical_scale: 10.0,
            vertical_offset: -50.0,
            time_scale_s: 0.01,
        }
    }

    fn sweep(buckets: Vec<DegreeBucket>, points: usize) -> Sweep {
        Sweep::from_parts(360, axis(points), buckets, SweepStatus::Complete, Utc::now())
    }

    fn bucket(degree: u16, vpp: f64, spectrum: Vec<u8>) -> DegreeBucket {
        DegreeBucket {
            degree,
            vpp,
            spectrum,
        }
    }

    #[test]
    fn test_fft_matrix_layout() {
        let sweep = sweep(
            vec![bucket(0, 1.0, vec![1, 2, 3]), bucket(1, 2.0, vec![4, 5, 6])],
            3,
        );
        let mut out = Vec::new();
        write_fft_matrix(&sweep, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Start frequency [Hz],End frequency [Hz],Point count,Vertical scale,Vertical offset,Time scale [s]",
                "0,10000,3,10,-50,0.01",
                "Angle (degrees),FFT values",
                "0,1,2,3",
                "1,4,5,6",
            ]
        );
    }

    #[test]
    fn test_row_width_violation_is_rejected() {
        let sweep = sweep(
            vec![bucket(0, 1.0, vec![1, 2, 3]), bucket(1, 2.0, vec![4, 5])],
            3,
        );
        let mut out = Vec::new();
        assert!(matches!(
            write_fft_matrix(&sweep, &mut out),
            Err(DaqError::Export(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_out_of_order_degrees_are_rejected() {
        let sweep = sweep(vec![bucket(3, 1.0, vec![1]), bucket(2, 1.0, vec![1])], 1);
        assert!(matches!(validate(&sweep), Err(DaqError::Export(_))));
    }

    #[test]
    fn test_reader_rejects_short_rows() {
        let text = "Start frequency [Hz],End frequency [Hz],Point count,Vertical scale,Vertical offset,Time scale [s]\n\
                    0,100,3,1,0,0.001\n\
                    Angle (degrees),FFT values\n\
                    0,1,2\n";
        assert!(matches!(
            read_fft_matrix(text.as_bytes()),
            Err(DaqError::Export(msg)) if msg.contains("expected 4")
        ));
    }

    #[test]
    fn test_reader_rejects_foreign_header() {
        let text = "Kot,Vpp\n1,2.0\n";
        assert!(read_scalar_series(text.as_bytes()).is_err());
    }

    #[test]
    fn test_paths_for_names() {
        let exporter = Exporter::new("data");
        let paths = exporter.paths_for("prop_a.csv", true).unwrap();
        assert_eq!(paths.scalar, PathBuf::from("data/prop_a.csv"));
        assert_eq!(paths.fft, PathBuf::from("data/prop_a_FFT.csv"));

        let paths = exporter.paths_for("prop_a", false).unwrap();
        assert_eq!(paths.scalar, PathBuf::from("data/prop_a_INCOMPLETE.csv"));
        assert_eq!(paths.fft, PathBuf::from("data/prop_a_FFT_INCOMPLETE.csv"));

        assert!(exporter.paths_for("   ", true).is_err());
    }
}
