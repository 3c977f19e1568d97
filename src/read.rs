use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::prelude::*;
use ndarray_npy::read_npy;
use num_complex::{Complex32, Complex64};

use crate::error::EnsembleError;
use crate::utils::with_suffix;

pub const PSD_NPY: &str = ".psd.npy";
pub const PSD_DAT: &str = ".psd.dat";
pub const CEPSTRAL_NPY: &str = ".cepstral.npy";
pub const CEPSTRAL_DAT: &str = ".cepstral.dat";
pub const COSPECTRUM_NPY: &str = ".cospectrum.npy";
pub const COSPECTRUM_DAT: &str = ".cospectrum.dat";
pub const SCALE_AIC_DAT: &str = ".kappa_scale_aicKmin.dat";

// Row/column layout of the upstream outputs.
const PSD_FREQ_ROW: usize = 0;
const PSD_VALUE_ROWS: [usize; 2] = [3, 4];
const CEPSTRAL_ROWS: [usize; 4] = [4, 5, 2, 3];
const COSPECTRUM_ENTRY: usize = 1;

type ReadResult<T> = Result<T, EnsembleError>;

/// One upstream analysis run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub name: String,
    /// Frequency axis in THz.
    pub freqs: Array1<f64>,
    /// 2 x F: periodogram value and uncertainty.
    pub periodogram: Array2<f64>,
    /// 4 x K: kappa, kappa uncertainty, L0, L0 uncertainty per cutoff.
    pub cepstral: Array2<f64>,
    /// M x M x F, already divided by the number of processes.
    pub cospectrum: Option<Array3<Complex64>>,
    pub kappa_scale: f64,
    pub aic_kmin: usize,
}

impl RunRecord {
    pub fn kappa_at_aic(&self) -> f64 {
        self.cepstral[[0, self.aic_kmin]]
    }

    pub fn kappa_std_at_aic(&self) -> f64 {
        self.cepstral[[1, self.aic_kmin]]
    }

    pub fn l0_at_aic(&self) -> f64 {
        self.cepstral[[2, self.aic_kmin]]
    }

    pub fn l0_std_at_aic(&self) -> f64 {
        self.cepstral[[3, self.aic_kmin]]
    }
}

/// Runs accepted for the ensemble, in input order.
#[derive(Debug, Clone)]
pub struct Ensemble {
    pub freqs: Array1<f64>,
    pub runs: Vec<RunRecord>,
    pub dropped: Vec<String>,
}

impl Ensemble {
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Whitespace separated numeric table; blank lines and `#` comments are skipped.
pub fn read_text_table(path: &Path) -> ReadResult<Vec<Vec<f64>>> {
    let text = fs::read_to_string(path)?;
    let mut rows: Vec<Vec<f64>> = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|tok| tok.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| EnsembleError::malformed(path, format!("line {}: {}", lineno + 1, e)))?;
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(EnsembleError::malformed(
                    path,
                    format!(
                        "line {} has {} columns, expected {}",
                        lineno + 1,
                        row.len(),
                        first.len()
                    ),
                ));
            }
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(EnsembleError::malformed(path, "no data rows"));
    }
    Ok(rows)
}

/// Picks `cols` out of a row-major table, returning them as rows (unpacked layout).
pub fn table_columns(path: &Path, table: &[Vec<f64>], cols: &[usize]) -> ReadResult<Array2<f64>> {
    let ncols = table.first().map(|r| r.len()).unwrap_or(0);
    if let Some(&bad) = cols.iter().find(|&&c| c >= ncols) {
        return Err(EnsembleError::malformed(
            path,
            format!("column {} requested but the table has {} columns", bad, ncols),
        ));
    }
    Ok(Array2::from_shape_fn((cols.len(), table.len()), |(i, j)| table[j][cols[i]]))
}

/// 2-D float array from a `.npy` file, accepting f64 or f32 data.
pub fn read_npy_2d(path: &Path) -> ReadResult<Array2<f64>> {
    match read_npy::<_, Array2<f64>>(path) {
        Ok(array) => Ok(array),
        Err(err) => match read_npy::<_, Array2<f32>>(path) {
            Ok(array) => Ok(array.mapv(f64::from)),
            Err(_) => Err(EnsembleError::Npy {
                path: path.to_path_buf(),
                source: err,
            }),
        },
    }
}

fn select_rows(path: &Path, array: &Array2<f64>, rows: &[usize]) -> ReadResult<Array2<f64>> {
    if let Some(&bad) = rows.iter().find(|&&r| r >= array.nrows()) {
        return Err(EnsembleError::malformed(
            path,
            format!("row {} requested but the array has {} rows", bad, array.nrows()),
        ));
    }
    Ok(array.select(Axis(0), rows))
}

fn existing(base: &Path, binary: &str, text: &str) -> Option<PathBuf> {
    let npy = with_suffix(base, binary);
    if npy.is_file() {
        return Some(npy);
    }
    let dat = with_suffix(base, text);
    if dat.is_file() {
        return Some(dat);
    }
    None
}

fn is_npy(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("npy")
}

/// Frequency axis and the 2 x F periodogram of one run.
pub fn read_periodogram(base: &Path) -> ReadResult<(Array1<f64>, Array2<f64>)> {
    let path = existing(base, PSD_NPY, PSD_DAT)
        .ok_or_else(|| EnsembleError::MissingFile(with_suffix(base, PSD_DAT)))?;

    if is_npy(&path) {
        let array = read_npy_2d(&path)?;
        let freqs = select_rows(&path, &array, &[PSD_FREQ_ROW])?.row(0).to_owned();
        let periodogram = select_rows(&path, &array, &PSD_VALUE_ROWS)?;
        Ok((freqs, periodogram))
    } else {
        let table = read_text_table(&path)?;
        let freqs = table_columns(&path, &table, &[PSD_FREQ_ROW])?.row(0).to_owned();
        let periodogram = table_columns(&path, &table, &PSD_VALUE_ROWS)?;
        Ok((freqs, periodogram))
    }
}

/// 4 x K cepstral coefficients: kappa, kappa uncertainty, L0, L0 uncertainty.
pub fn read_cepstral(base: &Path) -> ReadResult<Array2<f64>> {
    let path = existing(base, CEPSTRAL_NPY, CEPSTRAL_DAT)
        .ok_or_else(|| EnsembleError::MissingFile(with_suffix(base, CEPSTRAL_DAT)))?;

    if is_npy(&path) {
        let array = read_npy_2d(&path)?;
        select_rows(&path, &array, &CEPSTRAL_ROWS)
    } else {
        let table = read_text_table(&path)?;
        table_columns(&path, &table, &CEPSTRAL_ROWS)
    }
}

fn read_cospectrum_npy(path: &Path) -> ReadResult<ArrayD<Complex64>> {
    match read_npy::<_, ArrayD<Complex64>>(path) {
        Ok(array) => Ok(array),
        Err(err) => match read_npy::<_, ArrayD<Complex32>>(path) {
            Ok(array) => Ok(array.mapv(|c| Complex64::new(c.re as f64, c.im as f64))),
            Err(_) => Err(EnsembleError::Npy {
                path: path.to_path_buf(),
                source: err,
            }),
        },
    }
}

/// Optional M x M x F cospectrum, divided by `n_processes`.
///
/// The binary form stores a stack of matrices along the first axis and entry 1 is
/// used. The text form has one row per frequency: the frequency, then real and
/// imaginary parts of the M x M matrix in row-major order.
pub fn read_cospectrum(base: &Path, n_processes: usize) -> ReadResult<Option<Array3<Complex64>>> {
    let Some(path) = existing(base, COSPECTRUM_NPY, COSPECTRUM_DAT) else {
        return Ok(None);
    };
    let scale = 1.0 / n_processes as f64;

    let cospectrum = if is_npy(&path) {
        let array = read_cospectrum_npy(&path)?;
        if array.ndim() != 4 || array.shape()[0] <= COSPECTRUM_ENTRY {
            return Err(EnsembleError::malformed(
                &path,
                format!("expected shape (S>=2, M, M, F), got {:?}", array.shape()),
            ));
        }
        array
            .index_axis(Axis(0), COSPECTRUM_ENTRY)
            .to_owned()
            .into_dimensionality::<Ix3>()
            .map_err(|e| EnsembleError::malformed(&path, e.to_string()))?
    } else {
        let table = read_text_table(&path)?;
        let values = table[0].len().saturating_sub(1);
        let m = ((values / 2) as f64).sqrt().round() as usize;
        if m == 0 || 2 * m * m != values {
            return Err(EnsembleError::malformed(
                &path,
                format!("{} value columns do not form an M x M complex matrix", values),
            ));
        }
        Array3::from_shape_fn((m, m, table.len()), |(i, j, f)| {
            let col = 1 + 2 * (i * m + j);
            Complex64::new(table[f][col], table[f][col + 1])
        })
    };

    Ok(Some(cospectrum.mapv(|c| c * scale)))
}

/// Scale factor and AIC-selected cutoff from the two-line scale file.
pub fn read_scale_aic(base: &Path) -> ReadResult<(f64, usize)> {
    let path = with_suffix(base, SCALE_AIC_DAT);
    if !path.is_file() {
        return Err(EnsembleError::MissingFile(path));
    }
    let text = fs::read_to_string(&path)?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    let scale = lines
        .next()
        .ok_or_else(|| EnsembleError::malformed(&path, "missing kappa scale line"))?
        .parse::<f64>()
        .map_err(|e| EnsembleError::malformed(&path, format!("kappa scale: {}", e)))?;
    let aic = lines
        .next()
        .ok_or_else(|| EnsembleError::malformed(&path, "missing AIC cutoff line"))?
        .parse::<usize>()
        .map_err(|e| EnsembleError::malformed(&path, format!("AIC cutoff: {}", e)))?;

    Ok((scale, aic))
}

fn run_name(base: &Path) -> String {
    base.to_string_lossy().into_owned()
}

fn finish_run(
    base: &Path,
    freqs: Array1<f64>,
    periodogram: Array2<f64>,
    n_processes: usize,
) -> ReadResult<RunRecord> {
    let name = run_name(base);
    let cepstral = read_cepstral(base)?;
    let cospectrum = read_cospectrum(base, n_processes)?;
    let (kappa_scale, aic_kmin) = read_scale_aic(base)?;

    if aic_kmin >= cepstral.ncols() {
        return Err(EnsembleError::AicOutOfRange {
            run: name,
            index: aic_kmin,
            len: cepstral.ncols(),
        });
    }

    Ok(RunRecord {
        name,
        freqs,
        periodogram,
        cepstral,
        cospectrum,
        kappa_scale,
        aic_kmin,
    })
}

/// Reads every file of one run.
pub fn load_run(base: &Path, n_processes: usize) -> ReadResult<RunRecord> {
    let (freqs, periodogram) = read_periodogram(base)?;
    finish_run(base, freqs, periodogram, n_processes)
}

/// Loads all inputs in order. A run whose periodogram shape differs from the first
/// accepted run is dropped before its remaining files are read.
pub fn load_ensemble(inputs: &[PathBuf], n_processes: usize) -> ReadResult<Ensemble> {
    info!("Number of inputs: {}", inputs.len());
    let mut runs: Vec<RunRecord> = Vec::with_capacity(inputs.len());
    let mut dropped = Vec::new();

    for base in inputs {
        let (freqs, periodogram) = read_periodogram(base)?;
        if let Some(first) = runs.first() {
            if periodogram.shape() != first.periodogram.shape() {
                warn!(
                    "{} not used (inconsistent periodogram shape {:?}, first input has {:?})",
                    base.display(),
                    periodogram.shape(),
                    first.periodogram.shape()
                );
                dropped.push(run_name(base));
                continue;
            }
        }

        let run = finish_run(base, freqs, periodogram, n_processes)?;
        info!(
            "{} periodogram {:?} cepstral {:?}{}",
            run.name,
            run.periodogram.shape(),
            run.cepstral.shape(),
            if run.cospectrum.is_some() { " cospectrum" } else { "" }
        );
        runs.push(run);
    }

    let freqs = runs
        .first()
        .map(|r| r.freqs.clone())
        .ok_or(EnsembleError::EmptyEnsemble)?;
    info!("Reading done: {} runs used, {} dropped", runs.len(), dropped.len());

    Ok(Ensemble {
        freqs,
        runs,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::write_npy;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write(path: &Path, text: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn text_table_skips_comments_and_checks_width() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        write(&path, "# freq a b\n0.0 1.0 2.0\n\n1.0 3.0 4.0\n");
        let table = read_text_table(&path).unwrap();
        assert_eq!(table, vec![vec![0.0, 1.0, 2.0], vec![1.0, 3.0, 4.0]]);

        write(&path, "0.0 1.0\n1.0\n");
        let err = read_text_table(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn periodogram_prefers_binary_rows() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let array = Array2::from_shape_fn((5, 4), |(r, c)| (10 * r + c) as f64);
        write_npy(with_suffix(&base, PSD_NPY), &array).unwrap();
        // A stale text file must be ignored when the binary form exists.
        write(&with_suffix(&base, PSD_DAT), "9 9 9 9 9\n");

        let (freqs, psd) = read_periodogram(&base).unwrap();
        assert_eq!(freqs, array![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(psd.row(0), array![30.0, 31.0, 32.0, 33.0]);
        assert_eq!(psd.row(1), array![40.0, 41.0, 42.0, 43.0]);
    }

    #[test]
    fn periodogram_text_columns() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        write(&with_suffix(&base, PSD_DAT), "0.0 0 0 5.0 0.5\n0.1 0 0 6.0 0.6\n");
        let (freqs, psd) = read_periodogram(&base).unwrap();
        assert_eq!(freqs, array![0.0, 0.1]);
        assert_eq!(psd, array![[5.0, 6.0], [0.5, 0.6]]);
    }

    #[test]
    fn cepstral_rows_are_reordered() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let array = Array2::from_shape_fn((6, 3), |(r, _)| r as f64);
        write_npy(with_suffix(&base, CEPSTRAL_NPY), &array).unwrap();
        let cep = read_cepstral(&base).unwrap();
        assert_eq!(cep.column(0), array![4.0, 5.0, 2.0, 3.0]);
    }

    #[test]
    fn scale_file_is_required_and_parsed() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let err = read_scale_aic(&base).unwrap_err();
        assert!(matches!(err, EnsembleError::MissingFile(_)));

        write(&with_suffix(&base, SCALE_AIC_DAT), "1.5\n7\n");
        assert_eq!(read_scale_aic(&base).unwrap(), (1.5, 7));

        write(&with_suffix(&base, SCALE_AIC_DAT), "1.5\n");
        assert!(read_scale_aic(&base).is_err());
    }

    #[test]
    fn cospectrum_text_form_is_scaled() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        assert!(read_cospectrum(&base, 4).unwrap().is_none());

        // M = 2: freq, then (re, im) for 00, 01, 10, 11
        write(
            &with_suffix(&base, COSPECTRUM_DAT),
            "0.0 4 0 8 4 8 -4 12 0\n0.1 8 0 0 0 0 0 16 0\n",
        );
        let cosp = read_cospectrum(&base, 4).unwrap().unwrap();
        assert_eq!(cosp.shape(), &[2, 2, 2]);
        assert_eq!(cosp[[0, 0, 0]], Complex64::new(1.0, 0.0));
        assert_eq!(cosp[[0, 1, 0]], Complex64::new(2.0, 1.0));
        assert_eq!(cosp[[1, 0, 0]], Complex64::new(2.0, -1.0));
        assert_eq!(cosp[[1, 1, 1]], Complex64::new(4.0, 0.0));
    }

    #[test]
    fn cospectrum_binary_form_uses_second_entry() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let stack = Array4::from_shape_fn((2, 2, 2, 3), |(s, i, j, f)| {
            Complex64::new((100 * s + 10 * i + j) as f64, f as f64)
        });
        write_npy(with_suffix(&base, COSPECTRUM_NPY), &stack).unwrap();

        let cosp = read_cospectrum(&base, 4).unwrap().unwrap();
        assert_eq!(cosp.shape(), &[2, 2, 3]);
        let expected = stack.index_axis(Axis(0), 1).mapv(|c| c / 4.0);
        assert_eq!(cosp, expected);
        assert_eq!(cosp[[1, 0, 2]], Complex64::new(27.5, 0.5));
    }

    #[test]
    fn cospectrum_binary_single_precision() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let stack = Array4::from_shape_fn((3, 1, 1, 2), |(s, _, _, f)| {
            Complex32::new(2.0 * s as f32, f as f32)
        });
        write_npy(with_suffix(&base, COSPECTRUM_NPY), &stack).unwrap();

        let cosp = read_cospectrum(&base, 2).unwrap().unwrap();
        assert_eq!(cosp, array![[[Complex64::new(1.0, 0.0), Complex64::new(1.0, 0.5)]]]);
    }

    #[test]
    fn cospectrum_binary_needs_two_entries() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let stack = Array4::from_elem((1, 2, 2, 3), Complex64::new(1.0, 0.0));
        write_npy(with_suffix(&base, COSPECTRUM_NPY), &stack).unwrap();
        let err = read_cospectrum(&base, 1).unwrap_err();
        assert!(err.to_string().contains("S>=2"));
    }

    #[test]
    fn aic_beyond_cepstral_range_is_fatal() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        write_npy(with_suffix(&base, PSD_NPY), &Array2::<f64>::ones((5, 4))).unwrap();
        write_npy(with_suffix(&base, CEPSTRAL_NPY), &Array2::<f64>::ones((6, 3))).unwrap();
        write(&with_suffix(&base, SCALE_AIC_DAT), "1.0\n3\n");
        let err = load_run(&base, 2).unwrap_err();
        assert!(matches!(err, EnsembleError::AicOutOfRange { index: 3, len: 3, .. }));
    }
}
