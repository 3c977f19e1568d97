use clap::ValueEnum;
use log::{info, warn};
use ndarray::prelude::*;
use num_complex::Complex64;

use crate::error::EnsembleError;
use crate::read::Ensemble;

/// Fraction of the integrated mean periodogram used for the cumulative-power index.
pub const POWER_INDEX_FRACTION: f64 = 0.10;

/// Fill value for cells that exist in the first run but not in a shorter one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PadFill {
    /// Padded cells are NaN and left out of the per-cell statistics.
    Missing,
    /// Padded cells are 0.0 and counted like measured values.
    Zero,
}

impl PadFill {
    fn value(self) -> f64 {
        match self {
            PadFill::Missing => f64::NAN,
            PadFill::Zero => 0.0,
        }
    }
}

/// Copies `array` into `shape`, truncating larger axes and filling the rest with `fill`.
pub fn align_to(array: &Array2<f64>, shape: (usize, usize), fill: PadFill) -> Array2<f64> {
    let mut out = Array2::from_elem(shape, fill.value());
    let rows = array.nrows().min(shape.0);
    let cols = array.ncols().min(shape.1);
    out.slice_mut(s![..rows, ..cols])
        .assign(&array.slice(s![..rows, ..cols]));
    out
}

/// Stacks 2-D arrays along a new first axis, aligning each to the first one's shape.
pub fn stack_aligned<'a, I>(label: &str, names: &[String], arrays: I, fill: PadFill) -> Array3<f64>
where
    I: IntoIterator<Item = &'a Array2<f64>>,
{
    let arrays: Vec<&Array2<f64>> = arrays.into_iter().collect();
    let Some(first) = arrays.first() else {
        return Array3::zeros((0, 0, 0));
    };
    let shape = first.dim();
    let mut stack = Array3::zeros((arrays.len(), shape.0, shape.1));

    for (i, array) in arrays.iter().enumerate() {
        if array.dim() != shape {
            let name = names.get(i).map(String::as_str).unwrap_or("?");
            if array.nrows() > shape.0 || array.ncols() > shape.1 {
                warn!("{} of {}: {:?} truncated to {:?}", label, name, array.dim(), shape);
            }
            if array.nrows() < shape.0 || array.ncols() < shape.1 {
                warn!(
                    "{} of {}: {:?} padded to {:?} with {:?} cells",
                    label,
                    name,
                    array.dim(),
                    shape,
                    fill
                );
            }
        }
        stack
            .index_axis_mut(Axis(0), i)
            .assign(&align_to(array, shape, fill));
    }
    stack
}

/// Per-cell mean and sample standard deviation.
#[derive(Debug, Clone)]
pub struct MeanStd {
    pub mean: Array2<f64>,
    pub std: Array2<f64>,
}

/// Arithmetic mean and sample standard deviation (N-1) along the first axis, ignoring NaN.
pub fn mean_and_std(stack: &Array3<f64>) -> MeanStd {
    let (_, rows, cols) = stack.dim();
    let mut mean = Array2::from_elem((rows, cols), f64::NAN);
    let mut std = Array2::from_elem((rows, cols), f64::NAN);

    for r in 0..rows {
        for c in 0..cols {
            let values: Vec<f64> = stack
                .slice(s![.., r, c])
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .collect();
            mean[[r, c]] = sample_mean(&values);
            std[[r, c]] = sample_std(&values);
        }
    }
    MeanStd { mean, std }
}

pub fn sample_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with N-1 in the denominator; NaN for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let mean = sample_mean(values);
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Standard deviation with N in the denominator.
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mean = sample_mean(values);
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (ss / values.len() as f64).sqrt()
}

/// Smallest index at which the normalized cumulative sum of `arr` reaches `p`.
pub fn index_cumsum(arr: &[f64], p: f64) -> Result<usize, EnsembleError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(EnsembleError::InvalidParameter(format!(
            "p must be between 0 and 1 (got {})",
            p
        )));
    }
    if arr.is_empty() {
        return Err(EnsembleError::InvalidParameter(
            "cumulative sum of an empty array".to_string(),
        ));
    }

    let mut cumsum = Vec::with_capacity(arr.len());
    let mut acc = 0.0;
    for v in arr {
        acc += v;
        cumsum.push(acc);
    }
    let total = acc;

    Ok(cumsum
        .iter()
        .position(|c| c / total >= p)
        .unwrap_or(arr.len() - 1))
}

/// Low-frequency bins whose mean value exceeds a tenth of the zero-frequency bin.
pub fn significant_bins(mean_psd: &[f64], all_cut: usize) -> Vec<usize> {
    let Some(&dc) = mean_psd.first() else {
        return Vec::new();
    };
    let zero = dc / 10.0;
    (0..all_cut.min(mean_psd.len()))
        .filter(|&i| mean_psd[i] > zero)
        .collect()
}

/// Cross-run statistics of an [`Ensemble`].
#[derive(Debug, Clone)]
pub struct EnsembleStats {
    pub names: Vec<String>,
    pub freqs: Array1<f64>,
    /// N x 2 x F
    pub periodograms: Array3<f64>,
    /// N x 4 x K, aligned to the first run
    pub cepstrals: Array3<f64>,
    pub periodogram: MeanStd,
    pub cepstral: MeanStd,
    /// Per-run cospectra, present only when every run has one of the same shape.
    pub cospectra: Option<Vec<Array3<Complex64>>>,
    pub mean_cospectrum: Option<Array3<Complex64>>,
    pub kappa_scales: Vec<f64>,
    pub mean_kappa_scale: f64,
    pub aic_kmins: Vec<usize>,
    pub mean_aic: f64,
    /// Truncated mean AIC cutoff, clamped into the cepstral range.
    pub aic_index: usize,
    pub kappas_at_aic: Vec<f64>,
    pub kappa_stds_at_aic: Vec<f64>,
    pub l0s_at_aic: Vec<f64>,
    pub l0_stds_at_aic: Vec<f64>,
    pub power_index: usize,
    pub significant: Vec<usize>,
}

impl EnsembleStats {
    pub fn n_runs(&self) -> usize {
        self.periodograms.len_of(Axis(0))
    }

    pub fn n_freqs(&self) -> usize {
        self.freqs.len()
    }

    pub fn n_cutoffs(&self) -> usize {
        self.cepstrals.len_of(Axis(2))
    }

    /// Values of cepstral row `row` at the mean AIC cutoff, one per run, NaN cells skipped.
    pub fn cepstral_at_mean_aic(&self, row: usize) -> Vec<f64> {
        self.cepstrals
            .slice(s![.., row, self.aic_index])
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .collect()
    }
}

fn collect_cospectra(ensemble: &Ensemble) -> Option<Vec<Array3<Complex64>>> {
    let present: Vec<&Array3<Complex64>> = ensemble
        .runs
        .iter()
        .filter_map(|r| r.cospectrum.as_ref())
        .collect();
    if present.is_empty() {
        return None;
    }
    if present.len() != ensemble.len() {
        warn!(
            "cospectrum found for {} of {} runs; cospectrum plots disabled",
            present.len(),
            ensemble.len()
        );
        return None;
    }
    let shape = present[0].dim();
    if present.iter().any(|c| c.dim() != shape) {
        warn!("cospectra have different shapes; cospectrum plots disabled");
        return None;
    }
    Some(present.into_iter().cloned().collect())
}

fn mean_cospectrum(cospectra: &[Array3<Complex64>]) -> Option<Array3<Complex64>> {
    let first = cospectra.first()?;
    let mut sum = Array3::<Complex64>::zeros(first.dim());
    for c in cospectra {
        sum += c;
    }
    Some(sum.mapv(|c| c / cospectra.len() as f64))
}

/// Stacks the ensemble and computes every cross-run quantity used downstream.
pub fn aggregate(ensemble: &Ensemble, fill: PadFill, all_cut: usize) -> Result<EnsembleStats, EnsembleError> {
    if ensemble.is_empty() {
        return Err(EnsembleError::EmptyEnsemble);
    }
    let names: Vec<String> = ensemble.runs.iter().map(|r| r.name.clone()).collect();

    let periodograms = stack_aligned(
        "periodogram",
        &names,
        ensemble.runs.iter().map(|r| &r.periodogram),
        fill,
    );
    let cepstrals = stack_aligned(
        "cepstral",
        &names,
        ensemble.runs.iter().map(|r| &r.cepstral),
        fill,
    );

    let periodogram = mean_and_std(&periodograms);
    let cepstral = mean_and_std(&cepstrals);
    info!(
        "Mean values and standard deviations done: periodogram {:?}, cepstral {:?}",
        periodogram.mean.dim(),
        cepstral.mean.dim()
    );

    let cospectra = collect_cospectra(ensemble);
    let mean_cospectrum = cospectra.as_deref().and_then(mean_cospectrum);

    let kappa_scales: Vec<f64> = ensemble.runs.iter().map(|r| r.kappa_scale).collect();
    let aic_kmins: Vec<usize> = ensemble.runs.iter().map(|r| r.aic_kmin).collect();
    let mean_aic = aic_kmins.iter().sum::<usize>() as f64 / aic_kmins.len() as f64;
    let n_cutoffs = cepstrals.len_of(Axis(2));
    let mut aic_index = mean_aic as usize;
    if aic_index >= n_cutoffs {
        warn!(
            "mean AIC cutoff {} is outside the aligned cepstral range, using {}",
            aic_index,
            n_cutoffs - 1
        );
        aic_index = n_cutoffs - 1;
    }

    let mean_psd: Vec<f64> = periodogram.mean.row(0).to_vec();
    let power_index = index_cumsum(&mean_psd, POWER_INDEX_FRACTION)?;
    info!(
        "Index of {:.2} psd power = {} , {} THz",
        POWER_INDEX_FRACTION, power_index, ensemble.freqs[power_index]
    );

    let significant = significant_bins(&mean_psd, all_cut);
    match significant.last() {
        Some(last) => info!(
            "Number of components > {}: {}. Last is {}",
            mean_psd[0] / 10.0,
            significant.len(),
            last
        ),
        None => warn!("no periodogram component above a tenth of the zero-frequency bin"),
    }

    Ok(EnsembleStats {
        names,
        freqs: ensemble.freqs.clone(),
        periodograms,
        cepstrals,
        periodogram,
        cepstral,
        cospectra,
        mean_cospectrum,
        kappa_scales: kappa_scales.clone(),
        mean_kappa_scale: sample_mean(&kappa_scales),
        aic_kmins,
        mean_aic,
        aic_index,
        kappas_at_aic: ensemble.runs.iter().map(|r| r.kappa_at_aic()).collect(),
        kappa_stds_at_aic: ensemble.runs.iter().map(|r| r.kappa_std_at_aic()).collect(),
        l0s_at_aic: ensemble.runs.iter().map(|r| r.l0_at_aic()).collect(),
        l0_stds_at_aic: ensemble.runs.iter().map(|r| r.l0_std_at_aic()).collect(),
        power_index,
        significant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::RunRecord;
    use approx::assert_abs_diff_eq;

    fn run(name: &str, psd: Array2<f64>, cep: Array2<f64>, aic: usize) -> RunRecord {
        RunRecord {
            name: name.to_string(),
            freqs: Array1::linspace(0.0, 1.0, psd.ncols()),
            periodogram: psd,
            cepstral: cep,
            cospectrum: None,
            kappa_scale: 2.0,
            aic_kmin: aic,
        }
    }

    #[test]
    fn mean_and_sample_std_across_runs() {
        let stack = Array3::from_shape_vec((3, 1, 2), vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]).unwrap();
        let ms = mean_and_std(&stack);
        assert_abs_diff_eq!(ms.mean[[0, 0]], 2.0);
        assert_abs_diff_eq!(ms.mean[[0, 1]], 20.0);
        assert_abs_diff_eq!(ms.std[[0, 0]], 1.0);
        assert_abs_diff_eq!(ms.std[[0, 1]], 10.0);
    }

    #[test]
    fn missing_cells_are_excluded() {
        let stack = Array3::from_shape_vec((3, 1, 1), vec![1.0, f64::NAN, 3.0]).unwrap();
        let ms = mean_and_std(&stack);
        assert_abs_diff_eq!(ms.mean[[0, 0]], 2.0);
        assert_abs_diff_eq!(ms.std[[0, 0]], 2f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn align_truncates_and_pads_by_policy() {
        let a = array![[1.0, 2.0, 3.0]];
        assert_eq!(align_to(&a, (1, 2), PadFill::Missing), array![[1.0, 2.0]]);
        assert_eq!(align_to(&a, (1, 4), PadFill::Zero), array![[1.0, 2.0, 3.0, 0.0]]);
        let padded = align_to(&a, (1, 4), PadFill::Missing);
        assert!(padded[[0, 3]].is_nan());
    }

    #[test]
    fn shorter_cepstral_does_not_bias_the_mean_with_missing_fill() {
        let psd = Array2::from_elem((2, 4), 1.0);
        let ensemble = Ensemble {
            freqs: Array1::linspace(0.0, 1.0, 4),
            runs: vec![
                run("a", psd.clone(), Array2::from_elem((4, 3), 2.0), 1),
                run("b", psd.clone(), Array2::from_elem((4, 2), 4.0), 1),
            ],
            dropped: Vec::new(),
        };
        let stats = aggregate(&ensemble, PadFill::Missing, 100).unwrap();
        assert_eq!(stats.cepstral.mean.dim(), (4, 3));
        assert_abs_diff_eq!(stats.cepstral.mean[[0, 1]], 3.0);
        assert_abs_diff_eq!(stats.cepstral.mean[[0, 2]], 2.0);
        assert!(stats.cepstral.std[[0, 2]].is_nan());

        let stats = aggregate(&ensemble, PadFill::Zero, 100).unwrap();
        assert_abs_diff_eq!(stats.cepstral.mean[[0, 2]], 1.0);
    }

    #[test]
    fn index_cumsum_on_flat_array() {
        let arr = vec![1.0; 100];
        assert_eq!(index_cumsum(&arr, 0.1).unwrap(), 9);
        assert_eq!(index_cumsum(&arr, 0.5).unwrap(), 49);
        assert_eq!(index_cumsum(&arr, 1.0).unwrap(), 99);
        assert!(index_cumsum(&arr, 1.5).is_err());
        assert!(index_cumsum(&arr, -0.1).is_err());
    }

    #[test]
    fn index_cumsum_returns_smallest_index() {
        assert_eq!(index_cumsum(&[5.0, 1.0, 1.0, 3.0], 0.5).unwrap(), 0);
        assert_eq!(index_cumsum(&[1.0, 1.0, 1.0, 7.0], 0.35).unwrap(), 3);
        assert_eq!(index_cumsum(&[1.0, 1.0, 1.0, 7.0], 0.25).unwrap(), 2);
    }

    #[test]
    fn significant_bins_use_tenth_of_dc() {
        let psd = [10.0, 5.0, 0.5, 2.0, 0.9];
        assert_eq!(significant_bins(&psd, 100), vec![0, 1, 3]);
        assert_eq!(significant_bins(&psd, 2), vec![0, 1]);
    }

    #[test]
    fn aic_statistics() {
        let psd = Array2::from_elem((2, 4), 1.0);
        let cep = Array2::from_shape_fn((4, 6), |(r, c)| (r * 10 + c) as f64);
        let ensemble = Ensemble {
            freqs: Array1::linspace(0.0, 1.0, 4),
            runs: vec![
                run("a", psd.clone(), cep.clone(), 2),
                run("b", psd.clone(), cep.clone(), 3),
            ],
            dropped: Vec::new(),
        };
        let stats = aggregate(&ensemble, PadFill::Missing, 100).unwrap();
        assert_abs_diff_eq!(stats.mean_aic, 2.5);
        assert_eq!(stats.aic_index, 2);
        assert_eq!(stats.kappas_at_aic, vec![2.0, 3.0]);
        assert_eq!(stats.l0s_at_aic, vec![22.0, 23.0]);
        assert_abs_diff_eq!(stats.mean_kappa_scale, 2.0);
        assert_eq!(stats.cepstral_at_mean_aic(1), vec![12.0, 12.0]);
    }

    fn with_cospectrum(mut record: RunRecord, shape: (usize, usize, usize), value: f64) -> RunRecord {
        record.cospectrum = Some(Array3::from_elem(shape, Complex64::new(value, 0.0)));
        record
    }

    fn two_runs(a: RunRecord, b: RunRecord) -> Ensemble {
        Ensemble {
            freqs: Array1::linspace(0.0, 1.0, 4),
            runs: vec![a, b],
            dropped: Vec::new(),
        }
    }

    #[test]
    fn cospectrum_mean_over_all_runs() {
        let psd = Array2::from_elem((2, 4), 1.0);
        let cep = Array2::from_elem((4, 3), 1.0);
        let ensemble = two_runs(
            with_cospectrum(run("a", psd.clone(), cep.clone(), 1), (2, 2, 4), 1.0),
            with_cospectrum(run("b", psd, cep, 1), (2, 2, 4), 3.0),
        );
        let stats = aggregate(&ensemble, PadFill::Missing, 100).unwrap();
        assert_eq!(stats.cospectra.as_ref().map(Vec::len), Some(2));
        assert_eq!(
            stats.mean_cospectrum,
            Some(Array3::from_elem((2, 2, 4), Complex64::new(2.0, 0.0)))
        );
    }

    #[test]
    fn cospectrum_on_some_runs_only_is_disabled() {
        let psd = Array2::from_elem((2, 4), 1.0);
        let cep = Array2::from_elem((4, 3), 1.0);
        let ensemble = two_runs(
            with_cospectrum(run("a", psd.clone(), cep.clone(), 1), (2, 2, 4), 1.0),
            run("b", psd, cep, 1),
        );
        let stats = aggregate(&ensemble, PadFill::Missing, 100).unwrap();
        assert!(stats.cospectra.is_none());
        assert!(stats.mean_cospectrum.is_none());
    }

    #[test]
    fn cospectra_of_different_shapes_are_disabled() {
        let psd = Array2::from_elem((2, 4), 1.0);
        let cep = Array2::from_elem((4, 3), 1.0);
        let ensemble = two_runs(
            with_cospectrum(run("a", psd.clone(), cep.clone(), 1), (2, 2, 4), 1.0),
            with_cospectrum(run("b", psd, cep, 1), (1, 1, 4), 1.0),
        );
        let stats = aggregate(&ensemble, PadFill::Missing, 100).unwrap();
        assert!(stats.cospectra.is_none());
        assert!(stats.mean_cospectrum.is_none());
    }
}
