use log::{info, warn};
use ndarray::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::error::EnsembleError;

/// Largest sample size for which the exact Kolmogorov distribution is evaluated.
pub const EXACT_KS_MAX_N: usize = 100;
pub const DEFAULT_HIST_BINS: usize = 10;
pub const POOLED_HIST_BINS: usize = 100;

// Rescaling of the Marsaglia-Tsang-Wang matrix power.
const MTW_SCALE: f64 = 1e140;
const MTW_SCALE_EXP: i32 = 140;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsResult {
    pub statistic: f64,
    pub p_value: f64,
    pub n: usize,
}

/// One normalized-periodogram sample set and its test against chi2(dof).
#[derive(Debug, Clone)]
pub struct GofTest {
    pub label: String,
    pub dof: usize,
    /// Normalized values already multiplied by `dof`.
    pub values: Vec<f64>,
    pub hist_bins: usize,
    pub ks: KsResult,
}

/// Two-sided one-sample Kolmogorov-Smirnov statistic.
pub fn ks_statistic(sorted: &[f64], cdf: impl Fn(f64) -> f64) -> f64 {
    let n = sorted.len() as f64;
    sorted
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let f = cdf(x);
            let above = (i + 1) as f64 / n - f;
            let below = f - i as f64 / n;
            above.max(below)
        })
        .fold(0.0, f64::max)
}

fn matrix_power(a: &Array2<f64>, ea: i32, n: usize) -> (Array2<f64>, i32) {
    if n == 1 {
        return (a.clone(), ea);
    }
    let (v, ev) = matrix_power(a, ea, n / 2);
    let mut b = v.dot(&v);
    let mut eb = 2 * ev;
    if n % 2 == 1 {
        b = a.dot(&b);
        eb += ea;
    }
    let center = b.nrows() / 2;
    if b[[center, center]] > MTW_SCALE {
        b.mapv_inplace(|x| x / MTW_SCALE);
        eb += MTW_SCALE_EXP;
    }
    (b, eb)
}

/// P(D_n < d) by the Marsaglia-Tsang-Wang matrix method.
fn kolmogorov_cdf_exact(n: usize, d: f64) -> f64 {
    let nd = n as f64 * d;
    let k = nd.floor() as usize + 1;
    let m = 2 * k - 1;
    let h = k as f64 - nd;

    let mut hm = Array2::<f64>::zeros((m, m));
    for i in 0..m {
        for j in 0..m {
            if i + 1 >= j {
                hm[[i, j]] = 1.0;
            }
        }
    }
    for i in 0..m {
        hm[[i, 0]] -= h.powi(i as i32 + 1);
        hm[[m - 1, i]] -= h.powi((m - i) as i32);
    }
    if 2.0 * h - 1.0 > 0.0 {
        hm[[m - 1, 0]] += (2.0 * h - 1.0).powi(m as i32);
    }
    for i in 0..m {
        for j in 0..m {
            if i + 1 > j {
                for g in 1..=(i + 1 - j) {
                    hm[[i, j]] /= g as f64;
                }
            }
        }
    }

    let (q, mut eq) = matrix_power(&hm, 0, n);
    let mut s = q[[k - 1, k - 1]];
    for i in 1..=n {
        s = s * i as f64 / n as f64;
        if s < 1.0 / MTW_SCALE {
            s *= MTW_SCALE;
            eq -= MTW_SCALE_EXP;
        }
    }
    s * 10f64.powi(eq)
}

/// Survival function of the limiting Kolmogorov distribution.
fn kolmogorov_q(z: f64) -> f64 {
    if z <= 0.0 {
        return 1.0;
    }
    let p = if z < 1.18 {
        let y = (-1.233_700_550_136_169_8 / (z * z)).exp();
        2.256_758_334_191_025 * (-y.ln()).sqrt() * (y + y.powi(9) + y.powi(25) + y.powi(49))
    } else {
        let x = (-2.0 * z * z).exp();
        1.0 - 2.0 * (x - x.powi(4) + x.powi(9))
    };
    1.0 - p
}

/// Two-sided p-value P(D_n >= d).
///
/// Exact for `n <= EXACT_KS_MAX_N`, otherwise the asymptotic series with the
/// Stephens correction `(sqrt(n) + 0.12 + 0.11 / sqrt(n)) * d`.
pub fn kolmogorov_pvalue(n: usize, d: f64) -> f64 {
    if n == 0 || d.is_nan() {
        return f64::NAN;
    }
    if d <= 0.0 {
        return 1.0;
    }
    if d >= 1.0 {
        return 0.0;
    }
    let p = if n <= EXACT_KS_MAX_N {
        1.0 - kolmogorov_cdf_exact(n, d)
    } else {
        let sn = (n as f64).sqrt();
        kolmogorov_q((sn + 0.12 + 0.11 / sn) * d)
    };
    p.clamp(0.0, 1.0)
}

/// KS test of the finite entries of `samples` against `cdf`. `None` when nothing is left.
pub fn ks_test(samples: &[f64], cdf: impl Fn(f64) -> f64) -> Option<KsResult> {
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.len() < samples.len() {
        warn!(
            "{} non-finite samples left out of the KS test",
            samples.len() - sorted.len()
        );
    }
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let statistic = ks_statistic(&sorted, cdf);
    Some(KsResult {
        statistic,
        p_value: kolmogorov_pvalue(sorted.len(), statistic),
        n: sorted.len(),
    })
}

pub fn chi_squared(dof: usize) -> Result<ChiSquared, EnsembleError> {
    ChiSquared::new(dof as f64).map_err(|e| {
        EnsembleError::InvalidParameter(format!("chi-squared with {} degrees of freedom: {}", dof, e))
    })
}

/// KS test of `samples` against chi2(dof).
pub fn chi2_ks(samples: &[f64], dof: usize) -> Result<Option<KsResult>, EnsembleError> {
    let chi2 = chi_squared(dof)?;
    Ok(ks_test(samples, |x| chi2.cdf(x)))
}

/// For every run, the mean over all other runs at each bin. `values` is runs x bins.
pub fn leave_one_out_mean(values: ArrayView2<f64>) -> Array2<f64> {
    let n = values.nrows();
    let total = values.sum_axis(Axis(0));
    let mut out = Array2::zeros(values.raw_dim());
    for (i, row) in values.outer_iter().enumerate() {
        let others = (&total - &row) / (n as f64 - 1.0);
        out.row_mut(i).assign(&others);
    }
    out
}

/// `values[i, j] / loo[i, j]` for every run i and every bin j in `bins`, run-major.
pub fn normalized_values(values: ArrayView2<f64>, loo: ArrayView2<f64>, bins: &[usize]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.nrows() * bins.len());
    for i in 0..values.nrows() {
        for &j in bins {
            out.push(values[[i, j]] / loo[[i, j]]);
        }
    }
    out
}

fn build_test(
    label: &str,
    raw: Vec<f64>,
    dof: usize,
    hist_bins: usize,
) -> Result<Option<GofTest>, EnsembleError> {
    let values: Vec<f64> = raw.into_iter().map(|v| v * dof as f64).collect();
    let Some(ks) = chi2_ks(&values, dof)? else {
        warn!("{}: no finite samples, test skipped", label);
        return Ok(None);
    };
    Ok(Some(GofTest {
        label: label.to_string(),
        dof,
        values,
        hist_bins,
        ks,
    }))
}

/// Chi-squared KS checks of the leave-one-out normalized periodogram: bin 0 with
/// `dof`, bin 1 with `2 dof`, and all `significant` bins pooled with `2 dof`.
///
/// `periodograms` is runs x 2 x F; only the value row is used.
pub fn goodness_of_fit(
    periodograms: &Array3<f64>,
    dof: usize,
    significant: &[usize],
) -> Result<Vec<GofTest>, EnsembleError> {
    let (n_runs, _, n_freqs) = periodograms.dim();
    if n_runs < 2 {
        warn!("goodness-of-fit tests need at least 2 runs (got {}), skipped", n_runs);
        return Ok(Vec::new());
    }

    let values = periodograms.index_axis(Axis(1), 0);
    let loo = leave_one_out_mean(values);
    let mut tests = Vec::new();

    if n_freqs > 0 {
        let raw = normalized_values(values, loo.view(), &[0]);
        tests.extend(build_test("psd(0)", raw, dof, DEFAULT_HIST_BINS)?);
    }
    if n_freqs > 1 {
        let raw = normalized_values(values, loo.view(), &[1]);
        tests.extend(build_test("psd(1)", raw, 2 * dof, DEFAULT_HIST_BINS)?);
    }
    if !significant.is_empty() {
        let raw = normalized_values(values, loo.view(), significant);
        tests.extend(build_test("psd(all)", raw, 2 * dof, POOLED_HIST_BINS)?);
    }

    let summary: Vec<String> = tests
        .iter()
        .map(|t| format!("{}: D={:.4} p={:.4}", t.label, t.ks.statistic, t.ks.p_value))
        .collect();
    info!("Statistical test results: {}", summary.join(", "));
    Ok(tests)
}
