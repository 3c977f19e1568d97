use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use ndarray::prelude::*;

use crate::aggregate::{population_std, sample_mean, EnsembleStats};
use crate::gof::GofTest;
use crate::utils::with_suffix;

/// Paths of everything written for one output prefix.
#[derive(Debug, Clone)]
pub struct OutputNames {
    pub log: PathBuf,
    pub mean_periodogram: PathBuf,
    pub mean_cepstral: PathBuf,
    pub kolmogorov_smirnov: PathBuf,
    pub pdf: PathBuf,
}

pub fn generate_output_names(prefix: &Path) -> OutputNames {
    OutputNames {
        log: with_suffix(prefix, ".log"),
        mean_periodogram: with_suffix(prefix, ".mean_periodogram"),
        mean_cepstral: with_suffix(prefix, ".mean_cepstral"),
        kolmogorov_smirnov: with_suffix(prefix, ".kolmogorov_smirnov"),
        pdf: with_suffix(prefix, "_all.pdf"),
    }
}

/// `%.18e` as printed by C: two-digit signed exponent, `nan`/`inf` spelled out.
pub fn format_sci(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    let s = format!("{:.18e}", x);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => s,
    }
}

/// Writes rows of equally long columns, space separated, one table row per line.
pub fn write_columns(path: &Path, columns: &[ArrayView1<f64>]) -> io::Result<()> {
    let rows = columns.first().map(|c| c.len()).unwrap_or(0);
    if columns.iter().any(|c| c.len() != rows) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "all columns must have the same length",
        ));
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for r in 0..rows {
        let line: Vec<String> = columns.iter().map(|c| format_sci(c[r])).collect();
        writeln!(writer, "{}", line.join(" "))?;
    }
    writer.flush()
}

/// frequency, mean value, std value, mean uncertainty, std uncertainty
pub fn write_mean_periodogram(path: &Path, stats: &EnsembleStats) -> io::Result<()> {
    let mean = &stats.periodogram.mean;
    let std = &stats.periodogram.std;
    write_columns(
        path,
        &[stats.freqs.view(), mean.row(0), std.row(0), mean.row(1), std.row(1)],
    )
}

/// mean kappa, std kappa, mean kappa uncertainty, std kappa uncertainty
pub fn write_mean_cepstral(path: &Path, stats: &EnsembleStats) -> io::Result<()> {
    let mean = &stats.cepstral.mean;
    let std = &stats.cepstral.std;
    write_columns(path, &[mean.row(0), std.row(0), mean.row(1), std.row(1)])
}

pub fn write_ks_table(path: &Path, tests: &[GofTest]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "# test dof n statistic p_value")?;
    for t in tests {
        writeln!(
            writer,
            "{} {} {} {} {}",
            t.label,
            t.dof,
            t.ks.n,
            format_sci(t.ks.statistic),
            format_sci(t.ks.p_value)
        )?;
    }
    writer.flush()
}

fn mean_pm_std(values: &[f64]) -> String {
    format!("{} +/- {}", sample_mean(values), population_std(values))
}

/// Human-readable summary of the ensemble.
pub fn format_report(stats: &EnsembleStats, tests: &[GofTest], dropped: &[String]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# kappa-ensemble report, {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("Runs used: {}\n", stats.n_runs()));
    for name in dropped {
        out.push_str(&format!("Run dropped (inconsistent periodogram shape): {}\n", name));
    }
    out.push('\n');

    out.push_str(&format!("Mean value of kappa_scale: {}\n", stats.mean_kappa_scale));
    out.push_str(&format!("Mean value of minimum of AIC: {}\n", stats.mean_aic));
    out.push('\n');
    out.push_str(&format!(
        "Mean value and standard deviation of kappa(aic_Kmin):                    {}\n",
        mean_pm_std(&stats.kappas_at_aic)
    ));
    out.push_str(&format!(
        "Mean value of calculated statistical error per block of kappa(aic_Kmin): {}\n",
        sample_mean(&stats.kappa_stds_at_aic)
    ));
    out.push('\n');
    out.push_str(&format!(
        "Mean value and standard deviation of L0(aic_Kmin):                       {}\n",
        mean_pm_std(&stats.l0s_at_aic)
    ));
    out.push_str(&format!(
        "Mean value of calculated statistical error per block of L0(aic_Kmin):    {}\n",
        sample_mean(&stats.l0_stds_at_aic)
    ));

    out.push_str("\n\n===========\n");
    out.push_str(&format!("Values at mean value of aic_Kmin ({}):\n", stats.aic_index));
    out.push('\n');
    out.push_str(&format!(
        "Mean value and standard deviation of kappa(aic_Kminm):                   {}\n",
        mean_pm_std(&stats.cepstral_at_mean_aic(0))
    ));
    out.push_str(&format!(
        "Mean value of calculated statistical error per block of kappa(aic_Kmin): {}\n",
        sample_mean(&stats.cepstral_at_mean_aic(1))
    ));
    out.push('\n');
    out.push_str(&format!(
        "Mean value and standard deviation of L0(aic_Kmin):                       {}\n",
        mean_pm_std(&stats.cepstral_at_mean_aic(2))
    ));
    out.push_str(&format!(
        "Mean value of calculated statistical error per block of L0(aic_Kmin):    {}\n",
        sample_mean(&stats.cepstral_at_mean_aic(3))
    ));

    out.push_str("\n\n===========\n");
    out.push_str(&format!(
        "Index of {} of the integrated mean periodogram: {} ({} THz)\n",
        crate::aggregate::POWER_INDEX_FRACTION,
        stats.power_index,
        stats.freqs[stats.power_index]
    ));
    out.push_str(&format!("Significant periodogram bins: {}\n", stats.significant.len()));
    if tests.is_empty() {
        out.push_str("Kolmogorov-Smirnov tests: not computed\n");
    }
    for t in tests {
        out.push_str(&format!(
            "KS {} vs chi2({}), n={}: statistic={} p-value={}\n",
            t.label, t.dof, t.ks.n, t.ks.statistic, t.ks.p_value
        ));
    }
    out
}

pub fn write_report(path: &Path, stats: &EnsembleStats, tests: &[GofTest], dropped: &[String]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(format_report(stats, tests, dropped).as_bytes())?;
    writer.flush()
}
