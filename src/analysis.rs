use std::error::Error;
use std::fs;

use anyhow::{anyhow, Context, Result};
use log::info;

use crate::aggregate::{aggregate, EnsembleStats};
use crate::args::RunParams;
use crate::gof::{goodness_of_fit, GofTest};
use crate::output::{
    generate_output_names, write_ks_table, write_mean_cepstral, write_mean_periodogram,
    write_report, OutputNames,
};
use crate::pdf::PdfPages;
use crate::plot::{
    cepstral_page, cospectrum_page, gof_page, kappa_histogram_page, mean_psd_page, psd_page,
    psd_stages, psd_zoom_page, RenderConfig,
};
use crate::read::load_ensemble;

/// Result of one invocation: the statistics, the KS checks and where they went.
#[derive(Debug)]
pub struct Report {
    pub stats: EnsembleStats,
    pub tests: Vec<GofTest>,
    pub dropped: Vec<String>,
    pub outputs: OutputNames,
}

/// Reads every run, reduces the ensemble, runs the chi-squared checks and
/// writes the text outputs. No plotting happens here.
pub fn analyze_ensemble(params: &RunParams) -> Result<Report> {
    let ensemble = load_ensemble(&params.inputs, params.n_processes)
        .context("failed to read the input runs")?;
    let dropped = ensemble.dropped.clone();

    let stats = aggregate(&ensemble, params.pad_fill, params.all_cut)
        .context("failed to aggregate the ensemble")?;
    info!(
        "{} runs aggregated: {} frequencies, {} cutoffs, mean AIC cutoff {}",
        stats.n_runs(),
        stats.n_freqs(),
        stats.n_cutoffs(),
        stats.aic_index
    );

    let tests = goodness_of_fit(&stats.periodograms, params.dof(), &stats.significant)
        .context("goodness-of-fit tests failed")?;

    if let Some(parent) = params.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create output directory {}", parent.display()))?;
    }
    let outputs = generate_output_names(&params.output);

    write_mean_periodogram(&outputs.mean_periodogram, &stats)
        .with_context(|| format!("cannot write {}", outputs.mean_periodogram.display()))?;
    write_mean_cepstral(&outputs.mean_cepstral, &stats)
        .with_context(|| format!("cannot write {}", outputs.mean_cepstral.display()))?;
    write_ks_table(&outputs.kolmogorov_smirnov, &tests)
        .with_context(|| format!("cannot write {}", outputs.kolmogorov_smirnov.display()))?;
    write_report(&outputs.log, &stats, &tests, &dropped)
        .with_context(|| format!("cannot write {}", outputs.log.display()))?;
    info!("Summary written to {}", outputs.log.display());

    Ok(Report {
        stats,
        tests,
        dropped,
        outputs,
    })
}

fn plot_error(e: Box<dyn Error + Send + Sync>) -> anyhow::Error {
    anyhow!(e)
}

/// Draws the fixed page sequence into `<output>_all.pdf` and returns the page count.
pub fn render_report(report: &Report, params: &RunParams, cfg: &RenderConfig) -> Result<usize> {
    let stats = &report.stats;
    let title = format!("{} ensemble", params.output.display());
    let mut pdf = PdfPages::new(title, cfg.dpi);

    pdf.push(mean_psd_page(stats, cfg).map_err(plot_error).context("mean PSD page")?);

    for view in psd_stages(stats, params) {
        pdf.push(
            psd_page(&view, params, cfg)
                .map_err(plot_error)
                .with_context(|| format!("PSD page ({})", view.label))?,
        );
        pdf.push(
            psd_zoom_page(&view, params, cfg)
                .map_err(plot_error)
                .with_context(|| format!("zoomed PSD page ({})", view.label))?,
        );
        if let Some(page) = cospectrum_page(&view, params, cfg)
            .map_err(plot_error)
            .with_context(|| format!("cospectrum page ({})", view.label))?
        {
            pdf.push(page);
        }
    }

    if let Some(page) = kappa_histogram_page(stats, cfg)
        .map_err(plot_error)
        .context("kappa histogram page")?
    {
        pdf.push(page);
    }
    for test in &report.tests {
        if let Some(page) = gof_page(test, cfg)
            .map_err(plot_error)
            .with_context(|| format!("histogram page {}", test.label))?
        {
            pdf.push(page);
        }
    }
    pdf.push(cepstral_page(stats, cfg).map_err(plot_error).context("cepstral page")?);

    let pages = pdf.len();
    pdf.save(&report.outputs.pdf)
        .with_context(|| format!("cannot write {}", report.outputs.pdf.display()))?;
    Ok(pages)
}

/// The whole batch: analysis, text outputs and, unless disabled, the PDF.
pub fn run_ensemble_analysis(params: &RunParams, cfg: &RenderConfig) -> Result<Report> {
    let report = analyze_ensemble(params)?;
    if params.plots {
        let pages = render_report(&report, params, cfg)?;
        info!("{} pages rendered", pages);
    } else {
        info!("Plots disabled, {} not written", report.outputs.pdf.display());
    }
    Ok(report)
}
