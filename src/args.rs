use clap::Parser;
use std::path::PathBuf;

use crate::aggregate::PadFill;
use crate::error::EnsembleError;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kappa-ensemble",
    version,
    about = "Aggregate repeated cepstral analysis runs: ensemble mean/std, chi-squared KS checks and a multi-page PDF report.",
    after_help = "N_PROCESSES is the number of independent processes used, N_CURRENTS the number of currents in every random process.
The chi-squared degrees of freedom are N_PROCESSES - N_CURRENTS + 1.
Every INPUT is a basename: INPUT.psd.npy|dat, INPUT.cepstral.npy|dat and INPUT.kappa_scale_aicKmin.dat are read,
INPUT.cospectrum.npy|dat is used when present. At least two inputs are needed for meaningful statistics.

This program is licensed under the MIT License
see https://opensource.org/license/mit"
)]
pub struct Args {
    /// Output prefix (writes OUTPUT.log, OUTPUT.mean_periodogram, OUTPUT.mean_cepstral, OUTPUT_all.pdf)
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Number of currents in every random process (M)
    #[arg(value_name = "N_CURRENTS")]
    pub n_currents: usize,

    /// Number of independent processes (L)
    #[arg(value_name = "N_PROCESSES")]
    pub n_processes: usize,

    /// Time step in femtoseconds
    #[arg(value_name = "DT_FS")]
    pub dt_fs: f64,

    /// Upper frequency limit of the PSD plots in THz
    #[arg(value_name = "MAX_THZ")]
    pub max_thz: f64,

    /// Nyquist frequency marker in THz (<= 0 disables the marker)
    #[arg(value_name = "NYQUIST", allow_negative_numbers = true)]
    pub nyquist: f64,

    /// Upper limit of the PSD plots in W/(m K) (<= 0 scales from the data)
    #[arg(value_name = "K_SI_MAX", allow_negative_numbers = true)]
    pub k_si_max: f64,

    /// Upper frequency limit of the zoomed inset in THz
    #[arg(value_name = "ZOOM_MAX_THZ")]
    pub zoom_max_thz: f64,

    /// Upper limit of the zoomed inset in W/(m K) (<= 0 scales from the data)
    #[arg(value_name = "ZOOM_K_SI_MAX", allow_negative_numbers = true)]
    pub zoom_k_si_max: f64,

    /// Input basenames
    #[arg(value_name = "INPUT", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// How shorter cepstral arrays are padded when aligned to the first run.
    #[arg(long, value_enum, default_value_t = PadFill::Missing)]
    pub pad_fill: PadFill,

    /// Index of the run drawn as the single-run trace (clamped to the last run).
    #[arg(long, default_value_t = 2)]
    pub plot_run: usize,

    /// Number of low-frequency bins searched for significant components.
    #[arg(long, default_value_t = 100)]
    pub all_cut: usize,

    /// Running-average width in THz applied to the single run.
    #[arg(long, default_value_t = 0.5)]
    pub filter_single_thz: f64,

    /// Running-average width in THz applied to the ensemble mean.
    #[arg(long, default_value_t = 0.2)]
    pub filter_mean_thz: f64,

    /// Skip the PDF report.
    #[arg(long)]
    pub no_plots: bool,

    /// Page width in pixels.
    #[arg(long, default_value_t = 1360)]
    pub page_width: u32,

    /// Page height in pixels.
    #[arg(long, default_value_t = 800)]
    pub page_height: u32,

    /// Raster resolution used when placing pages in the PDF.
    #[arg(long, default_value_t = 200.0)]
    pub dpi: f32,
}

/// Validated run parameters derived from [`Args`].
#[derive(Debug, Clone)]
pub struct RunParams {
    pub output: PathBuf,
    pub n_currents: usize,
    pub n_processes: usize,
    pub dt_fs: f64,
    pub max_thz: f64,
    pub nyquist: Option<f64>,
    pub k_si_max: Option<f64>,
    pub zoom_max_thz: f64,
    pub zoom_k_si_max: Option<f64>,
    pub inputs: Vec<PathBuf>,
    pub pad_fill: PadFill,
    pub plot_run: usize,
    pub all_cut: usize,
    pub filter_single_thz: f64,
    pub filter_mean_thz: f64,
    pub plots: bool,
}

impl RunParams {
    /// Degrees of freedom of the chi-squared distribution of a single periodogram bin.
    pub fn dof(&self) -> usize {
        self.n_processes + 1 - self.n_currents
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

impl TryFrom<&Args> for RunParams {
    type Error = EnsembleError;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        if args.n_currents == 0 {
            return Err(EnsembleError::InvalidParameter(
                "N_CURRENTS must be at least 1".to_string(),
            ));
        }
        if args.n_processes + 1 <= args.n_currents {
            return Err(EnsembleError::InvalidParameter(format!(
                "N_PROCESSES - N_CURRENTS + 1 must be positive (got {} - {} + 1)",
                args.n_processes, args.n_currents
            )));
        }
        if !(args.dt_fs > 0.0) {
            return Err(EnsembleError::InvalidParameter(format!(
                "DT_FS must be positive (got {})",
                args.dt_fs
            )));
        }
        if !(args.max_thz > 0.0) || !(args.zoom_max_thz > 0.0) {
            return Err(EnsembleError::InvalidParameter(
                "MAX_THZ and ZOOM_MAX_THZ must be positive".to_string(),
            ));
        }
        if args.all_cut == 0 {
            return Err(EnsembleError::InvalidParameter(
                "--all-cut must be at least 1".to_string(),
            ));
        }
        if args.filter_single_thz < 0.0 || args.filter_mean_thz < 0.0 {
            return Err(EnsembleError::InvalidParameter(
                "filter widths must not be negative".to_string(),
            ));
        }

        Ok(RunParams {
            output: args.output.clone(),
            n_currents: args.n_currents,
            n_processes: args.n_processes,
            dt_fs: args.dt_fs,
            max_thz: args.max_thz,
            nyquist: positive(Some(args.nyquist)),
            k_si_max: positive(Some(args.k_si_max)),
            zoom_max_thz: args.zoom_max_thz,
            zoom_k_si_max: positive(Some(args.zoom_k_si_max)),
            inputs: args.inputs.clone(),
            pad_fill: args.pad_fill,
            plot_run: args.plot_run,
            all_cut: args.all_cut,
            filter_single_thz: args.filter_single_thz,
            filter_mean_thz: args.filter_mean_thz,
            plots: !args.no_plots,
        })
    }
}
