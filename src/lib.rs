//! Ensemble post-processing of repeated cepstral transport-coefficient runs.
//!
//! Every run contributes a periodogram, cepstral coefficients, an optional
//! cospectrum and its kappa scale / AIC cutoff. The runs are stacked, reduced
//! to mean and standard deviation, checked against the chi-squared law with
//! Kolmogorov-Smirnov tests and drawn into a multi-page PDF.

pub mod aggregate;
pub mod analysis;
pub mod args;
pub mod error;
pub mod filter;
pub mod gof;
pub mod output;
pub mod pdf;
pub mod plot;
pub mod read;
pub mod utils;

pub use analysis::{analyze_ensemble, render_report, run_ensemble_analysis, Report};
pub use args::{Args, RunParams};
pub use error::EnsembleError;
pub use plot::RenderConfig;
