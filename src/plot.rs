use std::error::Error;

use ndarray::prelude::*;
use num_complex::Complex64;
use plotters::coord::cartesian::Cartesian2d;
use plotters::coord::combinators::BindKeyPoints;
use plotters::coord::types::RangedCoordf64;
use plotters::coord::Shift;
use plotters::prelude::*;
use statrs::distribution::Continuous;

use crate::aggregate::EnsembleStats;
use crate::args::{Args, RunParams};
use crate::filter::{filter_cospectrum, filter_window, running_average};
use crate::gof::{chi_squared, GofTest, KsResult};
use crate::pdf::Page;
use crate::utils::{as_si, decimals_for, n_tick_in_range, ticks_between};

pub type PlotResult<T> = Result<T, Box<dyn Error + Send + Sync>>;
type Area<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

/// Inset position in figure fractions: left, bottom, width, height.
const ZOOM_INSET: [f64; 4] = [0.23, 0.55, 0.3, 0.3];
const KAPPA_HIST_BINS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct Palette {
    pub raw: RGBColor,
    pub trace: RGBColor,
    pub cospectrum: RGBColor,
    pub band: RGBColor,
    pub theory: RGBColor,
    pub marker: RGBColor,
    pub secondary: RGBColor,
}

impl Default for Palette {
    fn default() -> Self {
        Palette {
            raw: RGBColor(170, 170, 170),
            trace: RGBColor(0, 102, 204),
            cospectrum: RGBColor(204, 102, 0),
            band: RGBColor(0, 102, 204),
            theory: RGBColor(34, 139, 34),
            marker: RGBColor(200, 30, 30),
            secondary: RGBColor(160, 32, 240),
        }
    }
}

/// Everything the renderer needs to know about page geometry and style.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub dpi: f32,
    pub font: String,
    pub label_size: u32,
    pub desc_size: u32,
    pub title_size: u32,
    pub inset_label_size: u32,
    pub line_width: u32,
    pub palette: Palette,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            width: 1360,
            height: 800,
            dpi: 200.0,
            font: "sans-serif".to_string(),
            label_size: 22,
            desc_size: 24,
            title_size: 28,
            inset_label_size: 15,
            line_width: 2,
            palette: Palette::default(),
        }
    }
}

impl RenderConfig {
    pub fn from_args(args: &Args) -> Self {
        RenderConfig {
            width: args.page_width.max(200),
            height: args.page_height.max(150),
            dpi: if args.dpi > 0.0 { args.dpi } else { 200.0 },
            ..Default::default()
        }
    }

    fn font(&self, size: u32) -> (&str, u32) {
        (self.font.as_str(), size)
    }
}

/// One spectrum ready for drawing: the raw single-run periodogram, the trace
/// shown on top of it and, when available, the matching cospectrum.
#[derive(Debug, Clone)]
pub struct PsdView {
    pub label: String,
    pub freqs: Array1<f64>,
    pub psd: Array1<f64>,
    pub fpsd: Array1<f64>,
    pub cospectrum: Option<Array3<Complex64>>,
    /// Multiplies the periodogram into SI units of the transport coefficient.
    pub kappa_scale: f64,
}

impl PsdView {
    fn scale(&self) -> f64 {
        self.kappa_scale * 0.5
    }

    fn index_below(&self, max_thz: f64) -> usize {
        self.freqs
            .iter()
            .position(|&f| f > max_thz)
            .unwrap_or(self.freqs.len())
    }
}

/// The three PSD views: unfiltered mean, single run filtered with the narrow
/// width and mean filtered with the wide width.
pub fn psd_stages(stats: &EnsembleStats, params: &RunParams) -> Vec<PsdView> {
    let run = params.plot_run.min(stats.n_runs().saturating_sub(1));
    let n_freqs = stats.n_freqs();
    let kappa_scale = stats.mean_kappa_scale / params.dt_fs;
    let single = stats.periodograms.slice(s![run, 0, ..]).to_owned();
    let mean = stats.periodogram.mean.row(0).to_owned();
    let single_cospectrum = stats.cospectra.as_ref().and_then(|c| c.get(run).cloned());

    let w_single = filter_window(params.filter_single_thz, params.dt_fs, n_freqs);
    let w_mean = filter_window(params.filter_mean_thz, params.dt_fs, n_freqs);

    vec![
        PsdView {
            label: "mean, unfiltered".to_string(),
            freqs: stats.freqs.clone(),
            psd: single.clone(),
            fpsd: mean.clone(),
            cospectrum: stats.mean_cospectrum.clone(),
            kappa_scale,
        },
        PsdView {
            label: format!("{}, filtered {} THz", stats.names[run], params.filter_single_thz),
            freqs: stats.freqs.clone(),
            psd: single.clone(),
            fpsd: running_average(single.view(), w_single),
            cospectrum: single_cospectrum.map(|c| filter_cospectrum(&c, w_single)),
            kappa_scale,
        },
        PsdView {
            label: format!("mean, filtered {} THz", params.filter_mean_thz),
            freqs: stats.freqs.clone(),
            psd: single,
            fpsd: running_average(mean.view(), w_mean),
            cospectrum: stats
                .mean_cospectrum
                .as_ref()
                .map(|c| filter_cospectrum(c, w_mean)),
            kappa_scale,
        },
    ]
}

fn finite_max(values: impl Iterator<Item = f64>) -> f64 {
    values.filter(|v| v.is_finite()).fold(f64::NEG_INFINITY, f64::max)
}

fn finite_min(values: impl Iterator<Item = f64>) -> f64 {
    values.filter(|v| v.is_finite()).fold(f64::INFINITY, f64::min)
}

/// Upper y-limit when none is given: 1.3 times the largest scaled value of the
/// trace (or of Re cospectrum[0,0]) below `max_thz`.
pub fn auto_k_max(view: &PsdView, max_thz: f64) -> f64 {
    let scale = view.scale();
    let idx = view.index_below(max_thz);
    let mut top = finite_max(view.fpsd.iter().take(idx).map(|v| v * scale));
    if let Some(c) = &view.cospectrum {
        let end = idx.min(c.len_of(Axis(2)));
        top = top.max(finite_max(c.slice(s![0, 0, ..end]).iter().map(|z| z.re * scale)));
    }
    let k = top * 1.3;
    if k.is_finite() && k > 0.0 {
        k
    } else {
        1.0
    }
}

/// Non-degenerate `(lo, hi)` around the given bounds.
fn padded_range(lo: f64, hi: f64) -> (f64, f64) {
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    if hi > lo {
        let pad = 0.05 * (hi - lo);
        (lo - pad, hi + pad)
    } else {
        let pad = if lo == 0.0 { 1.0 } else { 0.1 * lo.abs() };
        (lo - pad, hi + pad)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistBin {
    pub lo: f64,
    pub hi: f64,
    pub value: f64,
}

/// Equal-width histogram over the data range, last bin closed on the right.
/// With `density` the bins integrate to one.
pub fn histogram(values: &[f64], bins: usize, density: bool) -> Vec<HistBin> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || bins == 0 {
        return Vec::new();
    }
    let mut lo = finite_min(finite.iter().copied());
    let mut hi = finite_max(finite.iter().copied());
    if hi <= lo {
        lo -= 0.5;
        hi += 0.5;
    }
    let width = (hi - lo) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in &finite {
        let k = (((v - lo) / width) as usize).min(bins - 1);
        counts[k] += 1;
    }
    let norm = if density {
        1.0 / (finite.len() as f64 * width)
    } else {
        1.0
    };
    counts
        .iter()
        .enumerate()
        .map(|(k, &c)| HistBin {
            lo: lo + k as f64 * width,
            hi: lo + (k + 1) as f64 * width,
            value: c as f64 * norm,
        })
        .collect()
}

fn render_page<F>(cfg: &RenderConfig, draw: F) -> PlotResult<Page>
where
    F: FnOnce(&Area) -> PlotResult<()>,
{
    let mut page = Page::blank(cfg.width, cfg.height);
    {
        let root = BitMapBackend::with_buffer(&mut page.rgb, (cfg.width, cfg.height)).into_drawing_area();
        root.fill(&WHITE)?;
        draw(&root)?;
        root.present()?;
    }
    Ok(page)
}

fn band_polygon(x: &[f64], upper: &[f64], lower: &[f64]) -> Vec<(f64, f64)> {
    let mut poly: Vec<(f64, f64)> = x
        .iter()
        .zip(upper)
        .filter(|(_, y)| y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect();
    let lower: Vec<(f64, f64)> = x
        .iter()
        .zip(lower)
        .filter(|(_, y)| y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect();
    poly.extend(lower.into_iter().rev());
    poly
}

/// (a) mean PSD with the +/- 1 sigma band.
pub fn mean_psd_page(stats: &EnsembleStats, cfg: &RenderConfig) -> PlotResult<Page> {
    render_page(cfg, |root| {
        let freqs: Vec<f64> = stats.freqs.to_vec();
        let mean = stats.periodogram.mean.row(0);
        let std = stats.periodogram.std.row(0);
        let upper: Vec<f64> = mean.iter().zip(std.iter()).map(|(m, s)| m + s).collect();
        let lower: Vec<f64> = mean.iter().zip(std.iter()).map(|(m, s)| m - s).collect();

        let x_max = freqs.last().copied().filter(|f| *f > 0.0).unwrap_or(1.0);
        let (y_lo, y_hi) = padded_range(
            finite_min(lower.iter().copied()).min(0.0),
            finite_max(upper.iter().copied()),
        );

        let mut chart = ChartBuilder::on(root)
            .caption("Original PSD", cfg.font(cfg.title_size))
            .margin(20)
            .x_label_area_size(60)
            .y_label_area_size(110)
            .build_cartesian_2d(0.0..x_max, y_lo..y_hi)?;

        chart
            .configure_mesh()
            .x_desc("f [THz]")
            .y_desc("PSD")
            .x_labels(10)
            .y_labels(8)
            .y_label_formatter(&|v| format!("{:.2e}", v))
            .label_style(cfg.font(cfg.label_size))
            .axis_desc_style(cfg.font(cfg.desc_size))
            .light_line_style(WHITE)
            .draw()?;

        let band = cfg.palette.band;
        chart.draw_series(std::iter::once(Polygon::new(
            band_polygon(&freqs, &upper, &lower),
            band.mix(0.25).filled(),
        )))?;
        chart
            .draw_series(LineSeries::new(
                freqs.iter().copied().zip(mean.iter().copied()).filter(|(_, y)| y.is_finite()),
                band.stroke_width(cfg.line_width),
            ))?
            .label("mean")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], band.stroke_width(2)));

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.85))
            .border_style(BLACK.mix(0.4))
            .label_font(cfg.font(cfg.label_size))
            .draw()?;
        Ok(())
    })
}

/// Heights of the Nyquist arrow tip and tail: the tip sits a seventh of the way
/// from the scaled trace at the Nyquist bin up to `y_max`, the tail `y_max / 7`
/// above it.
pub fn nyquist_arrow(view: &PsdView, nyq: f64, y_max: f64) -> (f64, f64) {
    let last = view.fpsd.len().min(view.freqs.len()).saturating_sub(1);
    let idx = view.freqs.iter().position(|&f| f >= nyq).unwrap_or(last).min(last);
    let base = view
        .fpsd
        .get(idx)
        .map(|v| v * view.scale())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
        .min(y_max);
    let tip = (y_max - base) / 7.0 + base;
    (tip, tip + y_max / 7.0)
}

/// Scaled single-run spectrum, trace and Re cospectrum[0,0] up to `max_thz`,
/// with an optional Nyquist arrow. Values outside the y-limit are clipped to it.
#[allow(clippy::too_many_arguments)]
fn draw_psd(
    area: &Area,
    view: &PsdView,
    cfg: &RenderConfig,
    max_thz: f64,
    k_max: Option<f64>,
    nyquist: Option<f64>,
    label_size: u32,
    caption: Option<&str>,
) -> PlotResult<()> {
    let scale = view.scale();
    let y_max = k_max.unwrap_or_else(|| auto_k_max(view, max_thz));
    let y_min = view
        .cospectrum
        .as_ref()
        .map(|c| {
            finite_min(c.slice(s![0, 0, ..]).iter().map(|z| z.re * scale))
                .min(0.0)
                .max(-y_max)
        })
        .unwrap_or(0.0);
    let idx = view.index_below(max_thz);
    let clip = |v: f64| v.clamp(y_min, y_max);

    let (x_major, x_minor) = n_tick_in_range(0.0, max_thz, 5);
    let (y_major, y_minor) = n_tick_in_range(0.0, y_max, 5);
    let x_coord = (0.0..max_thz)
        .with_key_points(ticks_between(0.0, max_thz, x_major))
        .with_light_points(ticks_between(0.0, max_thz, x_minor));
    let y_coord = (y_min..y_max)
        .with_key_points(ticks_between(y_min, y_max, y_major))
        .with_light_points(ticks_between(y_min, y_max, y_minor));
    let x_dec = decimals_for(x_major);
    let y_dec = decimals_for(y_major);
    let (x_desc, y_desc) = match caption {
        Some(_) => ("f [THz]", "PSD [W/(m K)]"),
        None => ("", ""),
    };

    let mut builder = ChartBuilder::on(area);
    if let Some(title) = caption {
        builder.caption(title, cfg.font(cfg.title_size));
    }
    let mut chart = builder
        .margin(15)
        .x_label_area_size((label_size * 2 + 10) as i32)
        .y_label_area_size((label_size * 4) as i32)
        .build_cartesian_2d(x_coord, y_coord)?;

    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .x_label_formatter(&|v| format!("{:.*}", x_dec, v))
        .y_label_formatter(&|v| format!("{:.*}", y_dec, v))
        .label_style(cfg.font(label_size))
        .axis_desc_style(cfg.font(cfg.desc_size))
        .light_line_style(RGBColor(238, 238, 238))
        .bold_line_style(RGBColor(215, 215, 215))
        .draw()?;

    let freqs = view.freqs.slice(s![..idx]);
    let raw = cfg.palette.raw;
    chart
        .draw_series(LineSeries::new(
            freqs
                .iter()
                .zip(view.psd.iter())
                .filter(|(_, p)| p.is_finite())
                .map(|(&f, &p)| (f, clip(p * scale))),
            raw.stroke_width(1),
        ))?
        .label("single run")
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], raw.stroke_width(2)));

    let trace = cfg.palette.trace;
    chart
        .draw_series(LineSeries::new(
            freqs
                .iter()
                .zip(view.fpsd.iter())
                .filter(|(_, p)| p.is_finite())
                .map(|(&f, &p)| (f, clip(p * scale))),
            trace.stroke_width(cfg.line_width),
        ))?
        .label(view.label.clone())
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], trace.stroke_width(2)));

    if let Some(c) = &view.cospectrum {
        let color = cfg.palette.cospectrum;
        chart
            .draw_series(LineSeries::new(
                freqs
                    .iter()
                    .zip(c.slice(s![0, 0, ..]).iter())
                    .map(|(&f, z)| (f, clip(z.re * scale))),
                color.stroke_width(cfg.line_width),
            ))?
            .label("Re cospectrum[0,0]")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], color.stroke_width(2)));
    }

    if let Some(nyq) = nyquist.filter(|&n| n < max_thz) {
        let marker = cfg.palette.marker;
        let (tip, tail) = nyquist_arrow(view, nyq, y_max);
        let dx = 0.012 * max_thz;
        let dy = 0.04 * y_max;
        chart.draw_series(std::iter::once(PathElement::new(
            vec![(nyq, tail), (nyq, tip)],
            marker.stroke_width(2),
        )))?;
        chart.draw_series(std::iter::once(PathElement::new(
            vec![(nyq - dx, tip + dy), (nyq, tip), (nyq + dx, tip + dy)],
            marker.stroke_width(2),
        )))?;
        chart.draw_series(std::iter::once(Text::new(
            "Nyquist".to_string(),
            (nyq, tail + dy),
            cfg.font(label_size).into_font().color(&marker),
        )))?;
    }

    if caption.is_some() {
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .background_style(WHITE.mix(0.85))
            .border_style(BLACK.mix(0.4))
            .label_font(cfg.font(cfg.label_size))
            .draw()?;
    }
    Ok(())
}

/// (b) annotated PSD of one filter stage.
pub fn psd_page(view: &PsdView, params: &RunParams, cfg: &RenderConfig) -> PlotResult<Page> {
    render_page(cfg, |root| {
        draw_psd(
            root,
            view,
            cfg,
            params.max_thz,
            params.k_si_max,
            params.nyquist,
            cfg.label_size,
            Some(view.label.as_str()),
        )
    })
}

/// (c) annotated PSD with a zoomed inset on the low-frequency part.
pub fn psd_zoom_page(view: &PsdView, params: &RunParams, cfg: &RenderConfig) -> PlotResult<Page> {
    render_page(cfg, |root| {
        draw_psd(
            root,
            view,
            cfg,
            params.max_thz,
            params.k_si_max,
            params.nyquist,
            cfg.label_size,
            Some(view.label.as_str()),
        )?;

        let (w, h) = (cfg.width as f64, cfg.height as f64);
        let [left, bottom, iw, ih] = ZOOM_INSET;
        let x0 = (left * w) as i32;
        let y0 = ((1.0 - bottom - ih) * h) as i32;
        let inset = root.clone().shrink((x0, y0), ((iw * w) as i32, (ih * h) as i32));
        inset.fill(&WHITE)?;
        draw_psd(
            &inset,
            view,
            cfg,
            params.zoom_max_thz,
            params.zoom_k_si_max,
            params.nyquist,
            cfg.inset_label_size,
            None,
        )
    })
}

/// (d) Re cospectrum[1,0] and Re cospectrum[1,1]; `None` without a cospectrum
/// of at least two currents.
pub fn cospectrum_page(view: &PsdView, params: &RunParams, cfg: &RenderConfig) -> PlotResult<Option<Page>> {
    let c = match &view.cospectrum {
        Some(c) if c.len_of(Axis(0)) >= 2 && c.len_of(Axis(1)) >= 2 => c,
        _ => return Ok(None),
    };
    let idx = view.index_below(params.max_thz).min(c.len_of(Axis(2)));
    let off: Vec<(f64, f64)> = (0..idx).map(|k| (view.freqs[k], c[[1, 0, k]].re)).collect();
    let diag: Vec<(f64, f64)> = (0..idx).map(|k| (view.freqs[k], c[[1, 1, k]].re)).collect();
    let all = off.iter().chain(diag.iter()).map(|p| p.1);
    let (y_lo, y_hi) = padded_range(finite_min(all.clone()), finite_max(all));

    let page = render_page(cfg, |root| {
        let mut chart = ChartBuilder::on(root)
            .caption(format!("cospectrum, {}", view.label), cfg.font(cfg.title_size))
            .margin(20)
            .x_label_area_size(60)
            .y_label_area_size(110)
            .build_cartesian_2d(0.0..params.max_thz, y_lo..y_hi)?;
        chart
            .configure_mesh()
            .x_desc("f [THz]")
            .y_desc("cospectrum")
            .y_label_formatter(&|v| format!("{:.2e}", v))
            .label_style(cfg.font(cfg.label_size))
            .axis_desc_style(cfg.font(cfg.desc_size))
            .light_line_style(WHITE)
            .draw()?;

        let c10 = cfg.palette.trace;
        chart
            .draw_series(LineSeries::new(off.iter().copied(), c10.stroke_width(cfg.line_width)))?
            .label("Re cospectrum[1,0]")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], c10.stroke_width(2)));
        let c11 = cfg.palette.secondary;
        chart
            .draw_series(LineSeries::new(diag.iter().copied(), c11.stroke_width(cfg.line_width)))?
            .label("Re cospectrum[1,1]")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], c11.stroke_width(2)));
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.85))
            .border_style(BLACK.mix(0.4))
            .label_font(cfg.font(cfg.label_size))
            .draw()?;
        Ok(())
    })?;
    Ok(Some(page))
}

/// x-extent of the bins.
fn histogram_span(bins: &[HistBin]) -> (f64, f64) {
    match (bins.first(), bins.last()) {
        (Some(first), Some(last)) => (first.lo, last.hi),
        _ => (0.0, 1.0),
    }
}

/// x-range of a chi-squared histogram page: always from the origin.
pub fn gof_x_range(bins: &[HistBin]) -> (f64, f64) {
    let (lo, hi) = histogram_span(bins);
    (lo.min(0.0), hi)
}

fn draw_histogram<'a, 'b>(
    area: &'a Area<'b>,
    cfg: &RenderConfig,
    title: &str,
    x_desc: &str,
    y_desc: &str,
    bins: &[HistBin],
    (x_lo, x_hi): (f64, f64),
) -> PlotResult<ChartContext<'a, BitMapBackend<'b>, Cartesian2d<RangedCoordf64, RangedCoordf64>>> {
    if bins.is_empty() {
        return Err("histogram without finite values".into());
    }
    let y_hi = finite_max(bins.iter().map(|b| b.value)).max(f64::MIN_POSITIVE) * 1.15;

    let mut chart = ChartBuilder::on(area)
        .caption(title, cfg.font(cfg.title_size))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(100)
        .build_cartesian_2d(x_lo..x_hi, 0.0..y_hi)?;
    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .label_style(cfg.font(cfg.label_size))
        .axis_desc_style(cfg.font(cfg.desc_size))
        .light_line_style(WHITE)
        .draw()?;

    let fill = cfg.palette.band.mix(0.45).filled();
    chart.draw_series(
        bins.iter()
            .map(|b| Rectangle::new([(b.lo, 0.0), (b.hi, b.value)], fill)),
    )?;
    chart.draw_series(bins.iter().map(|b| {
        Rectangle::new([(b.lo, 0.0), (b.hi, b.value)], cfg.palette.band.stroke_width(1))
    }))?;
    Ok(chart)
}

/// (e) per-run kappa at each run's own AIC cutoff.
pub fn kappa_histogram_page(stats: &EnsembleStats, cfg: &RenderConfig) -> PlotResult<Option<Page>> {
    let bins = histogram(&stats.kappas_at_aic, KAPPA_HIST_BINS, false);
    if bins.is_empty() {
        return Ok(None);
    }
    let page = render_page(cfg, |root| {
        draw_histogram(
            root,
            cfg,
            "kappa at AIC cutoff",
            "kappa [W/(m K)]",
            "runs",
            &bins,
            histogram_span(&bins),
        )?;
        Ok(())
    })?;
    Ok(Some(page))
}

/// The two annotation lines of a KS test, one decimal in the mantissa.
pub fn ks_annotation(ks: &KsResult) -> [String; 2] {
    [
        format!("KS-value={}", as_si(ks.statistic, 1)),
        format!("P={}", as_si(ks.p_value, 1)),
    ]
}

/// (f) normalized periodogram density against the chi-squared pdf.
pub fn gof_page(test: &GofTest, cfg: &RenderConfig) -> PlotResult<Option<Page>> {
    let bins = histogram(&test.values, test.hist_bins, true);
    if bins.is_empty() {
        return Ok(None);
    }
    let dist = chi_squared(test.dof)?;
    let page = render_page(cfg, |root| {
        let title = format!("{} vs chi2({})", test.label, test.dof);
        let (x_lo, x_hi) = gof_x_range(&bins);
        let mut chart = draw_histogram(
            root,
            cfg,
            &title,
            "normalized periodogram",
            "density",
            &bins,
            (x_lo, x_hi),
        )?;

        let y_top = chart.y_range().end;
        let n = 400;
        let curve: Vec<(f64, f64)> = (0..=n)
            .map(|i| x_lo + (x_hi - x_lo) * i as f64 / n as f64)
            .filter(|&x| x > 0.0)
            .map(|x| (x, dist.pdf(x).min(y_top)))
            .collect();
        let theory = cfg.palette.theory;
        chart
            .draw_series(LineSeries::new(curve, theory.stroke_width(cfg.line_width)))?
            .label(format!("chi2 pdf, {} dof", test.dof))
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], theory.stroke_width(2)));
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.85))
            .border_style(BLACK.mix(0.4))
            .label_font(cfg.font(cfg.label_size))
            .draw()?;

        let font = cfg.font(cfg.label_size).into_font();
        let x_text = (cfg.width as f64 * 0.62) as i32;
        let y_text = (cfg.height as f64 * 0.3) as i32;
        for (line, text) in ks_annotation(&test.ks).into_iter().enumerate() {
            let y = y_text + line as i32 * (cfg.label_size as i32 + 6);
            root.draw(&Text::new(text, (x_text, y), font.clone()))?;
        }
        Ok(())
    })?;
    Ok(Some(page))
}

/// y-limits of the convergence plot: the std band over `[aic, 3 aic)` scaled by 0.8 and 1.2.
pub fn cepstral_y_range(mean: &[f64], spread: &[f64], aic: usize) -> (f64, f64) {
    let end = (3 * aic).min(mean.len());
    let start = aic.min(end);
    let (lo, hi) = if end > start {
        (
            finite_min((start..end).map(|k| mean[k] - spread[k])) * 0.8,
            finite_max((start..end).map(|k| mean[k] + spread[k])) * 1.2,
        )
    } else {
        (f64::NAN, f64::NAN)
    };
    if lo.is_finite() && hi.is_finite() && hi > lo {
        (lo, hi)
    } else {
        padded_range(
            finite_min(mean.iter().zip(spread).map(|(m, s)| m - s)),
            finite_max(mean.iter().zip(spread).map(|(m, s)| m + s)),
        )
    }
}

/// (g) mean cepstral kappa against the cutoff with the ensemble std band and
/// the mean theoretical error.
pub fn cepstral_page(stats: &EnsembleStats, cfg: &RenderConfig) -> PlotResult<Page> {
    render_page(cfg, |root| {
        let mean: Vec<f64> = stats.cepstral.mean.row(0).to_vec();
        let spread: Vec<f64> = stats.cepstral.std.row(0).to_vec();
        let theory: Vec<f64> = stats.cepstral.mean.row(1).to_vec();
        let aic = stats.aic_index;
        let x_hi = ((10 * aic).max(1) as f64).min(mean.len().max(2) as f64 - 1.0).max(1.0);
        let (y_lo, y_hi) = cepstral_y_range(&mean, &spread, aic);
        let shown = (x_hi as usize + 1).min(mean.len());
        let (mean, spread, theory) = (&mean[..shown], &spread[..shown], &theory[..shown]);
        let k: Vec<f64> = (0..shown).map(|i| i as f64).collect();
        let clip = |v: f64| v.clamp(y_lo, y_hi);

        let mut chart = ChartBuilder::on(root)
            .caption(format!("kappa vs cutoff, mean AIC cutoff {}", aic), cfg.font(cfg.title_size))
            .margin(20)
            .x_label_area_size(60)
            .y_label_area_size(110)
            .build_cartesian_2d(0.0..x_hi, y_lo..y_hi)?;
        chart
            .configure_mesh()
            .x_desc("cutoff K")
            .y_desc("kappa [W/(m K)]")
            .x_label_formatter(&|v| format!("{:.0}", v))
            .label_style(cfg.font(cfg.label_size))
            .axis_desc_style(cfg.font(cfg.desc_size))
            .light_line_style(WHITE)
            .draw()?;

        let upper: Vec<f64> = mean.iter().zip(spread).map(|(m, s)| clip(m + s)).collect();
        let lower: Vec<f64> = mean.iter().zip(spread).map(|(m, s)| clip(m - s)).collect();
        let band = cfg.palette.band;
        chart
            .draw_series(std::iter::once(Polygon::new(
                band_polygon(&k, &upper, &lower),
                band.mix(0.25).filled(),
            )))?
            .label("ensemble std")
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 18, y + 5)], band.mix(0.25).filled()));

        let th = cfg.palette.theory;
        for sign in [1.0, -1.0] {
            let series = chart.draw_series(LineSeries::new(
                k.iter()
                    .zip(mean.iter().zip(theory))
                    .map(|(&x, (m, t))| (x, m + sign * t))
                    .filter(|(_, y)| y.is_finite())
                    .map(|(x, y)| (x, clip(y))),
                th.stroke_width(1),
            ))?;
            if sign > 0.0 {
                series
                    .label("mean theoretical error")
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], th.stroke_width(2)));
            }
        }

        chart
            .draw_series(LineSeries::new(
                k.iter()
                    .copied()
                    .zip(mean.iter().copied())
                    .filter(|(_, y)| y.is_finite())
                    .map(|(x, y)| (x, clip(y))),
                band.stroke_width(cfg.line_width),
            ))?
            .label("mean")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 18, y)], band.stroke_width(2)));

        let marker = cfg.palette.marker;
        chart.draw_series(std::iter::once(PathElement::new(
            vec![(aic as f64, y_lo), (aic as f64, y_hi)],
            marker.stroke_width(1),
        )))?;

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.85))
            .border_style(BLACK.mix(0.4))
            .label_font(cfg.font(cfg.label_size))
            .draw()?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn view(fpsd: Vec<f64>, cospectrum: Option<Array3<Complex64>>) -> PsdView {
        let n = fpsd.len();
        PsdView {
            label: "test".to_string(),
            freqs: Array1::linspace(0.0, (n - 1) as f64, n),
            psd: Array1::zeros(n),
            fpsd: Array1::from(fpsd),
            cospectrum,
            kappa_scale: 2.0,
        }
    }

    #[test]
    fn auto_limit_uses_values_below_max_frequency() {
        // scale = 2 * 0.5 = 1; only f <= 2 counts
        let v = view(vec![1.0, 3.0, 2.0, 50.0], None);
        assert_abs_diff_eq!(auto_k_max(&v, 2.0), 3.0 * 1.3, epsilon = 1e-12);
    }

    #[test]
    fn auto_limit_considers_cospectrum() {
        let c = Array3::from_shape_fn((1, 1, 4), |(_, _, f)| Complex64::new(if f == 1 { 10.0 } else { 0.0 }, 5.0));
        let v = view(vec![1.0, 3.0, 2.0, 50.0], Some(c));
        assert_abs_diff_eq!(auto_k_max(&v, 2.0), 13.0, epsilon = 1e-12);
    }

    #[test]
    fn auto_limit_falls_back_to_one() {
        let v = view(vec![0.0, 0.0], None);
        assert_eq!(auto_k_max(&v, 10.0), 1.0);
    }

    #[test]
    fn histogram_counts_and_density() {
        let values = [0.0, 0.5, 1.0, 1.0, 2.0];
        let counts = histogram(&values, 2, false);
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].value, 2.0);
        assert_eq!(counts[1].value, 3.0);
        assert_abs_diff_eq!(counts[1].hi, 2.0);

        let density = histogram(&values, 4, true);
        let area: f64 = density.iter().map(|b| b.value * (b.hi - b.lo)).sum();
        assert_abs_diff_eq!(area, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn histogram_of_constant_data_spans_unit_interval() {
        let bins = histogram(&[3.0, 3.0, f64::NAN], 10, false);
        assert_abs_diff_eq!(bins[0].lo, 2.5);
        assert_abs_diff_eq!(bins[9].hi, 3.5);
        assert_eq!(bins.iter().map(|b| b.value).sum::<f64>(), 2.0);
        assert!(histogram(&[f64::NAN], 10, false).is_empty());
    }

    #[test]
    fn convergence_limits_follow_band_after_cutoff() {
        let mean = vec![10.0, 1.0, 2.0, 3.0, 4.0, 100.0, 100.0];
        let std = vec![0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0];
        let (lo, hi) = cepstral_y_range(&mean, &std, 2);
        // band over indices 2..6; index 6 is past 3 * aic
        assert_abs_diff_eq!(lo, 1.5 * 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(hi, 100.0 * 1.2, epsilon = 1e-12);

        let (lo, hi) = cepstral_y_range(&mean, &std, 0);
        assert!(hi > lo);
    }

    #[test]
    fn nyquist_arrow_sits_above_trace_at_nyquist_bin() {
        // scale = 1; the Nyquist bin is the first frequency >= 1.5, i.e. f = 2
        let v = view(vec![1.0, 3.0, 2.0, 50.0], None);
        let (tip, tail) = nyquist_arrow(&v, 1.5, 9.0);
        assert_abs_diff_eq!(tip, (9.0 - 2.0) / 7.0 + 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(tail, tip + 9.0 / 7.0, epsilon = 1e-12);

        let (tip, _) = nyquist_arrow(&v, 1.0, 9.0);
        assert_abs_diff_eq!(tip, (9.0 - 3.0) / 7.0 + 3.0, epsilon = 1e-12);
    }

    #[test]
    fn nyquist_arrow_ignores_missing_trace() {
        let v = view(vec![1.0, f64::NAN, 2.0], None);
        let (tip, _) = nyquist_arrow(&v, 1.0, 7.0);
        assert_abs_diff_eq!(tip, 1.0, epsilon = 1e-12);
        // past the last bin the last value is used
        let (tip, _) = nyquist_arrow(&v, 10.0, 9.0);
        assert_abs_diff_eq!(tip, (9.0 - 2.0) / 7.0 + 2.0, epsilon = 1e-12);
    }

    #[test]
    fn ks_annotation_prints_one_decimal() {
        let ks = KsResult {
            statistic: 0.0456,
            p_value: 0.318,
            n: 10,
        };
        assert_eq!(ks_annotation(&ks), ["KS-value=4.6×10^-2".to_string(), "P=3.2×10^-1".to_string()]);
    }

    #[test]
    fn chi_squared_histogram_starts_at_origin() {
        let bins = histogram(&[3.0, 4.0, 8.0], 5, true);
        assert_eq!(gof_x_range(&bins), (0.0, 8.0));
        assert_eq!(histogram_span(&bins), (3.0, 8.0));
    }

    mod stages {
        use super::*;
        use crate::aggregate::{aggregate, PadFill};
        use crate::read::{Ensemble, RunRecord};
        use clap::Parser;

        const F: usize = 8;

        fn record(r: usize) -> RunRecord {
            RunRecord {
                name: format!("run{}", r),
                freqs: Array1::linspace(0.0, 3.5, F),
                periodogram: Array2::from_shape_fn((2, F), |(row, f)| {
                    if row == 0 {
                        1.0 + r as f64 + ((f * 5 + r) % 3) as f64
                    } else {
                        0.1
                    }
                }),
                cepstral: Array2::from_elem((4, 4), 1.0),
                cospectrum: Some(Array3::from_shape_fn((2, 2, F), |(i, j, f)| {
                    Complex64::new((r + 1) as f64 * ((f * 3 + i + j) % 4) as f64, 0.5)
                })),
                kappa_scale: 1.0 + r as f64,
                aic_kmin: 1,
            }
        }

        fn params(extra: &[&str]) -> RunParams {
            let mut argv = vec![
                "kappa-ensemble", "out", "1", "10", "4.0", "2.0", "-1", "0", "1.0", "0", "a", "b", "c",
            ];
            argv.extend_from_slice(extra);
            RunParams::try_from(&Args::try_parse_from(argv).unwrap()).unwrap()
        }

        fn stats() -> EnsembleStats {
            let ensemble = Ensemble {
                freqs: Array1::linspace(0.0, 3.5, F),
                runs: (0..3).map(record).collect(),
                dropped: Vec::new(),
            };
            aggregate(&ensemble, PadFill::Missing, 100).unwrap()
        }

        #[test]
        fn kappa_scale_is_divided_by_timestep() {
            let stats = stats();
            let stages = psd_stages(&stats, &params(&[]));
            assert_eq!(stages.len(), 3);
            // mean of 1, 2, 3 over DT_FS = 4
            for stage in &stages {
                assert_abs_diff_eq!(stage.kappa_scale, 2.0 / 4.0, epsilon = 1e-12);
            }
        }

        #[test]
        fn single_run_stage_uses_its_filtered_cospectrum() {
            let stats = stats();
            let params = params(&["--plot-run", "1", "--filter-single-thz", "47"]);
            let stages = psd_stages(&stats, &params);

            let window = filter_window(params.filter_single_thz, params.dt_fs, F);
            assert_eq!(window, 3);
            let own = &stats.cospectra.as_ref().unwrap()[1];
            let expected = filter_cospectrum(own, window);
            assert_eq!(stages[1].cospectrum.as_ref(), Some(&expected));
            assert_ne!(stages[1].cospectrum.as_ref(), Some(own));

            let single = stats.periodograms.slice(s![1, 0, ..]).to_owned();
            assert_eq!(stages[1].psd, single);
            assert_eq!(stages[1].fpsd, running_average(single.view(), window));
            assert!(stages[1].label.starts_with("run1"));

            assert_eq!(stages[0].cospectrum, stats.mean_cospectrum);
        }

        #[test]
        fn plot_run_is_clamped_to_last_run() {
            let stats = stats();
            let stages = psd_stages(&stats, &params(&["--plot-run", "9"]));
            assert_eq!(stages[1].psd, stats.periodograms.slice(s![2, 0, ..]).to_owned());
        }
    }

    #[test]
    fn padded_range_is_never_empty() {
        let (lo, hi) = padded_range(0.0, 0.0);
        assert!(hi > lo);
        let (lo, hi) = padded_range(f64::INFINITY, f64::NEG_INFINITY);
        assert_eq!((lo, hi), (0.0, 1.0));
    }
}
