use log::{debug, warn};
use ndarray::prelude::*;
use ndarray::Zip;
use num_complex::Complex64;

/// Running-average window in bins for a smoothing width of `width_thz`.
///
/// `n_freqs` bins cover the frequency axis, so the resolution is
/// `1000 / (2 * n_freqs * dt_fs)` THz. The window is forced odd.
pub fn filter_window(width_thz: f64, dt_fs: f64, n_freqs: usize) -> usize {
    let bins = (width_thz / 1000.0 * dt_fs * n_freqs as f64 * 2.0).round();
    let mut window = if bins.is_finite() && bins > 1.0 { bins as usize } else { 1 };
    if window % 2 == 0 {
        debug!("filter window {} is even, using {}", window, window + 1);
        window += 1;
    }
    window
}

fn usable_window(window: usize, len: usize) -> usize {
    let mut half = window.max(1) / 2;
    if len > 0 && half >= len {
        half = len - 1;
        warn!(
            "filter window {} longer than the data ({}), reduced to {}",
            window,
            len,
            2 * half + 1
        );
    }
    half
}

/// Moving average of odd width with mirrored edges; the output has the input length.
///
/// Edges are reflected without repeating the end samples, so
/// `[x0 x1 x2 ...]` is padded as `[... x2 x1 | x0 x1 x2 ...]`.
pub fn running_average(x: ArrayView1<f64>, window: usize) -> Array1<f64> {
    let n = x.len();
    let half = usable_window(window, n);
    if half == 0 || n == 0 {
        return x.to_owned();
    }

    let mut padded = Vec::with_capacity(n + 2 * half);
    padded.extend((1..=half).rev().map(|i| x[i]));
    padded.extend(x.iter().copied());
    padded.extend((1..=half).map(|i| x[n - 1 - i]));

    let width = 2 * half + 1;
    let mut out = Array1::zeros(n);
    let mut acc: f64 = padded[..width].iter().sum();
    out[0] = acc / width as f64;
    for k in 1..n {
        acc += padded[k + width - 1] - padded[k - 1];
        out[k] = acc / width as f64;
    }
    out
}

/// [`running_average`] applied to the real and imaginary parts.
pub fn running_average_complex(x: ArrayView1<Complex64>, window: usize) -> Array1<Complex64> {
    let re = running_average(x.mapv(|c| c.re).view(), window);
    let im = running_average(x.mapv(|c| c.im).view(), window);
    Zip::from(&re)
        .and(&im)
        .map_collect(|&r, &i| Complex64::new(r, i))
}

/// Filters every matrix element of an M x M x F cospectrum along frequency.
pub fn filter_cospectrum(cospectrum: &Array3<Complex64>, window: usize) -> Array3<Complex64> {
    let mut out = cospectrum.clone();
    for mut lane in out.lanes_mut(Axis(2)) {
        let filtered = running_average_complex(lane.view(), window);
        lane.assign(&filtered);
    }
    out
}
