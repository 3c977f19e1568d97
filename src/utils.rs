use std::ffi::OsString;
use std::path::{Path, PathBuf};

const TICK_SEARCH_MAX_ITER: u32 = 30;

/// Appends `suffix` to a basename without treating any dot in it as an extension.
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn tick_candidate(size: f64, n: usize, n_c: i32) -> f64 {
    let dx0 = size / n as f64;
    let e = 10f64.powf(dx0.log10().ceil());
    let m = dx0 / e;
    let cifre0 = (m * 10f64.powi(n_c)).ceil() as i64;
    let mut cifre = cifre0 - cifre0 % 5;
    if cifre == 0 {
        cifre = 1;
    }
    cifre as f64 * e / 10f64.powi(n_c)
}

fn tick_search(beg: f64, end: f64, n: usize, n_c: i32, nit: u32) -> (f64, f64) {
    let size = end - beg;
    let delta = tick_candidate(size, n, n_c);

    if nit < TICK_SEARCH_MAX_ITER {
        if delta >= size {
            return tick_search(beg, end, n + 1, n_c, nit + 1);
        }
        // Going back to n - 1 is only allowed when that count still leaves room for a tick.
        if size / delta > n as f64 && n > 1 && tick_candidate(size, n - 1, n_c) < size {
            return tick_search(beg, end, n - 1, n_c, nit + 1);
        }
    }

    (delta, delta / 2.0)
}

/// Major and minor tick spacing for roughly `n` ticks in `[beg, end]`.
///
/// The major spacing is a power of ten scaled by 1 or 5 (one significant digit,
/// rounded down to a multiple of five). The tick count is nudged up when the
/// spacing would cover the whole range and down when it yields more ticks than
/// asked for, for at most 30 rounds. The minor spacing is half the major one.
pub fn n_tick_in_range(beg: f64, end: f64, n: usize) -> (f64, f64) {
    tick_search(beg, end, n.max(1), 1, 0)
}

/// Multiples of `step` inside `[beg, end]`.
pub fn ticks_between(beg: f64, end: f64, step: f64) -> Vec<f64> {
    if !(step > 0.0) || !(end > beg) {
        return vec![beg];
    }
    let first = (beg / step).ceil() as i64;
    let last = (end / step + 1e-9).floor() as i64;
    (first..=last).map(|k| k as f64 * step).collect()
}

/// Scientific notation in the form `1.2×10^-3`.
pub fn as_si(x: f64, ndp: usize) -> String {
    let s = format!("{:.*e}", ndp, x);
    match s.split_once('e') {
        Some((m, e)) => match e.parse::<i32>() {
            Ok(exp) => format!("{}×10^{}", m, exp),
            Err(_) => s,
        },
        None => s,
    }
}

/// Number of decimals needed to print multiples of `step`.
pub fn decimals_for(step: f64) -> usize {
    if !(step > 0.0) || step >= 1.0 {
        return 0;
    }
    (-step.log10().floor()) as usize
}
