//! Clock conversion and digital-edge search helpers used by trial reconstruction.

/// Linear map from experiment clock to device clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockModel {
    pub clock_zero: f64,
    pub drift: f64,
}

impl ClockModel {
    pub fn new(clock_zero: f64, drift: f64) -> Self {
        Self { clock_zero, drift }
    }

    pub fn to_device(&self, experiment_time: f64) -> f64 {
        self.clock_zero + experiment_time * (1.0 + self.drift)
    }
}

/// Edge direction on a digital line; any non-zero value counts as high.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Rising,
    Falling,
    Any,
}

impl Polarity {
    fn accepts(self, value: u32) -> bool {
        match self {
            Polarity::Rising => value != 0,
            Polarity::Falling => value == 0,
            Polarity::Any => true,
        }
    }
}

/// Number of edges at or before `horizon`. `times` must be sorted.
pub fn count_until(times: &[f64], horizon: f64) -> usize {
    times.partition_point(|t| *t <= horizon)
}

/// True when successive edge levels never repeat.
pub fn levels_alternate(values: &[u32]) -> bool {
    values.windows(2).all(|w| (w[0] != 0) != (w[1] != 0))
}

/// Mark edges come in (high, low) pairs; `base` is the absolute index of `values[0]`.
pub fn mark_levels_consistent(values: &[u32], base: usize) -> bool {
    values
        .iter()
        .enumerate()
        .all(|(k, v)| (*v != 0) == ((base + k) % 2 == 0))
}

/// The single edge of the given polarity within `target ± radius`, if exactly one exists.
pub fn find_single_edge(
    times: &[f64],
    values: &[u32],
    target: f64,
    radius: f64,
    polarity: Polarity,
) -> Option<f64> {
    let lo = times.partition_point(|t| *t < target - radius);
    let hi = times.partition_point(|t| *t <= target + radius);
    let mut candidates = times[lo..hi]
        .iter()
        .zip(&values[lo..hi])
        .filter(|(_, v)| polarity.accepts(**v))
        .map(|(t, _)| *t);
    let first = candidates.next()?;
    match candidates.next() {
        None => Some(first),
        Some(_) => None,
    }
}

/// Least-squares line through `points`, as (slope, intercept).
pub fn fit_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (sxx, sxy) = points.iter().fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
        let dx = x - mean_x;
        (sxx + dx * dx, sxy + dx * (y - mean_y))
    });
    if sxx <= f64::EPSILON {
        return None;
    }
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}
