// ============================================================================
// IMAGE STATISTICS — min / mean / max and per-channel histograms
// ============================================================================

use rayon::prelude::*;

use crate::error::EditError;
use crate::progress::AtomicProgress;
use crate::raster::{self, Image};

const NUM_TICKS: usize = 8;
/// Histograms are scaled so this many bins (counting from the top) reach 1.0.
const NORMALIZE_RANK: usize = 10;

/// How bin positions map onto the horizontal axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AxisScale {
    Linear,
    Srgb,
    Log,
}

impl AxisScale {
    pub const ALL: [AxisScale; 3] = [AxisScale::Linear, AxisScale::Srgb, AxisScale::Log];

    fn index(self) -> usize {
        match self {
            AxisScale::Linear => 0,
            AxisScale::Srgb => 1,
            AxisScale::Log => 2,
        }
    }

    fn map(self, v: f32) -> f32 {
        match self {
            AxisScale::Linear => v,
            AxisScale::Srgb => raster::linear_to_srgb(v),
            AxisScale::Log => raster::normalized_log_scale(v),
        }
    }
}

/// Parameters the histogram cache is keyed on.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct HistogramParams {
    /// Exposure in stops applied before binning.
    pub exposure: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    /// One vector of bins per colour channel (R, G, B).
    pub values: [Vec<f32>; 3],
    pub x_ticks: Vec<f32>,
    pub x_tick_labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageStatistics {
    pub minimum: f32,
    pub average: f32,
    pub maximum: f32,
    pub exposure: f32,
    histograms: [Histogram; 3],
}

/// Per-thread partial sums merged by rayon.
struct Accumulator {
    bins: [[Vec<f32>; 3]; 3],
    sum: f64,
    min: f32,
    max: f32,
}

impl Accumulator {
    fn new(num_bins: usize) -> Self {
        let channel = || [vec![0.0; num_bins], vec![0.0; num_bins], vec![0.0; num_bins]];
        Self {
            bins: [channel(), channel(), channel()],
            sum: 0.0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    fn merge(mut self, other: Accumulator) -> Self {
        for (mine, theirs) in self.bins.iter_mut().zip(other.bins.iter()) {
            for (a, b) in mine.iter_mut().zip(theirs.iter()) {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += *y;
                }
            }
        }
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self
    }
}

fn bin_of(v: f32, num_bins: usize) -> usize {
    ((v * num_bins as f32).floor() as isize).clamp(0, num_bins as isize - 1) as usize
}

impl ImageStatistics {
    pub fn histogram(&self, scale: AxisScale) -> &Histogram {
        &self.histograms[scale.index()]
    }

    /// Compute statistics of `img` viewed at `exposure` stops.
    ///
    /// Minimum, maximum and average are taken over the raw colour channels;
    /// the histograms bin the exposed values.  Returns
    /// `EditError::Cancelled` as soon as the token is cancelled.
    pub fn compute(
        img: &Image,
        exposure: f32,
        num_bins: usize,
        progress: &AtomicProgress,
    ) -> Result<Self, EditError> {
        if raster::is_null(img) {
            return Err(EditError::EmptyImage);
        }
        let num_bins = num_bins.max(NORMALIZE_RANK);
        let w = img.width() as usize;
        let h = img.height() as usize;
        let gain = exposure.exp2();
        let weight = 1.0 / (w * h) as f32;

        let mut rows = progress.child(0.9);
        rows.set_num_steps(h);

        let acc = img
            .as_raw()
            .par_chunks(w * 4)
            .fold(
                || Accumulator::new(num_bins),
                |mut acc, row| {
                    if rows.is_cancelled() {
                        return acc;
                    }
                    for px in row.chunks_exact(4) {
                        for c in 0..3 {
                            let raw = px[c];
                            acc.sum += raw as f64;
                            acc.min = acc.min.min(raw);
                            acc.max = acc.max.max(raw);
                            let val = raw * gain;
                            for scale in AxisScale::ALL {
                                let bin = bin_of(scale.map(val), num_bins);
                                acc.bins[scale.index()][c][bin] += weight;
                            }
                        }
                    }
                    rows.advance(1);
                    acc
                },
            )
            .reduce(|| Accumulator::new(num_bins), Accumulator::merge);

        if progress.is_cancelled() {
            return Err(EditError::Cancelled);
        }

        let display_max = (-exposure).exp2();
        let ticks: Vec<f32> = (0..=NUM_TICKS).map(|i| i as f32 / NUM_TICKS as f32).collect();
        let labels: Vec<String> = ticks
            .iter()
            .map(|t| format!("{:.3}", display_max * t))
            .collect();

        let [linear, srgb, log] = acc.bins;
        let histograms = [(AxisScale::Linear, linear), (AxisScale::Srgb, srgb), (AxisScale::Log, log)]
            .map(|(scale, mut values)| {
                normalize(&mut values);
                Histogram {
                    values,
                    x_ticks: ticks.iter().map(|&t| scale.map(t)).collect(),
                    x_tick_labels: labels.clone(),
                }
            });

        progress.set_progress(1.0);
        Ok(Self {
            minimum: acc.min,
            average: (acc.sum / (3 * w * h) as f64) as f32,
            maximum: acc.max,
            exposure,
            histograms,
        })
    }
}

/// Divide every bin by the 10th-largest bin across all three channels.
fn normalize(values: &mut [Vec<f32>; 3]) {
    let mut all: Vec<f32> = values.iter().flatten().copied().collect();
    let idx = all.len() - NORMALIZE_RANK;
    let (_, pivot, _) = all.select_nth_unstable_by(idx, f32::total_cmp);
    let s = *pivot;
    if s > 0.0 {
        for v in values.iter_mut().flatten() {
            *v /= s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Image {
        raster::from_fn(16, 4, |x, _| {
            let v = x as f32 / 15.0;
            [v, v * 0.5, 2.0 * v, 1.0]
        })
    }

    #[test]
    fn extremes_and_average() {
        let stats = ImageStatistics::compute(&ramp(), 0.0, 256, &AtomicProgress::new()).unwrap();
        assert_eq!(stats.minimum, 0.0);
        assert_eq!(stats.maximum, 2.0);
        // mean of v, v/2, 2v over a 0..1 ramp is 3.5 * 0.5 / 3
        assert!((stats.average - 3.5 * 0.5 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn histograms_have_requested_shape() {
        let stats = ImageStatistics::compute(&ramp(), 1.0, 64, &AtomicProgress::new()).unwrap();
        for scale in AxisScale::ALL {
            let h = stats.histogram(scale);
            assert!(h.values.iter().all(|v| v.len() == 64));
            assert_eq!(h.x_ticks.len(), NUM_TICKS + 1);
            assert_eq!(h.x_tick_labels.first().map(String::as_str), Some("0.000"));
            assert_eq!(h.x_tick_labels.last().map(String::as_str), Some("0.500"));
        }
        let log_ticks = &stats.histogram(AxisScale::Log).x_ticks;
        assert!((log_ticks[NUM_TICKS] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn tenth_largest_bin_becomes_one() {
        let stats = ImageStatistics::compute(&ramp(), 0.0, 32, &AtomicProgress::new()).unwrap();
        let h = stats.histogram(AxisScale::Linear);
        let mut all: Vec<f32> = h.values.iter().flatten().copied().collect();
        all.sort_by(|a, b| b.total_cmp(a));
        assert!((all[NORMALIZE_RANK - 1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn overexposed_values_land_in_the_last_bin() {
        let img = raster::filled(2, 2, [10.0, 10.0, 10.0, 1.0]);
        let stats = ImageStatistics::compute(&img, 0.0, 16, &AtomicProgress::new()).unwrap();
        let red = &stats.histogram(AxisScale::Linear).values[0];
        assert!(red[15] > 0.0);
        assert!(red[..15].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn cancelled_and_empty_inputs_fail() {
        let p = AtomicProgress::new();
        p.request_cancel();
        assert_eq!(
            ImageStatistics::compute(&ramp(), 0.0, 256, &p),
            Err(EditError::Cancelled)
        );
        assert_eq!(
            ImageStatistics::compute(&raster::empty_image(), 0.0, 256, &AtomicProgress::new()),
            Err(EditError::EmptyImage)
        );
    }
}
