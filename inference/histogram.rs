//! Text histogram of bootstrap replicate statistics.

use std::fmt;

/// Equal-width bins over the replicates, with the observed statistic located.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// `counts.len() + 1` bin edges in increasing order.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    pub observed: f64,
    /// Bin holding the observed statistic, if it falls inside the range.
    pub observed_bin: Option<usize>,
}

impl Histogram {
    /// Bins the finite `values` into `bins` equal-width bins spanning both the
    /// values and `observed`.
    pub fn new(values: &[f64], observed: f64, bins: usize) -> Self {
        let bins = bins.max(1);
        let finite = values.iter().copied().filter(|v| v.is_finite());
        let points = finite.clone().chain(observed.is_finite().then_some(observed));
        let (lo, hi) = points.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        let (lo, hi) = match (lo.is_finite(), hi > lo) {
            (false, _) => (0.0, 1.0),
            (true, false) => (lo - 0.5, lo + 0.5),
            (true, true) => (lo, hi),
        };
        let width = (hi - lo) / bins as f64;
        let edges: Vec<f64> = (0..=bins).map(|b| lo + width * b as f64).collect();

        let locate = |v: f64| -> usize { (((v - lo) / width) as usize).min(bins - 1) };
        let mut counts = vec![0usize; bins];
        for v in finite {
            counts[locate(v)] += 1;
        }
        let observed_bin = observed.is_finite().then(|| locate(observed));
        Self {
            edges,
            counts,
            observed,
            observed_bin,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// One line per bin, bars scaled so the fullest bin is `width` characters.
    pub fn render(&self, width: usize) -> String {
        let peak = self.counts.iter().copied().max().unwrap_or(0).max(1);
        let mut out = String::new();
        for (b, &count) in self.counts.iter().enumerate() {
            let bar = "#".repeat(count * width / peak);
            let marker = if self.observed_bin == Some(b) {
                "  <- observed"
            } else {
                ""
            };
            out.push_str(&format!(
                "[{:>10.4}, {:>10.4}) {:<width$} {:>6}{}\n",
                self.edges[b],
                self.edges[b + 1],
                bar,
                count,
                marker,
                width = width
            ));
        }
        out
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(40))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_cover_every_finite_value() {
        let values = [0.1, 0.2, 0.2, 0.9, 1.0, f64::NAN];
        let hist = Histogram::new(&values, 0.5, 5);
        assert_eq!(hist.total(), 5);
        assert_eq!(hist.edges.len(), 6);
        assert_eq!(hist.counts[4], 2);
        assert_eq!(hist.observed_bin, Some(2));
    }

    #[test]
    fn observed_outside_the_replicates_widens_the_range() {
        let hist = Histogram::new(&[1.0, 2.0, 3.0], 10.0, 3);
        assert_eq!(hist.edges[3], 10.0);
        assert_eq!(hist.observed_bin, Some(2));
        assert_eq!(hist.counts, vec![3, 0, 0]);
    }

    #[test]
    fn constant_values_get_a_unit_wide_range() {
        let hist = Histogram::new(&[2.0, 2.0], 2.0, 4);
        assert_eq!(hist.edges[0], 1.5);
        assert_eq!(hist.total(), 2);
        let text = hist.render(10);
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("<- observed"));
    }
}
