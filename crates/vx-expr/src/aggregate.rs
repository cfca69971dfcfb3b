use std::sync::Arc;

use vx_metadata::{Feature, Metadata};

use crate::{AggregateOp, CompileError, EvalError, ExprArena, ExprId, ExprKind};

/// Linear-interpolated percentile over an ascending sample.
///
/// The rank is `p / 100 * (n - 1)`; a fractional rank interpolates between its neighbours.
/// An empty sample yields NaN.
#[must_use]
pub fn percentile_from_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Running state of one viewport aggregate over the visible features of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportAccumulator {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
    histogram: Vec<u64>,
    range: (f64, f64),
}

impl Default for ViewportAccumulator {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
            histogram: Vec::new(),
            range: (0.0, 0.0),
        }
    }
}

impl ViewportAccumulator {
    /// An accumulator with a percentile histogram of `buckets` bins spanning `range`.
    #[must_use]
    pub fn with_histogram(buckets: usize, range: (f64, f64)) -> Self {
        Self {
            histogram: vec![0; buckets],
            range,
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
        self.sum = 0.0;
        self.count = 0;
        self.histogram.iter_mut().for_each(|b| *b = 0);
    }

    /// Adds one feature value. Non-finite values are skipped.
    pub fn accumulate(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
        if !self.histogram.is_empty() {
            let bucket = self.bucket_of(value);
            self.histogram[bucket] += 1;
        }
    }

    /// Counts one feature without reading its value. `count` aggregates accept any type.
    pub fn tally(&mut self) {
        self.count += 1;
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    // Out-of-range values land in the edge buckets.
    fn bucket_of(&self, value: f64) -> usize {
        let (lo, hi) = self.range;
        let last = self.histogram.len() - 1;
        if hi <= lo {
            return 0;
        }
        let normalized = ((value - lo) / (hi - lo)).clamp(0.0, 1.0);
        ((normalized * self.histogram.len() as f64) as usize).min(last)
    }

    /// Current result for `op`. Every operator reports NaN before the first value.
    #[must_use]
    pub fn finalize(&self, op: AggregateOp) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        match op {
            AggregateOp::Min => self.min,
            AggregateOp::Max => self.max,
            AggregateOp::Sum => self.sum,
            AggregateOp::Avg => self.sum / self.count as f64,
            AggregateOp::Count => self.count as f64,
            AggregateOp::Percentile(p) => self.histogram_percentile(p),
        }
    }

    fn histogram_percentile(&self, p: f64) -> f64 {
        let (lo, hi) = self.range;
        let buckets = self.histogram.len();
        if buckets == 0 || hi <= lo {
            return lo;
        }
        let target = (p / 100.0).clamp(0.0, 1.0) * self.count as f64;
        let mut cumulative = 0.0;
        for (index, &weight) in self.histogram.iter().enumerate() {
            if weight == 0 {
                continue;
            }
            let weight = weight as f64;
            if cumulative + weight >= target {
                let within = (target - cumulative) / weight;
                return lo + (index as f64 + within) / buckets as f64 * (hi - lo);
            }
            cumulative += weight;
        }
        hi
    }
}

impl ExprArena {
    pub(crate) fn bind_global_aggregate(
        &mut self,
        id: ExprId,
        metadata: &Arc<Metadata>,
    ) -> Result<(), CompileError> {
        let (op, input) = match self.kind(id) {
            ExprKind::GlobalAggregate { op, input, .. } => (*op, *input),
            _ => return Ok(()),
        };
        let ExprKind::Property { name } = self.kind(input) else {
            return Err(CompileError::InvalidArgument {
                operator: "global aggregate",
                detail: format!("global {} requires a property input", op.name()),
            });
        };
        let column = metadata
            .column(name)
            .ok_or_else(|| CompileError::UnknownProperty { name: name.clone() })?;
        let result = match op {
            AggregateOp::Min => column.min,
            AggregateOp::Max => column.max,
            AggregateOp::Avg => column.avg,
            AggregateOp::Sum => column.sum,
            AggregateOp::Count => column.count,
            AggregateOp::Percentile(p) => percentile_from_sorted(&metadata.sorted_sample(name), p),
        };
        if let ExprKind::GlobalAggregate { value, .. } = self.kind_mut(id) {
            *value = result;
        }
        Ok(())
    }

    pub(crate) fn bind_viewport_aggregate(
        &mut self,
        id: ExprId,
        metadata: &Arc<Metadata>,
    ) -> Result<(), CompileError> {
        let (op, input) = match self.kind(id) {
            ExprKind::ViewportAggregate { op, input, .. } => (*op, *input),
            _ => return Ok(()),
        };
        let accumulator = match op {
            AggregateOp::Percentile(_) => {
                let ExprKind::Property { name } = self.kind(input) else {
                    return Err(CompileError::InvalidArgument {
                        operator: "viewport aggregate",
                        detail: "viewport percentile requires a property input".to_owned(),
                    });
                };
                let column = metadata
                    .column(name)
                    .ok_or_else(|| CompileError::UnknownProperty { name: name.clone() })?;
                ViewportAccumulator::with_histogram(
                    self.config().histogram_buckets,
                    (column.min, column.max),
                )
            }
            _ => ViewportAccumulator::default(),
        };
        if let ExprKind::ViewportAggregate {
            accumulator: slot,
            value,
            ..
        } = self.kind_mut(id)
        {
            *slot = accumulator;
            *value = f64::NAN;
        }
        Ok(())
    }

    fn viewport_aggregates(&self, root: ExprId) -> Vec<ExprId> {
        self.descendants(root)
            .into_iter()
            .filter(|id| matches!(self.kind(*id), ExprKind::ViewportAggregate { .. }))
            .collect()
    }

    /// Clears every viewport accumulator under `root`. Call before each visible-feature pass.
    pub fn reset_viewport_aggs(&mut self, root: ExprId) {
        for id in self.viewport_aggregates(root) {
            if let ExprKind::ViewportAggregate { accumulator, .. } = self.kind_mut(id) {
                accumulator.reset();
            }
        }
    }

    /// Feeds one visible feature to every viewport aggregate under `root`.
    ///
    /// Features without a value for the aggregated property are skipped.
    pub fn accum_viewport_aggs(&mut self, root: ExprId, feature: &Feature) -> Result<(), EvalError> {
        for id in self.viewport_aggregates(root) {
            let ExprKind::ViewportAggregate { op, input, .. } = self.kind(id) else {
                continue;
            };
            let counting = matches!(op, AggregateOp::Count);
            let sample = match self.evaluate_feature(*input, feature) {
                Ok(_) if counting => None,
                Ok(value) => Some(value.to_f64()?),
                Err(EvalError::MissingProperty { .. }) => continue,
                Err(err) => return Err(err),
            };
            if let ExprKind::ViewportAggregate { accumulator, .. } = self.kind_mut(id) {
                match sample {
                    Some(sample) => accumulator.accumulate(sample),
                    None => accumulator.tally(),
                }
            }
        }
        Ok(())
    }

    /// Finalizes viewport aggregates and settles finished blends. Call once per frame before
    /// evaluation or uniform upload.
    pub fn pre_draw(&mut self, root: ExprId) {
        for id in self.viewport_aggregates(root) {
            if let ExprKind::ViewportAggregate {
                op,
                accumulator,
                value,
                ..
            } = self.kind_mut(id)
            {
                *value = accumulator.finalize(*op);
            }
        }
        self.settle_blends(root);
    }
}
