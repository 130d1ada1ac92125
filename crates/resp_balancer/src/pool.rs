//! Read-only selection views over the ordered backend pool.
//!
//! Every operation is a pure function of the monitors' atomic state; the
//! pool itself never changes after construction.

use std::sync::Arc;

use rand::Rng;

use crate::backend::BackendMonitor;

/// Ordered, immutable sequence of backend monitors.
#[derive(Clone, Default)]
pub struct Pool {
    backends: Vec<Arc<BackendMonitor>>,
}

impl Pool {
    pub fn new(backends: Vec<Arc<BackendMonitor>>) -> Pool {
        Pool { backends }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendMonitor>> {
        self.backends.iter()
    }

    /// All backends that are up, preserving order.
    pub fn up(&self) -> Pool {
        self.filter(|b| b.up())
    }

    /// First backend in order that is up.
    pub fn first_up(&self) -> Option<Arc<BackendMonitor>> {
        self.first(|b| b.up())
    }

    /// First backend in order flagged as the Raft leader.
    pub fn leader(&self) -> Option<Arc<BackendMonitor>> {
        self.first(|b| b.leader())
    }

    /// Up backend minimizing `metric`; ties go to the lowest index.
    pub fn min_up(&self, metric: impl Fn(&BackendMonitor) -> i64) -> Option<Arc<BackendMonitor>> {
        let mut min = i64::MAX;
        let mut pos: Option<usize> = None;
        for (n, b) in self.backends.iter().enumerate() {
            if b.up() {
                let num = metric(b);
                if num < min {
                    pos = Some(n);
                    min = num;
                }
            }
        }
        pos.map(|n| Arc::clone(&self.backends[n]))
    }

    /// Uniform pick over the whole sequence, up or not.
    pub fn random(&self, rng: &mut impl Rng) -> Option<Arc<BackendMonitor>> {
        if self.backends.is_empty() {
            return None;
        }
        self.backends
            .get(rng.gen_range(0..self.backends.len()))
            .cloned()
    }

    /// Pick by position, reduced modulo the pool size. Negative reduced
    /// positions are negated rather than shifted.
    pub fn at(&self, pos: i32) -> Option<Arc<BackendMonitor>> {
        let n = self.backends.len() as i32;
        if n < 1 {
            return None;
        }
        let mut pos = pos % n;
        if pos < 0 {
            pos = -pos;
        }
        self.backends.get(pos as usize).cloned()
    }

    /// Weighted-random pick biased toward *lower* weights.
    ///
    /// Raw weights are costs: each is mapped to `min + max - w` before the
    /// subtractive walk, inverting the scale. Arithmetic wraps on overflow,
    /// matching how oversized costs (such as squared placeholder latencies)
    /// have always been folded in.
    pub fn weighted_random(
        &self,
        rng: &mut impl Rng,
        weight: impl Fn(&BackendMonitor) -> i64,
    ) -> Option<Arc<BackendMonitor>> {
        if self.backends.is_empty() {
            return None;
        }

        let mut min = i64::MAX;
        let mut max = 1i64;
        let mut weights = Vec::with_capacity(self.backends.len());
        for b in &self.backends {
            let w = weight(b);
            if w > max {
                max = w;
            }
            if w < min {
                min = w;
            }
            weights.push(w);
        }

        let mut sum = 0i64;
        for w in weights.iter_mut() {
            *w = min.wrapping_add(max).wrapping_sub(*w);
            sum = sum.wrapping_add(*w);
        }
        if sum <= 0 {
            sum = 1;
        }

        let mut mark = rng.gen_range(0..sum);
        for (n, w) in weights.iter().enumerate() {
            mark = mark.wrapping_sub(*w);
            if mark <= 0 {
                return self.backends.get(n).cloned();
            }
        }

        None
    }

    fn filter(&self, criteria: impl Fn(&BackendMonitor) -> bool) -> Pool {
        Pool {
            backends: self
                .backends
                .iter()
                .filter(|b| criteria(b))
                .cloned()
                .collect(),
        }
    }

    fn first(&self, criteria: impl Fn(&BackendMonitor) -> bool) -> Option<Arc<BackendMonitor>> {
        self.backends.iter().find(|b| criteria(b)).cloned()
    }
}

/// Pool holding at least one backend. Fallback picks are total, so the
/// dispatch path never handles an empty sequence and never panics.
pub struct NonEmptyPool {
    first: Arc<BackendMonitor>,
    view: Pool,
}

impl NonEmptyPool {
    pub fn new(first: Arc<BackendMonitor>, rest: Vec<Arc<BackendMonitor>>) -> NonEmptyPool {
        let mut backends = Vec::with_capacity(rest.len() + 1);
        backends.push(Arc::clone(&first));
        backends.extend(rest);
        NonEmptyPool {
            first,
            view: Pool::new(backends),
        }
    }

    /// Ordered view over every backend.
    pub fn view(&self) -> &Pool {
        &self.view
    }

    /// Uniform pick over the whole sequence, up or not.
    pub fn random(&self, rng: &mut impl Rng) -> Arc<BackendMonitor> {
        self.view
            .random(rng)
            .unwrap_or_else(|| Arc::clone(&self.first))
    }
}
