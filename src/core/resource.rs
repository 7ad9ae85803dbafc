//! Three-axis cluster resource arithmetic.
//!
//! Resources are accounted per SKU (a discrete hardware class, e.g. a GPU
//! model) on three axes: cpu, memory, gpu. Scheduling works on floating
//! point amounts because inference scaling allocates fractional cpu/memory
//! proportional to granted GPUs.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Comparison slack for floating point amounts produced by proportional
/// allocation.
const EPS: f64 = 1e-6;

/// A single axis: SKU label to non-negative amount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAxis(BTreeMap<String, f64>);

impl ResourceAxis {
    /// Empty axis.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build an axis from `(sku, amount)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Amount for a SKU, zero when absent.
    pub fn get(&self, sku: &str) -> f64 {
        self.0.get(sku).copied().unwrap_or(0.0)
    }

    /// Set the amount for a SKU.
    pub fn set(&mut self, sku: impl Into<String>, amount: f64) {
        self.0.insert(sku.into(), amount);
    }

    /// First SKU label in deterministic order, if any.
    pub fn first_sku(&self) -> Option<&str> {
        self.0.keys().next().map(String::as_str)
    }

    /// Iterate `(sku, amount)` in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True when no SKU carries a positive amount.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v <= EPS)
    }

    /// Multiply every amount by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for v in self.0.values_mut() {
            *v *= factor;
        }
    }

    fn add_assign(&mut self, other: &Self) {
        for (sku, amount) in &other.0 {
            *self.0.entry(sku.clone()).or_insert(0.0) += amount;
        }
    }

    /// Subtraction clamps at zero; callers gate with [`ResourceAxis::ge`]
    /// so the clamp only absorbs floating point dust.
    fn sub_assign(&mut self, other: &Self) {
        for (sku, amount) in &other.0 {
            let entry = self.0.entry(sku.clone()).or_insert(0.0);
            *entry = (*entry - amount).max(0.0);
        }
    }

    fn ge(&self, other: &Self) -> bool {
        other
            .0
            .iter()
            .all(|(sku, amount)| self.get(sku) + EPS >= *amount)
    }
}

impl fmt::Display for ResourceAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (sku, amount)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{sku}: {amount}")?;
        }
        write!(f, "}}")
    }
}

/// A three-axis quantity `{cpu, memory, gpu}` accounted per SKU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResource {
    /// CPU cores per SKU.
    pub cpu: ResourceAxis,
    /// Memory (GiB) per SKU.
    pub memory: ResourceAxis,
    /// GPU count per SKU.
    pub gpu: ResourceAxis,
}

impl ClusterResource {
    /// Zero resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the three axes.
    pub fn from_axes(cpu: ResourceAxis, memory: ResourceAxis, gpu: ResourceAxis) -> Self {
        Self { cpu, memory, gpu }
    }

    /// Partial order: holds iff every component of `self` is at least the
    /// corresponding component of `other`.
    pub fn ge(&self, other: &Self) -> bool {
        self.cpu.ge(&other.cpu) && self.memory.ge(&other.memory) && self.gpu.ge(&other.gpu)
    }

    /// True when the gpu or cpu axis carries no positive amount. Used to
    /// reject fractional inference allocations that degenerated to nothing.
    pub fn has_empty_gpu_or_cpu(&self) -> bool {
        self.gpu.is_empty() || self.cpu.is_empty()
    }
}

impl AddAssign<&ClusterResource> for ClusterResource {
    fn add_assign(&mut self, other: &ClusterResource) {
        self.cpu.add_assign(&other.cpu);
        self.memory.add_assign(&other.memory);
        self.gpu.add_assign(&other.gpu);
    }
}

impl SubAssign<&ClusterResource> for ClusterResource {
    fn sub_assign(&mut self, other: &ClusterResource) {
        self.cpu.sub_assign(&other.cpu);
        self.memory.sub_assign(&other.memory);
        self.gpu.sub_assign(&other.gpu);
    }
}

impl Add<&ClusterResource> for ClusterResource {
    type Output = ClusterResource;

    fn add(mut self, other: &ClusterResource) -> ClusterResource {
        self += other;
        self
    }
}

impl Sub<&ClusterResource> for ClusterResource {
    type Output = ClusterResource;

    fn sub(mut self, other: &ClusterResource) -> ClusterResource {
        self -= other;
        self
    }
}

impl fmt::Display for ClusterResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu: {}, memory: {}, gpu: {}",
            self.cpu, self.memory, self.gpu
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(cpu: f64, memory: f64, gpu: f64) -> ClusterResource {
        ClusterResource::from_axes(
            ResourceAxis::from_pairs([("A100", cpu)]),
            ResourceAxis::from_pairs([("A100", memory)]),
            ResourceAxis::from_pairs([("A100", gpu)]),
        )
    }

    #[test]
    fn partial_order_requires_every_component() {
        let big = res(10.0, 20.0, 4.0);
        let small = res(5.0, 20.0, 4.0);
        assert!(big.ge(&small));
        assert!(!small.ge(&big));
        // missing SKU counts as zero
        let other_sku = ClusterResource::from_axes(
            ResourceAxis::new(),
            ResourceAxis::new(),
            ResourceAxis::from_pairs([("V100", 1.0)]),
        );
        assert!(!big.ge(&other_sku));
    }

    #[test]
    fn exact_fit_is_admitted_one_more_is_not() {
        let capacity = res(10.0, 20.0, 4.0);
        assert!(capacity.ge(&res(10.0, 20.0, 4.0)));
        assert!(!capacity.ge(&res(10.0, 20.0, 5.0)));
    }

    #[test]
    fn subtraction_never_underflows_after_gating() {
        let mut capacity = res(10.0, 20.0, 4.0);
        let request = res(4.0, 8.0, 2.0);
        assert!(capacity.ge(&request));
        capacity -= &request;
        assert_eq!(capacity, res(6.0, 12.0, 2.0));
        capacity -= &res(6.0, 12.0, 2.0);
        assert!(capacity.gpu.is_empty());
        assert!(capacity.has_empty_gpu_or_cpu());
    }

    #[test]
    fn empty_axis_detection() {
        let mut r = res(1.0, 1.0, 1.0);
        assert!(!r.has_empty_gpu_or_cpu());
        r.gpu = ResourceAxis::new();
        assert!(r.has_empty_gpu_or_cpu());
    }

    #[test]
    fn scale_touches_every_sku() {
        let mut axis = ResourceAxis::from_pairs([("A100", 10.0), ("V100", 4.0)]);
        axis.scale(0.95);
        assert!((axis.get("A100") - 9.5).abs() < 1e-9);
        assert!((axis.get("V100") - 3.8).abs() < 1e-9);
    }
}
