//! Schedulable capacity derivation.

use std::collections::HashMap;

use crate::core::ClusterResource;
use crate::infra::store::ClusterStatusRecord;

/// Fraction of cpu/memory capacity usable by applications; the rest is a
/// fixed reservation for system overhead. GPU counts are integral and not
/// discounted.
pub const SYSTEM_RESERVE_DISCOUNT: f64 = 0.95;

fn discounted(mut resource: ClusterResource) -> ClusterResource {
    resource.cpu.scale(SYSTEM_RESERVE_DISCOUNT);
    resource.memory.scale(SYSTEM_RESERVE_DISCOUNT);
    resource
}

/// Cluster-wide schedulable resource: `(capacity - reserved) * 0.95`.
pub fn cluster_schedulable(status: &ClusterStatusRecord) -> ClusterResource {
    let schedulable = discounted(status.capacity.clone() - &status.reserved);
    tracing::info!("cluster schedulable: {schedulable}");
    schedulable
}

/// Per-VC schedulable resources: `(capacity - unschedulable) * 0.95`.
pub fn vc_schedulables(status: &ClusterStatusRecord) -> HashMap<String, ClusterResource> {
    let schedulables: HashMap<String, ClusterResource> = status
        .vc_statuses
        .iter()
        .map(|(vc_name, vc_status)| {
            (
                vc_name.clone(),
                discounted(vc_status.capacity.clone() - &vc_status.unschedulable),
            )
        })
        .collect();
    for (vc_name, schedulable) in &schedulables {
        tracing::info!("vc {vc_name} schedulable: {schedulable}");
    }
    schedulables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResourceAxis;
    use crate::infra::store::VcResourceStatus;

    #[test]
    fn discount_spares_gpu_axis() {
        let status = ClusterStatusRecord {
            capacity: ClusterResource::from_axes(
                ResourceAxis::from_pairs([("A100", 100.0)]),
                ResourceAxis::from_pairs([("A100", 200.0)]),
                ResourceAxis::from_pairs([("A100", 8.0)]),
            ),
            reserved: ClusterResource::from_axes(
                ResourceAxis::from_pairs([("A100", 20.0)]),
                ResourceAxis::from_pairs([("A100", 40.0)]),
                ResourceAxis::from_pairs([("A100", 0.0)]),
            ),
            vc_statuses: [(
                "v1".to_string(),
                VcResourceStatus {
                    capacity: ClusterResource::from_axes(
                        ResourceAxis::from_pairs([("A100", 50.0)]),
                        ResourceAxis::from_pairs([("A100", 100.0)]),
                        ResourceAxis::from_pairs([("A100", 4.0)]),
                    ),
                    unschedulable: ClusterResource::default(),
                },
            )]
            .into_iter()
            .collect(),
        };

        let cluster = cluster_schedulable(&status);
        assert!((cluster.cpu.get("A100") - 76.0).abs() < 1e-9);
        assert!((cluster.memory.get("A100") - 152.0).abs() < 1e-9);
        assert!((cluster.gpu.get("A100") - 8.0).abs() < 1e-9);

        let vcs = vc_schedulables(&status);
        let v1 = &vcs["v1"];
        assert!((v1.cpu.get("A100") - 47.5).abs() < 1e-9);
        assert!((v1.gpu.get("A100") - 4.0).abs() < 1e-9);
    }
}
