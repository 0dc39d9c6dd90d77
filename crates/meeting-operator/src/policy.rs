//! The scaling policy: a pure function from a metric sample to a replica count.

/// Computes the replica count for a JVB pool.
///
/// The sampled average is divided by the per-replica target and rounded half to
/// even. When the target exceeds the average the rounded ratio is used as is,
/// otherwise it scales the current replica count. The result is always clamped
/// to `[min_replicas, max_replicas]`, the bounds taking precedence over the
/// computed value.
///
/// A `NaN` average is treated as `0`. Callers must ensure `target > 0` and
/// `min_replicas <= max_replicas`, which [`AutoScalerSpec::validate`] checks.
///
/// [`AutoScalerSpec::validate`]: crate::crd::AutoScalerSpec::validate
pub fn desired_replicas(
    sampled_average: f64,
    target: i32,
    current_replicas: i32,
    min_replicas: i32,
    max_replicas: i32,
) -> i32 {
    let sampled_average = if sampled_average.is_nan() {
        0.0
    } else {
        sampled_average
    };
    let target = f64::from(target);

    let ratio = (sampled_average / target).round_ties_even();
    let unclamped = if target > sampled_average {
        ratio
    } else {
        f64::from(current_replicas) * ratio
    };

    clamp(unclamped, min_replicas, max_replicas)
}

/// Clamps in floating point so that huge products cannot overflow before the
/// bounds are applied.
fn clamp(replicas: f64, min_replicas: i32, max_replicas: i32) -> i32 {
    let clamped = replicas
        .max(f64::from(min_replicas))
        .min(f64::from(max_replicas));

    // In range of i32 after clamping against two i32 bounds
    clamped as i32
}
