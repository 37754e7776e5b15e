//! Evaluation metrics for committed schedules.
//!
//! All functions take trajectories in kW, one value per step, in the
//! consumption-positive sign convention.

/// Energy cost in ct: imports at the energy price, exports credited at the
/// feed-in price (zero when none is given).
pub fn costs(p: &[f64], energy: &[f64], feed_in: Option<&[f64]>, dt: f64) -> f64 {
    p.iter()
        .enumerate()
        .map(|(t, &v)| {
            if v >= 0.0 {
                v * energy.get(t).copied().unwrap_or(0.0)
            } else {
                v * feed_in.and_then(|f| f.get(t)).copied().unwrap_or(0.0)
            }
        })
        .sum::<f64>()
        * dt
}

/// Emissions in g for the imported energy.
pub fn co2_emissions(p: &[f64], co2: &[f64], dt: f64) -> f64 {
    p.iter()
        .zip(co2)
        .map(|(v, c)| v.max(0.0) * c)
        .sum::<f64>()
        * dt
}

/// Ratio of the largest absolute power to the mean absolute power.
pub fn peak_to_average_ratio(p: &[f64]) -> f64 {
    if p.is_empty() {
        return 0.0;
    }
    let peak = p.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let mean = p.iter().map(|v| v.abs()).sum::<f64>() / p.len() as f64;
    if mean == 0.0 {
        0.0
    } else {
        peak / mean
    }
}

/// Relative change of the peak compared to a reference trajectory; negative
/// values mean the peak was reduced.
pub fn peak_reduction_ratio(p: &[f64], reference: &[f64]) -> f64 {
    let peak = p.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let ref_peak = reference.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if ref_peak == 0.0 {
        0.0
    } else {
        (peak - ref_peak) / ref_peak
    }
}

/// Share of local generation consumed locally.
///
/// `generation` holds the (negative) generator trajectory, `total` the net
/// trajectory of the entity owning the generators.
pub fn self_consumption(generation: &[f64], total: &[f64]) -> f64 {
    let produced: f64 = generation.iter().map(|g| (-g).max(0.0)).sum();
    if produced == 0.0 {
        return 0.0;
    }
    let exported: f64 = total.iter().map(|v| (-v).max(0.0)).sum();
    ((produced - exported) / produced).clamp(0.0, 1.0)
}

/// Share of the gross consumption covered by local generation.
///
/// Same inputs as [`self_consumption`]. Gross consumption per step is the net
/// trajectory plus what the generators produce; an entity that consumes
/// nothing is fully autarkic, one without generators not at all.
pub fn autarky(generation: &[f64], total: &[f64]) -> f64 {
    if generation.is_empty() {
        return 0.0;
    }
    let mut consumption = 0.0;
    let mut covered = 0.0;
    for (g, p) in generation.iter().zip(total) {
        let produced = (-g).max(0.0);
        let load = (p + produced).max(0.0);
        consumption += load;
        covered += produced.min(load);
    }
    if consumption == 0.0 {
        return 1.0;
    }
    covered / consumption
}
