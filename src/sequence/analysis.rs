//! Post-run analysis: least-squares fit and per-device diagnosis.
//!
//! Each device's valid (standard, device) pairs are fitted with an
//! ordinary least squares line `device = slope · standard + intercept`.
//! Zero, span, and linearity errors are flagged against fractions of the
//! device's full scale; a device passes only when none is significant.

/// Fitted straight line through the calibration points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

/// Outcome of analysing one device.
#[derive(Debug, Clone)]
pub enum Diagnosis {
    /// Fewer than three valid points; nothing can be concluded.
    InsufficientData,
    Analyzed {
        fit: LineFit,
        zero_offset_significant: bool,
        span_error_significant: bool,
        linearity_significant: bool,
        /// Largest absolute deviation from the fitted line.
        max_residual: f64,
        /// The signed residual at that worst point (sign gives the bow
        /// direction of a non-linear response).
        worst_residual: f64,
        passed: bool,
    },
}

/// Analysis report for one device under test.
#[derive(Debug, Clone)]
pub struct DutReport {
    pub channel: usize,
    pub full_scale_torr: f64,
    pub diagnosis: Diagnosis,
}

impl DutReport {
    pub fn passed(&self) -> bool {
        matches!(self.diagnosis, Diagnosis::Analyzed { passed: true, .. })
    }
}

/// Ordinary least squares fit. `None` with fewer than two points or a
/// degenerate (vertical) spread.
pub fn fit_line(points: &[(f64, f64)]) -> Option<LineFit> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let ss_xx: f64 = points.iter().map(|(x, _)| (x - mean_x) * (x - mean_x)).sum();
    if ss_xx == 0.0 {
        return None;
    }
    let ss_xy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let slope = ss_xy / ss_xx;
    Some(LineFit {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

/// Diagnose one device from its valid (standard, device) pressure pairs.
pub fn diagnose(channel: usize, full_scale_torr: f64, points: &[(f64, f64)]) -> DutReport {
    let fs = full_scale_torr;
    let Some(fit) = (points.len() >= 3).then(|| fit_line(points)).flatten() else {
        return DutReport {
            channel,
            full_scale_torr,
            diagnosis: Diagnosis::InsufficientData,
        };
    };

    let zero_offset_significant = fit.intercept.abs() > fs * 0.001;
    let span_error_significant = (1.0 - fit.slope).abs() > 0.005;

    let mut max_residual = 0.0f64;
    let mut worst_residual = 0.0f64;
    for &(std_p, dut_p) in points {
        let residual = dut_p - (fit.slope * std_p + fit.intercept);
        if residual.abs() > max_residual {
            max_residual = residual.abs();
            worst_residual = residual;
        }
    }
    let linearity_significant = max_residual > fs * 0.002;

    let passed = !(zero_offset_significant || span_error_significant || linearity_significant);
    DutReport {
        channel,
        full_scale_torr,
        diagnosis: Diagnosis::Analyzed {
            fit,
            zero_offset_significant,
            span_error_significant,
            linearity_significant,
            max_residual,
            worst_residual,
            passed,
        },
    }
}

/// Human-readable diagnosis and tuning recommendations for one device.
pub fn recommendation_text(report: &DutReport) -> String {
    let ch = report.channel + 1;
    let fs = report.full_scale_torr;
    match &report.diagnosis {
        Diagnosis::InsufficientData => format!(
            "--- DUT {ch} ({fs} Torr FS): INSUFFICIENT DATA ---\n\
             Not enough valid data points to perform analysis."
        ),
        Diagnosis::Analyzed {
            fit,
            zero_offset_significant,
            span_error_significant,
            linearity_significant,
            worst_residual,
            passed,
            ..
        } => {
            let mut lines = Vec::new();
            if *passed {
                lines.push(format!("--- DUT {ch} ({fs} Torr FS): SUCCESS ---"));
                lines.push("Device is well-calibrated and within tolerance.".to_string());
                lines.push(format!(
                    " - Equation: y = {:.4}x {:+.4}",
                    fit.slope, fit.intercept
                ));
            } else {
                lines.push(format!(
                    "--- DUT {ch} ({fs} Torr FS): adjustments recommended ---"
                ));
                lines.push("[ Diagnosis ]".to_string());
                lines.push(format!(
                    " - Equation: y = {:.4}x {:+.4}",
                    fit.slope, fit.intercept
                ));
                if *zero_offset_significant {
                    lines.push(format!(
                        " - Zero offset error: {:+.4} Torr (significant)",
                        fit.intercept
                    ));
                }
                if *span_error_significant {
                    lines.push(format!(
                        " - Span (gain) error: slope is {:.4} ({})",
                        fit.slope,
                        if fit.slope > 1.0 { "too high" } else { "too low" }
                    ));
                }
                if *linearity_significant {
                    lines.push(format!(
                        " - Linearity error: mid-range response bows {}",
                        if *worst_residual > 0.0 { "up" } else { "down" }
                    ));
                }

                lines.push("[ Recommended actions ]".to_string());
                if *zero_offset_significant && fit.intercept.abs() > fs * 0.02 {
                    lines.push(
                        " 1. Coarse zero adjustment: the zero offset is large; correct it first."
                            .to_string(),
                    );
                }
                if *zero_offset_significant {
                    lines.push(format!(
                        " 2. Zero adjustment: adjust the zero reading {}.",
                        if fit.intercept > 0.0 { "down" } else { "up" }
                    ));
                }
                if *span_error_significant {
                    lines.push(format!(
                        " 3. Span adjustment: adjust the span (at 100% FS) {}.",
                        if fit.slope > 1.0 { "down" } else { "up" }
                    ));
                }
                if *linearity_significant {
                    lines.push(format!(
                        " 4. Linearity adjustment: correct the {} bow at 50% FS.",
                        if *worst_residual > 0.0 { "upward" } else { "downward" }
                    ));
                }
            }
            lines.join("\n")
        }
    }
}
