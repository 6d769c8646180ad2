//! Relative-pose residual diagnostic.
//!
//! For every 3D between-factor of a graph, measures how far the pose
//! estimates are from the factor's measurement. The discrepancy is computed
//! for both orderings of the endpoints: composing rigid transforms is not
//! order-invariant, and an asymmetry between the two is itself a signal about
//! the quality of the estimates.

use log::warn;
use nalgebra::Isometry3;
use serde::Serialize;
use std::fmt;

use crate::mapping::pose_graph::{EdgeSE3, Estimates, Factor, GraphError, Key, PoseGraph};
use crate::mapping::se2_se3::{between, euler_norm};

/// Magnitudes of a "difference" transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Residual {
    /// Euclidean norm of the translation.
    pub translation: f64,
    /// Norm of the (roll, pitch, yaw) vector of the rotation.
    pub rotation: f64,
}

impl Residual {
    pub fn of(diff: &Isometry3<f64>) -> Residual {
        Residual {
            translation: diff.translation.vector.norm(),
            rotation: euler_norm(&diff.rotation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelativePoseResidual {
    pub from: Key,
    pub to: Key,
    /// `between(measured, between(pose_from, pose_to))`
    pub forward: Residual,
    /// `between(measured, between(pose_to, pose_from))`
    pub backward: Residual,
}

/// Residuals of a single 3D relative-pose constraint against `estimates`.
pub fn compute_residual(
    factor: &EdgeSE3,
    estimates: &Estimates,
) -> Result<RelativePoseResidual, GraphError> {
    let pose1 = estimates.pose3(factor.from)?;
    let pose2 = estimates.pose3(factor.to)?;

    let predicted_forward = between(pose1, pose2);
    let predicted_backward = between(pose2, pose1);

    let diff_forward = between(&factor.measurement, &predicted_forward);
    let diff_backward = between(&factor.measurement, &predicted_backward);

    Ok(RelativePoseResidual {
        from: factor.from,
        to: factor.to,
        forward: Residual::of(&diff_forward),
        backward: Residual::of(&diff_backward),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Evaluated(RelativePoseResidual),
    /// The constraint references a key that is missing or not an SE3 pose.
    Failed(GraphError),
    /// Not a 3D relative-pose constraint.
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorReport {
    pub index: usize,
    pub kind: &'static str,
    /// Weighted error of the factor, when it can be evaluated.
    pub error: Option<f64>,
    pub outcome: Outcome,
}

/// Runs the residual diagnostic over every factor of `graph`, in order.
/// Factors that cannot be evaluated are reported and never abort the pass.
pub fn diagnose(graph: &PoseGraph, estimates: &Estimates) -> Vec<FactorReport> {
    graph
        .factors
        .iter()
        .enumerate()
        .map(|(index, factor)| {
            let outcome = match factor {
                Factor::SE3_SE3(edge) => match compute_residual(edge, estimates) {
                    Ok(residual) => Outcome::Evaluated(residual),
                    Err(err) => {
                        warn!("factor {index} ({} -> {}): {err}", edge.from, edge.to);
                        Outcome::Failed(err)
                    }
                },
                _ => Outcome::NotApplicable,
            };
            FactorReport {
                index,
                kind: factor.kind(),
                error: factor.error(estimates).ok(),
                outcome,
            }
        })
        .collect()
}

impl fmt::Display for FactorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--------------------------------------")?;
        match self.error {
            Some(e) => writeln!(f, "Factor {} error = {e}", self.index)?,
            None => writeln!(f, "Factor {} error = n/a", self.index)?,
        }
        match &self.outcome {
            Outcome::Evaluated(r) => {
                writeln!(f, "Node {} to {}", r.from, r.to)?;
                writeln!(
                    f,
                    "Translation difference: {} Rotation difference: {}",
                    r.forward.translation, r.forward.rotation
                )?;
                write!(
                    f,
                    "Translation difference v2: {} Rotation difference: {}",
                    r.backward.translation, r.backward.rotation
                )
            }
            Outcome::Failed(err) => write!(f, "Factor {} skipped: {err}", self.index),
            Outcome::NotApplicable => write!(
                f,
                "Factor {} is not a 3D relative-pose constraint ({})",
                self.index, self.kind
            ),
        }
    }
}

/// Flat view of a report, one CSV row per factor.
#[derive(Debug, Serialize)]
pub struct ReportRow {
    pub index: usize,
    pub kind: &'static str,
    pub status: &'static str,
    pub from: Option<Key>,
    pub to: Option<Key>,
    pub error: Option<f64>,
    pub translation_forward: Option<f64>,
    pub rotation_forward: Option<f64>,
    pub translation_backward: Option<f64>,
    pub rotation_backward: Option<f64>,
}

impl From<&FactorReport> for ReportRow {
    fn from(report: &FactorReport) -> ReportRow {
        let mut row = ReportRow {
            index: report.index,
            kind: report.kind,
            status: "skipped",
            from: None,
            to: None,
            error: report.error,
            translation_forward: None,
            rotation_forward: None,
            translation_backward: None,
            rotation_backward: None,
        };
        match &report.outcome {
            Outcome::Evaluated(r) => {
                row.status = "evaluated";
                row.from = Some(r.from);
                row.to = Some(r.to);
                row.translation_forward = Some(r.forward.translation);
                row.rotation_forward = Some(r.forward.rotation);
                row.translation_backward = Some(r.backward.translation);
                row.rotation_backward = Some(r.backward.rotation);
            }
            Outcome::Failed(_) => row.status = "failed",
            Outcome::NotApplicable => {}
        }
        row
    }
}

/// Writes one row per report.
pub fn write_csv<W: std::io::Write>(writer: W, reports: &[FactorReport]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    for report in reports {
        writer.serialize(ReportRow::from(report))?;
    }
    writer.flush()?;
    Ok(())
}
