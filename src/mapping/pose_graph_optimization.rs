#![allow(non_snake_case)]

use log::{debug, info, trace};
use nalgebra::{
    DMatrix, DVector, Isometry2, Isometry3, Matrix2, Matrix2x3, Matrix3, Matrix6, SMatrix,
    SVector, UnitComplex, UnitQuaternion, Vector2, Vector3,
};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::pose_graph::{
    pose2D_landmark2D_constraint, pose2D_pose2D_constraint, pose3D_pose3D_constraint,
    Estimates, Factor, GraphError, Key, Node, PoseGraph,
};
use crate::mapping::se2_se3::{between, log_se3, log_so3, right_jacobian_inv_so3, skew};

#[derive(Debug, Error, PartialEq)]
pub enum OptimizerError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("invalid optimizer parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevenbergMarquardtParams {
    pub max_iterations: usize,
    /// Stop as soon as the total error falls below this value.
    pub error_tol: f64,
    pub relative_error_tol: f64,
    pub absolute_error_tol: f64,
    pub lambda_initial: f64,
    pub lambda_factor: f64,
    pub lambda_lower_bound: f64,
    pub lambda_upper_bound: f64,
    /// Hold the first pose constant when the graph has no `FIX` record.
    pub anchor_first_pose: bool,
}

impl Default for LevenbergMarquardtParams {
    fn default() -> Self {
        LevenbergMarquardtParams {
            max_iterations: 1000,
            error_tol: 1e-8,
            relative_error_tol: 1e-5,
            absolute_error_tol: 1e-5,
            lambda_initial: 1e-5,
            lambda_factor: 10.0,
            lambda_lower_bound: 0.0,
            lambda_upper_bound: 1e5,
            anchor_first_pose: true,
        }
    }
}

impl LevenbergMarquardtParams {
    /// Rejects settings under which the damping loop cannot terminate.
    pub fn validate(&self) -> Result<(), OptimizerError> {
        let invalid = |msg: String| Err(OptimizerError::InvalidParams(msg));
        let tolerances = [
            ("error_tol", self.error_tol),
            ("relative_error_tol", self.relative_error_tol),
            ("absolute_error_tol", self.absolute_error_tol),
            ("lambda_initial", self.lambda_initial),
            ("lambda_lower_bound", self.lambda_lower_bound),
            ("lambda_upper_bound", self.lambda_upper_bound),
        ];
        for (name, value) in tolerances {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        if !(self.lambda_factor.is_finite() && self.lambda_factor > 1.0) {
            return invalid(format!(
                "lambda_factor must be finite and greater than 1, got {}",
                self.lambda_factor
            ));
        }
        if self.lambda_initial > self.lambda_upper_bound {
            return invalid(format!(
                "lambda_initial {} exceeds lambda_upper_bound {}",
                self.lambda_initial, self.lambda_upper_bound
            ));
        }
        if self.lambda_lower_bound > self.lambda_upper_bound {
            return invalid(format!(
                "lambda_lower_bound {} exceeds lambda_upper_bound {}",
                self.lambda_lower_bound, self.lambda_upper_bound
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub estimates: Estimates,
    /// Total error before the first iteration and after every accepted step.
    pub errors: Vec<f64>,
    pub iterations: usize,
    pub lambda: f64,
    pub converged: bool,
}

impl OptimizationResult {
    pub fn initial_error(&self) -> f64 {
        self.errors[0]
    }

    pub fn final_error(&self) -> f64 {
        self.errors[self.errors.len() - 1]
    }
}

/// Offsets of the free nodes in the linear system. Fixed nodes have none.
#[derive(Debug)]
struct Layout {
    offsets: FxHashMap<Key, usize>,
    len: usize,
}

impl Layout {
    fn new(graph: &PoseGraph, estimates: &Estimates, anchor_first_pose: bool) -> Layout {
        let mut fixed: FxHashSet<Key> = graph.fixed.clone();
        if fixed.is_empty() && anchor_first_pose {
            if let Some((key, _)) = estimates.iter().find(|(_, node)| node.is_pose()) {
                fixed.insert(key);
            }
        }

        let mut offsets = FxHashMap::default();
        let mut len = 0;
        for (key, node) in estimates.iter() {
            if !fixed.contains(&key) {
                offsets.insert(key, len);
                len += node.dim();
            }
        }
        Layout { offsets, len }
    }

    fn offset(&self, key: Key) -> Option<usize> {
        self.offsets.get(&key).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    params: LevenbergMarquardtParams,
}

impl LevenbergMarquardt {
    pub fn new(params: LevenbergMarquardtParams) -> LevenbergMarquardt {
        LevenbergMarquardt { params }
    }

    /// Refines `initial` against `graph`. Only steps that decrease the total
    /// error are accepted, so the final error never exceeds the initial one.
    pub fn optimize(
        &self,
        graph: &PoseGraph,
        initial: &Estimates,
    ) -> Result<OptimizationResult, OptimizerError> {
        let params = &self.params;
        params.validate()?;
        let layout = Layout::new(graph, initial, params.anchor_first_pose);

        let mut estimates = initial.clone();
        let mut error = graph.error(&estimates)?;
        let mut errors = vec![error];
        let mut lambda = params.lambda_initial;
        let mut iterations = 0;
        let mut converged = error <= params.error_tol || layout.len == 0;

        info!(
            "{}: optimizing {} nodes ({} free parameters), initial error {error:.6}",
            graph.name,
            estimates.len(),
            layout.len
        );

        while !converged && iterations < params.max_iterations {
            iterations += 1;
            let (H, b) = build_linear_system(graph, &estimates, &layout)?;

            let mut accepted = None;
            while lambda <= params.lambda_upper_bound {
                let mut H_damped = H.clone();
                for i in 0..layout.len {
                    H_damped[(i, i)] += lambda;
                }
                match H_damped.cholesky() {
                    Some(cholesky) => {
                        let dx = cholesky.solve(&b);
                        let candidate = retract(&estimates, &layout, &dx);
                        let candidate_error = graph.error(&candidate)?;
                        if candidate_error < error {
                            accepted = Some((candidate, candidate_error, dx.norm()));
                            lambda = (lambda / params.lambda_factor).max(params.lambda_lower_bound);
                            break;
                        }
                        trace!("rejected step: error {candidate_error:.6e}, lambda {lambda:.1e}");
                    }
                    None => trace!("damped system is not positive definite, lambda {lambda:.1e}"),
                }
                // lambda may have decayed to zero
                lambda = (lambda * params.lambda_factor).max(f64::EPSILON);
            }

            let Some((candidate, new_error, norm_dx)) = accepted else {
                debug!(
                    "lambda above {:.1e}, no decreasing step left",
                    params.lambda_upper_bound
                );
                break;
            };

            debug!("step {iterations:3} : |dx| = {norm_dx:3.5}, error = {new_error:3.5}, lambda = {lambda:.1e}");
            converged = check_convergence(params, error, new_error);
            estimates = candidate;
            error = new_error;
            errors.push(error);
        }

        info!(
            "{}: final error {error:.6} after {iterations} iterations (converged: {converged})",
            graph.name
        );
        Ok(OptimizationResult {
            estimates,
            errors,
            iterations,
            lambda,
            converged,
        })
    }
}

fn check_convergence(params: &LevenbergMarquardtParams, current_error: f64, new_error: f64) -> bool {
    if new_error <= params.error_tol {
        return true;
    }
    let absolute_decrease = current_error - new_error;
    let relative_decrease = absolute_decrease / current_error;
    absolute_decrease <= params.absolute_error_tol || relative_decrease <= params.relative_error_tol
}

#[allow(clippy::too_many_arguments)]
fn update_linear_system<const R: usize, const C1: usize, const C2: usize>(
    H: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    e: &SVector<f64, R>,
    A: &SMatrix<f64, R, C1>,
    B: &SMatrix<f64, R, C2>,
    omega: &SMatrix<f64, R, R>,
    from: Option<usize>,
    to: Option<usize>,
) {
    if let Some(i) = from {
        let mut H_ii = H.fixed_view_mut::<C1, C1>(i, i);
        H_ii += A.transpose() * omega * A;
        let mut b_i = b.fixed_rows_mut::<C1>(i);
        b_i -= A.transpose() * omega * e;
    }
    if let Some(j) = to {
        let mut H_jj = H.fixed_view_mut::<C2, C2>(j, j);
        H_jj += B.transpose() * omega * B;
        let mut b_j = b.fixed_rows_mut::<C2>(j);
        b_j -= B.transpose() * omega * e;
    }
    if let (Some(i), Some(j)) = (from, to) {
        let H_ij = A.transpose() * omega * B;
        let mut view = H.fixed_view_mut::<C1, C2>(i, j);
        view += H_ij;
        let mut view = H.fixed_view_mut::<C2, C1>(j, i);
        view += H_ij.transpose();
    }
}

/// Normal equations `H dx = b` with `H = Σ JᵀΩJ` and `b = -Σ JᵀΩe`.
fn build_linear_system(
    graph: &PoseGraph,
    estimates: &Estimates,
    layout: &Layout,
) -> Result<(DMatrix<f64>, DVector<f64>), GraphError> {
    let mut H = DMatrix::zeros(layout.len, layout.len);
    let mut b = DVector::zeros(layout.len);

    for factor in &graph.factors {
        match factor {
            Factor::SE2_SE2(edge) => {
                let x1 = estimates.pose2(edge.from)?;
                let x2 = estimates.pose2(edge.to)?;
                let z = &edge.measurement;

                let e = pose2D_pose2D_constraint(x1, x2, z);
                let (A, B) = linearize_pose2D_pose2D_constraint(x1, x2, z);
                update_linear_system(
                    &mut H,
                    &mut b,
                    &e,
                    &A,
                    &B,
                    &edge.information,
                    layout.offset(edge.from),
                    layout.offset(edge.to),
                );
            }
            Factor::SE2_XY(edge) => {
                let x = estimates.pose2(edge.from)?;
                let landmark = estimates.point2(edge.to)?;

                let e = pose2D_landmark2D_constraint(x, landmark, &edge.measurement);
                let (A, B) = linearize_pose_landmark_constraint(x, landmark);
                update_linear_system(
                    &mut H,
                    &mut b,
                    &e,
                    &A,
                    &B,
                    &edge.information,
                    layout.offset(edge.from),
                    layout.offset(edge.to),
                );
            }
            Factor::SE3_SE3(edge) => {
                let x1 = estimates.pose3(edge.from)?;
                let x2 = estimates.pose3(edge.to)?;
                let z = &edge.measurement;

                let e = log_se3(&pose3D_pose3D_constraint(x1, x2, z));
                let (A, B) = linearize_pose3D_pose3D_constraint(x1, x2, z);
                update_linear_system(
                    &mut H,
                    &mut b,
                    &e,
                    &A,
                    &B,
                    &edge.information,
                    layout.offset(edge.from),
                    layout.offset(edge.to),
                );
            }
        }
    }
    Ok((H, b))
}

/// Applies `dx` to the free nodes: translations move in the world frame,
/// rotations are composed on the right.
fn retract(estimates: &Estimates, layout: &Layout, dx: &DVector<f64>) -> Estimates {
    let mut updated = Estimates::new();
    for (key, node) in estimates.iter() {
        let node = match (layout.offset(key), *node) {
            (None, node) => node,
            (Some(offset), Node::SE2(mut x)) => {
                let diff = dx.fixed_rows::<3>(offset);
                x.translation.vector += Vector2::new(diff[0], diff[1]);
                x.rotation *= UnitComplex::from_angle(diff[2]);
                Node::SE2(x)
            }
            (Some(offset), Node::XY(landmark)) => {
                Node::XY(landmark + dx.fixed_rows::<2>(offset))
            }
            (Some(offset), Node::SE3(mut x)) => {
                let diff = dx.fixed_rows::<6>(offset);
                x.translation.vector += Vector3::new(diff[0], diff[1], diff[2]);
                x.rotation *= UnitQuaternion::from_scaled_axis(Vector3::new(diff[3], diff[4], diff[5]));
                Node::SE3(x)
            }
        };
        updated.insert(key, node);
    }
    updated
}

fn linearize_pose2D_pose2D_constraint(
    x1: &Isometry2<f64>,
    x2: &Isometry2<f64>,
    z: &Isometry2<f64>,
) -> (Matrix3<f64>, Matrix3<f64>) {
    let deriv = Matrix2::<f64>::new(0.0, -1.0, 1.0, 0.0);

    let z_rot = z.rotation.to_rotation_matrix();
    let x1_rot = x1.rotation.to_rotation_matrix();
    let a_11 = -(z_rot.inverse() * x1_rot.inverse()).matrix();
    let xr1d = deriv * x1_rot.matrix();
    let a_12 =
        z_rot.transpose() * xr1d.transpose() * (x2.translation.vector - x1.translation.vector);

    #[rustfmt::skip]
    let A = Matrix3::new(
        a_11.m11, a_11.m12, a_12.x,
        a_11.m21, a_11.m22, a_12.y,
        0.0, 0.0, -1.0,
    );

    let b_11 = (z_rot.inverse() * x1_rot.inverse()).matrix().to_owned();
    #[rustfmt::skip]
    let B = Matrix3::new(
        b_11.m11, b_11.m12, 0.0,
        b_11.m21, b_11.m22, 0.0,
        0.0, 0.0, 1.0,
    );
    (A, B)
}

fn linearize_pose_landmark_constraint(
    x: &Isometry2<f64>,
    landmark: &Vector2<f64>,
) -> (Matrix2x3<f64>, Matrix2<f64>) {
    let deriv = Matrix2::<f64>::new(0.0, -1.0, 1.0, 0.0);

    let a_1 = -x.rotation.to_rotation_matrix().transpose().matrix();
    let xrd = deriv * *x.rotation.to_rotation_matrix().matrix();
    let a_2 = xrd.transpose() * (landmark - x.translation.vector);

    #[rustfmt::skip]
    let A = Matrix2x3::new(
        a_1.m11, a_1.m12, a_2.x,
        a_1.m21, a_1.m22, a_2.y,
    );

    let B = *x.rotation.to_rotation_matrix().transpose().matrix();

    (A, B)
}

/// Jacobians of `[t; log(R)]` of `z⁻¹ · x1⁻¹ · x2` with respect to
/// `[δt; δφ]` of `x1` (A) and `x2` (B).
fn linearize_pose3D_pose3D_constraint(
    x1: &Isometry3<f64>,
    x2: &Isometry3<f64>,
    z: &Isometry3<f64>,
) -> (Matrix6<f64>, Matrix6<f64>) {
    let relative = between(x1, x2);
    let error = z.inverse() * relative;

    let z_rot_t = z.rotation.to_rotation_matrix().into_inner().transpose();
    let x1_rot_t = x1.rotation.to_rotation_matrix().into_inner().transpose();
    let relative_rot_t = relative.rotation.to_rotation_matrix().into_inner().transpose();
    let jr_inv = right_jacobian_inv_so3(&log_so3(&error.rotation));

    let mut A = Matrix6::zeros();
    A.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(-z_rot_t * x1_rot_t));
    A.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(z_rot_t * skew(&relative.translation.vector)));
    A.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(-jr_inv * relative_rot_t));

    let mut B = Matrix6::zeros();
    B.fixed_view_mut::<3, 3>(0, 0).copy_from(&(z_rot_t * x1_rot_t));
    B.fixed_view_mut::<3, 3>(3, 3).copy_from(&jr_inv);
    (A, B)
}
