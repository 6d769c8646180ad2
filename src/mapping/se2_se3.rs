// SO(3)/SE(3) helpers shared by the residual diagnostic and the optimizer.
// Conventions: translations are perturbed in the world frame, rotations on the
// right (R <- R * Exp(phi)).

#![allow(non_snake_case)]

use nalgebra::{
    AbstractRotation, Isometry, Isometry3, Matrix3, UnitQuaternion, Vector3, Vector6,
};

/// Relative transform taking `a`'s frame to `b`'s frame: `a⁻¹ · b`.
pub fn between<R: AbstractRotation<f64, D>, const D: usize>(
    a: &Isometry<f64, R, D>,
    b: &Isometry<f64, R, D>,
) -> Isometry<f64, R, D> {
    a.inverse() * b
}

pub fn skew(t: &Vector3<f64>) -> Matrix3<f64> {
    #[rustfmt::skip]
    let res = Matrix3::new(
        0.0, -t.z,  t.y,
        t.z,  0.0, -t.x,
        -t.y, t.x,  0.0
    );
    res
}

/// Logarithm of SO(3) as a rotation vector (axis * angle, angle in [0, pi]).
pub fn log_so3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Tangent-space residual of an SE(3) error transform, translation first
/// (g2o information layout).
pub fn log_se3(e: &Isometry3<f64>) -> Vector6<f64> {
    let t = e.translation.vector;
    let w = log_so3(&e.rotation);
    Vector6::new(t.x, t.y, t.z, w.x, w.y, w.z)
}

/// Source : A micro Lie theory for state estimation in robotics (Sola et al.).
///
/// Inverse of the SO(3) right Jacobian:
/// `log(Exp(phi) * Exp(d)) ~= phi + Jr⁻¹(phi) * d`.
pub fn right_jacobian_inv_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let W = skew(phi);
    let coeff = if theta < 1e-6 {
        1.0 / 12.0
    } else {
        1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())
    };
    Matrix3::identity() + 0.5 * W + coeff * W * W
}

/// Norm of the (roll, pitch, yaw) vector with `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.
pub fn euler_norm(q: &UnitQuaternion<f64>) -> f64 {
    let (roll, pitch, yaw) = q.euler_angles();
    Vector3::new(roll, pitch, yaw).norm()
}
