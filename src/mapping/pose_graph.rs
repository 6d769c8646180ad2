#![allow(non_camel_case_types)]

use nalgebra::{
    Isometry2, Isometry3, Matrix2, Matrix3, Matrix6, SMatrix, SVector, Vector2, Vector3,
};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::mapping::se2_se3::{between, log_se3};

pub type Key = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("no estimate for key {0}")]
    MissingPoseKey(Key),
    #[error("estimate for key {key} is not a {expected} node")]
    WrongNodeType { key: Key, expected: &'static str },
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node {
    SE2(Isometry2<f64>),
    SE3(Isometry3<f64>),
    XY(Vector2<f64>),
}

impl Node {
    /// Dimension of the node's tangent space.
    pub fn dim(&self) -> usize {
        match self {
            Node::SE2(_) => 3,
            Node::SE3(_) => 6,
            Node::XY(_) => 2,
        }
    }

    pub fn is_pose(&self) -> bool {
        matches!(self, Node::SE2(_) | Node::SE3(_))
    }

    /// Position of the node projected on the XY plane.
    pub fn xy(&self) -> Vector2<f64> {
        match self {
            Node::SE2(p) => p.translation.vector,
            Node::SE3(p) => p.translation.vector.xy(),
            Node::XY(l) => *l,
        }
    }
}

/// Current best guess for every node of a graph, keyed by vertex id.
/// Keeps insertion order so that iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Estimates {
    nodes: FxHashMap<Key, Node>,
    order: Vec<Key>,
}

impl Estimates {
    pub fn new() -> Estimates {
        Estimates::default()
    }

    /// Inserts a node, returning the previous estimate for `key` if any.
    pub fn insert(&mut self, key: Key, node: Node) -> Option<Node> {
        let previous = self.nodes.insert(key, node);
        if previous.is_none() {
            self.order.push(key);
        }
        previous
    }

    pub fn get(&self, key: Key) -> Option<&Node> {
        self.nodes.get(&key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &Node)> + '_ {
        self.order.iter().map(move |key| (*key, &self.nodes[key]))
    }

    pub fn pose2(&self, key: Key) -> Result<&Isometry2<f64>, GraphError> {
        match self.nodes.get(&key) {
            Some(Node::SE2(p)) => Ok(p),
            Some(_) => Err(GraphError::WrongNodeType {
                key,
                expected: "SE2",
            }),
            None => Err(GraphError::MissingPoseKey(key)),
        }
    }

    pub fn pose3(&self, key: Key) -> Result<&Isometry3<f64>, GraphError> {
        match self.nodes.get(&key) {
            Some(Node::SE3(p)) => Ok(p),
            Some(_) => Err(GraphError::WrongNodeType {
                key,
                expected: "SE3",
            }),
            None => Err(GraphError::MissingPoseKey(key)),
        }
    }

    pub fn point2(&self, key: Key) -> Result<&Vector2<f64>, GraphError> {
        match self.nodes.get(&key) {
            Some(Node::XY(l)) => Ok(l),
            Some(_) => Err(GraphError::WrongNodeType { key, expected: "XY" }),
            None => Err(GraphError::MissingPoseKey(key)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSE2 {
    pub from: Key,
    pub to: Key,
    pub measurement: Isometry2<f64>,
    pub information: Matrix3<f64>,
}

impl EdgeSE2 {
    pub fn new(
        from: Key,
        to: Key,
        measurement: Isometry2<f64>,
        information: Matrix3<f64>,
    ) -> EdgeSE2 {
        EdgeSE2 {
            from,
            to,
            measurement,
            information,
        }
    }

    pub fn residual(&self, estimates: &Estimates) -> Result<Vector3<f64>, GraphError> {
        let x1 = estimates.pose2(self.from)?;
        let x2 = estimates.pose2(self.to)?;
        Ok(pose2D_pose2D_constraint(x1, x2, &self.measurement))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSE2_XY {
    pub from: Key,
    pub to: Key,
    pub measurement: Vector2<f64>,
    pub information: Matrix2<f64>,
}

impl EdgeSE2_XY {
    pub fn new(
        from: Key,
        to: Key,
        measurement: Vector2<f64>,
        information: Matrix2<f64>,
    ) -> EdgeSE2_XY {
        EdgeSE2_XY {
            from,
            to,
            measurement,
            information,
        }
    }

    pub fn residual(&self, estimates: &Estimates) -> Result<Vector2<f64>, GraphError> {
        let x = estimates.pose2(self.from)?;
        let landmark = estimates.point2(self.to)?;
        Ok(pose2D_landmark2D_constraint(x, landmark, &self.measurement))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSE3 {
    pub from: Key,
    pub to: Key,
    pub measurement: Isometry3<f64>,
    pub information: Matrix6<f64>,
}

impl EdgeSE3 {
    pub fn new(
        from: Key,
        to: Key,
        measurement: Isometry3<f64>,
        information: Matrix6<f64>,
    ) -> EdgeSE3 {
        EdgeSE3 {
            from,
            to,
            measurement,
            information,
        }
    }

    pub fn residual(&self, estimates: &Estimates) -> Result<SVector<f64, 6>, GraphError> {
        let x1 = estimates.pose3(self.from)?;
        let x2 = estimates.pose3(self.to)?;
        Ok(log_se3(&pose3D_pose3D_constraint(x1, x2, &self.measurement)))
    }
}

/// Factor kinds a g2o graph can hold. Only `SE3_SE3` is a 3D relative-pose
/// constraint; the residual diagnostic skips every other variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Factor {
    SE2_SE2(EdgeSE2),
    SE2_XY(EdgeSE2_XY),
    SE3_SE3(EdgeSE3),
}

impl Factor {
    pub fn kind(&self) -> &'static str {
        match self {
            Factor::SE2_SE2(_) => "EDGE_SE2",
            Factor::SE2_XY(_) => "EDGE_SE2_XY",
            Factor::SE3_SE3(_) => "EDGE_SE3:QUAT",
        }
    }

    /// Weighted error `0.5 * rᵀ Ω r` of this factor alone.
    pub fn error(&self, estimates: &Estimates) -> Result<f64, GraphError> {
        let e = match self {
            Factor::SE2_SE2(edge) => mahalanobis(&edge.residual(estimates)?, &edge.information),
            Factor::SE2_XY(edge) => mahalanobis(&edge.residual(estimates)?, &edge.information),
            Factor::SE3_SE3(edge) => mahalanobis(&edge.residual(estimates)?, &edge.information),
        };
        Ok(0.5 * e)
    }
}

fn mahalanobis<const D: usize>(e: &SVector<f64, D>, omega: &SMatrix<f64, D, D>) -> f64 {
    (e.transpose() * omega * e).x
}

#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    pub name: String,
    pub factors: Vec<Factor>,
    pub fixed: FxHashSet<Key>,
}

impl PoseGraph {
    pub fn new(name: &str) -> PoseGraph {
        PoseGraph {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn add(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Total graph error, the sum of every factor's `0.5 * rᵀ Ω r`.
    pub fn error(&self, estimates: &Estimates) -> Result<f64, GraphError> {
        self.factors.iter().map(|f| f.error(estimates)).sum()
    }
}

pub(crate) fn pose2D_pose2D_constraint(
    x1: &Isometry2<f64>,
    x2: &Isometry2<f64>,
    z: &Isometry2<f64>,
) -> Vector3<f64> {
    let e = z.inverse() * between(x1, x2);
    Vector3::new(e.translation.x, e.translation.y, e.rotation.angle())
}

pub(crate) fn pose2D_landmark2D_constraint(
    x: &Isometry2<f64>,
    landmark: &Vector2<f64>,
    z: &Vector2<f64>,
) -> Vector2<f64> {
    x.rotation.to_rotation_matrix().transpose() * (landmark - x.translation.vector) - z
}

pub(crate) fn pose3D_pose3D_constraint(
    x1: &Isometry3<f64>,
    x2: &Isometry3<f64>,
    z: &Isometry3<f64>,
) -> Isometry3<f64> {
    z.inverse() * between(x1, x2)
}
