pub mod g2o;
pub mod pose_graph;
pub mod pose_graph_optimization;
pub mod residual;
pub mod se2_se3;

pub use g2o::{load_graph, parse_g2o, G2oError, ParseReason};
pub use pose_graph::{Estimates, Factor, GraphError, Key, Node, PoseGraph};
pub use pose_graph_optimization::{
    LevenbergMarquardt, LevenbergMarquardtParams, OptimizationResult, OptimizerError,
};
pub use residual::{
    compute_residual, diagnose, write_csv, FactorReport, Outcome, RelativePoseResidual, Residual,
};
