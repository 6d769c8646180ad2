use log::{info, warn};
use nalgebra::{
    Isometry2, Isometry3, Quaternion, SMatrix, Translation2, Translation3, UnitComplex,
    UnitQuaternion, Vector2,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::mapping::pose_graph::{
    EdgeSE2, EdgeSE2_XY, EdgeSE3, Estimates, Factor, Key, Node, PoseGraph,
};

/// Errors raised while loading a g2o file. All of them are fatal for a run.
#[derive(Debug, Error)]
pub enum G2oError {
    #[error("graph file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: ParseReason },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseReason {
    #[error("unknown record `{0}`")]
    UnknownRecord(String),
    #[error("`{record}` expects {expected} fields, got {got}")]
    FieldCount {
        record: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    #[error("non-finite number `{0}`")]
    NonFinite(String),
    #[error("quaternion ({qx}, {qy}, {qz}, {qw}) has no rotation")]
    InvalidQuaternion { qx: f64, qy: f64, qz: f64, qw: f64 },
    #[error("vertex {0} is defined twice")]
    DuplicateVertex(Key),
}

enum Record {
    Vertex(Key, Node),
    Edge(Factor),
    Fix(Key),
}

impl Record {
    /// `None` for records valid in both dimensions.
    fn is_3d(&self) -> Option<bool> {
        match self {
            Record::Vertex(_, Node::SE3(_)) | Record::Edge(Factor::SE3_SE3(_)) => Some(true),
            Record::Vertex(..) | Record::Edge(_) => Some(false),
            Record::Fix(_) => None,
        }
    }
}

fn iso2(x: f64, y: f64, angle: f64) -> Isometry2<f64> {
    Isometry2::from_parts(Translation2::new(x, y), UnitComplex::from_angle(angle))
}

fn iso3(
    x: f64,
    y: f64,
    z: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    qw: f64,
) -> Result<Isometry3<f64>, ParseReason> {
    let translation = Translation3::new(x, y, z);
    // g2o stores the scalar part last
    let rotation = UnitQuaternion::try_new(Quaternion::new(qw, qx, qy, qz), 1e-9)
        .ok_or(ParseReason::InvalidQuaternion { qx, qy, qz, qw })?;
    Ok(Isometry3::from_parts(translation, rotation))
}

/// Symmetric matrix from its row-major upper triangle.
fn information<const D: usize>(upper: &[f64]) -> SMatrix<f64, D, D> {
    let mut m = SMatrix::<f64, D, D>::zeros();
    let mut k = 0;
    for i in 0..D {
        for j in i..D {
            m[(i, j)] = upper[k];
            m[(j, i)] = upper[k];
            k += 1;
        }
    }
    m
}

/// Splits the fields following a tag into `K` ids and `N` numbers.
fn fields<const K: usize, const N: usize>(
    record: &'static str,
    line: &[&str],
) -> Result<([Key; K], [f64; N]), ParseReason> {
    if line.len() != K + N {
        return Err(ParseReason::FieldCount {
            record,
            expected: K + N,
            got: line.len(),
        });
    }
    let mut ids = [0; K];
    for (id, s) in ids.iter_mut().zip(&line[..K]) {
        *id = s
            .parse()
            .map_err(|_| ParseReason::InvalidNumber(s.to_string()))?;
    }
    let mut values = [0.0f64; N];
    for (v, s) in values.iter_mut().zip(&line[K..]) {
        *v = s
            .parse()
            .map_err(|_| ParseReason::InvalidNumber(s.to_string()))?;
        if !v.is_finite() {
            return Err(ParseReason::NonFinite(s.to_string()));
        }
    }
    Ok((ids, values))
}

fn parse_record(tag: &str, line: &[&str]) -> Result<Record, ParseReason> {
    let record = match tag {
        "VERTEX_SE2" => {
            let ([id], [x, y, angle]) = fields::<1, 3>("VERTEX_SE2", line)?;
            Record::Vertex(id, Node::SE2(iso2(x, y, angle)))
        }
        "VERTEX_XY" => {
            let ([id], [x, y]) = fields::<1, 2>("VERTEX_XY", line)?;
            Record::Vertex(id, Node::XY(Vector2::new(x, y)))
        }
        "VERTEX_SE3:QUAT" => {
            let ([id], [x, y, z, qx, qy, qz, qw]) = fields::<1, 7>("VERTEX_SE3:QUAT", line)?;
            Record::Vertex(id, Node::SE3(iso3(x, y, z, qx, qy, qz, qw)?))
        }
        "EDGE_SE2" => {
            let ([from, to], v) = fields::<2, 9>("EDGE_SE2", line)?;
            let measurement = iso2(v[0], v[1], v[2]);
            Record::Edge(Factor::SE2_SE2(EdgeSE2::new(
                from,
                to,
                measurement,
                information(&v[3..]),
            )))
        }
        "EDGE_SE2_XY" => {
            let ([from, to], v) = fields::<2, 5>("EDGE_SE2_XY", line)?;
            let measurement = Vector2::new(v[0], v[1]);
            Record::Edge(Factor::SE2_XY(EdgeSE2_XY::new(
                from,
                to,
                measurement,
                information(&v[2..]),
            )))
        }
        "EDGE_SE3:QUAT" => {
            let ([from, to], v) = fields::<2, 28>("EDGE_SE3:QUAT", line)?;
            let measurement = iso3(v[0], v[1], v[2], v[3], v[4], v[5], v[6])?;
            Record::Edge(Factor::SE3_SE3(EdgeSE3::new(
                from,
                to,
                measurement,
                information(&v[7..]),
            )))
        }
        "FIX" => {
            let ([id], []) = fields::<1, 0>("FIX", line)?;
            Record::Fix(id)
        }
        _ => return Err(ParseReason::UnknownRecord(tag.to_string())),
    };
    Ok(record)
}

/// Parses g2o text. Records of the other dimension than `is_3d` are skipped.
pub fn parse_g2o(text: &str, name: &str, is_3d: bool) -> Result<(PoseGraph, Estimates), G2oError> {
    let mut graph = PoseGraph::new(name);
    let mut estimates = Estimates::new();
    let mut skipped = 0;

    for (i, line) in text.lines().enumerate() {
        let line_nb = i + 1;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(tag) = tokens.first() else {
            continue;
        };
        if tag.starts_with('#') {
            continue;
        }

        let parse_error = |reason| G2oError::Parse {
            line: line_nb,
            reason,
        };
        let record = parse_record(tag, &tokens[1..]).map_err(parse_error)?;
        if record.is_3d().is_some_and(|dim| dim != is_3d) {
            skipped += 1;
            continue;
        }
        match record {
            Record::Vertex(id, node) => {
                if estimates.insert(id, node).is_some() {
                    return Err(parse_error(ParseReason::DuplicateVertex(id)));
                }
            }
            Record::Edge(factor) => graph.add(factor),
            Record::Fix(id) => {
                graph.fixed.insert(id);
            }
        }
    }

    if skipped > 0 {
        warn!(
            "{name}: skipped {skipped} {} records while loading a {} graph",
            if is_3d { "2D" } else { "3D" },
            if is_3d { "3D" } else { "2D" },
        );
    }
    info!(
        "{name}: loaded {} vertices and {} factors",
        estimates.len(),
        graph.len()
    );
    Ok((graph, estimates))
}

/// Reads a g2o file; the graph is named after the file stem.
pub fn load_graph<P: AsRef<Path>>(path: P, is_3d: bool) -> Result<(PoseGraph, Estimates), G2oError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => G2oError::FileNotFound(path.to_path_buf()),
        _ => G2oError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("graph");
    parse_g2o(&text, name, is_3d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use std::error::Error;
    use std::io::Write;

    const GRAPH_3D: &str = "\
# two poses, one odometry edge
VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1
VERTEX_SE3:QUAT 1 1 0 0 0 0 0.7071067811865476 0.7071067811865476
EDGE_SE3:QUAT 0 1 1 0 0 0 0 0.7071067811865476 0.7071067811865476 1 0 0 0 0 0 2 0 0 0 0 3 0 0 0 4 0 0 5 0 6

FIX 0
";

    const GRAPH_2D: &str = "\
VERTEX_SE2 0 0 0 0
VERTEX_SE2 1 1 0 1.5707963267948966
VERTEX_XY 2 1 1
EDGE_SE2 0 1 1 0 1.5707963267948966 1 0.1 0 2 0 3
EDGE_SE2_XY 1 2 1 0 5 0 5
";

    #[test]
    fn parse_3d() -> Result<(), Box<dyn Error>> {
        let (graph, estimates) = parse_g2o(GRAPH_3D, "tiny", true)?;
        assert_eq!("tiny", graph.name);
        assert_eq!(2, estimates.len());
        assert_eq!(1, graph.len());
        assert!(graph.fixed.contains(&0));

        // qw is the last field
        let x1 = estimates.pose3(1)?;
        approx::assert_abs_diff_eq!(
            x1.rotation.scaled_axis(),
            Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            epsilon = 1e-9
        );

        let Factor::SE3_SE3(edge) = &graph.factors[0] else {
            panic!("expected an SE3 edge")
        };
        assert_eq!((0, 1), (edge.from, edge.to));
        let diagonal = edge.information.diagonal();
        approx::assert_abs_diff_eq!(
            diagonal,
            nalgebra::Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0),
            epsilon = 1e-12
        );
        assert_eq!(edge.information, edge.information.transpose());
        Ok(())
    }

    #[test]
    fn parse_2d() -> Result<(), Box<dyn Error>> {
        let (graph, estimates) = parse_g2o(GRAPH_2D, "planar", false)?;
        assert_eq!(3, estimates.len());
        assert_eq!(2, graph.len());
        assert!(graph.fixed.is_empty());

        let Factor::SE2_SE2(edge) = &graph.factors[0] else {
            panic!("expected an SE2 edge")
        };
        #[rustfmt::skip]
        let expected = Matrix3::new(
            1.0, 0.1, 0.0,
            0.1, 2.0, 0.0,
            0.0, 0.0, 3.0
        );
        assert_eq!(expected, edge.information);
        assert!(matches!(graph.factors[1], Factor::SE2_XY(_)));
        assert_eq!(Some(&Node::XY(Vector2::new(1.0, 1.0))), estimates.get(2));
        Ok(())
    }

    #[test]
    fn other_dimension_is_skipped() -> Result<(), Box<dyn Error>> {
        let (graph, estimates) = parse_g2o(GRAPH_2D, "planar", true)?;
        assert!(graph.is_empty());
        assert!(estimates.is_empty());

        let mixed = format!("{GRAPH_3D}{GRAPH_2D}").replace("VERTEX_SE2 0", "VERTEX_SE2 10");
        let (graph, estimates) = parse_g2o(&mixed, "mixed", true)?;
        assert_eq!(1, graph.len());
        assert_eq!(2, estimates.len());
        Ok(())
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let err = parse_g2o("VERTEX_SE2 0 0 0 0\nVERTEX_SE4 1 0 0", "bad", false).unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse { line: 2, reason: ParseReason::UnknownRecord(ref tag) } if tag == "VERTEX_SE4"
        ));

        let err = parse_g2o("VERTEX_SE2 0 0 0", "bad", false).unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse {
                line: 1,
                reason: ParseReason::FieldCount {
                    expected: 4,
                    got: 3,
                    ..
                }
            }
        ));

        let err = parse_g2o("\nVERTEX_XY 3 1.0 abc", "bad", false).unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse { line: 2, reason: ParseReason::InvalidNumber(ref s) } if s == "abc"
        ));

        let err = parse_g2o("VERTEX_XY -1 1.0 2.0", "bad", false).unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse {
                reason: ParseReason::InvalidNumber(_),
                ..
            }
        ));

        let err = parse_g2o("VERTEX_SE3:QUAT 1 nan 0 0 0 0 0 1", "bad", true).unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse { line: 1, reason: ParseReason::NonFinite(ref s) } if s == "nan"
        ));

        let err = parse_g2o("VERTEX_XY 3 1 2\nEDGE_SE2_XY 0 3 -inf 0 1 0 1", "bad", false)
            .unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse { line: 2, reason: ParseReason::NonFinite(ref s) } if s == "-inf"
        ));

        let err = parse_g2o(
            "VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1\nVERTEX_SE3:QUAT 1 0 0 0 0 0 0 0",
            "bad",
            true,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse {
                line: 2,
                reason: ParseReason::InvalidQuaternion { qw, .. }
            } if qw == 0.0
        ));

        let err = parse_g2o("VERTEX_XY 3 1 2\nVERTEX_XY 3 1 2", "bad", false).unwrap_err();
        assert!(matches!(
            err,
            G2oError::Parse {
                line: 2,
                reason: ParseReason::DuplicateVertex(3)
            }
        ));
    }

    #[test]
    fn load_from_file() -> Result<(), Box<dyn Error>> {
        let mut file = tempfile::Builder::new().suffix(".g2o").tempfile()?;
        file.write_all(GRAPH_3D.as_bytes())?;
        let (graph, estimates) = load_graph(file.path(), true)?;
        assert_eq!(2, estimates.len());
        assert_eq!(1, graph.len());
        let stem = file.path().file_stem().and_then(|s| s.to_str()).unwrap();
        assert_eq!(stem, graph.name);
        Ok(())
    }

    #[test]
    fn from_g2o() -> Result<(), Box<dyn Error>> {
        let (graph, estimates) = load_graph("dataset/g2o/helix.g2o", true)?;
        assert_eq!("helix", graph.name);
        assert_eq!(30, estimates.len());
        assert_eq!(49, graph.len());
        assert!(graph
            .factors
            .iter()
            .all(|f| matches!(f, Factor::SE3_SE3(_))));

        let (graph, estimates) = load_graph("dataset/g2o/helix.g2o", false)?;
        assert!(graph.is_empty());
        assert!(estimates.is_empty());
        Ok(())
    }

    #[test]
    fn missing_file() {
        let err = load_graph("does/not/exist.g2o", true).unwrap_err();
        assert!(matches!(err, G2oError::FileNotFound(ref p) if p == Path::new("does/not/exist.g2o")));
        assert_eq!("graph file not found: does/not/exist.g2o", err.to_string());
    }
}
