use plotters::prelude::*;
use std::error::Error;
use std::ops::Range;
use std::path::Path;

use crate::mapping::pose_graph::{Estimates, Key};

/// XY positions of the poses, ordered by key.
pub fn trajectory(estimates: &Estimates) -> Vec<(f64, f64)> {
    let mut poses: Vec<(Key, (f64, f64))> = estimates
        .iter()
        .filter(|(_, node)| node.is_pose())
        .map(|(key, node)| {
            let p = node.xy();
            (key, (p.x, p.y))
        })
        .collect();
    poses.sort_by_key(|(key, _)| *key);
    poses.into_iter().map(|(_, p)| p).collect()
}

/// XY positions of the landmarks.
pub fn landmarks(estimates: &Estimates) -> Vec<(f64, f64)> {
    estimates
        .iter()
        .filter(|(_, node)| !node.is_pose())
        .map(|(_, node)| {
            let p = node.xy();
            (p.x, p.y)
        })
        .collect()
}

/// Square-ish plotting window around `points` with a 5% margin.
pub fn bounds<'a>(points: impl Iterator<Item = &'a (f64, f64)>) -> (Range<f64>, Range<f64>) {
    let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
    for (x, y) in points {
        min_x = min_x.min(*x);
        max_x = max_x.max(*x);
        min_y = min_y.min(*y);
        max_y = max_y.max(*y);
    }
    if min_x > max_x {
        return (-1.0..1.0, -1.0..1.0);
    }
    let margin = 0.05 * (max_x - min_x).max(max_y - min_y).max(1e-3);
    (
        min_x - margin..max_x + margin,
        min_y - margin..max_y + margin,
    )
}

/// Draws the trajectory before and after optimization to a PNG file.
pub fn plot_trajectories(
    path: &Path,
    name: &str,
    initial: &Estimates,
    optimized: &Estimates,
) -> Result<(), Box<dyn Error>> {
    let before = trajectory(initial);
    let after = trajectory(optimized);
    let points = landmarks(optimized);
    let (x_range, y_range) = bounds(before.iter().chain(&after).chain(&points));

    let root = BitMapBackend::new(path, (1024, 768)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(name, ("sans-serif", 40))
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(x_range, y_range)?;

    chart.configure_mesh().draw()?;

    chart
        .draw_series(LineSeries::new(before, &RED))?
        .label("Initial")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

    chart
        .draw_series(LineSeries::new(after, &BLUE))?
        .label("Optimized")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

    if !points.is_empty() {
        chart
            .draw_series(
                points
                    .iter()
                    .map(|(x, y)| Circle::new((*x, *y), 3, BLACK.filled())),
            )?
            .label("Landmarks")
            .legend(|(x, y)| Circle::new((x, y), 3, BLACK.filled()));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerRight)
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}
