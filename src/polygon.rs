use geo::prelude::*;
use geo::{LineString, Polygon};
use geo_clipper::{Clipper, EndType, JoinType};
use imageproc::point::Point;
use num_traits::{Num, NumCast};

pub fn shrink_polygon<T: Num + NumCast + Copy>(
    polygon: &[Point<T>],
    rate: f64,
) -> Option<Vec<Point<i32>>> {
    if polygon.len() < 3 {
        return None;
    }
    let as_i32 = |p: &Point<T>| Point::new(p.x.to_f64().unwrap() as i32, p.y.to_f64().unwrap() as i32);
    if (rate - 1.).abs() < f64::EPSILON {
        // rate 1 keeps the polygon as-is, no offset math
        return Some(polygon.iter().map(as_i32).collect());
    }
    let prep_poly = Polygon::new(
        LineString::from(
            polygon
                .iter()
                .map(|p| (p.x.to_f64().unwrap(), p.y.to_f64().unwrap()))
                .collect::<Vec<(f64, f64)>>(),
        ),
        vec![],
    );
    let area = prep_poly.unsigned_area();
    let perimeter = prep_poly.exterior().euclidean_length();
    if area < f64::EPSILON || perimeter < f64::EPSILON {
        return None;
    }
    let distance = area * (1. - rate * rate) / perimeter;
    let clipped = prep_poly.offset(-distance, JoinType::Miter(2.), EndType::ClosedPolygon, 1.);
    if clipped.0.is_empty() || clipped.0[0].exterior().0.is_empty() {
        return None;
    }
    let exterior_poly = clipped.0[0].exterior();
    let shrinked_points = exterior_poly
        .points()
        .take(exterior_poly.0.len() - 1)
        .map(|p| Point::new(p.x() as i32, p.y() as i32))
        .collect::<Vec<Point<i32>>>();
    if shrinked_points.len() < 3 {
        return None;
    }
    Some(shrinked_points)
}

/// Shrinks every polygon in the batch by the same rate, falling back to the
/// input polygon where the offset degenerates.
pub fn shrink_boxes(bboxes: &[Vec<Point<i32>>], rate: f64) -> Vec<Vec<Point<i32>>> {
    bboxes
        .iter()
        .map(|points| shrink_polygon(points, rate).unwrap_or_else(|| points.clone()))
        .collect()
}
