// THEORY:
// Labeling turns a grid of per-pixel classes into numbered connected components. It is
// the step that groups decoded pixels into spots, and it runs on the whole grid at once.
//
// Key architectural principles:
// 1.  **Class-Aware Union-Find**: Two pixels join the same component only when they are
//     neighbours under the configured connectivity and carry the same class. One pass
//     gives the same result as labeling every class's binary grid on its own.
// 2.  **First-Seen Ids**: Component ids start at 1 and follow the raster order of each
//     component's first pixel, whatever order the unions happened in.
// 3.  **Connectivity Table**: The neighbourhood is a closed enum. Only the neighbours
//     already visited in raster order are examined for each pixel.

use crate::core_modules::tensor::SpatialShape;
use crate::error::{Result, SpotDecodeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Neighbourhood used to decide whether two pixels touch.
///
/// `Four` and `Eight` only connect pixels within the same z-plane; `Six`, `Eighteen`
/// and `TwentySix` connect across planes (faces, faces + edges, faces + edges + corners).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Connectivity {
    Four,
    Eight,
    Six,
    Eighteen,
    #[default]
    TwentySix,
}

impl Connectivity {
    fn admits(&self, dz: isize, dy: isize, dx: isize) -> bool {
        let steps = dz.abs() + dy.abs() + dx.abs();
        match self {
            Connectivity::Four => dz == 0 && steps == 1,
            Connectivity::Eight => dz == 0,
            Connectivity::Six => steps == 1,
            Connectivity::Eighteen => steps <= 2,
            Connectivity::TwentySix => true,
        }
    }

    /// Neighbour offsets that precede the centre pixel in raster order.
    fn backward_offsets(&self) -> Vec<(isize, isize, isize)> {
        let mut offsets = Vec::new();
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if (dz, dy, dx) < (0, 0, 0) && self.admits(dz, dy, dx) {
                        offsets.push((dz, dy, dx));
                    }
                }
            }
        }
        offsets
    }
}

impl TryFrom<u8> for Connectivity {
    type Error = SpotDecodeError;

    fn try_from(neighbours: u8) -> Result<Self> {
        match neighbours {
            4 => Ok(Connectivity::Four),
            8 => Ok(Connectivity::Eight),
            6 => Ok(Connectivity::Six),
            18 => Ok(Connectivity::Eighteen),
            26 => Ok(Connectivity::TwentySix),
            other => Err(SpotDecodeError::InvalidConnectivity(other)),
        }
    }
}

impl From<Connectivity> for u8 {
    fn from(connectivity: Connectivity) -> u8 {
        match connectivity {
            Connectivity::Four => 4,
            Connectivity::Eight => 8,
            Connectivity::Six => 6,
            Connectivity::Eighteen => 18,
            Connectivity::TwentySix => 26,
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-connectivity", u8::from(*self))
    }
}

/// Result of labeling: one id per pixel in raster order, 0 for background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLabels {
    pub labels: Vec<u32>,
    pub count: usize,
}

fn find(parent: &mut [usize], mut node: usize) -> usize {
    while parent[node] != node {
        parent[node] = parent[parent[node]];
        node = parent[node];
    }
    node
}

/// Keeps the smaller raster index as root, so every root is its component's first pixel.
fn union(parent: &mut [usize], a: usize, b: usize) {
    let root_a = find(parent, a);
    let root_b = find(parent, b);
    if root_a < root_b {
        parent[root_b] = root_a;
    } else if root_b < root_a {
        parent[root_a] = root_b;
    }
}

/// Labels connected runs of equal, non-`None` classes on a raster-ordered grid.
pub fn label_components(
    shape: SpatialShape,
    classes: &[Option<usize>],
    connectivity: Connectivity,
) -> Result<ComponentLabels> {
    let len = shape.volume();
    if classes.len() != len {
        return Err(SpotDecodeError::GridSizeMismatch {
            expected: len,
            found: classes.len(),
        });
    }

    let offsets = connectivity.backward_offsets();
    let mut parent: Vec<usize> = (0..len).collect();

    // --- 1. Provisional merge with already visited neighbours ---
    for z in 0..shape.z {
        for y in 0..shape.y {
            for x in 0..shape.x {
                let index = shape.raster_index(z, y, x);
                let Some(class) = classes[index] else {
                    continue;
                };
                for &(dz, dy, dx) in &offsets {
                    let (Some(nz), Some(ny), Some(nx)) = (
                        z.checked_add_signed(dz),
                        y.checked_add_signed(dy),
                        x.checked_add_signed(dx),
                    ) else {
                        continue;
                    };
                    if nz >= shape.z || ny >= shape.y || nx >= shape.x {
                        continue;
                    }
                    let neighbour = shape.raster_index(nz, ny, nx);
                    if classes[neighbour] == Some(class) {
                        union(&mut parent, index, neighbour);
                    }
                }
            }
        }
    }

    // --- 2. Final ids in first-seen order ---
    let mut labels = vec![0u32; len];
    let mut next_id = 0u32;
    for index in 0..len {
        if classes[index].is_none() {
            continue;
        }
        let root = find(&mut parent, index);
        if root == index {
            next_id += 1;
            labels[index] = next_id;
        } else {
            // the root precedes `index` in raster order, so it is already numbered
            labels[index] = labels[root];
        }
    }

    Ok(ComponentLabels {
        labels,
        count: next_id as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(rows: &[&str]) -> (SpatialShape, Vec<Option<usize>>) {
        let shape = SpatialShape {
            z: 1,
            y: rows.len(),
            x: rows[0].len(),
        };
        let classes = rows
            .iter()
            .flat_map(|row| row.chars())
            .map(|c| c.to_digit(10).map(|d| d as usize))
            .collect();
        (shape, classes)
    }

    #[test]
    fn diagonal_pixels_split_under_four_and_merge_under_eight() {
        let (shape, classes) = plane(&["0.", ".0"]);
        let four = label_components(shape, &classes, Connectivity::Four).unwrap();
        assert_eq!(four.count, 2);
        assert_eq!(four.labels, vec![1, 0, 0, 2]);
        let eight = label_components(shape, &classes, Connectivity::Eight).unwrap();
        assert_eq!(eight.count, 1);
        assert_eq!(eight.labels, vec![1, 0, 0, 1]);
    }

    #[test]
    fn different_classes_never_merge() {
        let (shape, classes) = plane(&["0011", "0011"]);
        let result = label_components(shape, &classes, Connectivity::Eight).unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.labels, vec![1, 1, 2, 2, 1, 1, 2, 2]);
    }

    #[test]
    fn u_shape_is_one_component_numbered_by_first_pixel() {
        let (shape, classes) = plane(&["1.1.0", "1.1..", "111.."]);
        let result = label_components(shape, &classes, Connectivity::Four).unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.labels[0], 1);
        assert_eq!(result.labels[2], 1);
        assert_eq!(result.labels[4], 2);
        assert_eq!(result.labels[12], 1);
    }

    #[test]
    fn ids_follow_first_seen_raster_order() {
        // the two arms of the U only meet on the last row, after class 1 was seen
        let (shape, classes) = plane(&["0.1.0", "0...0", "00000"]);
        let result = label_components(shape, &classes, Connectivity::Four).unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.labels, vec![1, 0, 2, 0, 1, 1, 0, 0, 0, 1, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn planes_connect_only_in_three_dimensions() {
        let shape = SpatialShape { z: 2, y: 1, x: 2 };
        // (0,0,0) and (1,0,1) touch by an edge across planes
        let classes = vec![Some(0), None, None, Some(0)];
        assert_eq!(label_components(shape, &classes, Connectivity::Six).unwrap().count, 2);
        assert_eq!(label_components(shape, &classes, Connectivity::Eight).unwrap().count, 2);
        assert_eq!(label_components(shape, &classes, Connectivity::Eighteen).unwrap().count, 1);

        let corner = SpatialShape { z: 2, y: 2, x: 2 };
        let mut classes = vec![None; 8];
        classes[0] = Some(3);
        classes[7] = Some(3);
        assert_eq!(label_components(corner, &classes, Connectivity::Eighteen).unwrap().count, 2);
        assert_eq!(label_components(corner, &classes, Connectivity::TwentySix).unwrap().count, 1);
    }

    #[test]
    fn grid_size_must_match() {
        let shape = SpatialShape { z: 1, y: 2, x: 2 };
        assert!(matches!(
            label_components(shape, &[None; 3], Connectivity::Four),
            Err(SpotDecodeError::GridSizeMismatch { expected: 4, found: 3 })
        ));
    }

    #[test]
    fn connectivity_parses_neighbour_counts() {
        assert_eq!(Connectivity::try_from(18).unwrap(), Connectivity::Eighteen);
        assert!(Connectivity::try_from(5).is_err());
        assert_eq!(serde_json::to_string(&Connectivity::Four).unwrap(), "4");
        assert_eq!(serde_json::from_str::<Connectivity>("26").unwrap(), Connectivity::TwentySix);
    }
}
