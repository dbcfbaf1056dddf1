// THEORY:
// Distances between a pixel and a code are only meaningful once both have been put on
// the same scale. This module owns the two "lenses" the decoder uses: Lp
// normalization (how a vector is scaled to unit length) and the distance metric
// (how two unit vectors are compared).
//
// All metrics operate on already-normalized vectors. Magnitudes are measured on the
// raw vector with the same norm order, so "bright enough" and "close enough" are
// judged in consistent units.

use crate::error::{Result, SpotDecodeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order of the Lp norm. `f64::INFINITY` selects the max norm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormOrder(f64);

impl NormOrder {
    pub fn new(order: f64) -> Result<Self> {
        if order.is_nan() || order < 1.0 {
            return Err(SpotDecodeError::InvalidNormOrder(order));
        }
        Ok(Self(order))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Lp norm of `values`.
    pub fn norm(&self, values: &[f32]) -> f64 {
        let p = self.0;
        if p.is_infinite() {
            return values.iter().fold(0.0f64, |acc, v| acc.max((*v as f64).abs()));
        }
        if p == 1.0 {
            return values.iter().map(|v| (*v as f64).abs()).sum();
        }
        if p == 2.0 {
            return values.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
        }
        values
            .iter()
            .map(|v| (*v as f64).abs().powf(p))
            .sum::<f64>()
            .powf(1.0 / p)
    }

    /// Scales `values` to unit norm and returns the original magnitude alongside.
    /// A zero vector stays zero.
    pub fn normalize(&self, values: &[f32]) -> (Vec<f64>, f64) {
        let magnitude = self.norm(values);
        let normalized = if magnitude > 0.0 {
            values.iter().map(|v| *v as f64 / magnitude).collect()
        } else {
            vec![0.0; values.len()]
        };
        (normalized, magnitude)
    }
}

impl Default for NormOrder {
    fn default() -> Self {
        Self(2.0)
    }
}

/// Distance used to compare normalized pixel vectors against normalized codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Euclidean,
    Manhattan,
    Chebyshev,
    /// `1 - cos(angle)`, in `[0, 2]`. Zero vectors are at distance 1 from everything.
    Cosine,
}

impl Metric {
    pub fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        let pairs = a.iter().zip(b.iter());
        match self {
            Metric::Euclidean => pairs.map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt(),
            Metric::Manhattan => pairs.map(|(x, y)| (x - y).abs()).sum(),
            Metric::Chebyshev => pairs.fold(0.0f64, |acc, (x, y)| acc.max((x - y).abs())),
            Metric::Cosine => {
                let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
                for (x, y) in pairs {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                // rounding can push the cosine slightly past 1
                (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).max(0.0)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
            Metric::Chebyshev => "chebyshev",
            Metric::Cosine => "cosine",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = SpotDecodeError;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "manhattan" | "cityblock" | "l1" => Ok(Metric::Manhattan),
            "chebyshev" | "infinity" => Ok(Metric::Chebyshev),
            "cosine" => Ok(Metric::Cosine),
            _ => Err(SpotDecodeError::UnknownMetric(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METRICS: [Metric; 4] = [Metric::Euclidean, Metric::Manhattan, Metric::Chebyshev, Metric::Cosine];

    #[test]
    fn norm_order_below_one_is_rejected() {
        assert!(matches!(NormOrder::new(0.5), Err(SpotDecodeError::InvalidNormOrder(_))));
        assert!(NormOrder::new(f64::NAN).is_err());
        assert!(NormOrder::new(1.0).is_ok());
        assert!(NormOrder::new(f64::INFINITY).is_ok());
    }

    #[test]
    fn normalization_yields_unit_norm() {
        for order in [1.0, 2.0, 3.0, f64::INFINITY] {
            let norm = NormOrder::new(order).unwrap();
            let (unit, magnitude) = norm.normalize(&[3.0, -4.0, 1.0]);
            assert!(magnitude > 0.0);
            let unit_f32: Vec<f32> = unit.iter().map(|v| *v as f32).collect();
            assert!((norm.norm(&unit_f32) - 1.0).abs() < 1e-6, "order {order}");
        }
    }

    #[test]
    fn zero_vector_normalizes_to_itself() {
        let (unit, magnitude) = NormOrder::default().normalize(&[0.0, 0.0, 0.0]);
        assert_eq!(magnitude, 0.0);
        assert_eq!(unit, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn distances_are_non_negative_and_symmetric() {
        let vectors = [
            vec![1.0, 0.0, 0.0],
            vec![0.6, 0.8, 0.0],
            vec![0.0, 0.0, 0.0],
            vec![-0.5, 0.5, 0.70710678],
        ];
        for metric in METRICS {
            for a in &vectors {
                for b in &vectors {
                    let ab = metric.distance(a, b);
                    let ba = metric.distance(b, a);
                    assert!(ab >= 0.0, "{metric} produced {ab}");
                    assert!((ab - ba).abs() < 1e-12, "{metric} is not symmetric");
                }
            }
        }
    }

    #[test]
    fn identical_unit_vectors_are_at_distance_zero() {
        let v = [0.6, 0.8];
        for metric in METRICS {
            assert!(metric.distance(&v, &v) < 1e-12);
        }
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!("euclidean".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert_eq!("cityblock".parse::<Metric>().unwrap(), Metric::Manhattan);
        assert_eq!("Cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert!(matches!("hamming".parse::<Metric>(), Err(SpotDecodeError::UnknownMetric(_))));
    }
}
