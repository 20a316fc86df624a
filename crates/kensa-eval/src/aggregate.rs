use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A reduction from per-case scores to one number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Mean,
    /// Population variance.
    Variance,
    /// 90th percentile, linear interpolation between closest ranks.
    P90,
    Min,
    Max,
    Median,
}

impl Aggregation {
    pub const DEFAULT: [Aggregation; 3] = [Aggregation::Mean, Aggregation::Variance, Aggregation::P90];

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Variance => "variance",
            Aggregation::P90 => "p90",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Median => "median",
        }
    }

    /// Apply to the scores of the successfully scored cases.
    pub fn apply(&self, scores: &[f64]) -> AggregateValue {
        if scores.is_empty() {
            return AggregateValue::Undefined;
        }
        let n = scores.len() as f64;
        let value = match self {
            Aggregation::Mean => scores.iter().sum::<f64>() / n,
            Aggregation::Variance => {
                let mean = scores.iter().sum::<f64>() / n;
                scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n
            }
            Aggregation::P90 => percentile(scores, 0.9),
            Aggregation::Median => percentile(scores, 0.5),
            Aggregation::Min => scores.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        AggregateValue::Value(value)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Aggregation::Mean),
            "variance" => Ok(Aggregation::Variance),
            "p90" => Ok(Aggregation::P90),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "median" => Ok(Aggregation::Median),
            other => Err(format!("unknown aggregation '{other}'")),
        }
    }
}

/// `rank = p * (n - 1)`, interpolating between the neighbouring order statistics.
fn percentile(scores: &[f64], p: f64) -> f64 {
    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Aggregate result; `Undefined` when no case was scored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateValue {
    Value(f64),
    Undefined,
}

impl AggregateValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            AggregateValue::Value(v) => Some(*v),
            AggregateValue::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, AggregateValue::Undefined)
    }
}

impl fmt::Display for AggregateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateValue::Value(v) => write!(f, "{v:.4}"),
            AggregateValue::Undefined => f.write_str("undefined"),
        }
    }
}

/// Compute each requested aggregation over `scores`.
pub fn compute(aggregations: &[Aggregation], scores: &[f64]) -> BTreeMap<Aggregation, AggregateValue> {
    aggregations.iter().map(|a| (*a, a.apply(scores))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(v: AggregateValue, expected: f64) {
        let got = v.value().unwrap();
        assert!((got - expected).abs() < 1e-9, "expected {expected}, got {got}");
    }

    #[test]
    fn default_aggregations_on_four_scores() {
        let out = compute(&Aggregation::DEFAULT, &[2.0, 3.0, 4.0, 5.0]);
        approx(out[&Aggregation::Mean], 3.5);
        approx(out[&Aggregation::Variance], 1.25);
        approx(out[&Aggregation::P90], 4.7);
    }

    #[test]
    fn order_independent() {
        let out = compute(&[Aggregation::P90, Aggregation::Median], &[5.0, 2.0, 4.0, 3.0]);
        approx(out[&Aggregation::P90], 4.7);
        approx(out[&Aggregation::Median], 3.5);
    }

    #[test]
    fn min_max() {
        let out = compute(&[Aggregation::Min, Aggregation::Max], &[1.5, -2.0, 7.25]);
        approx(out[&Aggregation::Min], -2.0);
        approx(out[&Aggregation::Max], 7.25);
    }

    #[test]
    fn single_score() {
        let out = compute(&Aggregation::DEFAULT, &[4.0]);
        approx(out[&Aggregation::Mean], 4.0);
        approx(out[&Aggregation::Variance], 0.0);
        approx(out[&Aggregation::P90], 4.0);
    }

    #[test]
    fn empty_is_undefined() {
        let out = compute(&Aggregation::DEFAULT, &[]);
        assert_eq!(out.len(), 3);
        assert!(out.values().all(AggregateValue::is_undefined));
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("P90".parse::<Aggregation>().unwrap(), Aggregation::P90);
        assert!("stddev".parse::<Aggregation>().is_err());
        assert_eq!(Aggregation::Variance.to_string(), "variance");
        assert_eq!(AggregateValue::Undefined.to_string(), "undefined");
        assert_eq!(AggregateValue::Value(3.5).to_string(), "3.5000");
    }

    #[test]
    fn serde_shapes() {
        assert_eq!(serde_json::to_string(&Aggregation::P90).unwrap(), "\"p90\"");
        assert_eq!(serde_json::to_string(&AggregateValue::Value(1.25)).unwrap(), "1.25");
        assert_eq!(serde_json::to_string(&AggregateValue::Undefined).unwrap(), "null");
        let back: AggregateValue = serde_json::from_str("null").unwrap();
        assert!(back.is_undefined());
    }
}
