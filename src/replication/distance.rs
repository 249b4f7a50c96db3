//! Structural distance between replica outputs, each in `[0, 1]`.

use serde_json::Value;

use super::evidence::Replicate;
use super::schema::FieldSpec;

/// Distance between two values of one field.
///
/// Numbers use relative difference clamped to 1; everything else is 0 when
/// equal and 1 otherwise. A field present on only one side is maximally
/// distant.
pub fn field_distance(a: Option<&Value>, b: Option<&Value>) -> f64 {
    match (a, b) {
        (None, None) => 0.0,
        (None, Some(_)) | (Some(_), None) => 1.0,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => relative_difference(x, y),
            _ if a == b => 0.0,
            _ => 1.0,
        },
    }
}

fn relative_difference(x: f64, y: f64) -> f64 {
    let scale = x.abs().max(y.abs());
    if scale == 0.0 {
        return 0.0;
    }
    ((x - y).abs() / scale).min(1.0)
}

/// Mean field distance over the declared fields. With no declared fields,
/// whole outputs are compared for equality.
pub fn replica_distance(a: &Value, b: &Value, fields: &[FieldSpec]) -> f64 {
    if fields.is_empty() {
        return if a == b { 0.0 } else { 1.0 };
    }

    let total: f64 = fields
        .iter()
        .map(|field| field_distance(field.extract(a), field.extract(b)))
        .sum();
    total / fields.len() as f64
}

/// Distance between two replicates; an invalid replicate is maximally
/// distant from every other replicate
pub fn replicate_distance(a: &Replicate, b: &Replicate, fields: &[FieldSpec]) -> f64 {
    if !a.quality.valid || !b.quality.valid {
        return 1.0;
    }
    replica_distance(&a.data, &b.data, fields)
}

/// Full pairwise matrix; symmetric with a zero diagonal
pub fn pairwise_matrix(replicates: &[Replicate], fields: &[FieldSpec]) -> Vec<Vec<f64>> {
    let n = replicates.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let distance = replicate_distance(&replicates[i], &replicates[j], fields);
            matrix[i][j] = distance;
            matrix[j][i] = distance;
        }
    }
    matrix
}

/// Mean of the off-diagonal entries; 0 with fewer than two replicates
pub fn mean_pairwise_distance(matrix: &[Vec<f64>]) -> f64 {
    let n = matrix.len();
    if n < 2 {
        return 0.0;
    }

    let mut total = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            total += matrix[i][j];
        }
    }
    total / (n * (n - 1) / 2) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::schema::FieldKind;
    use serde_json::json;

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::required("label", FieldKind::String),
            FieldSpec::required("score", FieldKind::Number),
        ]
    }

    #[test]
    fn test_numeric_distance_is_relative() {
        assert_eq!(field_distance(Some(&json!(0)), Some(&json!(0.0))), 0.0);
        let d = field_distance(Some(&json!(100)), Some(&json!(90)));
        assert!((d - 0.1).abs() < 1e-12);
        assert_eq!(field_distance(Some(&json!(-5)), Some(&json!(5))), 1.0);
    }

    #[test]
    fn test_non_numeric_distance_is_equality() {
        assert_eq!(field_distance(Some(&json!("a")), Some(&json!("a"))), 0.0);
        assert_eq!(field_distance(Some(&json!("a")), Some(&json!("b"))), 1.0);
        assert_eq!(field_distance(Some(&json!("1")), Some(&json!(1))), 1.0);
        assert_eq!(field_distance(None, Some(&json!(1))), 1.0);
        assert_eq!(field_distance(None, None), 0.0);
    }

    #[test]
    fn test_replica_distance_averages_declared_fields() {
        let a = json!({"label": "cat", "score": 1.0, "ignored": 1});
        let b = json!({"label": "dog", "score": 1.0, "ignored": 2});
        assert_eq!(replica_distance(&a, &b, &fields()), 0.5);
        assert_eq!(replica_distance(&a, &a, &[]), 0.0);
        assert_eq!(replica_distance(&a, &b, &[]), 1.0);
    }

    #[test]
    fn test_matrix_shape_and_mean() {
        let replicates = vec![
            Replicate::valid("r1", json!({"label": "cat", "score": 1.0})),
            Replicate::valid("r2", json!({"label": "cat", "score": 1.0})),
            Replicate::invalid("r3", json!(null), vec!["boom".to_string()]),
        ];
        let matrix = pairwise_matrix(&replicates, &fields());
        assert_eq!(matrix[0][1], 0.0);
        assert_eq!(matrix[0][2], 1.0);
        assert_eq!(matrix[2][1], 1.0);
        for i in 0..3 {
            assert_eq!(matrix[i][i], 0.0);
        }
        assert!((mean_pairwise_distance(&matrix) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(mean_pairwise_distance(&matrix[..0]), 0.0);
    }
}
