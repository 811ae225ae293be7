use anyhow::{ensure, Result};
use proptest::prelude::*;
use stepport_core::{IOName, Shape, Tensor, WeightStore};
use stepport_numerics::{compare, relative_error, NumericsError, NumericsReport};

fn t(values: &[f32]) -> Tensor {
    Tensor::from_f32(Shape::from_slice(&[values.len()]), values)
}

fn store(entries: &[(&str, &[f32])]) -> WeightStore {
    entries
        .iter()
        .map(|(name, values)| (IOName::from(*name), t(values)))
        .collect()
}

fn non_zero() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-1e3f64..1e3, 1..32)
        .prop_filter("needs a non-zero element", |v| v.iter().any(|x| x.abs() > 1e-3))
}

proptest! {
    #[test]
    fn identical_arrays_have_no_error(a in non_zero()) {
        prop_assert_eq!(relative_error(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn error_is_symmetric(
        (a, b) in (1usize..32).prop_flat_map(|n| (
            prop::collection::vec(-1e3f64..1e3, n),
            prop::collection::vec(-1e3f64..1e3, n),
        ))
    ) {
        prop_assert_eq!(relative_error(&a, &b).unwrap(), relative_error(&b, &a).unwrap());
    }

    #[test]
    fn doubling_is_detected(a in non_zero()) {
        let doubled: Vec<f64> = a.iter().map(|x| x * 2.0).collect();
        prop_assert!(relative_error(&a, &doubled).unwrap() > 0.0);
    }
}

#[test]
fn compare_matches_by_name_and_skips_the_rest() -> Result<()> {
    let a = store(&[("w", &[1.0, 2.0]), ("only_a", &[1.0])]);
    let b = store(&[("w", &[1.0, 2.0]), ("only_b", &[5.0])]);

    let cmp = compare(a.iter(), b.iter(), 1e-6)?;
    ensure!(cmp.len() == 1);
    ensure!(cmp.get(&IOName::from("w")) == Some(0.0));
    Ok(())
}

#[test]
fn compare_names_the_first_offender() {
    let a = store(&[("a", &[1.0, 2.0]), ("b", &[1.0, 2.0]), ("c", &[1.0, 2.0])]);
    let b = store(&[("a", &[1.0, 2.0]), ("b", &[1.0, 3.0]), ("c", &[9.0, 9.0])]);

    match compare(a.iter(), b.iter(), 1e-3) {
        Err(NumericsError::ToleranceExceeded { name, error, .. }) => {
            assert_eq!(name.as_str(), "b");
            assert!(error > 1e-3);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn compare_reports_nan_before_tolerance() {
    let a = store(&[("a", &[1.0]), ("z", &[f32::INFINITY])]);
    let b = store(&[("a", &[100.0]), ("z", &[f32::INFINITY])]);
    let err = compare(a.iter(), b.iter(), 1e-3).unwrap_err();
    assert!(
        matches!(&err, NumericsError::NaNResult { name: Some(n) } if n.as_str() == "z"),
        "{err}"
    );
}

#[test]
fn compare_accepts_anchor_snapshots() -> Result<()> {
    let run_a = vec![(IOName::from("loss"), t(&[0.25]))];
    let run_b = vec![(IOName::from("loss"), t(&[0.25]))];
    let cmp = compare(
        run_a.iter().map(|(n, t)| (n, t)),
        run_b.iter().map(|(n, t)| (n, t)),
        0.0,
    )?;
    ensure!(cmp.worst().map(|(_, e)| e) == Some(0.0));
    Ok(())
}

#[test]
fn report_compares_updates_not_values() -> Result<()> {
    let a0 = store(&[("w", &[1.0, 1.0]), ("extra", &[0.0])]);
    let a1 = store(&[("w", &[0.5, 1.5])]);
    // Run B starts elsewhere but moves the same way.
    let b0 = store(&[("w", &[10.0, 10.0])]);
    let b1 = store(&[("w", &[9.5, 10.5])]);

    let report = NumericsReport::from_weights(&a0, &a1, &b0, &b1)?;
    ensure!(report.len() == 1, "`extra` is not in every model");
    ensure!(report.total() == 0.0, "{}", report.full_report());
    report.assert_within(0.0)?;

    let drifted = store(&[("w", &[9.0, 11.0])]);
    let report = NumericsReport::from_weights(&a0, &a1, &b0, &drifted)?;
    ensure!(report.total() > 0.0);
    ensure!(report.full_report().starts_with("w : "));
    ensure!(report.assert_within(1e-6).is_err());
    Ok(())
}

#[test]
fn report_rejects_unreadable_models() {
    let err = NumericsReport::from_models(b"nope", b"nope", b"nope", b"nope").unwrap_err();
    assert!(matches!(err, NumericsError::Model(_)));
}
