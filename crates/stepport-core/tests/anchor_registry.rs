use std::collections::BTreeMap;

use proptest::prelude::*;
use stepport_core::{
    derive_shape, AnchorRegistry, DeviceTarget, Error, IOName, ReductionPolicy, Shape, TensorInfo,
};

fn graph_outputs() -> BTreeMap<IOName, TensorInfo> {
    [
        (IOName::from("out"), TensorInfo::f32(&[2, 4])),
        (IOName::from("loss"), TensorInfo::f32(&[])),
        (IOName::from("w0"), TensorInfo::f32(&[4, 4])),
    ]
    .into_iter()
    .collect()
}

#[test]
fn register_rejects_duplicates() {
    let mut reg = AnchorRegistry::new(graph_outputs());
    reg.register("out", ReductionPolicy::Final).unwrap();
    let err = reg.register("out", ReductionPolicy::All).unwrap_err();
    assert!(matches!(err, Error::DuplicateAnchor(_)));
    assert!(err.is_configuration());
    assert_eq!(reg.len(), 1);
}

#[test]
fn register_rejects_tensors_the_graph_does_not_produce() {
    let mut reg = AnchorRegistry::new(graph_outputs());
    let err = reg.register("nope", ReductionPolicy::All).unwrap_err();
    assert!(matches!(err, Error::UnknownTensor { hint: None, .. }));
}

#[test]
fn unknown_gradient_anchor_carries_a_hint() {
    let mut reg = AnchorRegistry::new(graph_outputs());
    let err = reg.register("d__out", ReductionPolicy::All).unwrap_err();
    let Error::UnknownTensor { hint, .. } = &err else {
        panic!("unexpected error {err}");
    };
    assert!(hint.as_deref().unwrap().contains("`out` exists"));
    assert!(err.to_string().contains("no gradient"));
}

#[test]
fn layouts_follow_registration_order() {
    let mut reg = AnchorRegistry::new(graph_outputs());
    reg.register("loss", ReductionPolicy::All).unwrap();
    reg.register("out", ReductionPolicy::Sum).unwrap();
    reg.register("w0", ReductionPolicy::Final).unwrap();

    let layouts = reg.layouts(2).unwrap();
    let names: Vec<_> = layouts.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, ["loss", "out", "w0"]);
    assert_eq!(layouts[0].buffer, TensorInfo::f32(&[2]));
    assert_eq!(layouts[1].buffer, TensorInfo::f32(&[1, 4]));
    assert_eq!(layouts[2].buffer, TensorInfo::f32(&[4, 4]));

    assert!(reg.layouts(3).is_err(), "SUM anchor with leading dim 2 over 3 micro-batches");
}

#[test]
fn device_targets_parse() {
    assert_eq!("cpu".parse::<DeviceTarget>().unwrap(), DeviceTarget::Cpu);
    assert_eq!(
        "sim:4".parse::<DeviceTarget>().unwrap(),
        DeviceTarget::Simulated { partitions: 4 }
    );
    assert_eq!(
        "hw:1".parse::<DeviceTarget>().unwrap(),
        DeviceTarget::Accelerator { index: 1 }
    );
    assert!("sim:0".parse::<DeviceTarget>().is_err());
    assert!("cuda:0".parse::<DeviceTarget>().is_err());
}

fn policy() -> impl Strategy<Value = ReductionPolicy> {
    prop_oneof![
        Just(ReductionPolicy::All),
        Just(ReductionPolicy::Sum),
        Just(ReductionPolicy::Final),
    ]
}

proptest! {
    #[test]
    fn derive_shape_is_deterministic(
        dims in proptest::collection::vec(1usize..16, 0..5),
        policy in policy(),
        k in 1usize..8,
    ) {
        let base = Shape::from_slice(&dims);
        let first = derive_shape(&base, policy, k).map_err(|e| e.to_string());
        let second = derive_shape(&base, policy, k).map_err(|e| e.to_string());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn all_scales_leading_dim(
        lead in 1usize..32,
        rest in proptest::collection::vec(1usize..8, 0..3),
        k in 1usize..8,
    ) {
        let mut dims = vec![lead];
        dims.extend(&rest);
        let out = derive_shape(&Shape::from_slice(&dims), ReductionPolicy::All, k).unwrap();
        prop_assert_eq!(out.dims()[0], lead * k);
        prop_assert_eq!(&out.dims()[1..], &rest[..]);
    }

    #[test]
    fn final_is_identity_for_any_k(
        dims in proptest::collection::vec(0usize..16, 0..5),
        k in 1usize..64,
    ) {
        let base = Shape::from_slice(&dims);
        prop_assert_eq!(derive_shape(&base, ReductionPolicy::Final, k).unwrap(), base);
    }
}
