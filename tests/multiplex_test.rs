//! Multiplexed actuators brought up by the orchestrator.

mod common;

use common::*;
use rust_scope::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

fn align(init: serde_json::Value) -> Vec<ComponentRecord> {
    vec![
        leaf("ChildA", Role::ACTUATOR).with_init(json!({ "axes": ["x"] })),
        leaf("ChildB", Role::ACTUATOR).with_init(json!({ "axes": ["y"], "fail_moves": ["y"] })),
        composite("Align", Role::ALIGN, &[("a", "ChildA"), ("b", "ChildB")]).with_init(init),
    ]
}

fn inverted_x() -> serde_json::Value {
    json!({
        "axes_map": {
            "X": { "child": "a", "axis": "x" },
            "Y": { "child": "b", "axis": "y" }
        },
        "inverted": ["X"]
    })
}

#[tokio::test]
async fn inverted_axis_translates_sign() {
    let recorder = Recorder::new();
    let mut records = align(inverted_x());
    // no failing moves for this one
    records[1] = leaf("ChildB", Role::ACTUATOR).with_init(json!({ "axes": ["y"] }));
    let system = system(records, &recorder, 2);
    system.start().await.unwrap();

    let align = system.lookup_by_name("Align").unwrap();
    assert_eq!(
        align.axes().unwrap(),
        BTreeSet::from(["X".to_string(), "Y".to_string()])
    );
    align.move_axis("X", 5.0).await.unwrap();
    align.move_axis("Y", 5.0).await.unwrap();

    assert_eq!(
        recorder.moves(),
        vec![
            ("ChildA".to_string(), "x".to_string(), -5.0),
            ("ChildB".to_string(), "y".to_string(), 5.0),
        ]
    );
    assert_eq!(align.position("X").await.unwrap(), 5.0);
    system.stop().await;
}

#[tokio::test]
async fn partial_move_lists_completed_axes() {
    let recorder = Recorder::new();
    let system = system(align(inverted_x()), &recorder, 2);
    system.start().await.unwrap();

    let align = system.lookup_by_name("Align").unwrap();
    let targets = BTreeMap::from([("X".to_string(), 1.0), ("Y".to_string(), 2.0)]);
    match align.move_many(&targets).await {
        Err(ModelError::PartialMoveFailure {
            composite,
            completed,
            failed,
        }) => {
            assert_eq!(composite, "Align");
            assert_eq!(completed, BTreeSet::from(["X".to_string()]));
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, "Y");
            assert!(failed[0].1.message().contains("stalled"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // both children were called
    assert_eq!(recorder.moves().len(), 2);
    system.stop().await;
}

#[tokio::test]
async fn unknown_logical_axis_issues_no_call() {
    let recorder = Recorder::new();
    let system = system(align(inverted_x()), &recorder, 2);
    system.start().await.unwrap();

    let align = system.lookup_by_name("Align").unwrap();
    let targets = BTreeMap::from([("X".to_string(), 1.0), ("Z".to_string(), 2.0)]);
    assert!(align.move_many(&targets).await.is_err());
    assert!(recorder.moves().is_empty());
    system.stop().await;
}

#[tokio::test]
async fn missing_physical_axis_fails_composite_only() {
    let recorder = Recorder::new();
    let init = json!({
        "axes_map": {
            "X": { "child": "a", "axis": "x" },
            "Y": { "child": "b", "axis": "theta" }
        }
    });
    let system = system(align(init), &recorder, 2);
    let report = system.start().await.unwrap();

    let live: BTreeSet<String> = report.live.iter().cloned().collect();
    assert_eq!(live, BTreeSet::from(["ChildA".to_string(), "ChildB".to_string()]));
    assert_eq!(
        report.failure_of("Align"),
        Some(&ModelError::AxisResolution {
            composite: "Align".into(),
            axis: "Y".into(),
            child: "ChildB".into(),
            missing: "theta".into(),
        })
    );
    assert!(system.lookup_by_role(Role::ALIGN).is_empty());
    assert_eq!(system.lookup_by_role(Role::ACTUATOR).len(), 2);
    system.stop().await;
}

#[tokio::test]
async fn per_axis_properties_reach_children() {
    let recorder = Recorder::new();
    let mut records = align(inverted_x());
    records[2] = records[2]
        .clone()
        .with_property("speed", json!({ "X": 0.5, "Y": 0.25 }))
        .with_property("enabled", json!(true));
    let system = system(records, &recorder, 2);
    system.start().await.unwrap();

    let properties: Vec<(String, String, serde_json::Value)> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Property {
                component,
                name,
                value,
            } => Some((component, name, value)),
            _ => None,
        })
        .collect();
    assert_eq!(
        properties,
        vec![
            ("ChildA".to_string(), "enabled".to_string(), json!(true)),
            ("ChildB".to_string(), "enabled".to_string(), json!(true)),
            ("ChildA".to_string(), "speed".to_string(), json!({ "x": 0.5 })),
            ("ChildB".to_string(), "speed".to_string(), json!({ "y": 0.25 })),
        ]
    );
    system.stop().await;
}

#[tokio::test]
async fn composite_stops_after_child_shutdown() {
    let recorder = Recorder::new();
    let system = system(align(inverted_x()), &recorder, 2);
    system.start().await.unwrap();
    let align = system.lookup_by_name("Align").unwrap();

    let cause = ModelError::driver("ChildA", DriverError::new("encoder lost"));
    system.mark_failed("ChildA", &cause).await.unwrap();

    assert!(align.move_axis("X", 1.0).await.is_err());
    assert!(recorder.moves().is_empty());
    drop(align);
    system.stop().await;
}
