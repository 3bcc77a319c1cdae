//! The shipped model file, loaded and run end to end with simulated drivers.

use rust_scope::prelude::*;
use serial_test::serial;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

fn model_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("models/widefield.yaml")
}

#[test]
#[serial]
fn widefield_model_loads() {
    let model = ModelConfig::load_from(model_path()).unwrap();
    assert_eq!(model.engine.max_workers, 4);
    assert_eq!(model.engine.retry.max_attempts, 2);
    assert_eq!(model.components.len(), 9);

    let graph = ComponentGraph::build(model.components).unwrap();
    let order = graph.init_order();
    let position = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(position("Stage X") < position("Sample Stage"));
    assert!(position("Stage Y") < position("Sample Stage"));
    assert!(position("Focus Piezo") < position("Focus"));

    let lights = graph.affected_by_role("Camera", &Role::new(Role::LIGHT));
    assert_eq!(lights, BTreeSet::from(["Light Engine"]));
}

#[tokio::test]
#[serial]
async fn widefield_model_runs() {
    let model = ModelConfig::load_from(model_path()).unwrap();
    let system = MicroscopeSystem::from_config(model, DriverCatalog::with_simulated()).unwrap();
    let report = system.start().await.unwrap();
    assert!(report.is_complete(), "failed: {:?}", report.failed);

    let stage = system.lookup_by_role(Role::STAGE);
    assert_eq!(stage.len(), 1);
    let stage = &stage[0];
    stage
        .move_many(&BTreeMap::from([("x".to_string(), 0.01), ("y".to_string(), -0.01)]))
        .await
        .unwrap();
    assert_eq!(stage.position("x").await.unwrap(), 0.01);
    // x is inverted on the physical stage
    let stage_x = system.lookup_by_name("Stage X").unwrap();
    assert_eq!(stage_x.position("x").await.unwrap(), -0.01);

    let camera = system.lookup_by_name("Camera").unwrap();
    assert_eq!(camera.resolution().unwrap(), (512, 512));
    // binning 2 from the property overrides
    assert_eq!(camera.acquire().await.unwrap().len(), 256 * 256);

    let light = &system.registry().lookup_by_capability(Capability::LightEmitter)[0];
    light.set_power(0.1).await.unwrap();

    let shutdown = system.stop().await;
    assert!(shutdown.is_clean());
    assert_eq!(shutdown.stopped.len(), 9);
}

#[test]
#[serial]
fn env_overrides_model_file() {
    std::env::set_var("RUSTSCOPE_ENGINE__MAX_WORKERS", "1");
    let model = ModelConfig::load_from(model_path());
    std::env::remove_var("RUSTSCOPE_ENGINE__MAX_WORKERS");
    assert_eq!(model.unwrap().engine.max_workers, 1);
}
