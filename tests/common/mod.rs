//! Shared fixtures: a recording driver and helpers to build systems around it.
//!
//! `test.Recording` init payload:
//!
//! ```text
//! axes:            [x, y]        exposed axes (default [x])
//! fail:            "message"     construction fails
//! fail_moves:      [y]           moves on these axes fail
//! build_ms:        20            blocking construction delay
//! shutdown_error:  "message"     shutdown reports an error
//! shutdown_hang:   true          shutdown never returns
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use rust_scope::prelude::*;
use rust_scope::driver::builder;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RECORDING: &str = "test.Recording";

/// Something a recording driver was asked to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Construct(String),
    Property {
        component: String,
        name: String,
        value: Value,
    },
    Move {
        component: String,
        axis: String,
        target: f64,
    },
    Shutdown(String),
}

/// Shared log of every driver call, plus construction concurrency tracking.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn constructions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Construct(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn constructed(&self, name: &str) -> usize {
        self.constructions().iter().filter(|n| *n == name).count()
    }

    pub fn moves(&self) -> Vec<(String, String, f64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Move {
                    component,
                    axis,
                    target,
                } => Some((component, axis, target)),
                _ => None,
            })
            .collect()
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Shutdown(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn max_concurrent_constructions(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecordingInit {
    #[serde(default)]
    axes: Option<Vec<String>>,
    #[serde(default)]
    fail: Option<String>,
    #[serde(default)]
    fail_moves: Vec<String>,
    #[serde(default)]
    build_ms: u64,
    #[serde(default)]
    shutdown_error: Option<String>,
    #[serde(default)]
    shutdown_hang: bool,
}

pub struct RecordingDriver {
    name: String,
    axes: BTreeSet<String>,
    fail_moves: BTreeSet<String>,
    shutdown_error: Option<String>,
    shutdown_hang: bool,
    positions: Mutex<BTreeMap<String, f64>>,
    recorder: Arc<Recorder>,
}

impl RecordingDriver {
    pub fn construct(record: &ComponentRecord, recorder: Arc<Recorder>) -> Result<Self, DriverError> {
        let init: RecordingInit = serde_json::from_value(record.init.clone())
            .map_err(|err| DriverError::new(err.to_string()))?;

        let now = recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        recorder.max_active.fetch_max(now, Ordering::SeqCst);
        if init.build_ms > 0 {
            std::thread::sleep(Duration::from_millis(init.build_ms));
        }
        recorder.active.fetch_sub(1, Ordering::SeqCst);
        recorder.push(Event::Construct(record.name.clone()));

        if let Some(message) = init.fail {
            return Err(DriverError::new(message));
        }
        let axes: BTreeSet<String> = init
            .axes
            .unwrap_or_else(|| vec!["x".to_string()])
            .into_iter()
            .collect();
        Ok(Self {
            name: record.name.clone(),
            positions: Mutex::new(axes.iter().map(|a| (a.clone(), 0.0)).collect()),
            axes,
            fail_moves: init.fail_moves.into_iter().collect(),
            shutdown_error: init.shutdown_error,
            shutdown_hang: init.shutdown_hang,
            recorder,
        })
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    async fn apply_property(&self, name: &str, value: &Value) -> Result<(), DriverError> {
        self.recorder.push(Event::Property {
            component: self.name.clone(),
            name: name.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.recorder.push(Event::Shutdown(self.name.clone()));
        if self.shutdown_hang {
            std::future::pending::<()>().await;
        }
        match &self.shutdown_error {
            Some(message) => Err(DriverError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn as_movable(&self) -> Option<&dyn MovableAxes> {
        Some(self)
    }
}

#[async_trait]
impl MovableAxes for RecordingDriver {
    fn axes(&self) -> BTreeSet<String> {
        self.axes.clone()
    }

    async fn move_axis(&self, axis: &str, target: f64) -> Result<(), DriverError> {
        self.recorder.push(Event::Move {
            component: self.name.clone(),
            axis: axis.to_string(),
            target,
        });
        if self.fail_moves.contains(axis) {
            return Err(DriverError::new(format!("axis {} stalled", axis)));
        }
        self.positions
            .lock()
            .unwrap()
            .insert(axis.to_string(), target);
        Ok(())
    }

    async fn position(&self, axis: &str) -> Result<f64, DriverError> {
        self.positions
            .lock()
            .unwrap()
            .get(axis)
            .copied()
            .ok_or_else(|| DriverError::new(format!("unknown axis {}", axis)))
    }
}

/// Simulated catalog plus `test.Recording` wired to `recorder`.
pub fn catalog(recorder: &Arc<Recorder>) -> DriverCatalog {
    let mut catalog = DriverCatalog::with_simulated();
    let recorder = Arc::clone(recorder);
    catalog.register_factory(
        RECORDING,
        builder(move |record: &ComponentRecord| {
            RecordingDriver::construct(record, Arc::clone(&recorder))
        }),
    );
    catalog
}

pub fn leaf(name: &str, role: &str) -> ComponentRecord {
    ComponentRecord::new(name, RECORDING, role)
}

pub fn composite(name: &str, role: &str, children: &[(&str, &str)]) -> ComponentRecord {
    children
        .iter()
        .fold(ComponentRecord::new(name, MULTIPLEX_CLASS, role), |record, (label, child)| {
            record.with_child(*label, *child)
        })
}

pub fn engine(max_workers: usize) -> EngineConfig {
    EngineConfig {
        max_workers,
        shutdown_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

pub fn system(records: Vec<ComponentRecord>, recorder: &Arc<Recorder>, max_workers: usize) -> MicroscopeSystem {
    MicroscopeSystem::new(records, catalog(recorder), engine(max_workers)).unwrap()
}

/// Sequence number of `name`'s first transition into `state`.
pub fn seq(system: &MicroscopeSystem, name: &str, state: ComponentState) -> Option<u64> {
    system.orchestrator().states().seq_of(name, state)
}

pub fn settled_seq(system: &MicroscopeSystem, name: &str) -> u64 {
    seq(system, name, ComponentState::Live)
        .or_else(|| seq(system, name, ComponentState::Failed))
        .unwrap_or_else(|| panic!("{name} never settled"))
}

pub fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

