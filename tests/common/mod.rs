// tests/common/mod.rs
#![allow(dead_code)]

use sandbox_engine::observability::TracingTelemetry;
use sandbox_engine::runtime::contract::EngineOp;
use sandbox_engine::utils::config::MicroImageConfig;
use sandbox_engine::{Dispatcher, EngineConfig, Engines, ResourceGovernor, SessionContext, TaskSpec, Workspace};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: EngineConfig,
    pub dispatcher: Dispatcher,
    pub session: SessionContext,
}

impl Harness {
    pub fn task(&self, op: EngineOp) -> TaskSpec {
        TaskSpec::engine(self.session.clone(), op)
    }
}

/// Test configuration rooted in a fresh temporary directory
pub fn config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workspace.base_dir = dir.path().join("workspaces");
    config.micro.root = dir.path().join("vms");
    config.micro.pool_capacity = 2;
    config.micro.images = vec![MicroImageConfig {
        name: "sh".into(),
        command: "sh".into(),
        args: vec![],
        extension: "sh".into(),
        env: HashMap::new(),
    }];
    config.quotas.max_concurrent = 32;
    config.dispatcher.watchdog_grace_ms = 300;
    config
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    let governor = Arc::new(ResourceGovernor::new(config.quotas.clone()));
    let engines = Engines::from_config(&config, Arc::clone(&governor)).unwrap();
    let dispatcher = Dispatcher::new(
        config.dispatcher.clone(),
        engines,
        governor,
        Arc::new(TracingTelemetry),
    );
    let workspace = Workspace::open(config.workspace.base_dir.join("demo").join("main")).unwrap();
    let session = SessionContext::new("tester", "demo/main", workspace);

    Harness {
        dir,
        config,
        dispatcher,
        session,
    }
}
