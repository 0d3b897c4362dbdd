//! Test harness for end-to-end engine and pillar tests.
//!
//! Builds an [`Engine`] over fixture files written into a temp dir and
//! dispatches pillar verbs directly (no subprocess, no transport).

use scopegraph::config::{EngineConfig, EngineMode};
use scopegraph::engine::Engine;
use scopegraph::pillars::Pillar;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub pillar: Pillar,
    pub workspace: TempDir,
}

impl TestHarness {
    /// Create a harness over the given (relative path, content) files.
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self::with_config(files, |_| {})
    }

    /// Same, with a config tweak before the engine opens.
    pub fn with_config(files: &[(&str, &str)], tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let workspace = TempDir::new().expect("workspace temp dir");
        for (rel, content) in files {
            let path = workspace.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).expect("fixture dirs");
            std::fs::write(path, content).expect("fixture file");
        }

        // Leaked on purpose: parallel tests share the env var, so the dir
        // must outlive every engine that may have picked it up.
        let storage = Box::leak(Box::new(TempDir::new().expect("storage temp dir")));
        std::env::set_var("SCOPEGRAPH_STORAGE", storage.path());

        let mut config = EngineConfig::default();
        config.mode = EngineMode::Test;
        config.vector.eager_doc_embedding = true;
        tweak(&mut config);

        let engine = Engine::open(workspace.path(), config).expect("engine opens");
        engine.index_workspace().expect("initial index");

        TestHarness { engine, pillar: Pillar::new(), workspace }
    }

    /// Write (or overwrite) a workspace file and re-index it.
    pub fn write_file(&self, rel: &str, content: &str) {
        let path = self.workspace.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).expect("fixture dirs");
        std::fs::write(path, content).expect("fixture write");
        self.engine.reindex_file(rel).expect("reindex");
    }

    /// Dispatch one pillar verb.
    pub fn call(&self, verb: &str, args: Value) -> Value {
        self.pillar.handle(&self.engine, verb, &args)
    }

    /// Dispatch and assert the envelope reports success.
    pub fn call_ok(&self, verb: &str, args: Value) -> Value {
        let response = self.call(verb, args);
        assert_eq!(
            response["success"],
            Value::Bool(true),
            "pillar '{verb}' failed: {response}"
        );
        response
    }
}
