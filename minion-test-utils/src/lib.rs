//! Shared test fixtures: temp datastores seeded with agents and plans.

use minion_core::{AgentClass, AgentName, RuntimeDefaults, Transport};
use minion_flow::FlowSet;
use minion_store::{Store, WorkPaths};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A datastore rooted in a temp directory. Dropping it cleans everything up.
pub struct TestStore {
    pub dir: TempDir,
    pub store: Store,
}

impl TestStore {
    pub fn new() -> TestStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store_at(dir.path());
        TestStore { dir, store }
    }

    /// A second independent handle on the same datastore, as another
    /// process (or thread) would hold.
    pub fn reopen(&self) -> Store {
        open_store_at(self.dir.path())
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Register an agent with the given class.
    pub fn agent(&mut self, name: &str, class: AgentClass) -> AgentName {
        let agent = AgentName::from(name);
        self.store
            .register(&agent, class, None, Transport::Terminal, None)
            .expect("register");
        agent
    }

    /// Register a lead and set an active plan, unlocking sends and task
    /// creation.
    pub fn lead_with_plan(&mut self, name: &str) -> AgentName {
        let lead = self.agent(name, AgentClass::Lead);
        self.store.set_plan(&lead, "test battle plan").expect("set plan");
        lead
    }

    /// Refresh an agent's context so sends pass the staleness gate.
    pub fn fresh_context(&mut self, agent: &AgentName) {
        self.store
            .set_context(
                agent,
                &minion_store::ContextUpdate {
                    context: "fixture context".to_string(),
                    ..Default::default()
                },
            )
            .expect("set context");
    }

    /// Write a task spec file and return its path.
    pub fn spec_file(&self, slug: &str) -> PathBuf {
        let path = self.dir.path().join("tasks").join(format!("{}.md", slug));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("# task {}\n", slug)).unwrap();
        path
    }

    /// Write a result file and return its path.
    pub fn result_file(&self, slug: &str) -> PathBuf {
        let path = self.dir.path().join("results").join(format!("{}.md", slug));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("# result {}\n", slug)).unwrap();
        path
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a store handle rooted at `dir`, with built-in flows and default
/// numerics.
pub fn open_store_at(dir: &Path) -> Store {
    let paths = WorkPaths::from_db_path(dir.join("minion.db"));
    Store::open(paths, FlowSet::builtin(), RuntimeDefaults::default()).expect("open store")
}
