//! Scripted stand-in for the `vagrant` CLI.
//!
//! Each verb answers from a queue of scripted replies, falling back to a
//! per-verb default (exit 0, no output). Every call is recorded with the
//! environment it received so tests can check what reached the tool.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vagrant_sandbox::driver::{Invocation, ProcessResult, VagrantDriver};
use vagrant_sandbox::error::DriverError;
use vagrant_sandbox::{ManagerConfig, SandboxConfig, SandboxManager};

pub const SINGLE_MACHINE: &str = r#"
Vagrant.configure("2") do |config|
  config.vm.box = "generic/alpine318"
end
"#;

pub const MULTI_MACHINE: &str = r#"
Vagrant.configure("2") do |config|
  config.vm.box = "generic/alpine318"
  config.vm.define "attacker" do |a|
    a.vm.hostname = "attacker"
  end
  config.vm.define "victim" do |v|
    v.vm.hostname = "victim"
  end
end
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Up,
    Ssh,
    Upload,
    Destroy,
    Status,
    GlobalStatus,
}

impl Verb {
    fn name(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Ssh => "ssh",
            Self::Upload => "upload",
            Self::Destroy => "destroy",
            Self::Status => "status",
            Self::GlobalStatus => "global-status",
        }
    }
}

/// What a scripted call returns.
#[derive(Debug, Clone)]
pub struct Reply {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    delay: Duration,
    spawn_error: bool,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            delay: Duration::ZERO,
            spawn_error: false,
        }
    }

    pub fn exit(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: code,
            stderr: stderr.as_bytes().to_vec(),
            ..Self::ok()
        }
    }

    pub fn spawn_error() -> Self {
        Self {
            spawn_error: true,
            ..Self::ok()
        }
    }

    pub fn stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Takes `delay` to answer. A delay past the invocation's timeout yields
    /// `DriverError::Timeout`.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub verb: Verb,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub machine: Option<String>,
    pub command: Option<String>,
    pub input: Option<Vec<u8>>,
    pub destination: Option<String>,
    /// Contents of the staged file at upload time.
    pub uploaded: Option<Vec<u8>>,
}

impl Call {
    fn new(verb: Verb, inv: Invocation<'_>) -> Self {
        Self {
            verb,
            working_dir: inv.working_dir.to_path_buf(),
            env: inv.env.clone(),
            timeout: inv.timeout,
            machine: None,
            command: None,
            input: None,
            destination: None,
            uploaded: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeDriver {
    queued: Mutex<HashMap<Verb, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<Verb, Reply>>,
    calls: Mutex<Vec<Call>>,
    ups_in_flight: AtomicUsize,
    peak_ups: AtomicUsize,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a reply for the next call to `verb`.
    pub fn push(&self, verb: Verb, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(verb)
            .or_default()
            .push_back(reply);
    }

    /// Reply used once the queue for `verb` is empty.
    pub fn set_default(&self, verb: Verb, reply: Reply) {
        self.defaults.lock().unwrap().insert(verb, reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, verb: Verb) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.verb == verb).collect()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.calls_to(verb).len()
    }

    pub fn peak_concurrent_ups(&self) -> usize {
        self.peak_ups.load(Ordering::SeqCst)
    }

    fn next_reply(&self, verb: Verb) -> Reply {
        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&verb)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&verb)
            .cloned()
            .unwrap_or_else(Reply::ok)
    }

    async fn respond(&self, call: Call) -> Result<ProcessResult, DriverError> {
        let verb = call.verb;
        let timeout = call.timeout;
        self.calls.lock().unwrap().push(call);
        let reply = self.next_reply(verb);

        if reply.spawn_error {
            return Err(DriverError::Spawn {
                program: "vagrant".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted"),
            });
        }
        if let Some(timeout) = timeout.filter(|t| reply.delay > *t) {
            tokio::time::sleep(timeout).await;
            return Err(DriverError::Timeout {
                operation: verb.name(),
                timeout,
            });
        }
        tokio::time::sleep(reply.delay).await;

        Ok(ProcessResult {
            exit_code: reply.exit_code,
            stdout: reply.stdout,
            stderr: reply.stderr,
            duration: reply.delay,
        })
    }
}

struct UpCounter<'a>(&'a FakeDriver);

impl Drop for UpCounter<'_> {
    fn drop(&mut self) {
        self.0.ups_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VagrantDriver for FakeDriver {
    async fn up(&self, inv: Invocation<'_>) -> Result<ProcessResult, DriverError> {
        let now = self.ups_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_ups.fetch_max(now, Ordering::SeqCst);
        let _counter = UpCounter(self);
        self.respond(Call::new(Verb::Up, inv)).await
    }

    async fn ssh(
        &self,
        inv: Invocation<'_>,
        machine: &str,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<ProcessResult, DriverError> {
        let mut call = Call::new(Verb::Ssh, inv);
        call.machine = Some(machine.to_string());
        call.command = Some(command.to_string());
        call.input = input.map(<[u8]>::to_vec);
        self.respond(call).await
    }

    async fn upload(
        &self,
        inv: Invocation<'_>,
        machine: &str,
        source: &Path,
        destination: &str,
    ) -> Result<ProcessResult, DriverError> {
        let mut call = Call::new(Verb::Upload, inv);
        call.machine = Some(machine.to_string());
        call.destination = Some(destination.to_string());
        call.uploaded = fs::read(source).ok();
        self.respond(call).await
    }

    async fn destroy(
        &self,
        inv: Invocation<'_>,
        target: Option<&str>,
    ) -> Result<ProcessResult, DriverError> {
        let mut call = Call::new(Verb::Destroy, inv);
        call.machine = target.map(str::to_string);
        self.respond(call).await
    }

    async fn status(&self, inv: Invocation<'_>) -> Result<ProcessResult, DriverError> {
        self.respond(Call::new(Verb::Status, inv)).await
    }

    async fn global_status(
        &self,
        inv: Invocation<'_>,
        _prune: bool,
    ) -> Result<ProcessResult, DriverError> {
        self.respond(Call::new(Verb::GlobalStatus, inv)).await
    }
}

/// A source directory holding a definition plus a sibling file.
pub struct Fixture {
    pub source: tempfile::TempDir,
    pub cache: tempfile::TempDir,
    pub definition: PathBuf,
}

impl Fixture {
    pub fn new(definition: &str) -> Self {
        let source = tempfile::tempdir().expect("create source dir");
        let cache = tempfile::tempdir().expect("create cache dir");
        let path = source.path().join("Vagrantfile");
        fs::write(&path, definition).expect("write definition");
        fs::write(source.path().join("provision.sh"), "#!/bin/sh\necho hi\n")
            .expect("write sibling");
        Self {
            source,
            cache,
            definition: path,
        }
    }

    pub fn config(&self) -> SandboxConfig {
        SandboxConfig::default().with_vagrantfile_path(&self.definition)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .with_cache_root(self.cache.path())
            .with_max_startups(4)
    }

    pub fn manager(&self, driver: &Arc<FakeDriver>) -> SandboxManager {
        self.manager_with(self.manager_config(), driver)
    }

    pub fn manager_with(&self, config: ManagerConfig, driver: &Arc<FakeDriver>) -> SandboxManager {
        let driver: Arc<dyn VagrantDriver> = Arc::clone(driver) as Arc<dyn VagrantDriver>;
        SandboxManager::with_driver(config, driver).expect("create manager")
    }

    /// Workspace directories currently under the cache root.
    pub fn workspaces(&self) -> Vec<PathBuf> {
        vagrant_sandbox::workspace::list_workspaces(self.cache.path())
    }
}
