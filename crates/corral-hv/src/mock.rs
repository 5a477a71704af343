//! In-memory driver for tests.
//!
//! `MockDriver` records every call, creates no real resources, and hands
//! the remote end of each console stream to the test, which plays the domain
//! side: write to it to produce console output, read from it to see input,
//! drop it to simulate a remote hangup.

use crate::domain::{DomainHandle, DomainId};
use crate::driver::{ConsoleStream, ConsoleTarget, Driver};
use crate::error::{HvError, Result};
use crate::spec::DomainSpec;
use crate::uri::ConnectUri;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::DuplexStream;
use tokio::sync::Mutex;

const CONSOLE_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct MockState {
    connected: bool,
    domains: Vec<DomainHandle>,
    created: Vec<DomainSpec>,
    destroyed: Vec<DomainId>,
    remotes: HashMap<DomainId, DuplexStream>,
    console_opens: Vec<(DomainId, ConsoleTarget)>,
    exit_codes: HashMap<DomainId, i32>,
}

/// Driver that simulates a backend in memory.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
    unreachable: Option<String>,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
}

impl MockDriver {
    /// A backend that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `connect` always fails with `reason`.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            unreachable: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Make subsequent `create_domain` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `destroy_domain` calls fail after removing the domain.
    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Register a domain as if something else had created it.
    pub async fn insert_domain(&self, name: &str) -> DomainHandle {
        let handle = DomainHandle::new(DomainId::new(), name);
        self.state.lock().await.domains.push(handle.clone());
        handle
    }

    /// Take the domain-side end of the most recent console opened on `id`.
    pub async fn take_remote(&self, id: DomainId) -> Option<DuplexStream> {
        self.state.lock().await.remotes.remove(&id)
    }

    /// Report `code` as the exit code of the command of `id`.
    pub async fn set_exit_code(&self, id: DomainId, code: i32) {
        self.state.lock().await.exit_codes.insert(id, code);
    }

    /// Specs passed to `create_domain`, in call order.
    pub async fn created(&self) -> Vec<DomainSpec> {
        self.state.lock().await.created.clone()
    }

    /// Domains passed to `destroy_domain`, in call order.
    pub async fn destroyed(&self) -> Vec<DomainId> {
        self.state.lock().await.destroyed.clone()
    }

    /// Every `open_console` call, in order.
    pub async fn console_opens(&self) -> Vec<(DomainId, ConsoleTarget)> {
        self.state.lock().await.console_opens.clone()
    }

    /// Whether `connect` succeeded and `disconnect` has not run since.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self, _uri: &ConnectUri) -> Result<()> {
        if let Some(reason) = &self.unreachable {
            return Err(HvError::Connection(reason.clone()));
        }
        self.state.lock().await.connected = true;
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainHandle>> {
        Ok(self.state.lock().await.domains.clone())
    }

    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle> {
        let mut state = self.state.lock().await;
        state.created.push(spec.clone());
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(HvError::Create(format!("mock backend refused '{}'", spec.name)));
        }
        let handle = DomainHandle::new(DomainId::new(), spec.name.clone());
        state.domains.push(handle.clone());
        Ok(handle)
    }

    async fn destroy_domain(&self, id: DomainId) -> Result<()> {
        let mut state = self.state.lock().await;
        let pos = state
            .domains
            .iter()
            .position(|d| d.id() == id)
            .ok_or(HvError::DomainNotFound(id))?;
        state.domains.remove(pos);
        state.remotes.remove(&id);
        state.destroyed.push(id);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(HvError::Destroy("mock backend failed to destroy".into()));
        }
        Ok(())
    }

    async fn open_console(&self, id: DomainId, target: ConsoleTarget) -> Result<ConsoleStream> {
        let mut state = self.state.lock().await;
        if !state.domains.iter().any(|d| d.id() == id) {
            return Err(HvError::DomainNotFound(id));
        }
        let (local, remote) = tokio::io::duplex(CONSOLE_BUFFER);
        state.remotes.insert(id, remote);
        state.console_opens.push((id, target));
        Ok(ConsoleStream::from_duplex(local))
    }

    async fn wait_exit(&self, id: DomainId) -> Result<Option<i32>> {
        let state = self.state.lock().await;
        if !state.domains.iter().any(|d| d.id() == id) {
            return Err(HvError::DomainNotFound(id));
        }
        Ok(state.exit_codes.get(&id).copied())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.domains.clear();
        state.remotes.clear();
    }
}
