//! The blocking client: one caller's queue of requests
//!
//! Each [`Client`] owns a queue within its thread's dispatcher. Clients on
//! the same thread share the dispatcher, so waiting on one also moves the
//! others' requests along.

use std::path::Path;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use plexrpc_core::{kdebug, kwarn, Fault, FaultCode, FaultResult, Poller};
use plexrpc_lookup::{resolve_map_path, LookupReader};

use crate::condition::WaitCondition;
use crate::config::{ClientConfig, ConfigError};
use crate::dispatcher::{Dispatcher, OwnerId, RunOutcome};
use crate::registry::{registry, SharedDispatcher};
use crate::request::ClientRequest;

fn lock(dispatcher: &SharedDispatcher) -> MutexGuard<'_, Dispatcher> {
    dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Client {
    owner: OwnerId,
    name: String,
    config: ClientConfig,
    thread_id: u64,
    dispatcher: SharedDispatcher,
    initialized: bool,
    fault: Fault,
}

impl Client {
    /// Client configured from the environment. Invalid settings fall back
    /// to the defaults with a warning.
    pub fn new(name: &str) -> Self {
        let config = ClientConfig::from_env();
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kwarn!("plexrpc: ignoring client environment: {}", e);
                ClientConfig::default()
            }
        };
        Self::build(name, config)
    }

    pub fn with_config(name: &str, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(name, config))
    }

    fn build(name: &str, config: ClientConfig) -> Self {
        let registry = registry();
        let thread_id = registry.thread_id();
        let dispatcher = registry.attach(thread_id);
        let owner = OwnerId::next();
        lock(&dispatcher).attach_owner(owner);
        kdebug!("client {}: attached to thread {}", name, thread_id);

        Self {
            owner,
            name: format!("{}:{}", name, std::process::id()),
            config,
            thread_id,
            dispatcher,
            initialized: false,
            fault: Fault::default(),
        }
    }

    fn set_fault(&mut self, fault: Fault) -> Fault {
        self.fault = fault.clone();
        fault
    }

    /// Map the lookup table: `lookup_map`, else the configured path, else
    /// the environment, else the built-in default.
    pub fn initialize(&mut self, lookup_map: Option<&Path>) -> FaultResult<()> {
        if self.initialized {
            return Err(self.set_fault(Fault::from_code(FaultCode::AlreadyInitialized)));
        }
        let path = resolve_map_path(lookup_map.or(self.config.lookup_map_path.as_deref()));
        let reader = match LookupReader::open(&path) {
            Ok(reader) => reader,
            Err(fault) => return Err(self.set_fault(fault)),
        };
        lock(&self.dispatcher).set_lookup(self.owner, reader);
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `"<name>:<pid>"`, sent with every request
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Timeout stamped on requests added from now on
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.default_timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.config.default_timeout
    }

    pub fn set_debug(&mut self, enable: bool) {
        self.config.debug = enable;
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_fault()
    }

    /// Last fault of a client-level call
    pub fn fault(&self) -> &Fault {
        &self.fault
    }

    /// Requests added and not yet complete
    pub fn pending(&self) -> usize {
        lock(&self.dispatcher).todo(self.owner)
    }

    /// Route this thread's readiness waits through `proxy`, or back to
    /// `poll(2)` with `None`. Returns the previous proxy.
    pub fn set_poll_proxy(&mut self, proxy: Option<Arc<dyn Poller>>) -> Option<Arc<dyn Poller>> {
        lock(&self.dispatcher).set_poller(proxy)
    }

    /// Queue `request` for `service_key`. Nothing is sent until a wait.
    pub fn add_request(&mut self, service_key: &str, request: &ClientRequest) -> FaultResult<()> {
        if !self.initialized {
            return Err(self.set_fault(Fault::from_code(FaultCode::NotInitialized)));
        }
        let admitted = request.cell().lock().admit(
            service_key,
            &self.name,
            self.config.default_timeout,
            &self.config,
        );
        if let Err(fault) = admitted {
            return Err(self.set_fault(fault));
        }
        lock(&self.dispatcher).add(self.owner, request);
        Ok(())
    }

    /// Drop every request of this client without completing it, and clear
    /// the client fault
    pub fn reset(&mut self) {
        lock(&self.dispatcher).reset_owner(self.owner);
        self.fault.clear();
    }

    fn execute(
        &mut self,
        op: &str,
        cond: WaitCondition,
        budget: Option<Duration>,
    ) -> FaultResult<RunOutcome> {
        let here = registry().thread_id();
        assert!(
            here == self.thread_id,
            "client {} created on thread {} but {} called from thread {}",
            self.name,
            self.thread_id,
            op,
            here
        );
        if !self.initialized {
            return Err(self.set_fault(Fault::from_code(FaultCode::NotInitialized)));
        }
        let outcome = lock(&self.dispatcher).run(self.owner, &cond, budget);
        outcome.map_err(|fault| self.set_fault(fault))
    }

    /// Run until every request has been transmitted
    pub fn wait_sent(&mut self) -> FaultResult<()> {
        self.execute("wait_sent", WaitCondition::Sent, None)?;
        Ok(())
    }

    /// Run until every request is complete. Returns how many completed
    /// requests were handed back.
    pub fn wait_all(&mut self) -> FaultResult<usize> {
        self.execute("wait_all", WaitCondition::All, None)?;
        Ok(lock(&self.dispatcher).drain_completed(self.owner))
    }

    /// Run until a request completes and return the oldest completion, or
    /// `None` when nothing is outstanding
    pub fn wait_any(&mut self) -> FaultResult<Option<ClientRequest>> {
        self.execute("wait_any", WaitCondition::Any, None)?;
        Ok(lock(&self.dispatcher).pop_completed(self.owner))
    }

    /// Run until `request` completes. Other completions stay queued.
    pub fn wait_one(&mut self, request: &ClientRequest) -> FaultResult<()> {
        if self.initialized && !lock(&self.dispatcher).tracks(self.owner, request) {
            return Err(self.set_fault(Fault::from_code(FaultCode::RequestNotAdded)));
        }
        self.execute("wait_one", WaitCondition::One(request.downgrade()), None)?;
        lock(&self.dispatcher).take_completed(self.owner, request);
        Ok(())
    }

    /// Run until a request completes or nothing becomes ready within
    /// `timeout`. Returns the number of completions waiting.
    pub fn wait_blocked(&mut self, timeout: Duration) -> FaultResult<usize> {
        self.execute("wait_blocked", WaitCondition::Blocked, Some(timeout))?;
        Ok(lock(&self.dispatcher).completed_len(self.owner))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        lock(&self.dispatcher).detach_owner(self.owner);
        registry().detach(self.thread_id);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .field("initialized", &self.initialized)
            .field("fault", &self.fault)
            .finish()
    }
}
