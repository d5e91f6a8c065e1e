//! Client-side mirror of a remote parameter store.
//!
//! `RemoteParameters` clones the parameter inventory of a server once, keeps a
//! local cache of every cacheable parameter, and delivers change notifications
//! to registered callbacks. All network traffic after construction is driven
//! by [`RemoteParameters::poll`], which an external scheduler (UI tick, timer)
//! calls repeatedly and which never blocks.
//!
//! ```rust,ignore
//! let params = RemoteParameters::connect(runtime.handle().clone(), addr, true)?;
//! params.add_callback("lock", |value| println!("lock changed: {value}"), true)?;
//! params.write("sweep_speed", 8)?;
//! loop {
//!     params.poll();
//!     std::thread::sleep(Duration::from_millis(100));
//! }
//! ```
//!
//! # Execution model
//!
//! The mirror is `!Send` and owns no locks: caches, callback lists and the two
//! outstanding-call markers are only touched from the thread that calls
//! `poll()`. Callbacks run on that thread and may re-enter the mirror through
//! a clone of it (read a sibling, write, attach another callback).

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::transport::{IpcTransport, ParameterTransport, PendingCall};
use super::types::{ParameterChange, ParameterSnapshot, ParameterValue, SessionId};
use crate::error::{LinienError, Result};

type Callback = Rc<RefCell<dyn FnMut(&ParameterValue)>>;

#[derive(Debug)]
struct Slot {
    name: String,
    use_cache: bool,
    restorable: bool,
    loggable: bool,
    cache: RefCell<Option<ParameterValue>>,
}

/// The frozen set of parameter handles built from the server's inventory.
///
/// There is no way to add, replace or remove a name after construction.
#[derive(Debug)]
pub struct ParameterSet {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    fn from_snapshot(inventory: Vec<ParameterSnapshot>, enable_cache: bool) -> Result<Self> {
        let mut slots = Vec::with_capacity(inventory.len());
        let mut index = HashMap::with_capacity(inventory.len());

        for entry in inventory {
            if index.contains_key(&entry.name) {
                return Err(LinienError::ParameterRebind { name: entry.name });
            }
            let use_cache = enable_cache && entry.cacheable;
            index.insert(entry.name.clone(), slots.len());
            slots.push(Slot {
                name: entry.name,
                use_cache,
                restorable: entry.restorable,
                loggable: entry.loggable,
                cache: RefCell::new(use_cache.then_some(entry.value)),
            });
        }

        Ok(Self { slots, index })
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| LinienError::UnknownParameter {
                name: name.to_string(),
            })
    }

    fn slot(&self, name: &str) -> Result<&Slot> {
        self.position(name).map(|i| &self.slots[i])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names in the order the server listed them.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }
}

/// Health of the mirror's change stream.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    /// Change batches consumed since construction.
    pub batches_received: u64,
    pub last_batch_at: Option<Instant>,
    /// Age of the outstanding change fetch, if one is in flight.
    pub fetch_outstanding_for: Option<Duration>,
    pub registration_outstanding: bool,
    /// Message of the most recent failed deferred call.
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// True if the change fetch has been outstanding longer than `threshold`.
    ///
    /// A stalled fetch means no change notifications arrive; the mirror never
    /// issues a second fetch while one is outstanding.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.fetch_outstanding_for
            .map(|age| age > threshold)
            .unwrap_or(false)
    }
}

struct MirrorState {
    transport: Box<dyn ParameterTransport>,
    session: SessionId,
    parameters: ParameterSet,
    callbacks: RefCell<HashMap<String, Vec<Callback>>>,
    pending_registration: RefCell<Vec<String>>,
    changed_call: RefCell<Option<PendingCall<Vec<ParameterChange>>>>,
    /// In-flight registration and the names it carries.
    registration_call: RefCell<Option<(PendingCall<()>, Vec<String>)>>,
    batches_received: RefCell<u64>,
    last_batch_at: RefCell<Option<Instant>>,
    last_error: RefCell<Option<String>>,
}

/// Client-side mirror of a remote parameter store.
///
/// Cloning is cheap and yields another handle to the same mirror.
#[derive(Clone)]
pub struct RemoteParameters {
    state: Rc<MirrorState>,
}

impl std::fmt::Debug for RemoteParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteParameters")
            .field("session", &self.state.session)
            .field("parameters", &self.state.parameters.len())
            .finish()
    }
}

impl RemoteParameters {
    /// Build a mirror over `transport`.
    ///
    /// Fetches the full inventory synchronously, seeds the cache of every
    /// cache-enabled parameter, and runs one `poll()` before returning.
    pub fn new<T>(transport: T, session: SessionId, enable_cache: bool) -> Result<Self>
    where
        T: ParameterTransport + 'static,
    {
        let inventory = transport.init_parameter_sync(session)?;
        let parameters = ParameterSet::from_snapshot(inventory, enable_cache)?;

        info!(
            "Mirroring {} parameters for session {} (cache {})",
            parameters.len(),
            session,
            if enable_cache { "enabled" } else { "disabled" }
        );

        let mirror = Self {
            state: Rc::new(MirrorState {
                transport: Box::new(transport),
                session,
                parameters,
                callbacks: RefCell::new(HashMap::new()),
                pending_registration: RefCell::new(Vec::new()),
                changed_call: RefCell::new(None),
                registration_call: RefCell::new(None),
                batches_received: RefCell::new(0),
                last_batch_at: RefCell::new(None),
                last_error: RefCell::new(None),
            }),
        };
        mirror.poll();
        Ok(mirror)
    }

    /// Connect to a control server over IPC with a fresh session.
    ///
    /// Blocks the calling thread, which must not be a worker of `runtime`.
    pub fn connect(runtime: Handle, addr: SocketAddr, enable_cache: bool) -> Result<Self> {
        let transport = IpcTransport::connect(runtime, addr)?;
        Self::new(transport, SessionId::new(), enable_cache)
    }

    pub fn session(&self) -> SessionId {
        self.state.session
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.state.parameters
    }

    /// Handle to a single parameter.
    pub fn param(&self, name: &str) -> Result<RemoteParameter> {
        let index = self.state.parameters.position(name)?;
        Ok(RemoteParameter {
            mirror: self.clone(),
            index,
        })
    }

    /// All parameter handles in server order.
    pub fn iter(&self) -> impl Iterator<Item = RemoteParameter> + '_ {
        (0..self.state.parameters.len()).map(move |index| RemoteParameter {
            mirror: self.clone(),
            index,
        })
    }

    /// Current value of a parameter.
    ///
    /// Cache-backed parameters answer from the cache without a network call
    /// (the value may lag the server by up to one poll round trip). Others are
    /// fetched synchronously on every read.
    pub fn read(&self, name: &str) -> Result<ParameterValue> {
        let slot = self.state.parameters.slot(name)?;
        self.read_slot(slot)
    }

    /// Read a parameter and deserialize it into `T`.
    pub fn read_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        Ok(serde_json::from_value(self.read(name)?)?)
    }

    /// Send a new value to the server.
    ///
    /// The local cache is not touched; a cache-backed parameter shows the new
    /// value once the server echoes the change through `poll()`.
    pub fn write<V: Serialize>(&self, name: &str, value: V) -> Result<()> {
        self.state.parameters.slot(name)?;
        let value = serde_json::to_value(value)?;
        self.state.transport.set_param(name, value)
    }

    /// Ask the server to reset a parameter to its default.
    pub fn reset(&self, name: &str) -> Result<()> {
        self.state.parameters.slot(name)?;
        self.state.transport.reset_param(name)
    }

    /// Register `callback` for changes of `name`.
    ///
    /// If the parameter is not cache-backed, the server is asked (on a later
    /// `poll()`) to notify this session about it. With `invoke_with_current`
    /// the callback is called once, synchronously, with the present value.
    pub fn add_callback<F>(&self, name: &str, callback: F, invoke_with_current: bool) -> Result<()>
    where
        F: FnMut(&ParameterValue) + 'static,
    {
        let slot = self.state.parameters.slot(name)?;
        let callback: Callback = Rc::new(RefCell::new(callback));

        {
            let mut callbacks = self.state.callbacks.borrow_mut();
            let registered = callbacks.entry(name.to_string()).or_default();
            if registered.is_empty() && !slot.use_cache {
                self.state
                    .pending_registration
                    .borrow_mut()
                    .push(name.to_string());
            }
            registered.push(callback.clone());
        }

        if invoke_with_current {
            let value = self.read_slot(slot)?;
            let mut callback = callback.borrow_mut();
            (&mut *callback)(&value);
        }
        Ok(())
    }

    /// Advance the synchronization protocol by one step. Never blocks.
    ///
    /// 1. Issue a change fetch if none is outstanding.
    /// 2. Flush pending listener registrations if no registration is in flight.
    /// 3. If the change fetch completed: update every cache of the batch, issue
    ///    the next fetch, then run callbacks in batch order.
    /// 4. If the registration completed, allow the next one.
    ///
    /// Returns the number of change events delivered.
    pub fn poll(&self) -> usize {
        let state = &*self.state;

        {
            let mut changed_call = state.changed_call.borrow_mut();
            if changed_call.is_none() {
                *changed_call = Some(state.transport.get_changed_parameters_queue(state.session));
            }
        }

        {
            let mut registration_call = state.registration_call.borrow_mut();
            if registration_call.is_none() {
                let pending = std::mem::take(&mut *state.pending_registration.borrow_mut());
                if !pending.is_empty() {
                    debug!("Registering remote listeners for {:?}", pending);
                    let call = state
                        .transport
                        .register_remote_listeners(state.session, pending.clone());
                    *registration_call = Some((call, pending));
                }
            }
        }

        let delivered = match self.take_changed_batch() {
            Some(batch) => self.run_callbacks(&batch),
            None => 0,
        };

        self.finish_registration();
        delivered
    }

    /// Snapshot of the change stream's health.
    pub fn status(&self) -> SyncStatus {
        let state = &*self.state;
        SyncStatus {
            batches_received: *state.batches_received.borrow(),
            last_batch_at: *state.last_batch_at.borrow(),
            fetch_outstanding_for: state.changed_call.borrow().as_ref().map(PendingCall::age),
            registration_outstanding: state.registration_call.borrow().is_some(),
            last_error: state.last_error.borrow().clone(),
        }
    }

    fn read_slot(&self, slot: &Slot) -> Result<ParameterValue> {
        if slot.use_cache {
            if let Some(value) = slot.cache.borrow().as_ref() {
                return Ok(value.clone());
            }
        }
        self.state.transport.get_param(&slot.name)
    }

    /// Consume a completed change fetch: update caches, then re-issue.
    fn take_changed_batch(&self) -> Option<Vec<ParameterChange>> {
        let state = &*self.state;
        let result = state
            .changed_call
            .borrow_mut()
            .as_mut()
            .and_then(PendingCall::try_take)?;

        match result {
            Ok(batch) => {
                for change in &batch {
                    match state.parameters.slot(&change.name) {
                        Ok(slot) if slot.use_cache => {
                            *slot.cache.borrow_mut() = Some(change.value.clone());
                        }
                        Ok(_) => {}
                        Err(_) => warn!("Ignoring change of unknown parameter {}", change.name),
                    }
                }

                *state.changed_call.borrow_mut() =
                    Some(state.transport.get_changed_parameters_queue(state.session));
                *state.batches_received.borrow_mut() += 1;
                *state.last_batch_at.borrow_mut() = Some(Instant::now());
                Some(batch)
            }
            Err(e) => {
                warn!("Fetching changed parameters failed: {}", e);
                *state.changed_call.borrow_mut() = None;
                *state.last_error.borrow_mut() = Some(e.to_string());
                None
            }
        }
    }

    fn run_callbacks(&self, batch: &[ParameterChange]) -> usize {
        for change in batch {
            let callbacks: Vec<Callback> = self
                .state
                .callbacks
                .borrow()
                .get(&change.name)
                .cloned()
                .unwrap_or_default();

            for callback in callbacks {
                match callback.try_borrow_mut() {
                    Ok(mut callback) => (&mut *callback)(&change.value),
                    Err(_) => warn!(
                        "Skipping re-entrant callback invocation for {}",
                        change.name
                    ),
                }
            }
        }
        batch.len()
    }

    fn finish_registration(&self) {
        let state = &*self.state;
        let result = state
            .registration_call
            .borrow_mut()
            .as_mut()
            .and_then(|(call, _)| call.try_take());
        let Some(result) = result else {
            return;
        };

        let finished = state.registration_call.borrow_mut().take();
        if let Err(e) = result {
            warn!("Registering remote listeners failed: {}", e);
            *state.last_error.borrow_mut() = Some(e.to_string());
            if let Some((_, names)) = finished {
                state.pending_registration.borrow_mut().extend(names);
            }
        }
    }
}

/// Handle to one mirrored parameter.
#[derive(Clone, Debug)]
pub struct RemoteParameter {
    mirror: RemoteParameters,
    index: usize,
}

impl RemoteParameter {
    fn slot(&self) -> &Slot {
        &self.mirror.state.parameters.slots[self.index]
    }

    pub fn name(&self) -> &str {
        &self.slot().name
    }

    /// Whether reads are answered from the local cache.
    pub fn use_cache(&self) -> bool {
        self.slot().use_cache
    }

    pub fn restorable(&self) -> bool {
        self.slot().restorable
    }

    pub fn loggable(&self) -> bool {
        self.slot().loggable
    }

    pub fn value(&self) -> Result<ParameterValue> {
        self.mirror.read_slot(self.slot())
    }

    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value()?)?)
    }

    pub fn set<V: Serialize>(&self, value: V) -> Result<()> {
        self.mirror.write(self.name(), value)
    }

    pub fn reset(&self) -> Result<()> {
        self.mirror.reset(self.name())
    }

    pub fn add_callback<F>(&self, callback: F, invoke_with_current: bool) -> Result<()>
    where
        F: FnMut(&ParameterValue) + 'static,
    {
        self.mirror.add_callback(self.name(), callback, invoke_with_current)
    }
}
