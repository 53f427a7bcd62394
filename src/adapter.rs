use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    future::Future,
    pin::{pin, Pin},
    rc::Rc,
    task::{Poll, Waker},
    time::Instant,
};

use async_io::Timer;
use futures_util::{
    future::{poll_fn, select, Either},
    StreamExt,
};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    agent::{Agent, AgentEvent},
    bus::{
        is_child_path, BusEvent, EventStream, PropertyValue, ADAPTER_INTERFACE, DEVICE_INTERFACE,
    },
    device::{sort_by_priority, Device},
    obex::ObexManager,
    signal::{Signal, SubscriptionId},
    Error, Result, Session,
};

/// Returns the object paths of all Bluetooth adapters, in the order BlueZ lists them.
///
/// An empty list is not an error: the system simply has no adapter (or BlueZ hasn't found it).
pub async fn adapter_paths(session: &Session) -> Result<Vec<OwnedObjectPath>> {
    let objects = session.backend().managed_objects().await?;
    let paths: Vec<_> = objects
        .into_iter()
        .filter(|obj| obj.implements(ADAPTER_INTERFACE))
        .map(|obj| {
            log::debug!("found BlueZ adapter at path {}", obj.path);
            obj.path
        })
        .collect();
    Ok(paths)
}

/// A change to an [`Adapter`] or its device collection.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// A device was added to [`Adapter::devices`].
    DeviceAdded(OwnedObjectPath),
    /// A device was removed from [`Adapter::devices`].
    DeviceRemoved(OwnedObjectPath),
    PoweredChanged(bool),
    DiscoveringChanged(bool),
}

struct Inner {
    session: Session,
    path: OwnedObjectPath,
    agent: Rc<Agent>,
    powered: Cell<bool>,
    discovering: Cell<bool>,
    devices: RefCell<Vec<Device>>,
    /// Change subscriptions on tracked devices, which keep `devices` in priority order.
    subscriptions: RefCell<HashMap<OwnedObjectPath, SubscriptionId>>,
    obex: RefCell<Option<ObexManager>>,
    deadline: Cell<Option<Instant>>,
    timer: RefCell<Timer>,
    /// Waker of the `run` loop parked on `timer`.
    timer_waker: RefCell<Option<Waker>>,
    events: RefCell<Option<EventStream>>,
    signal: Signal<AdapterEvent>,
}

/// A BlueZ Bluetooth adapter and the devices it knows about.
///
/// The model is kept up to date by feeding it bus events, either by driving [`Adapter::run`] or
/// by passing events to [`Adapter::handle_event`] directly. Cloning an [`Adapter`] yields another
/// handle to the same model.
#[derive(Clone)]
pub struct Adapter {
    inner: Rc<Inner>,
}

impl Adapter {
    /// Opens the system's default Bluetooth adapter (the first one BlueZ lists).
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Unavailable`][crate::ErrorKind::Unavailable] error if there is no
    /// adapter.
    pub async fn open(session: &Session) -> Result<Self> {
        match adapter_paths(session).await?.into_iter().next() {
            Some(path) => Self::new(session.clone(), path).await,
            None => Err(Error::unavailable("no Bluetooth adapter found")),
        }
    }

    /// Loads the adapter at `path` together with its paired devices.
    ///
    /// The pairing agent is created but not registered.
    pub async fn new(session: Session, path: OwnedObjectPath) -> Result<Self> {
        let backend = session.backend();

        // Subscribe before enumerating, so that nothing between the two gets lost.
        let events = backend.events().await?;

        let props = backend.properties(&path, ADAPTER_INTERFACE).await?;
        let powered = flag(props.get("Powered"));
        let discovering = flag(props.get("Discovering"));
        let agent = Rc::new(Agent::new(session.clone())?);

        let mut devices = Vec::new();
        for obj in backend.managed_objects().await? {
            if !obj.implements(DEVICE_INTERFACE) || !is_child_path(path.as_str(), obj.path.as_str())
            {
                continue;
            }
            match Device::new(session.clone(), obj.path.clone(), agent.clone()).await {
                Ok(device) if device.is_paired() => devices.push(device),
                Ok(_) => {}
                Err(e) => log::warn!("skipping device at {}: {}", obj.path, e),
            }
        }
        sort_by_priority(&mut devices);
        log::debug!(
            "opened adapter {} (powered: {}, discovering: {}, {} paired devices)",
            path,
            powered,
            discovering,
            devices.len()
        );

        let adapter = Self {
            inner: Rc::new(Inner {
                session,
                path,
                agent,
                powered: Cell::new(powered),
                discovering: Cell::new(discovering),
                devices: RefCell::new(devices),
                subscriptions: RefCell::new(HashMap::new()),
                obex: RefCell::new(None),
                deadline: Cell::new(None),
                timer: RefCell::new(Timer::never()),
                timer_waker: RefCell::new(None),
                events: RefCell::new(Some(events)),
                signal: Signal::new(),
            }),
        };
        for device in adapter.devices() {
            adapter.track(&device);
        }
        Ok(adapter)
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.inner.path
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn is_powered(&self) -> bool {
        self.inner.powered.get()
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.discovering.get()
    }

    pub fn agent(&self) -> &Rc<Agent> {
        &self.inner.agent
    }

    /// Returns the tracked devices in display order.
    pub fn devices(&self) -> Vec<Device> {
        self.inner.devices.borrow().clone()
    }

    pub fn device(&self, path: &ObjectPath<'_>) -> Option<Device> {
        self.inner
            .devices
            .borrow()
            .iter()
            .find(|d| d.path().as_str() == path.as_str())
            .cloned()
    }

    /// Returns the OBEX transfer manager, creating it on first use.
    pub fn obex(&self) -> ObexManager {
        self.inner
            .obex
            .borrow_mut()
            .get_or_insert_with(|| ObexManager::new(self.inner.session.clone()))
            .clone()
    }

    /// Registers `callback` to be invoked for every [`AdapterEvent`].
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AdapterEvent) + 'static,
    {
        self.inner.signal.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.signal.unsubscribe(id)
    }

    /// Turns the adapter on or off.
    ///
    /// [`Adapter::is_powered`] changes once BlueZ reports the new state.
    pub async fn set_powered(&self, powered: bool) -> Result<()> {
        log::debug!("powering {} {}", self.path(), if powered { "on" } else { "off" });
        self.inner
            .session
            .backend()
            .set_property(
                self.path(),
                ADAPTER_INTERFACE,
                "Powered",
                PropertyValue::Bool(powered),
            )
            .await
    }

    /// Starts device discovery, unless it is already running.
    ///
    /// Discovery is stopped again after the configured discovery window.
    pub async fn start_discovery(&self) -> Result<()> {
        if self.is_discovering() {
            return Ok(());
        }
        self.inner
            .session
            .backend()
            .start_discovery(self.path())
            .await?;

        if let Some(window) = self.inner.session.config().discovery.window() {
            let deadline = Instant::now() + window;
            self.inner.deadline.set(Some(deadline));
            self.inner.timer.borrow_mut().set_at(deadline);
            // The loop has to poll the timer again for the new deadline to be registered.
            let waker = self.inner.timer_waker.borrow_mut().take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        Ok(())
    }

    /// Stops device discovery, if it is running.
    pub async fn stop_discovery(&self) -> Result<()> {
        self.inner.deadline.set(None);
        if !self.is_discovering() {
            return Ok(());
        }
        self.inner
            .session
            .backend()
            .stop_discovery(self.path())
            .await
    }

    /// Returns when discovery will be stopped automatically.
    pub fn discovery_deadline(&self) -> Option<Instant> {
        self.inner.deadline.get()
    }

    /// Stops discovery if the discovery window has elapsed at `now`. Returns whether it did.
    pub async fn expire_discovery(&self, now: Instant) -> Result<bool> {
        match self.inner.deadline.get() {
            Some(deadline) if deadline <= now => {
                log::debug!("discovery window of {} elapsed", self.path());
                self.stop_discovery().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Asks BlueZ to forget the device at `path`, removing its pairing.
    ///
    /// The device is removed from [`Adapter::devices`] once BlueZ reports it gone.
    pub async fn remove_device(&self, path: &ObjectPath<'_>) -> Result<()> {
        log::debug!("removing device {}", path);
        self.inner
            .session
            .backend()
            .remove_device(self.path(), path)
            .await
    }

    /// Updates the model from a bus event. Events not concerning this adapter are ignored.
    pub async fn handle_event(&self, event: &BusEvent) {
        match event {
            BusEvent::InterfacesAdded { path, interfaces } => {
                if interfaces.iter().any(|i| i == DEVICE_INTERFACE)
                    && is_child_path(self.path().as_str(), path.as_str())
                {
                    self.add_device(path).await;
                }
            }
            BusEvent::InterfacesRemoved { path, interfaces } => {
                if path == self.path() && interfaces.iter().any(|i| i == ADAPTER_INTERFACE) {
                    log::warn!("adapter {} was removed", path);
                } else if interfaces.iter().any(|i| i == DEVICE_INTERFACE) {
                    self.drop_device(path);
                }
            }
            BusEvent::PropertiesChanged {
                path,
                interface,
                changed,
                invalidated,
            } => {
                if path == self.path() && interface == ADAPTER_INTERFACE {
                    self.apply_adapter_changes(changed).await;
                } else if interface == DEVICE_INTERFACE
                    && is_child_path(self.path().as_str(), path.as_str())
                {
                    self.apply_device_changes(path, changed, invalidated).await;
                }
            }
        }
    }

    async fn add_device(&self, path: &OwnedObjectPath) {
        if self.device(path).is_some() {
            log::debug!("device {} is already tracked", path);
            return;
        }
        let device = match Device::new(
            self.inner.session.clone(),
            path.clone(),
            self.inner.agent.clone(),
        )
        .await
        {
            Ok(device) => device,
            Err(e) => {
                log::warn!("skipping device at {}: {}", path, e);
                return;
            }
        };
        // Another event may have added it while it was loading.
        if self.device(path).is_some() {
            return;
        }

        self.track(&device);
        {
            let mut devices = self.inner.devices.borrow_mut();
            devices.push(device);
            sort_by_priority(&mut devices);
        }
        log::debug!("device {} added", path);
        self.emit(AdapterEvent::DeviceAdded(path.clone()));
    }

    /// Re-sorts the collection whenever `device` changes, including its connection count.
    fn track(&self, device: &Device) {
        let inner = Rc::downgrade(&self.inner);
        let id = device.subscribe_changed(move |_| {
            if let Some(inner) = inner.upgrade() {
                sort_by_priority(&mut inner.devices.borrow_mut());
            }
        });
        self.inner
            .subscriptions
            .borrow_mut()
            .insert(device.path().clone(), id);
    }

    fn drop_device(&self, path: &OwnedObjectPath) {
        let removed = {
            let mut devices = self.inner.devices.borrow_mut();
            devices
                .iter()
                .position(|d| d.path() == path)
                .map(|i| devices.remove(i))
        };
        if let Some(device) = removed {
            if let Some(id) = self.inner.subscriptions.borrow_mut().remove(path) {
                device.unsubscribe(id);
            }
            log::debug!("device {} removed", path);
            self.emit(AdapterEvent::DeviceRemoved(path.clone()));
        }
    }

    async fn apply_adapter_changes(&self, changed: &[(String, PropertyValue)]) {
        for (name, value) in changed {
            let Some(value) = value.as_bool() else {
                continue;
            };
            match name.as_str() {
                "Powered" => {
                    if self.inner.powered.replace(value) == value {
                        continue;
                    }
                    if !value {
                        self.inner.deadline.set(None);
                    }
                    self.emit(AdapterEvent::PoweredChanged(value));
                    if value && self.inner.session.config().discovery.auto_start {
                        if let Err(e) = self.start_discovery().await {
                            log::warn!("failed to start discovery on {}: {}", self.path(), e);
                        }
                    }
                }
                "Discovering" => {
                    if self.inner.discovering.replace(value) == value {
                        continue;
                    }
                    if !value {
                        self.inner.deadline.set(None);
                    }
                    self.emit(AdapterEvent::DiscoveringChanged(value));
                }
                _ => {}
            }
        }
    }

    async fn apply_device_changes(
        &self,
        path: &OwnedObjectPath,
        changed: &[(String, PropertyValue)],
        invalidated: &[String],
    ) {
        let Some(device) = self.device(path) else {
            if self.is_discovering() {
                self.add_device(path).await;
            }
            return;
        };
        // Resorting happens in the subscription installed by `track`.
        device.update(changed, invalidated);
    }

    fn emit(&self, event: AdapterEvent) {
        self.inner.signal.emit(&event);
    }

    async fn discovery_timer(&self) {
        poll_fn(|cx| {
            let mut timer = self.inner.timer.borrow_mut();
            match Pin::new(&mut *timer).poll(cx) {
                Poll::Ready(_) => Poll::Ready(()),
                Poll::Pending => {
                    *self.inner.timer_waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Stops discovery, unregisters the agent and abandons in-flight connection attempts.
    ///
    /// Failures are logged only.
    pub async fn shutdown(&self) {
        log::debug!("shutting down adapter {}", self.path());
        if let Err(e) = self.stop_discovery().await {
            log::warn!("failed to stop discovery on {}: {}", self.path(), e);
        }
        self.inner.agent.unregister().await;

        let obex = self.inner.obex.borrow_mut().take();
        if let Some(obex) = obex {
            obex.destroy().await;
        }

        let backend = self.inner.session.backend();
        for device in self.devices().iter().filter(|d| d.is_connecting()) {
            if let Err(e) = backend.disconnect(device.path()).await {
                log::debug!("failed to disconnect {}: {}", device.path(), e);
            }
        }
    }

    /// Keeps the model up to date, forwards pairing agent events to its subscribers and ends
    /// discovery windows.
    ///
    /// # Errors
    ///
    /// Returns an error once the bus stops delivering events (eg. because BlueZ went away).
    /// The [`Adapter`] should be considered stale then.
    pub async fn run(&self) -> Result<()> {
        let stored = self.inner.events.borrow_mut().take();
        let mut events = match stored {
            Some(events) => events,
            None => self.inner.session.backend().events().await?,
        };

        enum Wake {
            Bus(Option<BusEvent>),
            Agent(Option<AgentEvent>),
            Timer,
        }

        loop {
            let wake = {
                let agent = pin!(self.inner.agent.next_event());
                let timer = pin!(self.discovery_timer());
                match select(select(agent, timer), events.next()).await {
                    Either::Left((Either::Left((event, _)), _)) => Wake::Agent(event),
                    Either::Left((Either::Right(((), _)), _)) => Wake::Timer,
                    Either::Right((event, _)) => Wake::Bus(event),
                }
            };

            match wake {
                Wake::Bus(Some(event)) => self.handle_event(&event).await,
                Wake::Bus(None) => {
                    return Err(Error::unavailable("BlueZ event stream ended"));
                }
                Wake::Agent(Some(event)) => self.inner.agent.dispatch(&event),
                Wake::Agent(None) => return Err(Error::from("pairing agent channel closed")),
                Wake::Timer => {
                    if let Err(e) = self.expire_discovery(Instant::now()).await {
                        log::warn!("failed to stop discovery on {}: {}", self.path(), e);
                    }
                }
            }
        }
    }
}

fn flag(value: Option<&PropertyValue>) -> bool {
    value.and_then(PropertyValue::as_bool).unwrap_or(false)
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("path", &self.inner.path)
            .field("powered", &self.inner.powered.get())
            .field("discovering", &self.inner.discovering.get())
            .field("devices", &self.inner.devices.borrow().len())
            .finish()
    }
}
