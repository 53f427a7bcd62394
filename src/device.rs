//! BlueZ [`Device`] model.

use std::{
    cell::{Cell, Ref, RefCell},
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    rc::Rc,
};

use zbus::zvariant::OwnedObjectPath;

use crate::{
    agent::Agent,
    bus::{PropertyValue, DEVICE_INTERFACE},
    class::{DeviceClass, DeviceKind},
    signal::{Signal, SubscriptionId},
    uuid::{Service, Uuid},
    Error, Result, Session,
};

/// After this many successful connections, a device is marked as trusted.
const TRUST_AFTER_CONNECTIONS: u32 = 3;

/// A single `org.bluez.Device1` property with a typed value.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DeviceProperty {
    Address(String),
    Alias(String),
    Name(String),
    Class(DeviceClass),
    Icon(String),
    Paired(bool),
    Bonded(bool),
    Trusted(bool),
    Blocked(bool),
    Connected(bool),
    Uuids(BTreeSet<Uuid>),
}

impl DeviceProperty {
    /// Interprets a property sent by BlueZ.
    ///
    /// Returns `None` for properties we don't track and for values of an unexpected type.
    pub fn parse(name: &str, value: &PropertyValue) -> Option<Self> {
        Some(match name {
            "Address" => Self::Address(value.as_str()?.to_string()),
            "Alias" => Self::Alias(value.as_str()?.to_string()),
            "Name" => Self::Name(value.as_str()?.to_string()),
            "Class" => Self::Class(DeviceClass(value.as_u32()?)),
            "Icon" => Self::Icon(value.as_str()?.to_string()),
            "Paired" => Self::Paired(value.as_bool()?),
            "Bonded" => Self::Bonded(value.as_bool()?),
            "Trusted" => Self::Trusted(value.as_bool()?),
            "Blocked" => Self::Blocked(value.as_bool()?),
            "Connected" => Self::Connected(value.as_bool()?),
            "UUIDs" => Self::Uuids(
                value
                    .as_str_list()?
                    .iter()
                    .filter_map(|s| match s.parse() {
                        Ok(uuid) => Some(uuid),
                        Err(e) => {
                            log::debug!("ignoring malformed UUID '{}': {}", s, e);
                            None
                        }
                    })
                    .collect(),
            ),
            _ => return None,
        })
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    address: String,
    alias: String,
    name: Option<String>,
    class: DeviceClass,
    icon: Option<String>,
    paired: bool,
    bonded: bool,
    trusted: bool,
    blocked: bool,
    connected: bool,
    uuids: BTreeSet<Uuid>,
}

impl DeviceState {
    /// Stores `prop`, returning whether the stored value changed.
    fn apply(&mut self, prop: DeviceProperty) -> bool {
        fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
            if *slot == value {
                false
            } else {
                *slot = value;
                true
            }
        }

        match prop {
            DeviceProperty::Address(v) => set(&mut self.address, v),
            DeviceProperty::Alias(v) => set(&mut self.alias, v),
            DeviceProperty::Name(v) => set(&mut self.name, Some(v)),
            DeviceProperty::Class(v) => set(&mut self.class, v),
            DeviceProperty::Icon(v) => set(&mut self.icon, Some(v)),
            DeviceProperty::Paired(v) => set(&mut self.paired, v),
            DeviceProperty::Bonded(v) => set(&mut self.bonded, v),
            DeviceProperty::Trusted(v) => set(&mut self.trusted, v),
            DeviceProperty::Blocked(v) => set(&mut self.blocked, v),
            DeviceProperty::Connected(v) => set(&mut self.connected, v),
            DeviceProperty::Uuids(v) => set(&mut self.uuids, v),
        }
    }

    /// Forgets the value of an invalidated property. Returns whether anything changed.
    fn invalidate(&mut self, name: &str) -> bool {
        match name {
            "Alias" => !std::mem::take(&mut self.alias).is_empty(),
            "Name" => self.name.take().is_some(),
            "Icon" => self.icon.take().is_some(),
            "UUIDs" => !std::mem::take(&mut self.uuids).is_empty(),
            _ => false,
        }
    }
}

/// How a device is presented in a device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    NotConnected,
    NotSetUp,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::NotConnected => "Not Connected",
            ConnectionStatus::NotSetUp => "Not Set Up",
        })
    }
}

/// The key devices are ordered by for display. Greater sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DevicePriority {
    pub connected: bool,
    pub paired: bool,
    pub connections: u32,
}

/// Sorts `devices` for display: connected first, then paired, then by how often they were
/// connected. Devices of equal priority keep their relative order.
pub fn sort_by_priority(devices: &mut [Device]) {
    devices.sort_by(|a, b| compare_priority(a, b));
}

fn compare_priority(a: &Device, b: &Device) -> Ordering {
    b.priority().cmp(&a.priority())
}

struct Inner {
    session: Session,
    path: OwnedObjectPath,
    agent: Rc<Agent>,
    state: RefCell<DeviceState>,
    connecting: Cell<bool>,
    changed: Signal<Device>,
}

/// A remote device known to BlueZ.
///
/// The model mirrors the device's `org.bluez.Device1` properties. It's updated by the owning
/// [`Adapter`][crate::Adapter] as BlueZ reports changes; subscribers registered with
/// [`Device::subscribe_changed`] are notified after every update that changed something.
///
/// Cloning a [`Device`] yields another handle to the same model.
#[derive(Clone)]
pub struct Device {
    inner: Rc<Inner>,
}

impl Device {
    /// Loads the device at `path`.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Unavailable`][crate::ErrorKind::Unavailable] error if the
    /// device's properties can't be fetched, typically because it has disappeared.
    pub async fn new(session: Session, path: OwnedObjectPath, agent: Rc<Agent>) -> Result<Self> {
        let props = session
            .backend()
            .properties(&path, DEVICE_INTERFACE)
            .await
            .map_err(|e| Error::unavailable(format!("device {} vanished: {}", path, e)))?;

        let mut state = DeviceState::default();
        for (name, value) in &props {
            if let Some(prop) = DeviceProperty::parse(name, value) {
                state.apply(prop);
            }
        }
        if state.address.is_empty() {
            return Err(Error::unavailable(format!("device {} has no address", path)));
        }
        log::debug!("loaded device {} ({})", path, state.address);

        Ok(Self {
            inner: Rc::new(Inner {
                session,
                path,
                agent,
                state: RefCell::new(state),
                connecting: Cell::new(false),
                changed: Signal::new(),
            }),
        })
    }

    fn state(&self) -> Ref<'_, DeviceState> {
        self.inner.state.borrow()
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.inner.path
    }

    /// Returns the hardware address, formatted as `XX:XX:XX:XX:XX:XX`.
    pub fn address(&self) -> String {
        self.state().address.clone()
    }

    pub fn alias(&self) -> String {
        self.state().alias.clone()
    }

    /// Returns the name the device reports for itself, if it reports one.
    pub fn name(&self) -> Option<String> {
        self.state().name.clone()
    }

    /// Returns the alias, or the address for devices without one.
    pub fn display_name(&self) -> String {
        let state = self.state();
        if state.alias.is_empty() {
            state.address.clone()
        } else {
            state.alias.clone()
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.state().class
    }

    pub fn kind(&self) -> DeviceKind {
        self.class().kind()
    }

    /// Returns the freedesktop icon name suggested by BlueZ.
    pub fn icon(&self) -> Option<String> {
        self.state().icon.clone()
    }

    pub fn is_paired(&self) -> bool {
        self.state().paired
    }

    pub fn is_bonded(&self) -> bool {
        self.state().bonded
    }

    pub fn is_trusted(&self) -> bool {
        self.state().trusted
    }

    pub fn is_blocked(&self) -> bool {
        self.state().blocked
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Returns whether a connect, disconnect or pair call is in flight.
    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.get()
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.state();
        if state.connected {
            ConnectionStatus::Connected
        } else if state.paired {
            ConnectionStatus::NotConnected
        } else {
            ConnectionStatus::NotSetUp
        }
    }

    /// Returns the advertised service UUIDs.
    pub fn uuids(&self) -> Vec<Uuid> {
        self.state().uuids.iter().copied().collect()
    }

    /// Returns the advertised services that have a well-known name.
    pub fn services(&self) -> Vec<Service> {
        self.state()
            .uuids
            .iter()
            .filter_map(Service::from_uuid)
            .collect()
    }

    /// Returns whether files can be sent to this device.
    pub fn supports_object_push(&self) -> bool {
        self.state().uuids.contains(&Service::ObjectPush.uuid())
    }

    /// Returns how often this device was connected successfully.
    pub fn connection_count(&self) -> u32 {
        self.inner.session.history().get(self.inner.path.as_str())
    }

    pub fn priority(&self) -> DevicePriority {
        let state = self.state();
        DevicePriority {
            connected: state.connected,
            paired: state.paired,
            connections: self.connection_count(),
        }
    }

    /// Applies a batch of property changes reported by BlueZ.
    ///
    /// Subscribers are notified once if anything changed. Returns whether anything changed.
    pub fn apply_changes(&self, changes: &[(String, PropertyValue)]) -> bool {
        self.update(changes, &[])
    }

    /// Like [`Device::apply_changes`], additionally dropping the `invalidated` properties.
    ///
    /// An invalidated alias makes [`Device::display_name`] fall back to the address, an
    /// invalidated name makes [`Device::name`] return `None`.
    pub fn update(&self, changes: &[(String, PropertyValue)], invalidated: &[String]) -> bool {
        let changed = {
            let mut state = self.inner.state.borrow_mut();
            let mut changed = false;
            for (name, value) in changes {
                if let Some(prop) = DeviceProperty::parse(name, value) {
                    changed |= state.apply(prop);
                }
            }
            for name in invalidated {
                changed |= state.invalidate(name);
            }
            changed
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Registers `callback` to be invoked whenever the device's state changes.
    pub fn subscribe_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Device) + 'static,
    {
        self.inner.changed.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.changed.unsubscribe(id)
    }

    fn notify(&self) {
        self.inner.changed.emit(self);
    }

    fn begin_connecting(&self) -> Option<ConnectingGuard<'_>> {
        if self.inner.connecting.replace(true) {
            return None;
        }
        self.notify();
        Some(ConnectingGuard { device: self })
    }

    /// Connects the device's profiles.
    ///
    /// Does nothing while another connect, disconnect or pair call is in flight. Every
    /// successful connection is recorded in the session's connection history; the third one
    /// marks the device as trusted.
    pub async fn connect(&self) -> Result<()> {
        let Some(_guard) = self.begin_connecting() else {
            log::debug!("{}: busy, ignoring connect request", self.path());
            return Ok(());
        };

        log::debug!("connecting to {}", self.path());
        self.inner.session.backend().connect(self.path()).await?;

        let count = self.inner.session.history().increment(self.path().as_str());
        // The new count changes the device's priority.
        self.notify();
        if count == TRUST_AFTER_CONNECTIONS {
            if let Err(e) = self.set_trusted(true).await {
                log::warn!("failed to mark {} as trusted: {}", self.path(), e);
            }
        }
        Ok(())
    }

    /// Disconnects the device.
    ///
    /// Does nothing while another connect, disconnect or pair call is in flight.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(_guard) = self.begin_connecting() else {
            log::debug!("{}: busy, ignoring disconnect request", self.path());
            return Ok(());
        };

        log::debug!("disconnecting from {}", self.path());
        self.inner.session.backend().disconnect(self.path()).await
    }

    /// Pairs with the device.
    ///
    /// Does nothing while another connect, disconnect or pair call is in flight on this device.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::AgentBusy`][crate::ErrorKind::AgentBusy] error without
    /// contacting BlueZ if another device is pairing.
    pub async fn pair(&self) -> Result<()> {
        if self.is_connecting() {
            log::debug!("{}: busy, ignoring pair request", self.path());
            return Ok(());
        }
        let _block = self.inner.agent.block()?;
        let Some(_guard) = self.begin_connecting() else {
            return Ok(());
        };

        log::debug!("pairing with {}", self.path());
        self.inner.session.backend().pair(self.path()).await
    }

    /// Sets the `Trusted` property. The model is updated once BlueZ reports the change.
    pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
        self.inner
            .session
            .backend()
            .set_property(
                self.path(),
                DEVICE_INTERFACE,
                "Trusted",
                PropertyValue::Bool(trusted),
            )
            .await
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Device")
            .field("path", &self.inner.path)
            .field("address", &state.address)
            .field("alias", &state.alias)
            .field("paired", &state.paired)
            .field("connected", &state.connected)
            .field("connecting", &self.inner.connecting.get())
            .finish()
    }
}

/// Clears the `connecting` flag when dropped.
struct ConnectingGuard<'a> {
    device: &'a Device,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.device.inner.connecting.set(false);
        self.device.notify();
    }
}
