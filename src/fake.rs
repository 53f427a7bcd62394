//! An in-memory [`Backend`] for tests.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    path::Path,
    rc::Rc,
};

use async_trait::async_trait;
use futures_channel::{
    mpsc::{self, UnboundedSender},
    oneshot,
};
use futures_util::StreamExt;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    agent::{AgentHandler, Capability},
    bus::{
        Backend, BusEvent, EventStream, Properties, PropertyValue, RemoteObject,
        ADAPTER_INTERFACE, DEVICE_INTERFACE,
    },
    config::Config,
    history::MemoryHistory,
    Error, ErrorKind, Result, Session,
};

pub const ADAPTER: &str = "/org/bluez/hci0";

pub fn path(s: &str) -> OwnedObjectPath {
    OwnedObjectPath::try_from(s).unwrap()
}

pub fn device_path(name: &str) -> OwnedObjectPath {
    path(&format!("{}/dev_{}", ADAPTER, name))
}

/// Device1 properties with the given pairing/connection state.
pub fn device_props(alias: &str, paired: bool, connected: bool) -> Properties {
    let mut props = Properties::new();
    props.insert(
        "Address".into(),
        PropertyValue::Str(format!("00:11:22:33:44:{:02X}", alias.len())),
    );
    props.insert("Alias".into(), PropertyValue::Str(alias.into()));
    props.insert("Name".into(), PropertyValue::Str(alias.into()));
    props.insert("Class".into(), PropertyValue::U32(0x240404));
    props.insert("Icon".into(), PropertyValue::Str("audio-headset".into()));
    props.insert("Paired".into(), PropertyValue::Bool(paired));
    props.insert("Bonded".into(), PropertyValue::Bool(paired));
    props.insert("Trusted".into(), PropertyValue::Bool(false));
    props.insert("Blocked".into(), PropertyValue::Bool(false));
    props.insert("Connected".into(), PropertyValue::Bool(connected));
    props.insert(
        "UUIDs".into(),
        PropertyValue::StrList(vec!["0000110b-0000-1000-8000-00805f9b34fb".into()]),
    );
    props
}

pub fn changed(
    path: &OwnedObjectPath,
    interface: &str,
    props: &[(&str, PropertyValue)],
) -> BusEvent {
    BusEvent::PropertiesChanged {
        path: path.clone(),
        interface: interface.into(),
        changed: props
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
        invalidated: Vec::new(),
    }
}

pub fn invalidated(path: &OwnedObjectPath, interface: &str, names: &[&str]) -> BusEvent {
    BusEvent::PropertiesChanged {
        path: path.clone(),
        interface: interface.into(),
        changed: Vec::new(),
        invalidated: names.iter().map(|name| name.to_string()).collect(),
    }
}

struct Object {
    path: OwnedObjectPath,
    interfaces: Vec<(String, Properties)>,
}

#[derive(Default)]
struct Inner {
    objects: RefCell<Vec<Object>>,
    calls: RefCell<Vec<String>>,
    failing: RefCell<HashMap<String, ErrorKind>>,
    held: RefCell<HashSet<String>>,
    waiting: RefCell<Vec<(String, oneshot::Sender<()>)>>,
    agent: RefCell<Option<AgentHandler>>,
    event_senders: RefCell<Vec<UnboundedSender<BusEvent>>>,
    obex_senders: RefCell<Vec<UnboundedSender<BusEvent>>>,
    next_transfer: Cell<u32>,
}

/// A scriptable stand-in for BlueZ and obexd.
///
/// Every call is recorded as `"<Method> <args...>"`. Methods can be made to fail ([`fail`]) or
/// to block until explicitly released ([`hold`] / [`release`]).
///
/// [`fail`]: FakeBus::fail
/// [`hold`]: FakeBus::hold
/// [`release`]: FakeBus::release
#[derive(Clone, Default)]
pub struct FakeBus {
    inner: Rc<Inner>,
}

impl FakeBus {
    /// A bus with a single powered-off adapter at [`ADAPTER`].
    pub fn new() -> Self {
        let bus = Self::default();
        let mut props = Properties::new();
        props.insert("Powered".into(), PropertyValue::Bool(false));
        props.insert("Discovering".into(), PropertyValue::Bool(false));
        bus.add_object(&path(ADAPTER), ADAPTER_INTERFACE, props);
        bus
    }

    /// A bus without any adapter.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Session {
        self.session_with(Config::default())
    }

    pub fn session_with(&self, config: Config) -> Session {
        Session::with_backend(
            Rc::new(self.clone()),
            Rc::new(MemoryHistory::new()),
            config,
        )
    }

    pub fn add_object(&self, path: &OwnedObjectPath, interface: &str, props: Properties) {
        let mut objects = self.inner.objects.borrow_mut();
        match objects.iter_mut().find(|o| o.path == *path) {
            Some(obj) => obj.interfaces.push((interface.into(), props)),
            None => objects.push(Object {
                path: path.clone(),
                interfaces: vec![(interface.into(), props)],
            }),
        }
    }

    pub fn add_device(&self, path: &OwnedObjectPath, props: Properties) {
        self.add_object(path, DEVICE_INTERFACE, props);
    }

    pub fn remove_object(&self, path: &OwnedObjectPath) {
        self.inner.objects.borrow_mut().retain(|o| o.path != *path);
    }

    /// Sends `event` to every stream returned by [`Backend::events`].
    pub fn emit(&self, event: BusEvent) {
        for tx in self.inner.event_senders.borrow().iter() {
            let _ = tx.unbounded_send(event.clone());
        }
    }

    /// Sends `event` to every stream returned by [`Backend::obex_events`].
    pub fn emit_obex(&self, event: BusEvent) {
        for tx in self.inner.obex_senders.borrow().iter() {
            let _ = tx.unbounded_send(event.clone());
        }
    }

    /// Ends all event streams.
    pub fn close_streams(&self) {
        self.inner.event_senders.borrow_mut().clear();
        self.inner.obex_senders.borrow_mut().clear();
    }

    pub fn fail(&self, method: &str) {
        self.fail_with(method, ErrorKind::RemoteCallFailed);
    }

    /// Makes calls to `method` fail with an error of the given kind.
    pub fn fail_with(&self, method: &str, kind: ErrorKind) {
        self.inner.failing.borrow_mut().insert(method.into(), kind);
    }

    pub fn heal(&self, method: &str) {
        self.inner.failing.borrow_mut().remove(method);
    }

    /// Makes calls to `method` wait until [`FakeBus::release`] is called.
    pub fn hold(&self, method: &str) {
        self.inner.held.borrow_mut().insert(method.into());
    }

    /// Lets the oldest waiting call to `method` continue. Returns `false` if none was waiting.
    pub fn release(&self, method: &str) -> bool {
        let mut waiting = self.inner.waiting.borrow_mut();
        match waiting.iter().position(|(m, _)| m == method) {
            Some(i) => {
                let (_, tx) = waiting.remove(i);
                tx.send(()).is_ok()
            }
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.borrow().clone()
    }

    pub fn calls_named(&self, method: &str) -> Vec<String> {
        self.inner
            .calls
            .borrow()
            .iter()
            .filter(|c| c.split(' ').next() == Some(method))
            .cloned()
            .collect()
    }

    pub fn agent_exported(&self) -> bool {
        self.inner.agent.borrow().is_some()
    }

    async fn call(&self, method: &str, args: &[&str]) -> Result<()> {
        let mut record = method.to_string();
        for arg in args {
            record.push(' ');
            record.push_str(arg);
        }
        self.inner.calls.borrow_mut().push(record);

        if self.inner.held.borrow().contains(method) {
            let (tx, rx) = oneshot::channel();
            self.inner.waiting.borrow_mut().push((method.into(), tx));
            let _ = rx.await;
        }

        let failure = self.inner.failing.borrow().get(method).copied();
        if let Some(kind) = failure {
            return Err(Error::with_kind(kind, format!("{} failed", method)));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Backend for FakeBus {
    async fn managed_objects(&self) -> Result<Vec<RemoteObject>> {
        self.call("GetManagedObjects", &[]).await?;
        Ok(self
            .inner
            .objects
            .borrow()
            .iter()
            .map(|o| RemoteObject {
                path: o.path.clone(),
                interfaces: o.interfaces.iter().map(|(i, _)| i.clone()).collect(),
            })
            .collect())
    }

    async fn events(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.event_senders.borrow_mut().push(tx);
        Ok(rx.boxed_local())
    }

    async fn properties(&self, path: &ObjectPath<'_>, interface: &str) -> Result<Properties> {
        self.call("GetAll", &[path.as_str(), interface]).await?;
        let objects = self.inner.objects.borrow();
        objects
            .iter()
            .find(|o| o.path.as_str() == path.as_str())
            .and_then(|o| o.interfaces.iter().find(|(i, _)| i == interface))
            .map(|(_, props)| props.clone())
            .ok_or_else(|| Error::unavailable(format!("no {} at {}", interface, path)))
    }

    async fn set_property(
        &self,
        path: &ObjectPath<'_>,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let value = format!("{:?}", value);
        let property = format!("{}.{}", interface, name);
        self.call("Set", &[path.as_str(), &property, &value]).await
    }

    async fn start_discovery(&self, adapter: &ObjectPath<'_>) -> Result<()> {
        self.call("StartDiscovery", &[adapter.as_str()]).await
    }

    async fn stop_discovery(&self, adapter: &ObjectPath<'_>) -> Result<()> {
        self.call("StopDiscovery", &[adapter.as_str()]).await
    }

    async fn remove_device(
        &self,
        adapter: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
    ) -> Result<()> {
        self.call("RemoveDevice", &[adapter.as_str(), device.as_str()])
            .await
    }

    async fn connect(&self, device: &ObjectPath<'_>) -> Result<()> {
        self.call("Connect", &[device.as_str()]).await
    }

    async fn disconnect(&self, device: &ObjectPath<'_>) -> Result<()> {
        self.call("Disconnect", &[device.as_str()]).await
    }

    async fn pair(&self, device: &ObjectPath<'_>) -> Result<()> {
        self.call("Pair", &[device.as_str()]).await
    }

    async fn export_agent(&self, path: &ObjectPath<'_>, handler: AgentHandler) -> Result<bool> {
        self.call("Export", &[path.as_str()]).await?;
        let mut agent = self.inner.agent.borrow_mut();
        if agent.is_some() {
            return Ok(false);
        }
        *agent = Some(handler);
        Ok(true)
    }

    async fn unexport_agent(&self, path: &ObjectPath<'_>) -> Result<bool> {
        self.call("Unexport", &[path.as_str()]).await?;
        Ok(self.inner.agent.borrow_mut().take().is_some())
    }

    async fn register_agent(&self, path: &ObjectPath<'_>, capability: Capability) -> Result<()> {
        self.call("RegisterAgent", &[path.as_str(), capability.as_str()])
            .await
    }

    async fn request_default_agent(&self, path: &ObjectPath<'_>) -> Result<()> {
        self.call("RequestDefaultAgent", &[path.as_str()]).await
    }

    async fn unregister_agent(&self, path: &ObjectPath<'_>) -> Result<()> {
        self.call("UnregisterAgent", &[path.as_str()]).await
    }

    async fn create_obex_session(&self, address: &str) -> Result<OwnedObjectPath> {
        self.call("CreateSession", &[address]).await?;
        Ok(path("/org/bluez/obex/client/session0"))
    }

    async fn remove_obex_session(&self, session: &ObjectPath<'_>) -> Result<()> {
        self.call("RemoveSession", &[session.as_str()]).await
    }

    async fn send_file(
        &self,
        session: &ObjectPath<'_>,
        file: &Path,
    ) -> Result<(OwnedObjectPath, Properties)> {
        let file = file.display().to_string();
        self.call("SendFile", &[session.as_str(), &file]).await?;

        let n = self.inner.next_transfer.get();
        self.inner.next_transfer.set(n + 1);
        let transfer = path(&format!("{}/transfer{}", session.as_str(), n));

        let mut props = Properties::new();
        props.insert("Status".into(), PropertyValue::Str("queued".into()));
        props.insert("Size".into(), PropertyValue::U64(1000));
        props.insert("Transferred".into(), PropertyValue::U64(0));
        Ok((transfer, props))
    }

    async fn cancel_transfer(&self, transfer: &ObjectPath<'_>) -> Result<()> {
        self.call("Cancel", &[transfer.as_str()]).await
    }

    async fn obex_events(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.obex_senders.borrow_mut().push(tx);
        Ok(rx.boxed_local())
    }
}
