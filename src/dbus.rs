//! The [`Backend`] talking to BlueZ and obexd over D-Bus.

use std::{cell::RefCell, collections::HashMap, future::ready, path::Path, sync::Arc};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use zbus::{
    fdo::{
        InterfacesAdded, InterfacesRemoved, ObjectManagerProxy, PropertiesChanged,
        PropertiesProxy,
    },
    names::InterfaceName,
    zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
    CacheProperties, Connection, MatchRule, Message, MessageStream, MessageType,
};

use crate::{
    agent::{AgentError, AgentHandler, Capability},
    bus::{
        Backend, BusEvent, EventStream, Properties, PropertyValue, RemoteObject, BLUEZ_SERVICE,
        OBEX_SERVICE,
    },
    Error, Result,
};

mod private {
    use std::collections::HashMap;

    use zbus::{
        dbus_proxy,
        zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
    };

    #[dbus_proxy(
        interface = "org.bluez.Adapter1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait Adapter {
        async fn start_discovery(&self) -> zbus::Result<()>;
        async fn stop_discovery(&self) -> zbus::Result<()>;
        async fn remove_device(&self, device: &ObjectPath<'_>) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.Device1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait Device {
        async fn connect(&self) -> zbus::Result<()>;
        async fn disconnect(&self) -> zbus::Result<()>;
        async fn pair(&self) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.AgentManager1",
        default_service = "org.bluez",
        default_path = "/org/bluez"
    )]
    trait AgentManager {
        async fn register_agent(&self, agent: &ObjectPath<'_>, capability: &str)
            -> zbus::Result<()>;
        async fn request_default_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
        async fn unregister_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.obex.Client1",
        default_service = "org.bluez.obex",
        default_path = "/org/bluez/obex"
    )]
    trait ObexClient {
        async fn create_session(
            &self,
            destination: &str,
            args: HashMap<&str, Value<'_>>,
        ) -> zbus::Result<OwnedObjectPath>;
        async fn remove_session(&self, session: &ObjectPath<'_>) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.obex.ObjectPush1",
        default_service = "org.bluez.obex",
        assume_defaults = false
    )]
    trait ObjectPush {
        async fn send_file(
            &self,
            sourcefile: &str,
        ) -> zbus::Result<(OwnedObjectPath, HashMap<String, OwnedValue>)>;
    }

    #[dbus_proxy(
        interface = "org.bluez.obex.Transfer1",
        default_service = "org.bluez.obex",
        assume_defaults = false
    )]
    trait Transfer {
        async fn cancel(&self) -> zbus::Result<()>;
    }
}

use private::{
    AdapterProxy, AgentManagerProxy, DeviceProxy, ObexClientProxy, ObjectPushProxy, TransferProxy,
};

/// Reduces a D-Bus value to a [`PropertyValue`]. Returns `None` for shapes we don't track.
fn property_value(value: &Value<'_>) -> Option<PropertyValue> {
    Some(match value {
        Value::Bool(b) => PropertyValue::Bool(*b),
        Value::U16(n) => PropertyValue::U32(u32::from(*n)),
        Value::U32(n) => PropertyValue::U32(*n),
        Value::U64(n) => PropertyValue::U64(*n),
        Value::Str(s) => PropertyValue::Str(s.to_string()),
        Value::ObjectPath(p) => PropertyValue::Str(p.to_string()),
        Value::Array(array) => PropertyValue::StrList(
            array
                .get()
                .iter()
                .map(|v| match v {
                    Value::Str(s) => Some(s.to_string()),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?,
        ),
        Value::Value(inner) => return property_value(inner),
        _ => return None,
    })
}

fn properties(props: &HashMap<String, OwnedValue>) -> Properties {
    props
        .iter()
        .filter_map(|(name, value)| Some((name.clone(), property_value(value)?)))
        .collect()
}

fn dbus_value(value: PropertyValue) -> Value<'static> {
    match value {
        PropertyValue::Bool(b) => Value::from(b),
        PropertyValue::U32(n) => Value::from(n),
        PropertyValue::U64(n) => Value::from(n),
        PropertyValue::Str(s) => Value::from(s),
        PropertyValue::StrList(list) => Value::from(list),
    }
}

/// Turns an object-manager or property-change signal into a [`BusEvent`].
fn bus_event(msg: Arc<Message>) -> Option<BusEvent> {
    if let Some(added) = InterfacesAdded::from_message(msg.clone()) {
        let args = added.args().ok()?;
        return Some(BusEvent::InterfacesAdded {
            path: args.object_path.clone().into(),
            interfaces: args
                .interfaces_and_properties
                .keys()
                .map(|i| i.to_string())
                .collect(),
        });
    }
    if let Some(removed) = InterfacesRemoved::from_message(msg.clone()) {
        let args = removed.args().ok()?;
        return Some(BusEvent::InterfacesRemoved {
            path: args.object_path.clone().into(),
            interfaces: args.interfaces.iter().map(|i| i.to_string()).collect(),
        });
    }
    let path: OwnedObjectPath = msg.path()?.into();
    let changed = PropertiesChanged::from_message(msg)?;
    let args = changed.args().ok()?;
    let mut changed: Vec<_> = args
        .changed_properties
        .iter()
        .filter_map(|(name, value)| Some((name.to_string(), property_value(value)?)))
        .collect();
    changed.sort_by(|a, b| a.0.cmp(&b.0));
    Some(BusEvent::PropertiesChanged {
        path,
        interface: args.interface_name.to_string(),
        changed,
        invalidated: args
            .invalidated_properties
            .iter()
            .map(|name| name.to_string())
            .collect(),
    })
}

/// Subscribes to the object manager and to property changes of everything below `namespace`.
async fn signal_stream(
    conn: &Connection,
    service: &'static str,
    namespace: &'static str,
) -> Result<EventStream> {
    let manager = ObjectManagerProxy::builder(conn)
        .destination(service)
        .map_err(Error::from)?
        .path("/")
        .map_err(Error::from)?
        .build()
        .await
        .map_err(Error::from)?;
    let object_signals = manager.receive_all_signals().await.map_err(Error::from)?;

    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(service)
        .map_err(Error::from)?
        .interface("org.freedesktop.DBus.Properties")
        .map_err(Error::from)?
        .member("PropertiesChanged")
        .map_err(Error::from)?
        .path_namespace(namespace)
        .map_err(Error::from)?
        .build();
    let property_signals = MessageStream::for_match_rule(rule, conn, None)
        .await
        .map_err(Error::from)?
        .filter_map(|msg| ready(msg.ok()));

    Ok(stream::select(object_signals, property_signals)
        .filter_map(|msg| ready(bus_event(msg)))
        .boxed_local())
}

/// The `org.bluez.Agent1` object exported on the system bus.
struct AgentInterface {
    handler: AgentHandler,
    path: OwnedObjectPath,
}

impl AgentInterface {
    /// Passes `res` on to BlueZ. If the request couldn't be handled at all, the agent is
    /// unregistered so that BlueZ falls back to another one.
    async fn reply<T>(
        &self,
        conn: &Connection,
        res: std::result::Result<T, AgentError>,
    ) -> std::result::Result<T, AgentError> {
        if let Err(AgentError::Failed(reason)) = &res {
            log::warn!("agent request failed ({}), unregistering {}", reason, self.path);
            let unregistered = match AgentManagerProxy::new(conn).await {
                Ok(manager) => manager.unregister_agent(&self.path).await,
                Err(e) => Err(e),
            };
            if let Err(e) = unregistered {
                log::warn!("failed to unregister agent {}: {}", self.path, e);
            }
        }
        res
    }
}

#[zbus::dbus_interface(name = "org.bluez.Agent1")]
impl AgentInterface {
    fn release(&self) {
        self.handler.release();
    }

    fn request_pin_code(&self, device: OwnedObjectPath) -> std::result::Result<String, AgentError> {
        self.handler.request_pin_code(device)
    }

    async fn display_pin_code(
        &self,
        #[zbus(connection)] conn: &Connection,
        device: OwnedObjectPath,
        pincode: String,
    ) -> std::result::Result<(), AgentError> {
        let res = self.handler.display_pin_code(device, pincode).await;
        self.reply(conn, res).await
    }

    fn request_passkey(&self, device: OwnedObjectPath) -> std::result::Result<u32, AgentError> {
        self.handler.request_passkey(device)
    }

    fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
        self.handler.display_passkey(device, passkey, entered);
    }

    async fn request_confirmation(
        &self,
        #[zbus(connection)] conn: &Connection,
        device: OwnedObjectPath,
        passkey: u32,
    ) -> std::result::Result<(), AgentError> {
        let res = self.handler.request_confirmation(device, passkey).await;
        self.reply(conn, res).await
    }

    async fn request_authorization(
        &self,
        #[zbus(connection)] conn: &Connection,
        device: OwnedObjectPath,
    ) -> std::result::Result<(), AgentError> {
        let res = self.handler.request_authorization(device).await;
        self.reply(conn, res).await
    }

    fn authorize_service(
        &self,
        device: OwnedObjectPath,
        uuid: String,
    ) -> std::result::Result<(), AgentError> {
        self.handler.authorize_service(device, &uuid)
    }

    fn cancel(&self) {
        self.handler.cancel();
    }
}

/// A [`Backend`] on top of D-Bus connections.
///
/// BlueZ lives on the system bus. obexd runs per user on the session bus, which is only
/// connected to once a file transfer is attempted.
pub struct ZbusBackend {
    system: Connection,
    session: RefCell<Option<Connection>>,
}

impl ZbusBackend {
    /// Connects to the system bus.
    pub async fn system() -> Result<Self> {
        let conn = Connection::system().await.map_err(Error::from)?;
        Ok(Self::with_connection(conn))
    }

    /// Uses an existing system bus connection.
    pub fn with_connection(system: Connection) -> Self {
        Self {
            system,
            session: RefCell::new(None),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.system
    }

    async fn session_bus(&self) -> Result<Connection> {
        let cached = self.session.borrow().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = Connection::session().await.map_err(Error::from)?;
        log::debug!(
            "connected to the session bus ({})",
            conn.unique_name().map(|n| n.as_str()).unwrap_or("?")
        );
        *self.session.borrow_mut() = Some(conn.clone());
        Ok(conn)
    }

    async fn adapter(&self, path: &ObjectPath<'_>) -> Result<AdapterProxy<'static>> {
        AdapterProxy::builder(&self.system)
            .path(path.to_owned())
            .map_err(Error::from)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(Error::from)
    }

    async fn device(&self, path: &ObjectPath<'_>) -> Result<DeviceProxy<'static>> {
        DeviceProxy::builder(&self.system)
            .path(path.to_owned())
            .map_err(Error::from)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(Error::from)
    }

    async fn agent_manager(&self) -> Result<AgentManagerProxy<'static>> {
        AgentManagerProxy::new(&self.system)
            .await
            .map_err(Error::from)
    }

    async fn obex_client(&self) -> Result<ObexClientProxy<'static>> {
        let conn = self.session_bus().await?;
        ObexClientProxy::new(&conn).await.map_err(Error::from)
    }
}

#[async_trait(?Send)]
impl Backend for ZbusBackend {
    async fn managed_objects(&self) -> Result<Vec<RemoteObject>> {
        let manager = ObjectManagerProxy::builder(&self.system)
            .destination(BLUEZ_SERVICE)
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;

        let mut objects: Vec<_> = objects
            .into_iter()
            .map(|(path, interfaces)| RemoteObject {
                path,
                interfaces: interfaces.keys().map(|i| i.to_string()).collect(),
            })
            .collect();
        // The object manager replies with a dictionary; give callers a stable order.
        objects.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
        Ok(objects)
    }

    async fn events(&self) -> Result<EventStream> {
        signal_stream(&self.system, BLUEZ_SERVICE, "/org/bluez").await
    }

    async fn properties(&self, path: &ObjectPath<'_>, interface: &str) -> Result<Properties> {
        let proxy = PropertiesProxy::builder(&self.system)
            .destination(BLUEZ_SERVICE)
            .map_err(Error::from)?
            .path(path.to_owned())
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;
        let props = proxy
            .get_all(InterfaceName::from_str_unchecked(interface))
            .await
            .map_err(Error::from)?;
        Ok(properties(&props))
    }

    async fn set_property(
        &self,
        path: &ObjectPath<'_>,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Result<()> {
        log::debug!("{}: setting {}.{} to {:?}", path, interface, name, value);
        let proxy = PropertiesProxy::builder(&self.system)
            .destination(BLUEZ_SERVICE)
            .map_err(Error::from)?
            .path(path.to_owned())
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;
        proxy
            .set(
                InterfaceName::from_str_unchecked(interface),
                name,
                &dbus_value(value),
            )
            .await
            .map_err(Error::from)
    }

    async fn start_discovery(&self, adapter: &ObjectPath<'_>) -> Result<()> {
        log::debug!("{}: starting discovery", adapter);
        self.adapter(adapter)
            .await?
            .start_discovery()
            .await
            .map_err(Error::from)
    }

    async fn stop_discovery(&self, adapter: &ObjectPath<'_>) -> Result<()> {
        log::debug!("{}: stopping discovery", adapter);
        self.adapter(adapter)
            .await?
            .stop_discovery()
            .await
            .map_err(Error::from)
    }

    async fn remove_device(
        &self,
        adapter: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
    ) -> Result<()> {
        self.adapter(adapter)
            .await?
            .remove_device(device)
            .await
            .map_err(Error::from)
    }

    async fn connect(&self, device: &ObjectPath<'_>) -> Result<()> {
        self.device(device)
            .await?
            .connect()
            .await
            .map_err(Error::from)
    }

    async fn disconnect(&self, device: &ObjectPath<'_>) -> Result<()> {
        self.device(device)
            .await?
            .disconnect()
            .await
            .map_err(Error::from)
    }

    async fn pair(&self, device: &ObjectPath<'_>) -> Result<()> {
        self.device(device).await?.pair().await.map_err(Error::from)
    }

    async fn export_agent(&self, path: &ObjectPath<'_>, handler: AgentHandler) -> Result<bool> {
        let iface = AgentInterface {
            handler,
            path: path.to_owned().into(),
        };
        self.system
            .object_server()
            .at(path.to_owned(), iface)
            .await
            .map_err(Error::from)
    }

    async fn unexport_agent(&self, path: &ObjectPath<'_>) -> Result<bool> {
        self.system
            .object_server()
            .remove::<AgentInterface, _>(path.to_owned())
            .await
            .map_err(Error::from)
    }

    async fn register_agent(&self, path: &ObjectPath<'_>, capability: Capability) -> Result<()> {
        self.agent_manager()
            .await?
            .register_agent(path, capability.as_str())
            .await
            .map_err(Error::from)
    }

    async fn request_default_agent(&self, path: &ObjectPath<'_>) -> Result<()> {
        self.agent_manager()
            .await?
            .request_default_agent(path)
            .await
            .map_err(Error::from)
    }

    async fn unregister_agent(&self, path: &ObjectPath<'_>) -> Result<()> {
        self.agent_manager()
            .await?
            .unregister_agent(path)
            .await
            .map_err(Error::from)
    }

    async fn create_obex_session(&self, address: &str) -> Result<OwnedObjectPath> {
        let mut args = HashMap::new();
        args.insert("Target", Value::from("opp"));
        self.obex_client()
            .await?
            .create_session(address, args)
            .await
            .map_err(Error::from)
    }

    async fn remove_obex_session(&self, session: &ObjectPath<'_>) -> Result<()> {
        self.obex_client()
            .await?
            .remove_session(session)
            .await
            .map_err(Error::from)
    }

    async fn send_file(
        &self,
        session: &ObjectPath<'_>,
        file: &Path,
    ) -> Result<(OwnedObjectPath, Properties)> {
        let file = file
            .to_str()
            .ok_or_else(|| Error::from(format!("{} is not valid UTF-8", file.display())))?;
        let conn = self.session_bus().await?;
        let push = ObjectPushProxy::builder(&conn)
            .path(session.to_owned())
            .map_err(Error::from)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(Error::from)?;
        let (transfer, props) = push.send_file(file).await.map_err(Error::from)?;
        Ok((transfer, properties(&props)))
    }

    async fn cancel_transfer(&self, transfer: &ObjectPath<'_>) -> Result<()> {
        let conn = self.session_bus().await?;
        TransferProxy::builder(&conn)
            .path(transfer.to_owned())
            .map_err(Error::from)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(Error::from)?
            .cancel()
            .await
            .map_err(Error::from)
    }

    async fn obex_events(&self) -> Result<EventStream> {
        let conn = self.session_bus().await?;
        signal_stream(&conn, OBEX_SERVICE, "/org/bluez/obex").await
    }
}
