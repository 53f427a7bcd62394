//! The boundary between the models and the bus.
//!
//! Every call the models make to BlueZ or the OBEX daemon goes through the [`Backend`] trait.
//! [`ZbusBackend`][crate::dbus::ZbusBackend] implements it on top of real D-Bus connections.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use futures_util::stream::LocalBoxStream;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    agent::{AgentHandler, Capability},
    Result,
};

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const AGENT_INTERFACE: &str = "org.bluez.Agent1";
pub const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";

pub const OBEX_SERVICE: &str = "org.bluez.obex";
pub const OBEX_CLIENT_INTERFACE: &str = "org.bluez.obex.Client1";
pub const OBEX_TRANSFER_INTERFACE: &str = "org.bluez.obex.Transfer1";

/// A D-Bus property value, reduced to the shapes BlueZ uses for the properties we track.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    Str(String),
    StrList(Vec<String>),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(n) => Some(*n),
            _ => None,
        }
    }

    /// Widens any unsigned integer value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U32(n) => Some(u64::from(*n)),
            Self::U64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Self::StrList(list) => Some(list),
            _ => None,
        }
    }
}

/// Property name → value map of one interface of a remote object.
pub type Properties = HashMap<String, PropertyValue>;

/// An object reported by BlueZ' object manager.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub path: OwnedObjectPath,
    pub interfaces: Vec<String>,
}

impl RemoteObject {
    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }
}

/// A notification delivered by the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// `InterfacesAdded` from the object manager.
    InterfacesAdded {
        path: OwnedObjectPath,
        interfaces: Vec<String>,
    },
    /// `InterfacesRemoved` from the object manager.
    InterfacesRemoved {
        path: OwnedObjectPath,
        interfaces: Vec<String>,
    },
    /// `PropertiesChanged` of one interface of one object.
    ///
    /// `invalidated` names properties that no longer have a value (eg. a device's `Name` once
    /// BlueZ forgets it).
    PropertiesChanged {
        path: OwnedObjectPath,
        interface: String,
        changed: Vec<(String, PropertyValue)>,
        invalidated: Vec<String>,
    },
}

impl BusEvent {
    pub fn path(&self) -> &OwnedObjectPath {
        match self {
            Self::InterfacesAdded { path, .. }
            | Self::InterfacesRemoved { path, .. }
            | Self::PropertiesChanged { path, .. } => path,
        }
    }
}

/// A never-ending (until the connection dies) stream of [`BusEvent`]s.
pub type EventStream = LocalBoxStream<'static, BusEvent>;

/// Returns whether `path` lies strictly below `parent` in the object tree.
pub(crate) fn is_child_path(parent: &str, path: &str) -> bool {
    path.len() > parent.len() + 1
        && path.starts_with(parent)
        && path.as_bytes()[parent.len()] == b'/'
}

/// The bus operations needed by the adapter, device, agent and OBEX models.
///
/// All methods correspond 1:1 to a BlueZ or OBEX D-Bus call (or signal subscription). Paths
/// are BlueZ object paths (`/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`, ...).
#[async_trait(?Send)]
pub trait Backend {
    /// `GetManagedObjects` on BlueZ' root object.
    async fn managed_objects(&self) -> Result<Vec<RemoteObject>>;

    /// Subscribes to object-manager and property-change signals from BlueZ.
    async fn events(&self) -> Result<EventStream>;

    /// Fetches all properties of `interface` on the object at `path`.
    async fn properties(&self, path: &ObjectPath<'_>, interface: &str) -> Result<Properties>;

    /// `org.freedesktop.DBus.Properties.Set`.
    async fn set_property(
        &self,
        path: &ObjectPath<'_>,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Result<()>;

    async fn start_discovery(&self, adapter: &ObjectPath<'_>) -> Result<()>;
    async fn stop_discovery(&self, adapter: &ObjectPath<'_>) -> Result<()>;
    async fn remove_device(&self, adapter: &ObjectPath<'_>, device: &ObjectPath<'_>)
        -> Result<()>;

    async fn connect(&self, device: &ObjectPath<'_>) -> Result<()>;
    async fn disconnect(&self, device: &ObjectPath<'_>) -> Result<()>;
    async fn pair(&self, device: &ObjectPath<'_>) -> Result<()>;

    /// Publishes the `org.bluez.Agent1` object at `path`, backed by `handler`.
    ///
    /// Returns `false` if an agent was already exported at that path.
    async fn export_agent(&self, path: &ObjectPath<'_>, handler: AgentHandler) -> Result<bool>;
    /// Removes the agent object. Returns `false` if nothing was exported at `path`.
    async fn unexport_agent(&self, path: &ObjectPath<'_>) -> Result<bool>;
    async fn register_agent(&self, path: &ObjectPath<'_>, capability: Capability) -> Result<()>;
    async fn request_default_agent(&self, path: &ObjectPath<'_>) -> Result<()>;
    async fn unregister_agent(&self, path: &ObjectPath<'_>) -> Result<()>;

    /// `CreateSession` with an Object Push target. Returns the session path.
    async fn create_obex_session(&self, address: &str) -> Result<OwnedObjectPath>;
    async fn remove_obex_session(&self, session: &ObjectPath<'_>) -> Result<()>;
    /// `SendFile` on a session. Returns the transfer path and its initial properties.
    async fn send_file(
        &self,
        session: &ObjectPath<'_>,
        file: &Path,
    ) -> Result<(OwnedObjectPath, Properties)>;
    async fn cancel_transfer(&self, transfer: &ObjectPath<'_>) -> Result<()>;
    /// Subscribes to property changes of OBEX transfers.
    async fn obex_events(&self) -> Result<EventStream>;
}
