//! Adapter, device, pairing agent and OBEX models for desktop Bluetooth settings, backed by
//! BlueZ over D-Bus.
//!
//! Everything here is meant to run on a single-threaded event loop: models are cheap
//! [`Rc`]-backed handles, state changes are delivered to subscribed callbacks, and the
//! event pumps ([`Adapter::run`], [`ObexManager::run`][obex::ObexManager::run],
//! [`Manager::run`]) are plain futures that can be spawned on any local executor.

pub mod adapter;
pub mod agent;
pub mod bus;
pub mod class;
pub mod config;
pub mod dbus;
pub mod device;
mod error;
pub mod history;
pub mod manager;
pub mod obex;
pub mod signal;
pub mod uuid;

#[cfg(test)]
mod fake;

pub use adapter::{Adapter, AdapterEvent};
pub use device::Device;
pub use error::{Error, ErrorKind, Result};
pub use manager::Manager;

use std::{fmt, rc::Rc};

use bus::Backend;
use config::Config;
use history::{ConnectionHistory, FileHistory, MemoryHistory};

/// A cloneable handle to the bus backend, the connection history and the configuration.
///
/// This type is used to construct various objects in this library.
#[derive(Clone)]
pub struct Session {
    backend: Rc<dyn Backend>,
    history: Rc<dyn ConnectionHistory>,
    config: Rc<Config>,
}

impl Session {
    /// Connects to the system bus, loads the default configuration and opens the connection
    /// history it points to.
    pub async fn new() -> Result<Self> {
        Self::with_config(Config::load_default()?).await
    }

    /// Connects to the system bus using the given configuration.
    pub async fn with_config(config: Config) -> Result<Self> {
        let backend = dbus::ZbusBackend::system().await?;
        let history: Rc<dyn ConnectionHistory> = match &config.history.path {
            Some(path) => Rc::new(FileHistory::open(path)?),
            None => Rc::new(MemoryHistory::new()),
        };
        Ok(Self::with_backend(Rc::new(backend), history, config))
    }

    /// Creates a session on top of an arbitrary [`Backend`].
    pub fn with_backend(
        backend: Rc<dyn Backend>,
        history: Rc<dyn ConnectionHistory>,
        config: Config,
    ) -> Self {
        Self {
            backend,
            history,
            config: Rc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn history(&self) -> &dyn ConnectionHistory {
        &*self.history
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        &*self.backend
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
