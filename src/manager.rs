//! The application-facing entry point.

use std::{cell::RefCell, fmt, pin::pin};

use futures_util::future::{pending, select, Either};
use zbus::zvariant::ObjectPath;

use crate::{
    signal::{Signal, SubscriptionId},
    Adapter, Error, ErrorKind, Result, Session,
};

/// Whether there is an adapter to work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// No adapter was found (or BlueZ isn't running). The application should show a disabled
    /// state rather than fail.
    Unavailable,
    Ready,
}

/// A short message about a failed user action, meant for a toast or dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub body: String,
}

impl Notice {
    fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.body)
    }
}

/// Owns the default adapter and turns the failures of user actions into [`Notice`]s.
pub struct Manager {
    session: Session,
    adapter: RefCell<Option<Adapter>>,
    notices: Signal<Notice>,
}

impl Manager {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            adapter: RefCell::new(None),
            notices: Signal::new(),
        }
    }

    /// Opens the default adapter and registers the pairing agent.
    ///
    /// Neither a missing adapter nor a failed agent registration is an error; both are reported
    /// as a [`Notice`].
    pub async fn start(&self) -> AdapterState {
        let adapter = match Adapter::open(&self.session).await {
            Ok(adapter) => adapter,
            Err(e) => {
                log::warn!("no usable Bluetooth adapter: {}", e);
                self.notify(Notice::new("No Bluetooth Adapter", "No Bluetooth adapter found"));
                return AdapterState::Unavailable;
            }
        };

        if let Err(e) = adapter.agent().register().await {
            log::error!("failed to register pairing agent: {}", e);
            self.notify(Notice::new(
                "Failed to register bluetooth agent",
                e.to_string(),
            ));
        }

        if adapter.is_powered() && self.session.config().discovery.auto_start {
            if let Err(e) = adapter.start_discovery().await {
                log::warn!("failed to start discovery: {}", e);
            }
        }

        *self.adapter.borrow_mut() = Some(adapter);
        AdapterState::Ready
    }

    pub fn state(&self) -> AdapterState {
        match &*self.adapter.borrow() {
            Some(_) => AdapterState::Ready,
            None => AdapterState::Unavailable,
        }
    }

    pub fn adapter(&self) -> Option<Adapter> {
        self.adapter.borrow().clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn subscribe_notices<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notice) + 'static,
    {
        self.notices.subscribe(callback)
    }

    pub fn unsubscribe_notices(&self, id: SubscriptionId) -> bool {
        self.notices.unsubscribe(id)
    }

    fn notify(&self, notice: Notice) {
        self.notices.emit(&notice);
    }

    fn require_adapter(&self) -> Option<Adapter> {
        let adapter = self.adapter();
        if adapter.is_none() {
            self.notify(Notice::new(
                "No Bluetooth Adapter",
                "No Bluetooth adapter available",
            ));
        }
        adapter
    }

    /// Turns the adapter on or off. Returns whether the request was accepted.
    pub async fn set_powered(&self, powered: bool) -> bool {
        let Some(adapter) = self.require_adapter() else {
            return false;
        };
        match adapter.set_powered(powered).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to set adapter power: {}", e);
                self.notify(Notice::new(
                    "Power Control Error",
                    format!("Failed to set adapter power: {}", e),
                ));
                false
            }
        }
    }

    /// Starts discovery if it isn't running, stops it otherwise.
    pub async fn toggle_discovery(&self) {
        let Some(adapter) = self.require_adapter() else {
            return;
        };
        let res = if adapter.is_discovering() {
            adapter.stop_discovery().await
        } else {
            adapter.start_discovery().await
        };
        if let Err(e) = res {
            log::error!("failed to toggle discovery: {}", e);
            self.notify(Notice::new("Discovery Error", e.to_string()));
        }
    }

    /// Does what clicking on a device row does: pairs and connects new devices, disconnects
    /// connected ones and connects the others.
    ///
    /// Failures are reported as a [`Notice`].
    pub async fn activate_device(&self, path: &ObjectPath<'_>) {
        let Some(adapter) = self.require_adapter() else {
            return;
        };
        let Some(device) = adapter.device(path) else {
            log::warn!("cannot activate unknown device {}", path);
            return;
        };

        let (action, res) = if !device.is_paired() {
            // Discovery slows pairing down.
            if let Err(e) = adapter.stop_discovery().await {
                log::warn!("failed to stop discovery: {}", e);
            }
            let res = match device.pair().await {
                Ok(()) => device.connect().await,
                Err(e) => Err(e),
            };
            ("pair with", res)
        } else if device.is_connected() {
            ("disconnect from", device.disconnect().await)
        } else {
            ("connect to", device.connect().await)
        };

        let Err(e) = res else {
            return;
        };
        if !device.is_paired() {
            if let Err(e) = adapter.start_discovery().await {
                log::warn!("failed to restart discovery: {}", e);
            }
        }

        let name = device.display_name();
        log::error!("failed to {} {}: {}", action, name, e);
        self.notify(failure_notice(action, &name, &e));
    }

    /// Removes the device's pairing ("Forget Device"). Failures are reported as a [`Notice`].
    pub async fn forget_device(&self, path: &ObjectPath<'_>) {
        let Some(adapter) = self.require_adapter() else {
            return;
        };
        if let Err(e) = adapter.remove_device(path).await {
            log::error!("failed to remove device {}: {}", path, e);
            self.notify(Notice::new("Failed to forget device", e.to_string()));
        }
    }

    /// Keeps the adapter model and OBEX transfers up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no adapter, or once BlueZ stops delivering events.
    pub async fn run(&self) -> Result<()> {
        let Some(adapter) = self.adapter() else {
            return Err(Error::unavailable("no Bluetooth adapter"));
        };
        let obex = adapter.obex();

        let adapter_run = pin!(adapter.run());
        let obex_run = pin!(async {
            if let Err(e) = obex.run().await {
                log::warn!("OBEX transfers can't be tracked: {}", e);
            }
            pending::<()>().await
        });
        match select(adapter_run, obex_run).await {
            Either::Left((res, _)) => res,
            Either::Right(((), _)) => Ok(()),
        }
    }

    /// Stops discovery, unregisters the pairing agent and aborts transfers.
    pub async fn shutdown(&self) {
        if let Some(adapter) = self.adapter() {
            adapter.shutdown().await;
        }
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("adapter", &*self.adapter.borrow())
            .finish_non_exhaustive()
    }
}

fn failure_notice(action: &str, name: &str, error: &Error) -> Notice {
    let title = match error.kind() {
        ErrorKind::Rejected => format!("Authentication failed with {}", name),
        ErrorKind::Canceled => format!("Pairing with {} was canceled", name),
        ErrorKind::AgentBusy => "Another device is pairing".to_string(),
        _ => format!("An error occurred attempting to {} {}", action, name),
    };
    Notice::new(title, error.to_string())
}
