//! The pairing agent.
//!
//! BlueZ asks a registered *agent* whenever pairing needs a decision: confirming a passkey,
//! authorizing an incoming pairing, showing a PIN. The [`Agent`] exports an `org.bluez.Agent1`
//! object, registers it as the default agent, and turns those calls into [`AgentEvent`]s that
//! carry a [`RequestId`]. The call is answered once the application resolves the request with
//! [`Agent::confirm_pairing`], [`Agent::cancel_confirmation`], [`Agent::confirm_authorization`]
//! or [`Agent::cancel_authorization`].

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_channel::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use futures_util::{future::poll_fn, StreamExt};
use serde::{Deserialize, Serialize};
use zbus::zvariant::OwnedObjectPath;

use crate::{
    signal::{Signal, SubscriptionId},
    Error, ErrorKind, Result, Session,
};

/// The input/output capability announced to BlueZ on registration.
///
/// It decides which pairing method BlueZ picks, and thereby which agent methods get called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Capability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::DisplayOnly => "DisplayOnly",
            Capability::DisplayYesNo => "DisplayYesNo",
            Capability::KeyboardOnly => "KeyboardOnly",
            Capability::NoInputNoOutput => "NoInputNoOutput",
            Capability::KeyboardDisplay => "KeyboardDisplay",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a pairing request awaiting an answer from the application.
///
/// Ids are allocated from a per-agent counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// What a pending request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Confirm that the passkey shown on both devices matches. Answered with
    /// [`Agent::confirm_pairing`] / [`Agent::cancel_confirmation`].
    Confirmation,
    /// Allow an unknown device to pair. Answered with [`Agent::confirm_authorization`] /
    /// [`Agent::cancel_authorization`].
    Authorization,
    /// Show a PIN the user has to type on the remote device. Answered like a confirmation.
    PinDisplay,
}

/// A request that has been announced but not answered yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub device: OwnedObjectPath,
}

/// Something the pairing agent wants the application to know about or decide.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    ConfirmationRequested {
        device: OwnedObjectPath,
        request: RequestId,
        passkey: u32,
    },
    AuthorizationRequested {
        device: OwnedObjectPath,
        request: RequestId,
    },
    PinDisplayRequested {
        device: OwnedObjectPath,
        request: RequestId,
        pincode: String,
    },
    /// The passkey to type on the remote device; `entered` counts the keys typed so far.
    PasskeyDisplayed {
        device: OwnedObjectPath,
        passkey: u32,
        entered: u16,
    },
    /// BlueZ aborted the pairing; every pending request has been answered as canceled.
    Canceled,
    /// BlueZ unregistered the agent on its own.
    Released,
}

/// The error returned to BlueZ from agent methods.
#[derive(zbus::DBusError, Debug)]
#[dbus_error(prefix = "org.bluez.Error")]
pub enum AgentError {
    #[dbus_error(zbus_error)]
    ZBus(zbus::Error),
    Rejected(String),
    Canceled(String),
    Failed(String),
}

struct Pending {
    kind: RequestKind,
    device: OwnedObjectPath,
    reply: oneshot::Sender<std::result::Result<(), AgentError>>,
}

struct HandlerState {
    next_id: u64,
    pending: HashMap<RequestId, Pending>,
    events: UnboundedSender<AgentEvent>,
}

/// The bus-facing half of the agent.
///
/// This is what the exported `org.bluez.Agent1` object calls into. zbus dispatches method calls
/// on its own executor, so this type is `Send + Sync` and hands events to the [`Agent`] through
/// a channel. Each method that needs a decision parks the caller until the matching request is
/// resolved.
#[derive(Clone)]
pub struct AgentHandler {
    state: Arc<Mutex<HandlerState>>,
}

impl AgentHandler {
    fn new(events: UnboundedSender<AgentEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HandlerState {
                next_id: 0,
                pending: HashMap::new(),
                events,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `RequestConfirmation`: completes once the request is confirmed or canceled.
    pub async fn request_confirmation(
        &self,
        device: OwnedObjectPath,
        passkey: u32,
    ) -> std::result::Result<(), AgentError> {
        log::debug!("{}: confirmation requested (passkey {:06})", device, passkey);
        self.wait_for_answer(RequestKind::Confirmation, device, |device, request| {
            AgentEvent::ConfirmationRequested {
                device,
                request,
                passkey,
            }
        })
        .await
    }

    /// `RequestAuthorization`: completes once the request is allowed or denied.
    pub async fn request_authorization(
        &self,
        device: OwnedObjectPath,
    ) -> std::result::Result<(), AgentError> {
        log::debug!("{}: authorization requested", device);
        self.wait_for_answer(RequestKind::Authorization, device, |device, request| {
            AgentEvent::AuthorizationRequested { device, request }
        })
        .await
    }

    /// `DisplayPinCode`: completes once the user dismisses (or cancels) the PIN.
    pub async fn display_pin_code(
        &self,
        device: OwnedObjectPath,
        pincode: String,
    ) -> std::result::Result<(), AgentError> {
        log::debug!("{}: displaying PIN code", device);
        self.wait_for_answer(RequestKind::PinDisplay, device, |device, request| {
            AgentEvent::PinDisplayRequested {
                device,
                request,
                pincode,
            }
        })
        .await
    }

    /// `DisplayPasskey`: informational, answered immediately.
    pub fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
        self.notify(AgentEvent::PasskeyDisplayed {
            device,
            passkey,
            entered,
        });
    }

    /// `AuthorizeService`: profile connections of known devices are always accepted.
    pub fn authorize_service(
        &self,
        device: OwnedObjectPath,
        uuid: &str,
    ) -> std::result::Result<(), AgentError> {
        log::debug!("{}: authorizing service {}", device, uuid);
        Ok(())
    }

    /// `RequestPinCode`: never expected with the capabilities we announce, so it's rejected.
    pub fn request_pin_code(
        &self,
        device: OwnedObjectPath,
    ) -> std::result::Result<String, AgentError> {
        log::warn!("{}: rejecting PIN code input request", device);
        Err(AgentError::Rejected("PIN code input is not supported".into()))
    }

    /// `RequestPasskey`: rejected for the same reason as [`AgentHandler::request_pin_code`].
    pub fn request_passkey(&self, device: OwnedObjectPath) -> std::result::Result<u32, AgentError> {
        log::warn!("{}: rejecting passkey input request", device);
        Err(AgentError::Rejected("passkey input is not supported".into()))
    }

    /// `Cancel`: answers every pending request as canceled.
    pub fn cancel(&self) {
        let canceled = self.cancel_pending("pairing canceled by the remote side");
        log::debug!("agent request canceled by BlueZ ({} pending)", canceled);
        self.notify(AgentEvent::Canceled);
    }

    /// `Release`.
    pub fn release(&self) {
        log::debug!("agent released by BlueZ");
        self.notify(AgentEvent::Released);
    }

    fn notify(&self, event: AgentEvent) {
        if self.lock().events.unbounded_send(event).is_err() {
            log::warn!("dropping agent event, the agent is gone");
        }
    }

    async fn wait_for_answer(
        &self,
        kind: RequestKind,
        device: OwnedObjectPath,
        event: impl FnOnce(OwnedObjectPath, RequestId) -> AgentEvent,
    ) -> std::result::Result<(), AgentError> {
        let answer = {
            let mut state = self.lock();
            let id = RequestId(state.next_id);
            state.next_id += 1;

            let (reply, answer) = oneshot::channel();
            state.pending.insert(
                id,
                Pending {
                    kind,
                    device: device.clone(),
                    reply,
                },
            );
            if state.events.unbounded_send(event(device, id)).is_err() {
                state.pending.remove(&id);
                log::error!("{} cannot be shown, the agent is gone", id);
                return Err(AgentError::Failed("agent is not running".into()));
            }
            answer
        };

        match answer.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(AgentError::Canceled("request abandoned".into())),
        }
    }

    /// Answers the pending request `id` if it exists and is of one of the `kinds`.
    fn resolve(
        &self,
        id: RequestId,
        kinds: &[RequestKind],
        result: std::result::Result<(), AgentError>,
    ) -> bool {
        let pending = {
            let mut state = self.lock();
            match state.pending.get(&id) {
                Some(p) if kinds.contains(&p.kind) => state.pending.remove(&id),
                _ => None,
            }
        };

        match pending {
            Some(pending) => {
                log::debug!("{} for {} answered: {:?}", id, pending.device, result);
                if pending.reply.send(result).is_err() {
                    log::debug!("{}: BlueZ stopped waiting for the answer", id);
                }
                true
            }
            None => {
                log::debug!("ignoring answer to unknown or resolved {}", id);
                false
            }
        }
    }

    fn cancel_pending(&self, reason: &str) -> usize {
        let pending: Vec<Pending> = self.lock().pending.drain().map(|(_, p)| p).collect();
        let count = pending.len();
        for p in pending {
            let _ = p.reply.send(Err(AgentError::Canceled(reason.to_string())));
        }
        count
    }

    fn pending(&self) -> Vec<PendingRequest> {
        let mut list: Vec<_> = self
            .lock()
            .pending
            .iter()
            .map(|(id, p)| PendingRequest {
                id: *id,
                kind: p.kind,
                device: p.device.clone(),
            })
            .collect();
        list.sort_by_key(|p| p.id);
        list
    }
}

impl fmt::Debug for AgentHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandler")
            .field("pending", &self.lock().pending.len())
            .finish()
    }
}

/// Holds the agent's pairing slot. Dropping it frees the slot again.
///
/// Returned by [`Agent::block`].
#[derive(Debug)]
pub struct AgentBlock {
    flag: Rc<Cell<bool>>,
}

impl AgentBlock {
    /// Frees the pairing slot (same as dropping the guard).
    pub fn free(self) {}
}

impl Drop for AgentBlock {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// The application side of the pairing agent.
pub struct Agent {
    session: Session,
    path: OwnedObjectPath,
    capability: Capability,
    handler: AgentHandler,
    events: RefCell<UnboundedReceiver<AgentEvent>>,
    exported: Cell<bool>,
    registered: Cell<bool>,
    blocked: Rc<Cell<bool>>,
    signal: Signal<AgentEvent>,
}

impl Agent {
    /// Creates an unregistered agent using the path and capability from the session's config.
    pub fn new(session: Session) -> Result<Self> {
        let config = &session.config().agent;
        let path = OwnedObjectPath::try_from(config.path.as_str()).map_err(|e| {
            Error::with_kind(
                ErrorKind::Config,
                format!("invalid agent path '{}': {}", config.path, e),
            )
        })?;
        let capability = config.capability;
        let (tx, rx) = mpsc::unbounded();

        Ok(Self {
            session,
            path,
            capability,
            handler: AgentHandler::new(tx),
            events: RefCell::new(rx),
            exported: Cell::new(false),
            registered: Cell::new(false),
            blocked: Rc::new(Cell::new(false)),
            signal: Signal::new(),
        })
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    /// Exports the agent object and registers it as BlueZ' default agent.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::AlreadyRegistered`] error if the agent is already registered (or
    /// registering), or if another object is exported at the agent's path. If any bus call
    /// fails, the agent is left unregistered.
    pub async fn register(&self) -> Result<()> {
        if self.registered.replace(true) {
            return Err(Error::with_kind(
                ErrorKind::AlreadyRegistered,
                "the pairing agent is already registered",
            ));
        }

        let backend = self.session.backend();
        match backend.export_agent(&self.path, self.handler.clone()).await {
            Ok(true) => self.exported.set(true),
            Ok(false) => {
                self.registered.set(false);
                return Err(Error::with_kind(
                    ErrorKind::AlreadyRegistered,
                    format!("another object is exported at {}", self.path),
                ));
            }
            Err(e) => {
                self.registered.set(false);
                return Err(e);
            }
        }

        let res = match backend.register_agent(&self.path, self.capability).await {
            Ok(()) => backend.request_default_agent(&self.path).await,
            Err(e) => {
                self.registered.set(false);
                Err(e)
            }
        };
        if let Err(e) = res {
            log::warn!("failed to register pairing agent: {}", e);
            self.unregister().await;
            return Err(e);
        }

        log::debug!(
            "registered pairing agent at {} ({})",
            self.path,
            self.capability
        );
        Ok(())
    }

    /// Removes the agent object and tells BlueZ to forget it.
    ///
    /// Safe to call any number of times. Outstanding requests are answered as canceled. A
    /// failing `UnregisterAgent` call is logged only.
    pub async fn unregister(&self) {
        let was_registered = self.registered.replace(false);
        let canceled = self.handler.cancel_pending("the pairing agent was unregistered");
        if canceled != 0 {
            log::debug!("canceled {} pending agent requests", canceled);
        }

        let backend = self.session.backend();
        if self.exported.replace(false) {
            if let Err(e) = backend.unexport_agent(&self.path).await {
                log::warn!("failed to remove agent object {}: {}", self.path, e);
            }
        }
        if was_registered {
            if let Err(e) = backend.unregister_agent(&self.path).await {
                log::warn!("failed to unregister agent {}: {}", self.path, e);
            }
        }
    }

    /// Accepts a [`RequestKind::Confirmation`] or [`RequestKind::PinDisplay`] request.
    ///
    /// Returns `false` (and does nothing) if `request` isn't pending.
    pub fn confirm_pairing(&self, request: RequestId) -> bool {
        self.handler.resolve(
            request,
            &[RequestKind::Confirmation, RequestKind::PinDisplay],
            Ok(()),
        )
    }

    /// Declines a [`RequestKind::Confirmation`] or [`RequestKind::PinDisplay`] request; BlueZ
    /// receives `org.bluez.Error.Canceled`.
    pub fn cancel_confirmation(&self, request: RequestId) -> bool {
        self.handler.resolve(
            request,
            &[RequestKind::Confirmation, RequestKind::PinDisplay],
            Err(AgentError::Canceled(
                "pairing confirmation canceled by user".into(),
            )),
        )
    }

    /// Allows a [`RequestKind::Authorization`] request.
    pub fn confirm_authorization(&self, request: RequestId) -> bool {
        self.handler
            .resolve(request, &[RequestKind::Authorization], Ok(()))
    }

    /// Denies a [`RequestKind::Authorization`] request; BlueZ receives
    /// `org.bluez.Error.Rejected`.
    pub fn cancel_authorization(&self, request: RequestId) -> bool {
        self.handler.resolve(
            request,
            &[RequestKind::Authorization],
            Err(AgentError::Rejected("pairing rejected by user".into())),
        )
    }

    /// Returns the requests that haven't been answered yet, oldest first.
    pub fn pending(&self) -> Vec<PendingRequest> {
        self.handler.pending()
    }

    /// Claims the (process-wide) pairing slot.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::AgentBusy`] error if another pairing holds it.
    pub fn block(&self) -> Result<AgentBlock> {
        if self.blocked.replace(true) {
            return Err(Error::with_kind(
                ErrorKind::AgentBusy,
                "another device is already pairing",
            ));
        }
        Ok(AgentBlock {
            flag: self.blocked.clone(),
        })
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.get()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) + 'static,
    {
        self.signal.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.signal.unsubscribe(id)
    }

    /// Waits for the next event from the bus-facing handler without dispatching it.
    pub async fn next_event(&self) -> Option<AgentEvent> {
        poll_fn(|cx| self.events.borrow_mut().poll_next_unpin(cx)).await
    }

    /// Delivers `event` to the subscribers.
    pub fn dispatch(&self, event: &AgentEvent) {
        self.signal.emit(event);
    }

    /// Delivers all events that have already arrived. Returns how many there were.
    pub fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.events.borrow_mut().try_next();
            match next {
                Ok(Some(event)) => {
                    self.dispatch(&event);
                    count += 1;
                }
                Ok(None) | Err(_) => return count,
            }
        }
    }

    /// Delivers events to the subscribers as they arrive. Never returns while the agent lives.
    pub async fn run(&self) {
        while let Some(event) = self.next_event().await {
            self.dispatch(&event);
        }
    }

    /// Returns the handler the exported agent object forwards its calls to.
    pub fn handler(&self) -> &AgentHandler {
        &self.handler
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("path", &self.path)
            .field("capability", &self.capability)
            .field("registered", &self.registered.get())
            .field("blocked", &self.blocked.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;
    use crate::fake::{path, FakeBus};

    const DEV: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

    fn agent(bus: &FakeBus) -> Agent {
        Agent::new(bus.session()).unwrap()
    }

    fn collect(agent: &Agent) -> Rc<RefCell<Vec<AgentEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        agent.subscribe(move |ev| e.borrow_mut().push(ev.clone()));
        events
    }

    fn requested_id(event: &AgentEvent) -> RequestId {
        match event {
            AgentEvent::ConfirmationRequested { request, .. }
            | AgentEvent::AuthorizationRequested { request, .. }
            | AgentEvent::PinDisplayRequested { request, .. } => *request,
            other => panic!("not a request: {:?}", other),
        }
    }

    #[test]
    fn register_twice() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let agent = agent(&bus);

            agent.register().await.unwrap();
            assert!(agent.is_registered());
            assert_eq!(
                bus.calls_named("RegisterAgent"),
                ["RegisterAgent /org/bluedeck/agent DisplayYesNo"]
            );
            assert_eq!(bus.calls_named("RequestDefaultAgent").len(), 1);

            let err = agent.register().await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);
            assert_eq!(bus.calls_named("RegisterAgent").len(), 1);
        });
    }

    #[test]
    fn register_failure_unexports() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            bus.fail("RequestDefaultAgent");
            let agent = agent(&bus);

            agent.register().await.unwrap_err();
            assert!(!agent.is_registered());
            assert!(!bus.agent_exported());
            assert_eq!(bus.calls_named("UnregisterAgent").len(), 1);

            // Registration can be retried once the cause is gone.
            bus.heal("RequestDefaultAgent");
            agent.register().await.unwrap();
            assert!(bus.agent_exported());
        });
    }

    #[test]
    fn unregister_is_idempotent() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let agent = agent(&bus);

            agent.unregister().await;
            assert!(bus.calls_named("UnregisterAgent").is_empty());

            agent.register().await.unwrap();
            bus.fail("UnregisterAgent");
            agent.unregister().await;
            agent.unregister().await;
            assert!(!bus.agent_exported());
            assert_eq!(bus.calls_named("UnregisterAgent").len(), 1);
            assert!(!agent.is_registered());
        });
    }

    #[test]
    fn confirmation_is_answered_once() {
        let bus = FakeBus::new();
        let agent = agent(&bus);
        let events = collect(&agent);

        let mut call = agent
            .handler()
            .request_confirmation(path(DEV), 123456)
            .boxed_local();
        assert!((&mut call).now_or_never().is_none());

        assert_eq!(agent.dispatch_pending(), 1);
        let id = requested_id(&events.borrow()[0]);
        assert_eq!(
            events.borrow()[0],
            AgentEvent::ConfirmationRequested {
                device: path(DEV),
                request: id,
                passkey: 123456,
            }
        );
        assert_eq!(agent.pending().len(), 1);

        assert!(agent.confirm_pairing(id));
        assert!(!agent.confirm_pairing(id));
        assert!(!agent.cancel_confirmation(id));
        assert!(agent.pending().is_empty());

        assert!(matches!(call.now_or_never(), Some(Ok(()))));
    }

    #[test]
    fn canceled_confirmation() {
        let bus = FakeBus::new();
        let agent = agent(&bus);
        let events = collect(&agent);

        let mut call = agent.handler().request_confirmation(path(DEV), 1).boxed_local();
        assert!((&mut call).now_or_never().is_none());
        agent.dispatch_pending();
        let id = requested_id(&events.borrow()[0]);

        assert!(agent.cancel_confirmation(id));
        assert!(!agent.confirm_pairing(id));
        assert!(matches!(
            call.now_or_never(),
            Some(Err(AgentError::Canceled(_)))
        ));
    }

    #[test]
    fn authorization_needs_matching_kind() {
        let bus = FakeBus::new();
        let agent = agent(&bus);
        let events = collect(&agent);

        let mut call = agent.handler().request_authorization(path(DEV)).boxed_local();
        assert!((&mut call).now_or_never().is_none());
        agent.dispatch_pending();
        let id = requested_id(&events.borrow()[0]);

        // Pairing answers don't apply to authorization requests.
        assert!(!agent.confirm_pairing(id));
        assert!(agent.cancel_authorization(id));
        assert!(!agent.confirm_authorization(id));
        assert!(matches!(
            call.now_or_never(),
            Some(Err(AgentError::Rejected(_)))
        ));
    }

    #[test]
    fn request_ids_are_unique() {
        let bus = FakeBus::new();
        let agent = agent(&bus);
        let events = collect(&agent);

        let mut calls: Vec<_> = (0..3)
            .map(|i| agent.handler().request_confirmation(path(DEV), i).boxed_local())
            .collect();
        for call in &mut calls {
            assert!(call.now_or_never().is_none());
        }
        agent.dispatch_pending();

        let ids: Vec<_> = events.borrow().iter().map(requested_id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    }

    #[test]
    fn bluez_cancel_answers_everything() {
        let bus = FakeBus::new();
        let agent = agent(&bus);
        let events = collect(&agent);

        let mut confirm = agent.handler().request_confirmation(path(DEV), 7).boxed_local();
        let mut pin = agent
            .handler()
            .display_pin_code(path(DEV), "0000".into())
            .boxed_local();
        assert!((&mut confirm).now_or_never().is_none());
        assert!((&mut pin).now_or_never().is_none());

        agent.handler().cancel();
        agent.dispatch_pending();

        assert!(matches!(
            confirm.now_or_never(),
            Some(Err(AgentError::Canceled(_)))
        ));
        assert!(matches!(pin.now_or_never(), Some(Err(AgentError::Canceled(_)))));
        assert_eq!(events.borrow().last(), Some(&AgentEvent::Canceled));
        assert!(agent.pending().is_empty());
    }

    #[test]
    fn immediate_answers() {
        let bus = FakeBus::new();
        let agent = agent(&bus);
        let events = collect(&agent);
        let handler = agent.handler();

        handler
            .authorize_service(path(DEV), "0000110b-0000-1000-8000-00805f9b34fb")
            .unwrap();
        assert!(matches!(
            handler.request_pin_code(path(DEV)),
            Err(AgentError::Rejected(_))
        ));
        assert!(matches!(
            handler.request_passkey(path(DEV)),
            Err(AgentError::Rejected(_))
        ));
        handler.display_passkey(path(DEV), 4242, 2);

        agent.dispatch_pending();
        assert_eq!(
            *events.borrow(),
            [AgentEvent::PasskeyDisplayed {
                device: path(DEV),
                passkey: 4242,
                entered: 2,
            }]
        );
        assert!(agent.pending().is_empty());
    }

    #[test]
    fn request_fails_without_agent() {
        let bus = FakeBus::new();
        let handler = agent(&bus).handler().clone();

        let res = handler
            .request_confirmation(path(DEV), 1)
            .now_or_never()
            .unwrap();
        assert!(matches!(res, Err(AgentError::Failed(_))));
    }

    #[test]
    fn unregister_cancels_pending() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let agent = agent(&bus);
            agent.register().await.unwrap();

            let mut call = agent.handler().request_authorization(path(DEV)).boxed_local();
            assert!((&mut call).now_or_never().is_none());

            agent.unregister().await;
            assert!(matches!(call.await, Err(AgentError::Canceled(_))));
        });
    }

    #[test]
    fn block_is_exclusive() {
        let bus = FakeBus::new();
        let agent = agent(&bus);

        let block = agent.block().unwrap();
        assert!(agent.is_blocked());
        assert_eq!(agent.block().unwrap_err().kind(), ErrorKind::AgentBusy);

        block.free();
        assert!(!agent.is_blocked());
        drop(agent.block().unwrap());
        assert!(!agent.is_blocked());
    }
}
