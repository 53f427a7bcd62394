//! Sending files over OBEX Object Push.
//!
//! File transfers are handled by the OBEX daemon (`obexd`) on the session bus. A transfer runs
//! inside a session with one remote device; [`ObexManager`] creates those sessions, starts
//! transfers and reports their progress as [`TransferEvent`]s. [`FileBatch`] sends several files
//! to one device, one after another.

use std::{
    cell::{Cell, RefCell},
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};

use futures_channel::mpsc::{self, UnboundedReceiver};
use futures_util::StreamExt;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    bus::{BusEvent, EventStream, Properties, PropertyValue, OBEX_TRANSFER_INTERFACE},
    signal::{Signal, SubscriptionId},
    Error, Result, Session,
};

/// The `Status` of an OBEX transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Active,
    Suspended,
    Complete,
    Error,
}

impl TransferStatus {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "active" => Self::Active,
            "suspended" => Self::Suspended,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// A transfer that hasn't completed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub path: OwnedObjectPath,
    /// Total size in bytes; `0` if obexd doesn't know it.
    pub size: u64,
    pub transferred: u64,
    pub status: TransferStatus,
}

impl Transfer {
    fn new(path: OwnedObjectPath, props: &Properties) -> Self {
        let mut transfer = Self {
            path,
            size: 0,
            transferred: 0,
            status: TransferStatus::Queued,
        };
        transfer.update(props.iter().map(|(k, v)| (k.as_str(), v)));
        transfer
    }

    /// Applies property changes, returning whether the byte counts changed.
    fn update<'a>(&mut self, changes: impl Iterator<Item = (&'a str, &'a PropertyValue)>) -> bool {
        let mut progressed = false;
        for (name, value) in changes {
            match name {
                "Size" => {
                    if let Some(size) = value.as_u64() {
                        progressed |= self.size != size;
                        self.size = size;
                    }
                }
                "Transferred" => {
                    if let Some(n) = value.as_u64() {
                        progressed |= self.transferred != n;
                        self.transferred = n;
                    }
                }
                "Status" => match value.as_str().and_then(TransferStatus::parse) {
                    Some(status) => self.status = status,
                    None => log::debug!("{}: unexpected status {:?}", self.path, value),
                },
                _ => {}
            }
        }
        progressed
    }
}

/// Reported by [`ObexManager`] as transfers progress.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        path: OwnedObjectPath,
        transferred: u64,
        total: u64,
    },
    /// The transfer finished successfully. It is no longer tracked.
    Completed(OwnedObjectPath),
    /// The transfer failed. It is no longer tracked.
    Failed {
        path: OwnedObjectPath,
        reason: String,
    },
}

impl TransferEvent {
    pub fn path(&self) -> &OwnedObjectPath {
        match self {
            Self::Progress { path, .. } | Self::Completed(path) | Self::Failed { path, .. } => {
                path
            }
        }
    }

    /// Returns the completed fraction of the transfer, if known.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Self::Progress {
                transferred, total, ..
            } if *total != 0 => Some((*transferred as f64 / *total as f64).min(1.0)),
            Self::Progress { .. } | Self::Failed { .. } => None,
            Self::Completed(_) => Some(1.0),
        }
    }
}

struct Inner {
    session: Session,
    transfers: RefCell<Vec<Transfer>>,
    stream: RefCell<Option<EventStream>>,
    subscribed: Cell<bool>,
    signal: Signal<TransferEvent>,
}

/// Creates Object Push sessions and tracks the transfers running in them.
///
/// Transfer progress is only observed while [`ObexManager::run`] is driven (or events are fed
/// to [`ObexManager::handle_event`]).
#[derive(Clone)]
pub struct ObexManager {
    inner: Rc<Inner>,
}

impl ObexManager {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Rc::new(Inner {
                session,
                transfers: RefCell::new(Vec::new()),
                stream: RefCell::new(None),
                subscribed: Cell::new(false),
                signal: Signal::new(),
            }),
        }
    }

    /// Opens an Object Push session with the device at `address`.
    ///
    /// Returns `None` (and logs the cause) if obexd is unavailable or the device can't be
    /// reached.
    pub async fn create_session(&self, address: &str) -> Option<OwnedObjectPath> {
        match self
            .inner
            .session
            .backend()
            .create_obex_session(address)
            .await
        {
            Ok(path) => {
                log::debug!("created OBEX session {} with {}", path, address);
                Some(path)
            }
            Err(e) => {
                log::warn!("failed to create OBEX session with {}: {}", address, e);
                None
            }
        }
    }

    /// Closes a session created by [`ObexManager::create_session`].
    pub async fn remove_session(&self, session: &ObjectPath<'_>) -> Result<()> {
        log::debug!("removing OBEX session {}", session);
        self.inner
            .session
            .backend()
            .remove_obex_session(session)
            .await
    }

    /// Starts sending `file` in `session` and returns the path of the new transfer.
    ///
    /// Returns `None` (and logs the cause) if obexd refuses the transfer.
    pub async fn send_file_with_session(
        &self,
        session: &ObjectPath<'_>,
        file: &Path,
    ) -> Option<OwnedObjectPath> {
        self.subscribe_bus().await;

        let backend = self.inner.session.backend();
        match backend.send_file(session, file).await {
            Ok((path, props)) => {
                log::debug!("sending {} as {}", file.display(), path);
                self.inner
                    .transfers
                    .borrow_mut()
                    .push(Transfer::new(path.clone(), &props));
                Some(path)
            }
            Err(e) => {
                log::warn!("failed to send {}: {}", file.display(), e);
                None
            }
        }
    }

    /// Asks obexd to abort the transfer at `path`. Returns `false` if it isn't tracked.
    ///
    /// The transfer is forgotten right away; a failing `Cancel` call is only logged.
    pub async fn cancel_transfer(&self, path: &ObjectPath<'_>) -> bool {
        let removed = self.take(path);
        if removed.is_none() {
            return false;
        }
        log::debug!("canceling transfer {}", path);
        if let Err(e) = self.inner.session.backend().cancel_transfer(path).await {
            log::warn!("failed to cancel transfer {}: {}", path, e);
        }
        true
    }

    /// Cancels every tracked transfer.
    pub async fn destroy(&self) {
        let paths: Vec<_> = self
            .inner
            .transfers
            .borrow()
            .iter()
            .map(|t| t.path.clone())
            .collect();
        for path in paths {
            self.cancel_transfer(&path).await;
        }
    }

    /// Returns the transfers that are still running.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.transfers.borrow().clone()
    }

    pub fn transfer(&self, path: &ObjectPath<'_>) -> Option<Transfer> {
        self.inner
            .transfers
            .borrow()
            .iter()
            .find(|t| t.path.as_str() == path.as_str())
            .cloned()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + 'static,
    {
        self.inner.signal.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.signal.unsubscribe(id)
    }

    fn take(&self, path: &ObjectPath<'_>) -> Option<Transfer> {
        let mut transfers = self.inner.transfers.borrow_mut();
        let i = transfers
            .iter()
            .position(|t| t.path.as_str() == path.as_str())?;
        Some(transfers.remove(i))
    }

    /// Updates tracked transfers from an obexd event. Events for other objects are ignored.
    pub fn handle_event(&self, event: &BusEvent) {
        match event {
            BusEvent::PropertiesChanged {
                path,
                interface,
                changed,
                ..
            } if interface == OBEX_TRANSFER_INTERFACE => {
                let update = {
                    let mut transfers = self.inner.transfers.borrow_mut();
                    transfers.iter_mut().find(|t| t.path == *path).map(|t| {
                        let progressed =
                            t.update(changed.iter().map(|(k, v)| (k.as_str(), v)));
                        (progressed, t.clone())
                    })
                };
                let Some((progressed, transfer)) = update else {
                    return;
                };

                if progressed {
                    self.inner.signal.emit(&TransferEvent::Progress {
                        path: path.clone(),
                        transferred: transfer.transferred,
                        total: transfer.size,
                    });
                }
                match transfer.status {
                    TransferStatus::Complete => {
                        self.take(path);
                        log::debug!("transfer {} completed", path);
                        self.inner
                            .signal
                            .emit(&TransferEvent::Completed(path.clone()));
                    }
                    TransferStatus::Error => {
                        self.fail(path, "the transfer was aborted");
                    }
                    _ => {}
                }
            }
            BusEvent::InterfacesRemoved { path, interfaces }
                if interfaces.iter().any(|i| i == OBEX_TRANSFER_INTERFACE) =>
            {
                // obexd reports completion before removing the object, so a tracked transfer
                // disappearing here never finished.
                self.fail(path, "the transfer disappeared");
            }
            _ => {}
        }
    }

    fn fail(&self, path: &OwnedObjectPath, reason: &str) {
        if self.take(path).is_some() {
            log::warn!("transfer {} failed: {}", path, reason);
            self.inner.signal.emit(&TransferEvent::Failed {
                path: path.clone(),
                reason: reason.to_string(),
            });
        }
    }

    async fn subscribe_bus(&self) {
        if self.inner.subscribed.get() {
            return;
        }
        match self.inner.session.backend().obex_events().await {
            Ok(stream) => {
                *self.inner.stream.borrow_mut() = Some(stream);
                self.inner.subscribed.set(true);
            }
            Err(e) => log::warn!("failed to listen to OBEX transfer changes: {}", e),
        }
    }

    /// Processes obexd events until the connection to obexd is lost.
    pub async fn run(&self) -> Result<()> {
        let stored = self.inner.stream.borrow_mut().take();
        let mut stream = match stored {
            Some(stream) => stream,
            None => {
                let stream = self.inner.session.backend().obex_events().await?;
                self.inner.subscribed.set(true);
                stream
            }
        };

        while let Some(event) = stream.next().await {
            self.handle_event(&event);
        }
        self.inner.subscribed.set(false);
        Err(Error::unavailable("OBEX event stream ended"))
    }
}

impl fmt::Debug for ObexManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObexManager")
            .field("transfers", &*self.inner.transfers.borrow())
            .finish_non_exhaustive()
    }
}

/// Where a [`FileBatch`] is at.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchState {
    /// [`FileBatch::start`] hasn't been called yet.
    Idle,
    /// The file at `index` is being sent.
    Sending {
        index: usize,
        transfer: OwnedObjectPath,
    },
    /// Sending the file at `index` failed. The batch waits for [`FileBatch::retry`] or
    /// [`FileBatch::cancel`].
    Failed { index: usize, reason: String },
    /// All files have been sent and the session is closed.
    Finished,
    /// The batch was canceled and the session is closed.
    Canceled,
}

/// Sends a list of files to one device, one at a time, over a single session.
pub struct FileBatch {
    obex: ObexManager,
    session: OwnedObjectPath,
    files: Vec<PathBuf>,
    index: usize,
    sent: usize,
    progress: Option<f64>,
    state: BatchState,
    closed: bool,
    events: UnboundedReceiver<TransferEvent>,
    subscription: SubscriptionId,
}

impl FileBatch {
    /// Opens a session with the device at `address`.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Unavailable`][crate::ErrorKind::Unavailable] error if no session
    /// could be established.
    pub async fn open(obex: &ObexManager, address: &str, files: Vec<PathBuf>) -> Result<Self> {
        let session = obex.create_session(address).await.ok_or_else(|| {
            Error::unavailable(format!("could not establish a connection to {}", address))
        })?;

        let (tx, rx) = mpsc::unbounded();
        let subscription = obex.subscribe(move |event| {
            let _ = tx.unbounded_send(event.clone());
        });

        Ok(Self {
            obex: obex.clone(),
            session,
            files,
            index: 0,
            sent: 0,
            progress: None,
            state: BatchState::Idle,
            closed: false,
            events: rx,
            subscription,
        })
    }

    pub fn session(&self) -> &OwnedObjectPath {
        &self.session
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Returns the file that is being sent (or failed to send).
    pub fn current_file(&self) -> Option<&Path> {
        self.files.get(self.index).map(PathBuf::as_path)
    }

    /// Returns the completed fraction of the current file, if known.
    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    /// Returns how many files have been sent successfully.
    pub fn sent(&self) -> usize {
        self.sent
    }

    fn is_done(&self) -> bool {
        matches!(self.state, BatchState::Finished | BatchState::Canceled)
    }

    /// Starts sending the first file.
    pub async fn start(&mut self) -> &BatchState {
        if self.state == BatchState::Idle {
            self.send_current().await;
        }
        &self.state
    }

    /// Sends the file that failed again, then continues with the rest.
    pub async fn retry(&mut self) -> &BatchState {
        if let BatchState::Failed { index, .. } = self.state {
            log::debug!("retrying {}", self.files[index].display());
            self.send_current().await;
        }
        &self.state
    }

    /// Aborts the current transfer, skips the remaining files and closes the session.
    pub async fn cancel(&mut self) {
        if self.is_done() {
            return;
        }
        if let BatchState::Sending { transfer, .. } = &self.state {
            let transfer = transfer.clone();
            self.obex.cancel_transfer(&transfer).await;
        }
        self.state = BatchState::Canceled;
        self.finish().await;
    }

    /// Closes the session. Further transfers are impossible afterwards.
    pub async fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.obex.remove_session(&self.session).await {
            log::warn!("failed to clean up OBEX session {}: {}", self.session, e);
        }
    }

    async fn send_current(&mut self) {
        // Entries without a path can't be sent.
        while self
            .files
            .get(self.index)
            .map_or(false, |f| f.as_os_str().is_empty())
        {
            self.index += 1;
        }

        if self.index >= self.files.len() {
            log::debug!("sent {} files over {}", self.sent, self.session);
            self.state = BatchState::Finished;
            self.finish().await;
            return;
        }

        self.progress = Some(0.0);
        let file = self.files[self.index].clone();
        self.state = match self.obex.send_file_with_session(&self.session, &file).await {
            Some(transfer) => BatchState::Sending {
                index: self.index,
                transfer,
            },
            None => BatchState::Failed {
                index: self.index,
                reason: format!("could not start the transfer of {}", file.display()),
            },
        };
    }

    /// Reacts to an event of the [`ObexManager`]. Events of other transfers are ignored.
    pub async fn handle_event(&mut self, event: &TransferEvent) -> &BatchState {
        let current = match &self.state {
            BatchState::Sending { transfer, .. } if transfer == event.path() => {
                Some(transfer.clone())
            }
            _ => None,
        };
        let Some(current) = current else {
            return &self.state;
        };

        match event {
            TransferEvent::Progress { .. } => self.progress = event.fraction(),
            TransferEvent::Completed(_) => {
                self.progress = Some(1.0);
                self.sent += 1;
                self.index += 1;
                self.send_current().await;
            }
            TransferEvent::Failed { reason, .. } => {
                log::debug!("{} failed, waiting for retry", current);
                self.state = BatchState::Failed {
                    index: self.index,
                    reason: reason.clone(),
                };
            }
        }
        &self.state
    }

    /// Handles all events that have arrived so far.
    pub async fn process_pending(&mut self) -> &BatchState {
        while let Ok(Some(event)) = self.events.try_next() {
            self.handle_event(&event).await;
        }
        &self.state
    }

    /// Waits until the batch finishes or a file fails to send.
    ///
    /// Requires the [`ObexManager`] to be driven concurrently.
    pub async fn wait(&mut self) -> &BatchState {
        while let BatchState::Sending { .. } = self.state {
            match self.events.next().await {
                Some(event) => {
                    self.handle_event(&event).await;
                }
                None => break,
            }
        }
        &self.state
    }
}

impl Drop for FileBatch {
    fn drop(&mut self) {
        self.obex.unsubscribe(self.subscription);
    }
}

impl fmt::Debug for FileBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBatch")
            .field("session", &self.session)
            .field("files", &self.files)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{changed, path, FakeBus};

    const ADDRESS: &str = "00:11:22:33:44:55";

    fn transfer_changed(path: &OwnedObjectPath, props: &[(&str, PropertyValue)]) -> BusEvent {
        changed(path, OBEX_TRANSFER_INTERFACE, props)
    }

    fn collect(obex: &ObexManager) -> Rc<RefCell<Vec<TransferEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        obex.subscribe(move |ev| e.borrow_mut().push(ev.clone()));
        events
    }

    #[test]
    fn session_lifecycle() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());

            let session = obex.create_session(ADDRESS).await.unwrap();
            assert_eq!(bus.calls_named("CreateSession"), [format!("CreateSession {}", ADDRESS)]);
            obex.remove_session(&session).await.unwrap();

            bus.fail("CreateSession");
            assert_eq!(obex.create_session(ADDRESS).await, None);
            bus.fail("RemoveSession");
            obex.remove_session(&session).await.unwrap_err();
        });
    }

    #[test]
    fn progress_and_completion() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let events = collect(&obex);
            let session = obex.create_session(ADDRESS).await.unwrap();

            let transfer = obex
                .send_file_with_session(&session, Path::new("/tmp/photo.jpg"))
                .await
                .unwrap();
            let tracked = obex.transfer(&transfer).unwrap();
            assert_eq!(tracked.status, TransferStatus::Queued);
            assert_eq!(tracked.size, 1000);

            obex.handle_event(&transfer_changed(
                &transfer,
                &[
                    ("Status", PropertyValue::Str("active".into())),
                    ("Transferred", PropertyValue::U64(500)),
                ],
            ));
            obex.handle_event(&transfer_changed(
                &transfer,
                &[("Transferred", PropertyValue::U64(1000))],
            ));
            let complete = transfer_changed(
                &transfer,
                &[("Status", PropertyValue::Str("complete".into()))],
            );
            obex.handle_event(&complete);
            obex.handle_event(&complete);

            let events = events.borrow();
            let fractions: Vec<_> = events.iter().map(TransferEvent::fraction).collect();
            assert_eq!(fractions, [Some(0.5), Some(1.0), Some(1.0)]);
            assert_eq!(events[2], TransferEvent::Completed(transfer.clone()));
            assert_eq!(events.len(), 3);
            assert!(obex.transfers().is_empty());
        });
    }

    #[test]
    fn failure() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let events = collect(&obex);
            let session = obex.create_session(ADDRESS).await.unwrap();
            let transfer = obex
                .send_file_with_session(&session, Path::new("/tmp/a.txt"))
                .await
                .unwrap();

            obex.handle_event(&transfer_changed(
                &transfer,
                &[("Status", PropertyValue::Str("error".into()))],
            ));
            assert!(matches!(
                &events.borrow()[..],
                [TransferEvent::Failed { path, .. }] if *path == transfer
            ));
            assert!(obex.transfers().is_empty());
            let failed = TransferEvent::Failed {
                path: transfer,
                reason: String::new(),
            };
            assert_eq!(failed.fraction(), None);
        });
    }

    #[test]
    fn untracked_transfers_are_ignored() {
        let bus = FakeBus::new();
        let obex = ObexManager::new(bus.session());
        let events = collect(&obex);
        let stranger = path("/org/bluez/obex/client/session9/transfer9");

        obex.handle_event(&transfer_changed(
            &stranger,
            &[
                ("Transferred", PropertyValue::U64(10)),
                ("Status", PropertyValue::Str("complete".into())),
            ],
        ));
        obex.handle_event(&BusEvent::InterfacesRemoved {
            path: stranger,
            interfaces: vec![OBEX_TRANSFER_INTERFACE.into()],
        });
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn cancel() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let events = collect(&obex);
            let session = obex.create_session(ADDRESS).await.unwrap();
            let transfer = obex
                .send_file_with_session(&session, Path::new("/tmp/a.txt"))
                .await
                .unwrap();

            bus.fail("Cancel");
            assert!(obex.cancel_transfer(&transfer).await);
            assert!(!obex.cancel_transfer(&transfer).await);
            assert_eq!(bus.calls_named("Cancel").len(), 1);
            assert!(obex.transfers().is_empty());

            // A late completion of the canceled transfer goes unnoticed.
            obex.handle_event(&transfer_changed(
                &transfer,
                &[("Status", PropertyValue::Str("complete".into()))],
            ));
            assert!(events.borrow().is_empty());
        });
    }

    #[test]
    fn destroy_cancels_everything() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let session = obex.create_session(ADDRESS).await.unwrap();
            for file in ["/tmp/a", "/tmp/b"] {
                obex.send_file_with_session(&session, Path::new(file))
                    .await
                    .unwrap();
            }

            obex.destroy().await;
            assert_eq!(bus.calls_named("Cancel").len(), 2);
            assert!(obex.transfers().is_empty());
        });
    }

    #[test]
    fn send_failure() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let session = obex.create_session(ADDRESS).await.unwrap();
            bus.fail("SendFile");
            assert_eq!(
                obex.send_file_with_session(&session, Path::new("/tmp/a"))
                    .await,
                None
            );
            assert!(obex.transfers().is_empty());
        });
    }

    #[test]
    fn run_ends_with_stream() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let events = collect(&obex);
            let session = obex.create_session(ADDRESS).await.unwrap();
            let transfer = obex
                .send_file_with_session(&session, Path::new("/tmp/a"))
                .await
                .unwrap();

            bus.emit_obex(transfer_changed(
                &transfer,
                &[("Status", PropertyValue::Str("complete".into()))],
            ));
            bus.close_streams();
            obex.run().await.unwrap_err();
            assert_eq!(*events.borrow(), [TransferEvent::Completed(transfer)]);
        });
    }

    fn complete(path: &OwnedObjectPath) -> BusEvent {
        transfer_changed(path, &[("Status", PropertyValue::Str("complete".into()))])
    }

    fn sending(batch: &FileBatch) -> OwnedObjectPath {
        match batch.state() {
            BatchState::Sending { transfer, .. } => transfer.clone(),
            other => panic!("not sending: {:?}", other),
        }
    }

    #[test]
    fn batch_sends_sequentially() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let files = vec![PathBuf::from("/tmp/a"), PathBuf::new(), PathBuf::from("/tmp/b")];
            let mut batch = FileBatch::open(&obex, ADDRESS, files).await.unwrap();
            assert_eq!(batch.state(), &BatchState::Idle);

            batch.start().await;
            let first = sending(&batch);
            assert_eq!(bus.calls_named("SendFile").len(), 1);

            obex.handle_event(&transfer_changed(
                &first,
                &[("Transferred", PropertyValue::U64(250))],
            ));
            batch.process_pending().await;
            assert_eq!(batch.progress(), Some(0.25));

            obex.handle_event(&complete(&first));
            batch.process_pending().await;
            let second = sending(&batch);
            assert_ne!(first, second);
            assert_eq!(batch.current_file(), Some(Path::new("/tmp/b")));
            assert_eq!(
                bus.calls_named("SendFile")[1],
                format!("SendFile {} /tmp/b", batch.session())
            );

            obex.handle_event(&complete(&second));
            batch.process_pending().await;
            assert_eq!(batch.state(), &BatchState::Finished);
            assert_eq!(batch.sent(), 2);
            assert_eq!(bus.calls_named("RemoveSession").len(), 1);
        });
    }

    #[test]
    fn batch_pauses_on_failure() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let files = vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")];
            let mut batch = FileBatch::open(&obex, ADDRESS, files).await.unwrap();

            bus.fail("SendFile");
            batch.start().await;
            assert!(matches!(batch.state(), BatchState::Failed { index: 0, .. }));

            bus.heal("SendFile");
            batch.retry().await;
            let first = sending(&batch);
            obex.handle_event(&transfer_changed(
                &first,
                &[("Status", PropertyValue::Str("error".into()))],
            ));
            batch.process_pending().await;
            assert!(matches!(batch.state(), BatchState::Failed { index: 0, .. }));
            assert_eq!(bus.calls_named("SendFile").len(), 2);

            batch.retry().await;
            let again = sending(&batch);
            // The failed transfer's late events don't affect the retry.
            obex.handle_event(&complete(&first));
            batch.process_pending().await;
            assert_eq!(sending(&batch), again);

            obex.handle_event(&complete(&again));
            batch.process_pending().await;
            assert_eq!(batch.current_file(), Some(Path::new("/tmp/b")));
            assert!(bus.calls_named("RemoveSession").is_empty());
        });
    }

    #[test]
    fn batch_cancel() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            let obex = ObexManager::new(bus.session());
            let files = vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")];
            let mut batch = FileBatch::open(&obex, ADDRESS, files).await.unwrap();
            batch.start().await;
            let transfer = sending(&batch);

            batch.cancel().await;
            batch.cancel().await;
            assert_eq!(batch.state(), &BatchState::Canceled);
            assert_eq!(bus.calls_named("Cancel"), [format!("Cancel {}", transfer)]);
            assert_eq!(bus.calls_named("RemoveSession").len(), 1);
            assert_eq!(bus.calls_named("SendFile").len(), 1);
        });
    }

    #[test]
    fn batch_needs_session() {
        pollster::block_on(async {
            let bus = FakeBus::new();
            bus.fail("CreateSession");
            let obex = ObexManager::new(bus.session());
            let err = FileBatch::open(&obex, ADDRESS, vec![PathBuf::from("/tmp/a")])
                .await
                .unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Unavailable);
        });
    }
}
