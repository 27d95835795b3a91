//! The client session: one ordered pipeline from socket frames to the view.
//!
//! ```text
//!  ConnectionEvent ──▸ decode ──▸ [suppress?] ──▸ apply (offload) ──▸ cache ──▸ View
//!        ▲                                                                      │
//!        │                 dispatch / navigate / location change ◂── host ◂─────┘
//!        └──────────────── EventDispatcher ◂────────────┘
//! ```
//!
//! Frames are handled one at a time: the next frame is not decoded until the
//! previous one has been applied, so intern definitions and patches always
//! land in receipt order.

use canopy_core::{PatchOp, UiNode};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::client::{ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState, EventSink};
use crate::config::SessionConfig;
use crate::decoder::{Decoded, WireDecoder};
use crate::dispatch::{DispatchOptions, EventDispatcher};
use crate::navigation::{page_for_path, page_path, LocationSync, NavigationReconciler};
use crate::offload::{OffloadStats, PatchOffloader};
use crate::protocol::ApplicationError;

/// What the rendering consumer sees.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    /// Current tree; `None` until the first full tree arrives.
    pub tree: Option<Arc<UiNode>>,
    /// Revision of the last applied (or discarded) server message.
    pub rev: u64,
    pub status: ConnectionState,
    /// Last application error, shown over the tree.
    pub error: Option<ApplicationError>,
    /// Page being fetched after a navigation without cached content.
    pub loading: Option<usize>,
}

impl Default for View {
    fn default() -> Self {
        Self {
            tree: None,
            rev: 0,
            status: ConnectionState::Disconnected,
            error: None,
            loading: None,
        }
    }
}

/// Host requests, for hosts that drive the session from another task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Dispatch {
        id: String,
        value: Value,
        options: DispatchOptions,
    },
    Navigate(usize),
    LocationChanged(String),
}

/// How a navigation updates the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocationUpdate {
    Push,
    Replace,
    /// The location already changed (back/forward).
    Keep,
}

pub struct Session<S: EventSink + 'static> {
    id: Uuid,
    decoder: WireDecoder,
    offloader: PatchOffloader,
    dispatcher: EventDispatcher<S>,
    navigation: NavigationReconciler,
    location: Arc<dyn LocationSync>,
    /// Location read at creation; consumed by the first full tree.
    startup_path: Option<String>,
    view: watch::Sender<View>,
    runtime_tx: mpsc::UnboundedSender<Map<String, Value>>,
    runtime_rx: Option<mpsc::UnboundedReceiver<Map<String, Value>>>,
}

impl<S: EventSink + 'static> Session<S> {
    pub fn new(config: &SessionConfig, sink: S, location: Arc<dyn LocationSync>) -> Self {
        let id = Uuid::new_v4();
        let startup_path = location.current();
        let (view, _) = watch::channel(View::default());
        let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
        log::info!("[{id}] Session created at '{startup_path}'");

        Self {
            id,
            decoder: WireDecoder::new(&config.decoder),
            offloader: PatchOffloader::new(config.offload.clone()),
            dispatcher: EventDispatcher::new(sink, &config.dispatch),
            navigation: NavigationReconciler::new(config.navigation.clone()),
            location,
            startup_path: Some(startup_path),
            view,
            runtime_tx,
            runtime_rx: Some(runtime_rx),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribe to view updates.
    pub fn view(&self) -> watch::Receiver<View> {
        self.view.subscribe()
    }

    /// Snapshot of the current view.
    pub fn current_view(&self) -> View {
        self.view.borrow().clone()
    }

    /// Take the `runtime_event` receiver (can only be called once).
    pub fn take_runtime_rx(&mut self) -> Option<mpsc::UnboundedReceiver<Map<String, Value>>> {
        self.runtime_rx.take()
    }

    pub fn dispatcher(&self) -> &EventDispatcher<S> {
        &self.dispatcher
    }

    pub fn navigation(&self) -> &NavigationReconciler {
        &self.navigation
    }

    pub fn offload_stats(&self) -> OffloadStats {
        self.offloader.stats()
    }

    /// Consume connection events until the channel closes.
    pub async fn run(&mut self, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        self.shutdown();
    }

    /// Like [`run`](Self::run), also serving host commands between frames.
    pub async fn run_with_commands(
        &mut self,
        mut events: mpsc::Receiver<ConnectionEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(command) = commands.recv() => self.handle_command(command),
            }
        }
        self.shutdown();
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Dispatch { id, value, options } => self.dispatch(&id, value, options),
            SessionCommand::Navigate(page) => self.navigate(page),
            SessionCommand::LocationChanged(path) => self.on_location_changed(&path),
        }
    }

    /// Process one connection event to completion.
    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Status(status) => {
                if status == ConnectionState::Connected {
                    self.decoder.reset_epoch();
                }
                log::debug!("[{}] Connection {status:?}", self.id);
                self.view.send_modify(|view| view.status = status);
            }
            ConnectionEvent::Frame(raw) => self.handle_frame(&raw).await,
        }
    }

    async fn handle_frame(&mut self, raw: &str) {
        let decoded = match self.decoder.decode(raw).await {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("[{}] Dropping message: {e}", self.id);
                return;
            }
        };

        match decoded {
            Decoded::FullTree { rev, tree } => self.on_full_tree(rev, tree),
            Decoded::Patch { rev, ops } => self.on_patch(rev, ops).await,
            Decoded::Error(error) => {
                log::info!("[{}] Application error: {}", self.id, error.message);
                self.view.send_modify(|view| view.error = Some(error));
            }
            Decoded::RuntimeEvent(fields) => {
                if self.runtime_tx.send(fields).is_err() {
                    log::debug!("[{}] Runtime event dropped, no receiver", self.id);
                }
            }
        }
    }

    fn on_full_tree(&mut self, rev: u64, tree: Arc<UiNode>) {
        log::debug!("[{}] Full tree rev {rev}", self.id);
        let page = self.navigation.observe_full(&tree);
        let loading = self.navigation.loading();
        self.view.send_modify(|view| {
            view.tree = Some(tree.clone());
            view.rev = rev;
            view.error = None;
            view.loading = loading;
        });

        if let Some(path) = self.startup_path.take() {
            let labels = self.navigation.config().page_labels(&tree);
            if let Some(target) = page_for_path(&labels, &path) {
                if Some(target) != page {
                    log::info!("[{}] Restoring page {target} from '{path}'", self.id);
                    self.navigate_to(target, LocationUpdate::Replace);
                    return;
                }
            }
        }
        self.sync_location(&tree, page);
    }

    async fn on_patch(&mut self, rev: u64, ops: Vec<PatchOp>) {
        if self.navigation.take_suppressed() {
            log::debug!(
                "[{}] Discarding patch rev {rev} ({} ops) after cached navigation",
                self.id,
                ops.len()
            );
            self.view.send_modify(|view| view.rev = rev);
            return;
        }

        let Some(base) = self.view.borrow().tree.clone() else {
            log::warn!("[{}] Dropping patch rev {rev}: no tree yet", self.id);
            return;
        };

        log::debug!("[{}] Patch rev {rev} ({} ops)", self.id, ops.len());
        let next = self.offloader.apply_async(&base, &ops).await;
        let page = self.navigation.observe_patch(&next, &ops);
        let loading = self.navigation.loading();
        self.view.send_modify(|view| {
            view.tree = Some(next.clone());
            view.rev = rev;
            view.loading = loading;
        });

        // While a page is loading the location already names it.
        if loading.is_none() {
            self.sync_location(&next, page);
        }
    }

    /// Point the location at the page the tree shows, without history.
    fn sync_location(&self, tree: &Arc<UiNode>, page: Option<usize>) {
        let Some(page) = page else { return };
        let labels = self.navigation.config().page_labels(tree);
        if page_for_path(&labels, &self.location.current()) != Some(page) {
            self.location.replace(&page_path(&labels, page));
        }
    }

    /// Send a widget event. Events for the navigation control navigate.
    pub fn dispatch(&mut self, id: &str, value: Value, options: DispatchOptions) {
        if id == self.navigation.config().control_id {
            match value.as_u64().and_then(|page| usize::try_from(page).ok()) {
                Some(page) => self.navigate(page),
                None => log::warn!("[{}] Ignoring navigation to {value}", self.id),
            }
            return;
        }
        self.dispatcher.dispatch(id, value, options);
    }

    /// User navigation to `page`.
    pub fn navigate(&mut self, page: usize) {
        self.navigate_to(page, LocationUpdate::Push);
    }

    /// Back/forward: the location already changed to `path`.
    pub fn on_location_changed(&mut self, path: &str) {
        let Some(tree) = self.view.borrow().tree.clone() else {
            self.startup_path = Some(path.to_string());
            return;
        };

        let config = self.navigation.config();
        let labels = config.page_labels(&tree);
        match page_for_path(&labels, path) {
            Some(page) if Some(page) != config.selected_page(&tree) => {
                self.navigate_to(page, LocationUpdate::Keep);
            }
            Some(_) => {}
            None => log::debug!("[{}] Location '{path}' names no page", self.id),
        }
    }

    fn navigate_to(&mut self, page: usize, update: LocationUpdate) {
        self.dispatcher.flush();

        let current = self.view.borrow().tree.clone();
        if let Some(tree) = current {
            let plan = self.navigation.begin(&tree, page);

            let labels = self.navigation.config().page_labels(&plan.tree);
            let path = page_path(&labels, page);
            match update {
                LocationUpdate::Push if self.location.current() != path => self.location.push(&path),
                LocationUpdate::Replace => self.location.replace(&path),
                _ => {}
            }

            let loading = self.navigation.loading();
            self.view.send_modify(|view| {
                view.tree = Some(plan.tree);
                view.loading = loading;
            });
        }

        let control_id = self.navigation.config().control_id.clone();
        self.dispatcher
            .dispatch(&control_id, Value::from(page), DispatchOptions::action());
    }

    /// Drop pending debounced events.
    pub fn shutdown(&mut self) {
        let pending = self.dispatcher.pending_count();
        self.dispatcher.cancel_all();
        log::info!("[{}] Session stopped ({pending} pending events dropped)", self.id);
    }
}

/// Wire a session to a new connection manager. The caller runs
/// `session.run(events)` and calls `manager.connect()`.
pub fn connect(
    config: &SessionConfig,
    location: Arc<dyn LocationSync>,
) -> Result<
    (
        ConnectionManager,
        Session<ConnectionHandle>,
        mpsc::Receiver<ConnectionEvent>,
    ),
    ConnectionError,
> {
    let mut manager = ConnectionManager::new(config.connection.clone());
    let events = manager.take_event_rx().ok_or(ConnectionError::Closed)?;
    let session = Session::new(config, manager.handle(), location);
    Ok((manager, session, events))
}
