//! Recent-maps and workspaces list models
//!
//! Read-through caches over the paginated list endpoints. Changing a
//! filter supersedes any fetch still in flight rather than queuing behind
//! it: the latest request wins, and a superseded fetch neither publishes
//! its results nor keeps the network busy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use atlaspub_core::domain::{Map, Workspace, WorkspaceId};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    client::ApiGateway,
    pagination::{Paginator, PartialResults},
    ApiError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Result of one list fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    /// The fetch ran to the end (possibly stopped early by an error)
    Completed(PartialResults<T>),
    /// A newer request replaced this one before it finished
    Superseded,
}

/// Published state of a list model
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot<T> {
    pub items: Vec<T>,
    pub error: Option<ApiError>,
    /// Incremented for every request; identifies which request produced `items`
    pub generation: u64,
    pub loading: bool,
}

impl<T> Default for ListSnapshot<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            error: None,
            generation: 0,
            loading: false,
        }
    }
}

// ============================================================================
// ListModel (shared latest-request-wins machinery)
// ============================================================================

struct ListModel<T> {
    gateway: Arc<ApiGateway>,
    generation: AtomicU64,
    in_flight: Mutex<Option<CancellationToken>>,
    snapshot_tx: watch::Sender<ListSnapshot<T>>,
}

impl<T: DeserializeOwned + Clone + Send + Sync> ListModel<T> {
    fn new(gateway: Arc<ApiGateway>) -> Self {
        let (snapshot_tx, _) = watch::channel(ListSnapshot::default());
        Self {
            gateway,
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            snapshot_tx,
        }
    }

    /// Starts a new request, cancelling the previous one
    fn start(&self) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        let generation = {
            let mut in_flight = lock(&self.in_flight);
            if let Some(previous) = in_flight.replace(token.clone()) {
                previous.cancel();
            }
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.snapshot_tx.send_modify(|s| {
            s.loading = true;
            s.generation = generation;
        });
        (generation, token)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn fetch<'a>(&'a self, paginator: Paginator<'a, T>) -> FetchOutcome<T> {
        let (generation, token) = self.start();

        let results = tokio::select! {
            _ = token.cancelled() => None,
            results = paginator.collect_all() => Some(results),
        };

        let Some(results) = results else {
            debug!(generation, "List fetch superseded");
            return FetchOutcome::Superseded;
        };

        // Publishing happens under the same lock that `start` takes, so a
        // newer request can never be overwritten by an older one.
        {
            let mut in_flight = lock(&self.in_flight);
            if !self.is_current(generation) {
                debug!(generation, "Discarding results of superseded fetch");
                return FetchOutcome::Superseded;
            }
            in_flight.take();
            self.snapshot_tx.send_replace(ListSnapshot {
                items: results.items.clone(),
                error: results.error.clone(),
                generation,
                loading: false,
            });
        }

        debug!(
            generation,
            items = results.items.len(),
            complete = results.is_complete(),
            "List fetch completed"
        );
        FetchOutcome::Completed(results)
    }

    fn cancel(&self) {
        if let Some(token) = lock(&self.in_flight).take() {
            token.cancel();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.snapshot_tx.send_modify(|s| s.loading = false);
    }

    fn items(&self) -> Vec<T> {
        self.snapshot_tx.borrow().items.clone()
    }
}

// ============================================================================
// RecentMapsModel
// ============================================================================

/// Filter applied to the recent maps list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapFilter {
    /// Free-text search on the map title
    pub search: Option<String>,
    pub workspace_id: Option<WorkspaceId>,
}

/// Recently updated maps, filtered by search text and workspace
pub struct RecentMapsModel {
    model: ListModel<Map>,
    filter: Mutex<MapFilter>,
}

impl RecentMapsModel {
    pub fn new(gateway: Arc<ApiGateway>) -> Self {
        Self {
            model: ListModel::new(gateway),
            filter: Mutex::new(MapFilter::default()),
        }
    }

    pub fn filter(&self) -> MapFilter {
        lock(&self.filter).clone()
    }

    /// Replaces the filter and fetches from the first page
    ///
    /// Supersedes any fetch still in flight.
    pub async fn set_filter(&self, filter: MapFilter) -> FetchOutcome<Map> {
        *lock(&self.filter) = filter;
        self.refresh().await
    }

    /// Re-fetches with the current filter
    pub async fn refresh(&self) -> FetchOutcome<Map> {
        let filter = self.filter();
        let paginator = self
            .model
            .gateway
            .list_maps(filter.search.as_deref(), filter.workspace_id.as_ref());
        self.model.fetch(paginator).await
    }

    /// Abandons any in-flight fetch
    pub fn cancel(&self) {
        self.model.cancel();
    }

    pub fn maps(&self) -> Vec<Map> {
        self.model.items()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListSnapshot<Map>> {
        self.model.snapshot_tx.subscribe()
    }
}

// ============================================================================
// WorkspacesModel
// ============================================================================

/// The account's workspaces
pub struct WorkspacesModel {
    model: ListModel<Workspace>,
}

impl WorkspacesModel {
    pub fn new(gateway: Arc<ApiGateway>) -> Self {
        Self {
            model: ListModel::new(gateway),
        }
    }

    /// Fetches all workspaces, superseding any fetch in flight
    pub async fn refresh(&self) -> FetchOutcome<Workspace> {
        let paginator = self.model.gateway.list_workspaces();
        self.model.fetch(paginator).await
    }

    pub fn cancel(&self) {
        self.model.cancel();
    }

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.model.items()
    }

    /// The workspace preselected for new maps: the first one listed
    pub fn default_workspace(&self) -> Option<Workspace> {
        self.model.snapshot_tx.borrow().items.first().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListSnapshot<Workspace>> {
        self.model.snapshot_tx.subscribe()
    }
}
