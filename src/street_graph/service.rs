use super::{
    BatchOutcome, FetchError, GeoBounds, GraphStore, GraphView, LinkIndex, LinkKey, NodeId,
    TileBatch, TileCoord, TileLoadPipeline, TileSource,
};
use crate::config::GraphConfig;
use crate::error::{GraphError, GraphResult};
use geo::Point;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 64;

type ReadFn = Box<dyn FnOnce(GraphView<'_>) + Send>;

/// Requests accepted by the graph service
pub enum GraphCommand {
    QueueViewport {
        bounds: GeoBounds,
        reply: oneshot::Sender<usize>,
    },
    ForceReload {
        tiles: Vec<TileCoord>,
        reply: oneshot::Sender<usize>,
    },
    UnloadTiles {
        tiles: Vec<TileCoord>,
        reply: oneshot::Sender<usize>,
    },
    /// Unload everything outside the viewport and its surrounding ring
    UnloadOutside {
        bounds: GeoBounds,
        reply: oneshot::Sender<usize>,
    },
    HighlightLinks {
        keys: Vec<LinkKey>,
    },
    ClearHighlights,
    ClickLink {
        point: Point<f64>,
        reply: oneshot::Sender<Option<LinkKey>>,
    },
    DragHandle {
        point: Point<f64>,
        anchor: NodeId,
        reply: oneshot::Sender<Option<NodeId>>,
    },
    ShortestPath {
        start: NodeId,
        end: NodeId,
        reply: oneshot::Sender<Option<Vec<NodeId>>>,
    },
    /// Run a query against the current graph
    Read(ReadFn),
    Snapshot {
        reply: oneshot::Sender<GraphSummary>,
    },
    Shutdown,
}

/// Counts describing the service state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    pub zoom: u8,
    pub tiles: usize,
    pub ways: usize,
    pub nodes: usize,
    pub links: usize,
    pub highlighted: usize,
    pub pending_tiles: usize,
    pub in_flight_tiles: usize,
    /// Nothing queued and nothing being fetched
    pub idle: bool,
}

/// Owner of the graph store. Every mutation runs on its task, in arrival order;
/// fetches run on spawned tasks and report back through a channel.
pub struct GraphService<S> {
    store: GraphStore,
    pipeline: TileLoadPipeline,
    source: Arc<S>,
    click_tolerance_m: f64,
    link_index: Option<LinkIndex>,
}

impl<S> GraphService<S>
where
    S: TileSource + Send + Sync + 'static,
{
    /// Move `store` into a new task and return the handle used to drive it.
    /// The task hands the store back when it shuts down.
    pub fn spawn(
        store: GraphStore,
        source: S,
        config: &GraphConfig,
    ) -> (GraphHandle, JoinHandle<GraphStore>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let service = GraphService {
            pipeline: TileLoadPipeline::new(store.zoom(), config.retry.policy()),
            store,
            source: Arc::new(source),
            click_tolerance_m: config.click_tolerance_m,
            link_index: None,
        };

        let task = tokio::spawn(service.run(rx));
        (GraphHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<GraphCommand>) -> GraphStore {
        let (done_tx, mut done_rx) = mpsc::channel::<Result<TileBatch, FetchError>>(1);
        log::info!("Graph service started (zoom {})", self.store.zoom());

        loop {
            self.start_next_batch(&done_tx);

            let retry_at = self.waiting_for_retry();
            let wake_at = tokio::time::Instant::from_std(retry_at.unwrap_or_else(Instant::now));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(GraphCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(result) = done_rx.recv() => self.complete_batch(result),
                _ = tokio::time::sleep_until(wake_at), if retry_at.is_some() => {}
            }
        }

        if let Some(tiles) = self.pipeline.in_flight() {
            log::warn!("Shutting down with {} tile(s) still in flight", tiles.len());
        }
        log::info!(
            "Graph service stopped: {} tile(s), {} link(s)",
            self.store.tile_count(),
            self.store.link_count()
        );
        self.store
    }

    /// Backoff deadline, if queued tiles are waiting on it
    fn waiting_for_retry(&self) -> Option<Instant> {
        self.pipeline
            .retry_at()
            .filter(|_| self.pipeline.in_flight().is_none() && self.pipeline.pending_len() > 0)
    }

    fn start_next_batch(&mut self, done: &mpsc::Sender<Result<TileBatch, FetchError>>) {
        let Some(tiles) = self.pipeline.next_batch(Instant::now()) else {
            return;
        };
        log::info!("Fetching batch of {} tile(s)", tiles.len());

        let source = Arc::clone(&self.source);
        let done = done.clone();
        tokio::spawn(async move {
            let result = source.fetch_batch(tiles).await;
            if done.send(result).await.is_err() {
                log::debug!("Graph service gone before batch completed");
            }
        });
    }

    fn complete_batch(&mut self, result: Result<TileBatch, FetchError>) {
        let outcome = self
            .pipeline
            .complete_batch(&mut self.store, result, Instant::now());
        self.link_index = None;

        if let BatchOutcome::Merged(report) = outcome {
            log::debug!("Batch merged: {:?}", report);
        }
    }

    fn handle_command(&mut self, command: GraphCommand) {
        match command {
            GraphCommand::QueueViewport { bounds, reply } => {
                let queued = self.pipeline.queue_viewport(&self.store, &bounds);
                let _ = reply.send(queued);
            }
            GraphCommand::ForceReload { tiles, reply } => {
                let count = self.pipeline.force_reload(&mut self.store, tiles);
                self.link_index = None;
                let _ = reply.send(count);
            }
            GraphCommand::UnloadTiles { tiles, reply } => {
                let count = self.pipeline.unload_tiles(&mut self.store, tiles);
                self.link_index = None;
                let _ = reply.send(count);
            }
            GraphCommand::UnloadOutside { bounds, reply } => {
                let count = self.pipeline.unload_outside(&mut self.store, &bounds);
                self.link_index = None;
                let _ = reply.send(count);
            }
            GraphCommand::HighlightLinks { keys } => self.store.highlight_links(keys),
            GraphCommand::ClearHighlights => self.store.clear_highlights(),
            GraphCommand::ClickLink { point, reply } => {
                let index = self
                    .link_index
                    .get_or_insert_with(|| LinkIndex::build(self.store.view()));
                let _ = reply.send(index.nearest_link(point, self.click_tolerance_m));
            }
            GraphCommand::DragHandle {
                point,
                anchor,
                reply,
            } => {
                let _ = reply.send(self.store.view().drag_handle(point, anchor));
            }
            GraphCommand::ShortestPath { start, end, reply } => {
                let _ = reply.send(self.store.view().shortest_path(start, end));
            }
            GraphCommand::Read(read) => read(self.store.view()),
            GraphCommand::Snapshot { reply } => {
                let _ = reply.send(self.summary());
            }
            GraphCommand::Shutdown => {}
        }
    }

    fn summary(&self) -> GraphSummary {
        GraphSummary {
            zoom: self.store.zoom(),
            tiles: self.store.tile_count(),
            ways: self.store.way_count(),
            nodes: self.store.node_count(),
            links: self.store.link_count(),
            highlighted: self.store.highlighted().count(),
            pending_tiles: self.pipeline.pending_len(),
            in_flight_tiles: self.pipeline.in_flight().map_or(0, <[TileCoord]>::len),
            idle: self.pipeline.is_idle(),
        }
    }
}

/// Cloneable sender side of a [`GraphService`]
#[derive(Clone)]
pub struct GraphHandle {
    tx: mpsc::Sender<GraphCommand>,
}

impl GraphHandle {
    async fn send(&self, command: GraphCommand) -> GraphResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| GraphError::ServiceClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> GraphCommand,
    ) -> GraphResult<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| GraphError::ServiceClosed)
    }

    /// Returns the number of newly queued tiles
    pub async fn queue_viewport(&self, bounds: GeoBounds) -> GraphResult<usize> {
        self.request(|reply| GraphCommand::QueueViewport { bounds, reply })
            .await
    }

    pub async fn force_reload(&self, tiles: Vec<TileCoord>) -> GraphResult<usize> {
        self.request(|reply| GraphCommand::ForceReload { tiles, reply })
            .await
    }

    /// Returns how many of `tiles` were loaded, queued or in flight
    pub async fn unload_tiles(&self, tiles: Vec<TileCoord>) -> GraphResult<usize> {
        self.request(|reply| GraphCommand::UnloadTiles { tiles, reply })
            .await
    }

    pub async fn unload_outside(&self, bounds: GeoBounds) -> GraphResult<usize> {
        self.request(|reply| GraphCommand::UnloadOutside { bounds, reply })
            .await
    }

    pub async fn highlight_links(&self, keys: Vec<LinkKey>) -> GraphResult<()> {
        self.send(GraphCommand::HighlightLinks { keys }).await
    }

    pub async fn clear_highlights(&self) -> GraphResult<()> {
        self.send(GraphCommand::ClearHighlights).await
    }

    pub async fn click_link(&self, point: Point<f64>) -> GraphResult<Option<LinkKey>> {
        self.request(|reply| GraphCommand::ClickLink { point, reply })
            .await
    }

    pub async fn drag_handle(&self, point: Point<f64>, anchor: NodeId) -> GraphResult<Option<NodeId>> {
        self.request(|reply| GraphCommand::DragHandle {
            point,
            anchor,
            reply,
        })
        .await
    }

    pub async fn shortest_path(&self, start: NodeId, end: NodeId) -> GraphResult<Option<Vec<NodeId>>> {
        self.request(|reply| GraphCommand::ShortestPath { start, end, reply })
            .await
    }

    /// Run `query` on the service task and return its result
    pub async fn read<T, F>(&self, query: F) -> GraphResult<T>
    where
        F: FnOnce(GraphView<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.request(|reply| {
            GraphCommand::Read(Box::new(move |view: GraphView<'_>| {
                let _ = reply.send(query(view));
            }))
        })
        .await
    }

    pub async fn snapshot(&self) -> GraphResult<GraphSummary> {
        self.request(|reply| GraphCommand::Snapshot { reply }).await
    }

    /// Poll until nothing is queued or in flight, or `timeout` passes.
    /// The last summary is returned either way; check `idle`.
    pub async fn wait_until_idle(&self, poll: Duration, timeout: Duration) -> GraphResult<GraphSummary> {
        let deadline = Instant::now() + timeout;
        loop {
            let summary = self.snapshot().await?;
            if summary.idle || Instant::now() >= deadline {
                return Ok(summary);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn shutdown(&self) -> GraphResult<()> {
        self.send(GraphCommand::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::street_graph::test_support::*;

    fn config() -> GraphConfig {
        GraphConfig {
            retry: RetryConfig {
                base_delay_secs: 0.01,
                factor: 2.0,
                max_delay_secs: 0.05,
                max_attempts: None,
            },
            ..GraphConfig::default()
        }
    }

    fn centre_viewport() -> GeoBounds {
        let centre = point_in(center_tile(), 0.5, 0.5);
        GeoBounds::new(centre.y(), centre.x(), centre.y(), centre.x())
    }

    async fn settle(handle: &GraphHandle) -> GraphSummary {
        handle
            .wait_until_idle(Duration::from_millis(5), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_viewport_loads_and_derives_links() {
        let source = Arc::new(FixtureSource::new(cross_world()));
        let (handle, task) =
            GraphService::spawn(GraphStore::new(16), Arc::clone(&source), &config());

        assert_eq!(handle.queue_viewport(centre_viewport()).await.unwrap(), 9);
        let summary = settle(&handle).await;

        assert!(summary.idle);
        assert_eq!(summary.tiles, 9);
        assert_eq!(summary.links, 4);
        assert_eq!(source.requests().len(), 1);

        // Already loaded: nothing new to queue
        assert_eq!(handle.queue_viewport(centre_viewport()).await.unwrap(), 0);

        handle.shutdown().await.unwrap();
        let store = task.await.unwrap();
        assert_eq!(store.link_count(), 4);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried() {
        let source = Arc::new(
            FixtureSource::new(cross_world())
                .failing_with([FetchError::NetworkTimeout, FetchError::RateLimited]),
        );
        let (handle, _task) =
            GraphService::spawn(GraphStore::new(16), Arc::clone(&source), &config());

        handle.queue_viewport(centre_viewport()).await.unwrap();
        let summary = settle(&handle).await;

        assert_eq!(summary.links, 4);
        let requests = source.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0], requests[2]);
    }

    #[tokio::test]
    async fn test_queries_through_handle() {
        let (handle, _task) =
            GraphService::spawn(GraphStore::new(16), FixtureSource::new(cross_world()), &config());
        handle.queue_viewport(centre_viewport()).await.unwrap();
        settle(&handle).await;

        let c = center_tile();
        assert_eq!(
            handle.click_link(point_in(c, 0.5, 0.3)).await.unwrap(),
            Some(LinkKey::new(10, 12))
        );
        assert_eq!(handle.click_link(point_in(c, 0.05, 0.05)).await.unwrap(), None);
        assert_eq!(
            handle.drag_handle(point_in(c, 0.21, 0.5), 10).await.unwrap(),
            Some(18)
        );
        assert_eq!(
            handle.shortest_path(18, 16).await.unwrap(),
            Some(vec![18, 17, 10, 15, 16])
        );

        let degree = handle
            .read(|view| view.node(10).map(|node| node.degree()))
            .await
            .unwrap();
        assert_eq!(degree, Some(4));
    }

    #[tokio::test]
    async fn test_highlights_and_reload() {
        let source = Arc::new(FixtureSource::new(cross_world()));
        let (handle, _task) =
            GraphService::spawn(GraphStore::new(16), Arc::clone(&source), &config());
        handle.queue_viewport(centre_viewport()).await.unwrap();
        settle(&handle).await;

        let key = LinkKey::new(10, 14);
        handle.highlight_links(vec![key]).await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().highlighted, 1);

        assert_eq!(handle.force_reload(vec![center_tile()]).await.unwrap(), 1);
        let summary = settle(&handle).await;
        assert_eq!(summary.links, 4);
        assert_eq!(source.requests().len(), 2);
        assert_eq!(source.requests()[1], vec![center_tile()]);

        let highlighted = handle
            .read(move |view| view.link(key).map(|link| link.metadata.highlighted))
            .await
            .unwrap();
        assert_eq!(highlighted, Some(true));

        handle.clear_highlights().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().highlighted, 0);
    }

    #[tokio::test]
    async fn test_unload_shrinks_the_store() {
        let (handle, task) =
            GraphService::spawn(GraphStore::new(16), FixtureSource::new(cross_world()), &config());
        handle.queue_viewport(centre_viewport()).await.unwrap();
        settle(&handle).await;

        let c = center_tile();
        let east = c.neighbors()[4];
        assert_eq!(
            handle.click_link(point_in(c, 0.5, 0.3)).await.unwrap(),
            Some(LinkKey::new(10, 12))
        );

        // The centre owns every way, so dropping a neighbour keeps the graph
        assert_eq!(handle.unload_tiles(vec![east]).await.unwrap(), 1);
        let summary = handle.snapshot().await.unwrap();
        assert_eq!((summary.tiles, summary.links), (8, 4));
        let (east_loaded, refs) = handle
            .read(move |view| (view.is_tile_loaded(east), view.node(10).map(|n| n.ref_count())))
            .await
            .unwrap();
        assert!(!east_loaded);
        assert_eq!(refs, Some(2));

        assert_eq!(handle.unload_tiles(vec![c, c]).await.unwrap(), 1);
        let summary = handle.snapshot().await.unwrap();
        assert_eq!(summary.tiles, 7);
        assert_eq!((summary.ways, summary.nodes, summary.links), (0, 0, 0));
        assert_eq!(handle.click_link(point_in(c, 0.5, 0.3)).await.unwrap(), None);

        assert_eq!(handle.unload_tiles(vec![c]).await.unwrap(), 0);

        let far = TileCoord::new(c.x + 10, c.y, c.zoom).center();
        let elsewhere = GeoBounds::new(far.y(), far.x(), far.y(), far.x());
        assert_eq!(handle.unload_outside(elsewhere).await.unwrap(), 7);
        assert!(handle.snapshot().await.unwrap().idle);

        handle.shutdown().await.unwrap();
        let store = task.await.unwrap();
        assert_eq!(store.tile_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let (handle, task) =
            GraphService::spawn(GraphStore::new(16), FixtureSource::new(cross_world()), &config());
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(handle.snapshot().await, Err(GraphError::ServiceClosed)));
    }
}
