//! The build orchestrator.
//!
//! A [`Project`] owns one [`AssetGraph`] for its whole lifetime and drives
//! it through build generations. Each generation gets a fresh
//! [`BuildSignal`] and [`TaskQueue`]; the graph itself is shared across
//! generations and mutated only between suspension points, from within the
//! single-threaded scheduling context, so no locking is involved.
//!
//! A generation runs update → complete → bundle → package. The update pass
//! shallowly reprocesses invalidated nodes; the completion pass is a
//! fixed-point computation, since transforming a file discovers new
//! dependencies whose resolution discovers new files. Cancellation is
//! cooperative: superseding a generation flips its signal, and every task
//! checks the signal after its collaborator call, before applying the
//! result. In-flight collaborator work is never interrupted, its result is
//! simply discarded.

use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::BuildError;
use crate::graph::{AssetGraph, DependencyNode, DependencyRequest, Node, NodeKey};
use crate::plugin::{Bundle, Bundler, ContentCache, Packager, PackagerRegistry, Resolver, Transformer, Watch};
use crate::queue::TaskQueue;
use crate::signal::BuildSignal;

/// Explicit configuration for a [`Project`]. There is no ambient lookup of
/// a working directory or a global default config; everything the core
/// needs arrives here.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Entry files seeding the asset graph. Everything reachable from these
    /// is built; everything else is pruned.
    pub entries: Vec<Utf8PathBuf>,
}

/// Per-branch errors collected while a generation ran to completion.
///
/// A resolve or transform failure poisons only its own branch: the node is
/// marked errored and the failure lands here, while the rest of the graph
/// is still bundled and packaged.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub errors: Vec<BuildError>,
}

/// The build orchestrator: one asset graph, the collaborator set, and the
/// update/complete/bundle/package cycle over them.
pub struct Project<R, T, B, P, C> {
    entries: Vec<Utf8PathBuf>,
    graph: Rc<RefCell<AssetGraph>>,
    resolver: Rc<R>,
    transformer: Rc<T>,
    bundler: B,
    packagers: PackagerRegistry<P>,
    cache: C,
    watcher: Option<Rc<dyn Watch>>,
    made_dirs: RefCell<HashSet<Utf8PathBuf>>,
}

impl<R, T, B, P, C> Project<R, T, B, P, C>
where
    R: Resolver + 'static,
    T: Transformer + 'static,
    B: Bundler,
    P: Packager,
    C: ContentCache,
{
    pub fn new(
        options: Options,
        resolver: R,
        transformer: T,
        bundler: B,
        packagers: PackagerRegistry<P>,
        cache: C,
    ) -> Self {
        let graph = AssetGraph::new(options.entries.iter().cloned());

        Self {
            entries: options.entries,
            graph: Rc::new(RefCell::new(graph)),
            resolver: Rc::new(resolver),
            transformer: Rc::new(transformer),
            bundler,
            packagers,
            cache,
            watcher: None,
            made_dirs: RefCell::new(HashSet::new()),
        }
    }

    /// Attach a file watcher. Newly resolved files are registered with it
    /// and pruned files are unregistered; its change events feed [`Project::run`].
    pub fn with_watcher(mut self, watcher: Rc<dyn Watch>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Read access to the current graph, mainly for bundler implementations
    /// and inspection.
    pub fn graph(&self) -> Ref<'_, AssetGraph> {
        self.graph.borrow()
    }

    /// Mark a tracked file stale so the next generation reprocesses it.
    /// Notifications for untracked paths are ignored.
    pub fn invalidate(&self, path: &Utf8Path) {
        self.graph
            .borrow_mut()
            .invalidate(&NodeKey::File(path.to_owned()));
    }

    /// Run a single build generation to completion.
    pub async fn build(&self) -> Result<BuildReport, BuildError> {
        self.build_with_signal(BuildSignal::new()).await
    }

    /// Run a single build generation under an externally owned signal.
    ///
    /// Aborting the signal makes the generation discard any result not yet
    /// applied and resolve to [`BuildError::Aborted`].
    pub async fn build_with_signal(&self, signal: BuildSignal) -> Result<BuildReport, BuildError> {
        tracing::info!("starting build");

        let generation = Rc::new(Generation {
            graph: Rc::clone(&self.graph),
            queue: TaskQueue::new(),
            signal: signal.clone(),
            scheduled: RefCell::new(HashSet::new()),
            errors: RefCell::new(Vec::new()),
            resolver: Rc::clone(&self.resolver),
            transformer: Rc::clone(&self.transformer),
            watcher: self.watcher.clone(),
        });

        generation.update_graph().await?;
        generation.complete_graph().await?;

        let snapshot = self.graph.borrow().clone();
        let bundles = self
            .bundler
            .bundle(&snapshot)
            .await
            .map_err(BuildError::Bundler)?;

        if signal.is_aborted() {
            return Err(BuildError::Aborted);
        }

        self.package(bundles, &signal).await?;

        let report = BuildReport {
            errors: generation.errors.take(),
        };

        tracing::info!(errors = report.errors.len(), "finished build");
        Ok(report)
    }

    /// Watch-mode entry point.
    ///
    /// Starts generation zero and then reacts to change events: an event
    /// for a tracked file aborts the live generation's signal, invalidates
    /// the node and starts a new generation without waiting for the
    /// superseded one. Events for untracked paths are ignored. Resolves
    /// once the event channel closes and every started generation has
    /// settled, the last-started one included.
    pub async fn run(&self, mut events: UnboundedReceiver<Utf8PathBuf>) -> Result<(), BuildError> {
        if let Some(watcher) = &self.watcher {
            for entry in &self.entries {
                watcher.watch(entry);
            }
        }

        let mut generations = FuturesUnordered::new();
        let mut signal = BuildSignal::new();
        generations.push(self.build_with_signal(signal.clone()));

        loop {
            tokio::select! {
                Some(result) = generations.next() => report_generation(result),
                event = events.recv() => match event {
                    Some(path) => {
                        let key = NodeKey::File(path);
                        if !self.graph.borrow().has_node(&key) {
                            continue;
                        }

                        tracing::debug!(?key, "change superseded the running build");
                        signal.abort();
                        self.graph.borrow_mut().invalidate(&key);

                        signal = BuildSignal::new();
                        generations.push(self.build_with_signal(signal.clone()));
                    }
                    None => break,
                }
            }
        }

        while let Some(result) = generations.next().await {
            report_generation(result);
        }

        Ok(())
    }

    /// Package every bundle concurrently and await them all. A missing
    /// packager or a packaging failure is fatal to its own bundle only;
    /// the first error is returned once every bundle has settled.
    async fn package(&self, bundles: Vec<Bundle>, signal: &BuildSignal) -> Result<(), BuildError> {
        let mut jobs: FuturesUnordered<_> = bundles
            .into_iter()
            .map(|bundle| self.package_bundle(bundle, signal))
            .collect();

        let mut first = None;
        while let Some(result) = jobs.next().await {
            if let Err(err) = result {
                tracing::error!("{err}");
                first.get_or_insert(err);
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn package_bundle(&self, bundle: Bundle, signal: &BuildSignal) -> Result<(), BuildError> {
        let Some(packager) = self.packagers.select(&bundle) else {
            return Err(BuildError::PackagerConfig(bundle.packager_key().into()));
        };

        let fail = |err| BuildError::Packager(bundle.dest_path.clone(), err);

        let mut contents = Vec::with_capacity(bundle.assets.len());
        for asset in &bundle.assets {
            let blobs = self.cache.read_blobs(asset).await.map_err(fail)?;
            contents.push(packager.asset(blobs).await.map_err(fail)?);
        }

        let bytes = packager.package(contents).await.map_err(fail)?;

        // Last checkpoint before output becomes visible on disk.
        if signal.is_aborted() {
            return Err(BuildError::Aborted);
        }

        if let Some(dir) = bundle.dest_path.parent() {
            self.ensure_dir(dir)?;
        }

        packager
            .write_file(&bundle.dest_path, &bytes)
            .await
            .map_err(fail)
    }

    /// Idempotent destination directory creation, cached per directory
    /// after the first success.
    fn ensure_dir(&self, dir: &Utf8Path) -> Result<(), BuildError> {
        if dir.as_str().is_empty() || self.made_dirs.borrow().contains(dir) {
            return Ok(());
        }

        std::fs::create_dir_all(dir)?;
        self.made_dirs.borrow_mut().insert(dir.to_owned());
        Ok(())
    }
}

fn report_generation(result: Result<BuildReport, BuildError>) {
    match result {
        Ok(report) if report.errors.is_empty() => tracing::info!("build finished"),
        Ok(report) => {
            tracing::warn!(errors = report.errors.len(), "build finished with errors");
        }
        Err(err) if err.is_abort() => tracing::debug!("build superseded, result discarded"),
        Err(err) => tracing::error!("build failed: {err}"),
    }
}

/// State scoped to one build generation: its queue, its signal, the set of
/// nodes already scheduled (single-flight per node), and the errors its
/// branches produced.
struct Generation<R, T> {
    graph: Rc<RefCell<AssetGraph>>,
    queue: TaskQueue,
    signal: BuildSignal,
    scheduled: RefCell<HashSet<NodeKey>>,
    errors: RefCell<Vec<BuildError>>,
    resolver: Rc<R>,
    transformer: Rc<T>,
    watcher: Option<Rc<dyn Watch>>,
}

impl<R, T> Generation<R, T>
where
    R: Resolver + 'static,
    T: Transformer + 'static,
{
    /// Shallowly reprocess every node marked invalid by change
    /// notifications, then drain the queue.
    async fn update_graph(self: &Rc<Self>) -> Result<(), BuildError> {
        let invalid = self.graph.borrow().invalid_nodes();
        for (_, node) in invalid {
            self.process_node(node, true);
        }

        self.queue.run().await
    }

    /// Drive every incomplete node to a stable state.
    ///
    /// Processing a node may discover and schedule further nodes while the
    /// queue is already draining; the queue handles that. The outer loop
    /// additionally catches nodes that entered the graph without a task of
    /// their own, such as files attached by a resolution that merged into
    /// an existing node, or leftovers of a superseded generation.
    async fn complete_graph(self: &Rc<Self>) -> Result<(), BuildError> {
        loop {
            let pending: Vec<_> = {
                let graph = self.graph.borrow();
                let scheduled = self.scheduled.borrow();
                graph
                    .incomplete_nodes()
                    .into_iter()
                    .filter(|(key, _)| !scheduled.contains(key))
                    .collect()
            };

            if pending.is_empty() {
                return Ok(());
            }

            for (_, node) in pending {
                self.process_node(node, false);
            }

            self.queue.run().await?;
        }
    }

    fn process_node(self: &Rc<Self>, node: Node, shallow: bool) {
        match node {
            Node::Dependency(dep) => self.schedule_resolve(dep),
            Node::File(file) => self.schedule_transform(file.path, shallow),
        }
    }

    /// Queue resolution of a dependency, unless this generation already
    /// has a task in flight for it.
    fn schedule_resolve(self: &Rc<Self>, dep: DependencyNode) {
        let key = NodeKey::Dependency(dep.id);
        if !self.scheduled.borrow_mut().insert(key.clone()) {
            return;
        }
        self.graph.borrow_mut().mark_in_progress(&key);

        let generation = Rc::clone(self);
        self.queue.add(async move {
            let resolved = match generation.resolver.resolve(&dep).await {
                Ok(path) => path,
                // An error state is a result like any other; a superseded
                // generation may not apply it over a newer one's work.
                Err(_) if generation.signal.is_aborted() => {
                    return Err(BuildError::Aborted);
                }
                Err(err) => {
                    let specifier = dep.specifier.clone().into_boxed_str();
                    generation.report(&key, BuildError::Resolution(specifier, err));
                    return Ok(());
                }
            };

            if generation.signal.is_aborted() {
                return Err(BuildError::Aborted);
            }

            let update = generation
                .graph
                .borrow_mut()
                .update_dependency(dep.id, &resolved);

            if update.created {
                if let Some(watcher) = &generation.watcher {
                    watcher.watch(&resolved);
                }
                generation.schedule_transform(resolved, false);
            }

            Ok(())
        });
    }

    /// Queue transformation of a file, unless this generation already has a
    /// task in flight for it. In shallow mode the result still updates the
    /// file's own assets and edges, but newly discovered dependencies are
    /// not scheduled; the completion pass picks them up instead.
    fn schedule_transform(self: &Rc<Self>, path: Utf8PathBuf, shallow: bool) {
        let key = NodeKey::File(path.clone());
        if !self.scheduled.borrow_mut().insert(key.clone()) {
            return;
        }
        self.graph.borrow_mut().mark_in_progress(&key);

        let generation = Rc::clone(self);
        self.queue.add(async move {
            let output = match generation.transformer.transform(&path).await {
                Ok(output) => output,
                Err(_) if generation.signal.is_aborted() => {
                    return Err(BuildError::Aborted);
                }
                Err(err) => {
                    generation.report(&key, BuildError::Transform(path, err));
                    return Ok(());
                }
            };

            if generation.signal.is_aborted() {
                return Err(BuildError::Aborted);
            }

            let deps: Vec<DependencyRequest> = output
                .assets
                .iter()
                .flat_map(|asset| asset.dependencies.iter())
                .map(|specifier| DependencyRequest {
                    specifier: specifier.clone(),
                    resolve_from: path.clone(),
                })
                .collect();

            let update = generation
                .graph
                .borrow_mut()
                .update_file(&path, output.assets, deps);

            if let Some(watcher) = &generation.watcher {
                for pruned in &update.pruned {
                    watcher.unwatch(pruned);
                }
            }

            if !shallow {
                for dep in update.new_deps {
                    generation.schedule_resolve(dep);
                }
            }

            Ok(())
        });
    }

    /// A branch failed: the node keeps the error state, the build goes on.
    fn report(&self, key: &NodeKey, err: BuildError) {
        self.graph.borrow_mut().mark_errored(key);
        tracing::error!("{err}");
        self.errors.borrow_mut().push(err);
    }
}
