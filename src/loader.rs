use crate::batch::{LoadCallback, PendingBatchRegistry};
use crate::hashing::HashMap;
use crate::resource_url::{ResourceKind, ResourceUrl};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex};

//
// The loader tracks two pieces of state:
// - Load State Registry: per-URL load status, created on first request and
//   never deleted. Monotonic, Loading -> Completed exactly once.
// - Pending Batch Registry: the active (remaining resources, callbacks)
//   groups, destroyed the instant their remaining set empties.
//
// All mutation happens under one lock, either from the request API or from
// the update() event pump. Injector completions never mutate directly, they
// queue a LoaderEvent that update() applies.
//

/// Load status of a single resource. Monotonic: once `Completed`, never
/// reverts. There is no failed state; a resource whose injector never signals
/// completion stays `Loading` forever and every batch containing it stays
/// pending.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Completed,
}

/// Loader events which drive state changes for requested resources
#[derive(Debug)]
pub enum LoaderEvent {
    // Sent by a ResourceLoadOp when the injector finished loading a resource
    LoadComplete(ResourceUrl),
    // Sent when a ResourceLoadOp is dropped without signaling completion
    LoadDropped(ResourceUrl),
}

/// Type that allows the [`ResourceInjector`] implementation to signal that a
/// load has finished. `complete` consumes the op, so a platform mechanism
/// that would fire its ready signal more than once cannot produce a second
/// completion event. Dropping the op without completing it is reported to the
/// loader, which logs it; the affected batches stay pending.
pub struct ResourceLoadOp {
    sender: Option<Sender<LoaderEvent>>,
    url: ResourceUrl,
}

impl ResourceLoadOp {
    pub(crate) fn new(
        sender: Sender<LoaderEvent>,
        url: ResourceUrl,
    ) -> Self {
        Self {
            sender: Some(sender),
            url,
        }
    }

    /// Returns the URL this load operation is for
    pub fn url(&self) -> &ResourceUrl {
        &self.url
    }

    /// Signals that the resource has finished loading.
    pub fn complete(mut self) {
        log::debug!("load op for {} complete", self.url);
        let _ = self
            .sender
            .as_ref()
            .unwrap()
            .send(LoaderEvent::LoadComplete(self.url.clone()));
        self.sender = None;
    }
}

impl Drop for ResourceLoadOp {
    fn drop(&mut self) {
        if let Some(ref sender) = self.sender {
            let _ = sender.send(LoaderEvent::LoadDropped(self.url.clone()));
        }
    }
}

/// The side-effect boundary: performs the actual fetch/execution of a
/// resource. The loader guarantees `load` is called at most once per URL for
/// the lifetime of the loader. The implementation must eventually call
/// `load_op.complete()`; there is no retry or timeout if it never does.
///
/// `kind` is the pre-classified injection strategy for the URL so
/// implementations can dispatch on data instead of re-parsing the extension.
pub trait ResourceInjector: Send + Sync {
    fn load(
        &self,
        url: &ResourceUrl,
        kind: ResourceKind,
        load_op: ResourceLoadOp,
    );
}

struct LoaderInner {
    // Load state for every URL ever requested. Entries are never removed.
    load_states: HashMap<ResourceUrl, LoadState>,

    // Active batches waiting on one or more Loading resources
    batches: PendingBatchRegistry,

    // The collaborator that actually fetches/executes resources
    injector: Box<dyn ResourceInjector>,

    // The event queue that drives resource load states changing. Events are
    // produced by ResourceLoadOps handed to the injector.
    events_tx: Sender<LoaderEvent>,
    events_rx: Receiver<LoaderEvent>,
}

impl LoaderInner {
    // Returns a callback to be fired immediately by the caller (with the lock
    // released) when every requested resource was already completed.
    fn request_resources(
        &mut self,
        mut requested: Vec<ResourceUrl>,
        callback: LoadCallback,
    ) -> Option<LoadCallback> {
        // Canonical order, so equal sets merge regardless of input order.
        // Duplicates within one request collapse to a single membership.
        requested.sort_unstable();
        requested.dedup();
        requested.retain(|url| !matches!(self.load_states.get(url), Some(LoadState::Completed)));

        if requested.is_empty() {
            log::trace!("request already satisfied, firing callback immediately");
            return Some(callback);
        }

        let not_yet_loading: Vec<ResourceUrl> = requested
            .iter()
            .filter(|url| !self.load_states.contains_key(url))
            .cloned()
            .collect();

        self.batches.register_or_merge(requested, callback);

        for url in not_yet_loading {
            let old = self.load_states.insert(url.clone(), LoadState::Loading);
            debug_assert!(old.is_none());

            let kind = ResourceKind::classify(url.as_str());
            log::debug!("requesting load of {} as {:?}", url, kind);
            let load_op = ResourceLoadOp::new(self.events_tx.clone(), url.clone());
            self.injector.load(&url, kind, load_op);
        }

        None
    }

    // Process all events, possibly completing batches. Callbacks of completed
    // batches are returned for the caller to fire with the lock released.
    #[profiling::function]
    fn update(&mut self) -> Vec<LoadCallback> {
        let mut ready = Vec::new();

        while let Ok(loader_event) = self.events_rx.try_recv() {
            log::debug!("handle event {:?}", loader_event);
            match loader_event {
                LoaderEvent::LoadComplete(url) => self.handle_load_complete(url, &mut ready),
                LoaderEvent::LoadDropped(url) => {
                    // No failure channel exists. Surface the hang instead of
                    // masking it: every batch containing this URL is stuck.
                    log::error!(
                        "load op for {} dropped without signaling completion, \
                         batches containing it will never fire",
                        url
                    );
                }
            }
        }

        ready
    }

    fn handle_load_complete(
        &mut self,
        url: ResourceUrl,
        ready: &mut Vec<LoadCallback>,
    ) {
        match self.load_states.insert(url.clone(), LoadState::Completed) {
            Some(LoadState::Loading) => {}
            Some(LoadState::Completed) => {
                // State is monotonic, a duplicate signal must not re-fire
                log::warn!("duplicate completion signal for {}, ignoring", url);
                return;
            }
            None => {
                log::warn!("completion signal for {} which was never requested", url);
            }
        }

        ready.extend(self.batches.notify_completed(&url));
    }
}

/// Deduplicating resource loader. Each instance owns its own registries, so
/// independent loaders (for example one per test) never share state.
///
/// Completion signals from the injector are queued and only applied when
/// [`Loader::update`] is called; batch callbacks fire from within that call,
/// after the internal lock is released, so they may issue new requests.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<Mutex<LoaderInner>>,
}

impl Loader {
    pub fn new(injector: Box<dyn ResourceInjector>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let inner = LoaderInner {
            load_states: Default::default(),
            batches: Default::default(),
            injector,
            events_tx,
            events_rx,
        };

        Loader {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Requests a single resource. Equivalent to a one-element
    /// [`Loader::request_resources`] call.
    pub fn request_resource(
        &self,
        url: &str,
        callback: impl FnOnce() + Send + 'static,
    ) {
        self.request_resources(&[url], callback);
    }

    /// Requests that every resource in `urls` be loaded, invoking `callback`
    /// once all of them have completed.
    ///
    /// Resources that already completed are satisfied immediately; if nothing
    /// remains, `callback` is invoked synchronously within this call. Resources
    /// already loading are awaited without a second injector call. Requests
    /// whose remaining sets match are merged and their callbacks fired
    /// together, last-registered first.
    pub fn request_resources<S: AsRef<str>>(
        &self,
        urls: &[S],
        callback: impl FnOnce() + Send + 'static,
    ) {
        let requested: Vec<ResourceUrl> =
            urls.iter().map(|url| ResourceUrl::from(url.as_ref())).collect();

        let immediate = self
            .inner
            .lock()
            .unwrap()
            .request_resources(requested, Box::new(callback));

        // Fired with the lock released so the callback may re-enter the loader
        if let Some(callback) = immediate {
            callback();
        }
    }

    /// Applies all completion signals received from the injector since the
    /// last call, firing the callbacks of every batch that finished.
    pub fn update(&self) {
        let ready = self.inner.lock().unwrap().update();
        for callback in ready {
            callback();
        }
    }

    /// Returns the load state of a URL, or `None` if it was never requested.
    pub fn load_state(
        &self,
        url: &str,
    ) -> Option<LoadState> {
        self.inner
            .lock()
            .unwrap()
            .load_states
            .get(&ResourceUrl::from(url))
            .copied()
    }

    /// Returns the URLs of all loads that are still in flight.
    pub fn active_loads(&self) -> Vec<ResourceUrl> {
        let inner = self.inner.lock().unwrap();
        inner
            .load_states
            .iter()
            .filter(|(_, state)| **state == LoadState::Loading)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Number of batches still waiting on at least one resource
    pub fn pending_batch_count(&self) -> usize {
        self.inner.lock().unwrap().batches.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingState {
        loads: Vec<(ResourceUrl, ResourceKind)>,
        ops: Vec<ResourceLoadOp>,
    }

    // Injector that records every load call and parks the ops so tests can
    // complete (or drop) them at a chosen moment
    #[derive(Clone, Default)]
    struct RecordingInjector(Arc<Mutex<RecordingState>>);

    impl RecordingInjector {
        fn load_count(&self) -> usize {
            self.0.lock().unwrap().loads.len()
        }

        fn loads(&self) -> Vec<(ResourceUrl, ResourceKind)> {
            self.0.lock().unwrap().loads.clone()
        }

        fn complete(
            &self,
            url: &str,
        ) {
            let op = self.take_op(url);
            op.complete();
        }

        fn drop_op(
            &self,
            url: &str,
        ) {
            let op = self.take_op(url);
            drop(op);
        }

        fn take_op(
            &self,
            url: &str,
        ) -> ResourceLoadOp {
            let mut state = self.0.lock().unwrap();
            let index = state
                .ops
                .iter()
                .position(|op| op.url().as_str() == url)
                .expect("no pending load op for url");
            state.ops.remove(index)
        }
    }

    impl ResourceInjector for RecordingInjector {
        fn load(
            &self,
            url: &ResourceUrl,
            kind: ResourceKind,
            load_op: ResourceLoadOp,
        ) {
            let mut state = self.0.lock().unwrap();
            state.loads.push((url.clone(), kind));
            state.ops.push(load_op);
        }
    }

    fn make_loader() -> (Loader, RecordingInjector) {
        let injector = RecordingInjector::default();
        let loader = Loader::new(Box::new(injector.clone()));
        (loader, injector)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(c: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let c = c.clone();
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn loads_each_resource_at_most_once() {
        let (loader, injector) = make_loader();
        let fired = counter();

        loader.request_resources(&["a.js", "b.js"], counting(&fired));
        loader.request_resource("a.js", counting(&fired));
        loader.request_resources(&["b.js", "a.js"], counting(&fired));
        assert_eq!(injector.load_count(), 2);

        injector.complete("a.js");
        injector.complete("b.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        // Completed resources never load again
        loader.request_resource("a.js", counting(&fired));
        assert_eq!(injector.load_count(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fans_in_duplicate_single_requests() {
        let (loader, injector) = make_loader();
        let fired = counter();

        for _ in 0..5 {
            loader.request_resource("lib.js", counting(&fired));
        }
        assert_eq!(injector.load_count(), 1);
        assert_eq!(loader.pending_batch_count(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        injector.complete("lib.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert_eq!(loader.pending_batch_count(), 0);
    }

    #[test]
    fn merges_equal_sets_regardless_of_request_order() {
        let (loader, injector) = make_loader();
        let fired = counter();

        loader.request_resources(&["a.js", "b.js"], counting(&fired));
        loader.request_resources(&["b.js", "a.js"], counting(&fired));
        assert_eq!(loader.pending_batch_count(), 1);
        assert_eq!(injector.load_count(), 2);

        injector.complete("a.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        injector.complete("b.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn completed_resources_short_circuit_synchronously() {
        let (loader, injector) = make_loader();

        let first = counter();
        loader.request_resource("a.js", counting(&first));
        injector.complete("a.js");
        loader.update();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(loader.load_state("a.js"), Some(LoadState::Completed));

        // Fires within the request call itself, no update() needed
        let second = counter();
        loader.request_resource("a.js", counting(&second));
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(injector.load_count(), 1);
        assert_eq!(loader.pending_batch_count(), 0);
    }

    #[test]
    fn carries_over_only_unmet_resources() {
        let (loader, injector) = make_loader();

        let warmup = counter();
        loader.request_resource("done.js", counting(&warmup));
        injector.complete("done.js");
        loader.update();

        let fired = counter();
        loader.request_resources(&["done.js", "new.js"], counting(&fired));
        assert_eq!(injector.load_count(), 2);
        assert_eq!(
            injector.loads().last().map(|(url, _)| url.as_str().to_string()),
            Some("new.js".to_string())
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        injector.complete("new.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deduplicates_within_one_request() {
        let (loader, injector) = make_loader();
        let fired = counter();

        loader.request_resources(&["a.js", "a.js", "a.js"], counting(&fired));
        assert_eq!(injector.load_count(), 1);

        injector.complete("a.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_request_completes_synchronously() {
        let (loader, injector) = make_loader();
        let fired = counter();

        let no_urls: [&str; 0] = [];
        loader.request_resources(&no_urls, counting(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(injector.load_count(), 0);
        assert_eq!(loader.pending_batch_count(), 0);
    }

    #[test]
    fn fires_merged_callbacks_last_registered_first() {
        let (loader, injector) = make_loader();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let order = order.clone();
            loader.request_resource("a.js", move || order.lock().unwrap().push(name));
        }

        injector.complete("a.js");
        loader.update();
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn merges_against_current_remaining_set() {
        let (loader, injector) = make_loader();
        let fired = counter();

        loader.request_resources(&["a.js", "b.js"], counting(&fired));
        injector.complete("a.js");
        loader.update();

        // The first batch has shrunk to ["b.js"], so this request merges into
        // it rather than creating a second batch
        loader.request_resource("b.js", counting(&fired));
        assert_eq!(loader.pending_batch_count(), 1);

        injector.complete("b.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn classifies_resources_for_the_injector() {
        let (loader, injector) = make_loader();

        loader.request_resources(&["theme.CSS", "app.js", "no_extension"], || {});

        let loads = injector.loads();
        let kind_of = |url: &str| {
            loads
                .iter()
                .find(|(u, _)| u.as_str() == url)
                .map(|(_, kind)| *kind)
                .unwrap()
        };
        assert_eq!(kind_of("theme.CSS"), ResourceKind::Stylesheet);
        assert_eq!(kind_of("app.js"), ResourceKind::Script);
        assert_eq!(kind_of("no_extension"), ResourceKind::Script);
    }

    #[test]
    fn dropped_load_op_leaves_batch_pending() {
        let (loader, injector) = make_loader();
        let fired = counter();

        loader.request_resource("stuck.js", counting(&fired));
        injector.drop_op("stuck.js");
        loader.update();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(loader.pending_batch_count(), 1);
        assert_eq!(loader.load_state("stuck.js"), Some(LoadState::Loading));
    }

    #[test]
    fn callbacks_may_issue_new_requests() {
        let (loader, injector) = make_loader();
        let fired = counter();

        let chained = loader.clone();
        let chained_fired = fired.clone();
        loader.request_resource("first.js", move || {
            chained.request_resource("second.js", counting(&chained_fired));
        });

        injector.complete("first.js");
        loader.update();
        assert_eq!(injector.load_count(), 2);

        injector.complete("second.js");
        loader.update();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn active_loads_reports_in_flight_urls() {
        let (loader, injector) = make_loader();

        loader.request_resources(&["a.js", "b.js"], || {});
        let mut active: Vec<String> = loader
            .active_loads()
            .iter()
            .map(|url| url.as_str().to_string())
            .collect();
        active.sort();
        assert_eq!(active, vec!["a.js", "b.js"]);

        injector.complete("a.js");
        loader.update();
        let active: Vec<String> = loader
            .active_loads()
            .iter()
            .map(|url| url.as_str().to_string())
            .collect();
        assert_eq!(active, vec!["b.js"]);
    }
}
