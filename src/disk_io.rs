use crate::loader::{ResourceInjector, ResourceLoadOp};
use crate::resource_url::{ResourceKind, ResourceUrl};
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

struct DiskIORequest {
    url: ResourceUrl,
    kind: ResourceKind,
    load_op: ResourceLoadOp,
}

// Maps a URL onto a path under the root directory. Scheme and host are
// stripped; the rest of the URL is taken as a relative path.
fn resource_path(
    root_path: &Path,
    url: &str,
) -> PathBuf {
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => url,
    };
    root_path.join(path.trim_start_matches('/'))
}

// Thread that tries to take jobs out of the request channel and ends when the finish channel is signalled
struct DiskIOWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DiskIOWorkerThread {
    fn new(
        root_path: Arc<PathBuf>,
        request_rx: Receiver<DiskIORequest>,
        active_request_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> Self {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("IO Thread".into())
            .spawn(move || {
                profiling::register_thread!(&format!("DiskIOWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let msg = msg.unwrap();
                            profiling::scope!("DiskIORequest");
                            log::trace!("start read {} ({:?})", msg.url, msg.kind);

                            let path = resource_path(&root_path, msg.url.as_str());
                            match std::fs::read(&path) {
                                Ok(data) => {
                                    log::trace!("read {} bytes for {}", data.len(), msg.url);
                                    msg.load_op.complete();
                                }
                                Err(error) => {
                                    // No failure channel: the op is dropped
                                    // uncompleted and the loader reports the hang
                                    log::warn!(
                                        "failed to read {} from {:?}: {}",
                                        msg.url,
                                        path,
                                        error
                                    );
                                }
                            }

                            active_request_count.fetch_sub(1, Ordering::Release);
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .unwrap();

        DiskIOWorkerThread {
            finish_tx,
            join_handle,
        }
    }
}

// Spawns N threads, proxies requests to them, and kills the threads when the pool is dropped
struct DiskIOThreadPool {
    worker_threads: Vec<DiskIOWorkerThread>,
    request_tx: Sender<DiskIORequest>,
    active_request_count: Arc<AtomicUsize>,
}

impl DiskIOThreadPool {
    fn new(
        root_path: Arc<PathBuf>,
        max_requests_in_flight: usize,
    ) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<DiskIORequest>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let mut worker_threads = Vec::with_capacity(max_requests_in_flight);
        for thread_index in 0..max_requests_in_flight {
            let worker = DiskIOWorkerThread::new(
                root_path.clone(),
                request_rx.clone(),
                active_request_count.clone(),
                thread_index,
            );
            worker_threads.push(worker);
        }

        DiskIOThreadPool {
            request_tx,
            worker_threads,
            active_request_count,
        }
    }

    fn add_request(
        &self,
        request: DiskIORequest,
    ) {
        self.active_request_count.fetch_add(1, Ordering::Release);
        self.request_tx.send(request).unwrap();
    }

    fn finish(self) {
        for worker_thread in &self.worker_threads {
            worker_thread.finish_tx.send(()).unwrap();
        }

        for worker_thread in self.worker_threads {
            worker_thread.join_handle.join().unwrap();
        }
    }
}

/// [`ResourceInjector`] that reads resources from files under a root
/// directory on a small worker-thread pool. A read failure never completes
/// the load, matching the contract that a failed resource leaves its batches
/// pending rather than reporting an error.
pub struct DiskResourceIO {
    thread_pool: Option<DiskIOThreadPool>,
}

impl DiskResourceIO {
    pub fn new(root_path: PathBuf) -> Result<Self, String> {
        if !root_path.is_dir() {
            return Err(format!("resource root {:?} is not a directory", root_path));
        }

        let thread_pool = Some(DiskIOThreadPool::new(Arc::new(root_path), 4));
        Ok(DiskResourceIO { thread_pool })
    }
}

impl Drop for DiskResourceIO {
    fn drop(&mut self) {
        self.thread_pool.take().unwrap().finish();
    }
}

impl ResourceInjector for DiskResourceIO {
    fn load(
        &self,
        url: &ResourceUrl,
        kind: ResourceKind,
        load_op: ResourceLoadOp,
    ) {
        log::debug!("request load of {} ({:?})", url, kind);
        self.thread_pool.as_ref().unwrap().add_request(DiskIORequest {
            url: url.clone(),
            kind,
            load_op,
        });
    }
}
