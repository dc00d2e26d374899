use crate::resource_url::ResourceUrl;

/// Callback invoked with no arguments once every resource in a request has
/// finished loading.
pub type LoadCallback = Box<dyn FnOnce() + Send>;

/// One group of not-yet-completed resources tied to the callbacks waiting on
/// them. Lives only while `remaining` is non-empty.
struct PendingBatch {
    remaining: Vec<ResourceUrl>,
    callbacks: Vec<LoadCallback>,
}

/// Holds every active batch. New requests fan in to an existing batch when
/// their remaining sequence matches; completions fan out to every batch the
/// resource belongs to.
#[derive(Default)]
pub struct PendingBatchRegistry {
    // Most recently created batch is at the end. Scans walk back to front.
    batches: Vec<PendingBatch>,
}

impl PendingBatchRegistry {
    /// Appends `callback` to the batch whose current remaining sequence is
    /// element-wise equal to `remaining` (same length, same elements, same
    /// order), or creates a new batch if none matches.
    ///
    /// Matching is against the *current* remaining sequence, not the original
    /// request. A batch that has partially completed matches new requests by
    /// its shrunken sequence; originally-identical batches that completed
    /// resources in a different relative order stop matching each other. This
    /// drift is inherent to the matching rule and intentionally kept.
    pub fn register_or_merge(
        &mut self,
        remaining: Vec<ResourceUrl>,
        callback: LoadCallback,
    ) {
        debug_assert!(!remaining.is_empty());

        for batch in self.batches.iter_mut().rev() {
            if batch.remaining == remaining {
                log::trace!("merging request into existing batch {:?}", batch.remaining);
                batch.callbacks.push(callback);
                return;
            }
        }

        log::trace!("new batch {:?}", remaining);
        self.batches.push(PendingBatch {
            remaining,
            callbacks: vec![callback],
        });
    }

    /// Removes the first occurrence of `url` from every batch containing it,
    /// scanning most-recently-created first. Batches whose remaining sequence
    /// empties out are destroyed and their callbacks returned in firing order,
    /// last-registered first. The caller invokes them with no locks held.
    pub fn notify_completed(
        &mut self,
        url: &ResourceUrl,
    ) -> Vec<LoadCallback> {
        let mut ready = Vec::new();

        for i in (0..self.batches.len()).rev() {
            let batch = &mut self.batches[i];
            let Some(found) = batch.remaining.iter().position(|r| r == url) else {
                continue;
            };
            batch.remaining.remove(found);

            if batch.remaining.is_empty() {
                let mut finished = self.batches.remove(i);
                log::trace!(
                    "batch finished, firing {} callback(s)",
                    finished.callbacks.len()
                );
                while let Some(callback) = finished.callbacks.pop() {
                    ready.push(callback);
                }
            }
        }

        ready
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
