use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::debug;

use super::entry::FrontierEntry;

/// Priority-ordered queue of discovered URLs with de-duplication.
///
/// A URL is in at most one of {queued, processing, visited} at any time;
/// re-discovery of a URL present in any of the three sets is a no-op.
/// Within one priority bucket discovery order is preserved, across buckets
/// the highest priority drains first.
///
/// The frontier is the only state shared between a job's workers; callers
/// wrap it in a single `Arc<Mutex<..>>` and keep the lock held briefly.
#[derive(Debug, Default)]
pub struct Frontier {
    buckets: BTreeMap<u8, VecDeque<FrontierEntry>>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    visited: HashSet<String>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a discovered URL. Returns `false` (no-op) when the URL is
    /// already queued, processing or visited.
    pub fn add(&mut self, entry: FrontierEntry) -> bool {
        if self.queued.contains(&entry.url)
            || self.processing.contains(&entry.url)
            || self.visited.contains(&entry.url)
        {
            debug!(url = %entry.url, "skipping already known url");
            return false;
        }

        self.queued.insert(entry.url.clone());
        self.buckets
            .entry(entry.priority)
            .or_default()
            .push_back(entry);
        true
    }

    /// Dequeue the head of the highest-priority non-empty bucket and mark
    /// it processing. Returns `None` when the frontier is drained.
    pub fn get_next(&mut self) -> Option<FrontierEntry> {
        // BTreeMap iterates ascending; take the last non-empty bucket.
        let (&priority, _) = self.buckets.iter().rev().find(|(_, b)| !b.is_empty())?;

        let bucket = self.buckets.get_mut(&priority)?;
        let entry = bucket.pop_front()?;
        if bucket.is_empty() {
            self.buckets.remove(&priority);
        }

        self.queued.remove(&entry.url);
        self.processing.insert(entry.url.clone());
        Some(entry)
    }

    /// Finalize a URL successfully: out of processing, into visited.
    pub fn mark_visited(&mut self, url: &str) {
        self.processing.remove(url);
        self.visited.insert(url.to_string());
    }

    /// Finalize a URL after a page error: out of processing only.
    pub fn mark_error(&mut self, url: &str) {
        self.processing.remove(url);
    }

    /// Number of URLs fully processed.
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    /// Number of URLs waiting in buckets.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Number of URLs dequeued but not yet finalized.
    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    /// True when nothing is queued and nothing is being processed.
    pub fn is_drained(&self) -> bool {
        self.queued.is_empty() && self.processing.is_empty()
    }
}
