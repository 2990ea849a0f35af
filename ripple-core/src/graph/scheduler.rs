//! Job Queue
//!
//! The queue decides when and in which order deferred work runs. Writes never
//! run queued jobs directly: they enqueue, and the flush that follows drains
//! the queue in one pass.
//!
//! # Algorithm
//!
//! 1. `queue_job` skips jobs that are already pending, then inserts by
//!    priority id with a binary search. Jobs without an id go last. A `pre`
//!    job sorts ahead of non-pre jobs with the same id.
//! 2. A flush sorts the queue and walks it with a cursor. Jobs enqueued while
//!    flushing are inserted after the cursor, so nothing scheduled later in
//!    the flush runs ahead of work already passed.
//! 3. Once the main list drains, the post list runs, deduplicated and sorted.
//! 4. If either list gained entries in the meantime, the flush goes another
//!    round.
//!
//! The queue itself only holds state; the runtime drives it so that no lock
//! is held while a job runs.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::reactive::Effect;

/// Generate a new unique job key.
fn next_job_key() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A unit of deferred work.
///
/// Clones share identity: the queue deduplicates by it, and disposing one
/// clone disposes all of them.
#[derive(Clone)]
pub struct Job {
    key: u64,
    id: Option<u64>,
    pre: bool,
    allow_recurse: bool,
    label: Arc<str>,
    active: Arc<AtomicBool>,
    run: Arc<dyn Fn() + Send + Sync>,
    effect: Option<Effect>,
}

impl Job {
    /// Create a job without a priority id.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            key: next_job_key(),
            id: None,
            pre: false,
            allow_recurse: false,
            label: Arc::from("job"),
            active: Arc::new(AtomicBool::new(true)),
            run: Arc::new(run),
            effect: None,
        }
    }

    /// Create a job that re-runs `effect` if it is dirty.
    ///
    /// The job is skipped once the effect is stopped.
    pub fn from_effect(effect: Effect) -> Self {
        let runner = effect.clone();
        let mut job = Self::new(move || {
            if runner.is_dirty() {
                runner.run();
            }
        });
        job.label = effect.label();
        job.effect = Some(effect);
        job
    }

    /// Set the priority id. Lower ids run first.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Run ahead of non-pre jobs that share the same id.
    pub fn pre(mut self) -> Self {
        self.pre = true;
        self
    }

    /// Allow the job to enqueue itself again while it runs.
    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    pub fn labeled(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = label.into();
        self
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn is_pre(&self) -> bool {
        self.pre
    }

    pub fn allows_recurse(&self) -> bool {
        self.allow_recurse
    }

    pub fn label(&self) -> Arc<str> {
        Arc::clone(&self.label)
    }

    /// Sort key: jobs without an id run after every job with one.
    pub fn priority(&self) -> u64 {
        self.id.unwrap_or(u64::MAX)
    }

    /// Whether the flush should still run this job.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.effect.as_ref().map_or(true, Effect::is_active)
    }

    /// Prevent the job from running again. Pending copies are skipped.
    pub fn dispose(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn run(&self) {
        (self.run)();
    }

    fn compare(&self, other: &Job) -> CmpOrdering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.pre.cmp(&self.pre))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Job {}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("label", &self.label)
            .field("id", &self.id)
            .field("pre", &self.pre)
            .field("allow_recurse", &self.allow_recurse)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Pending and in-flight jobs of one runtime.
#[derive(Default)]
pub(crate) struct JobQueue {
    queue: Vec<Job>,
    flush_index: usize,
    flushing: bool,
    flush_pending: bool,
    pending_post: Vec<Job>,
    active_post: Option<Vec<Job>>,
    post_index: usize,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// First index after the cursor, where new work may be inserted.
    fn insertion_floor(&self) -> usize {
        if self.flushing {
            (self.flush_index + 1).min(self.queue.len())
        } else {
            0
        }
    }

    fn find_insertion_index(&self, id: u64) -> usize {
        let mut start = self.insertion_floor();
        let mut end = self.queue.len();

        while start < end {
            let middle = (start + end) / 2;
            let job = &self.queue[middle];
            if job.priority() < id || (job.priority() == id && job.is_pre()) {
                start = middle + 1;
            } else {
                end = middle;
            }
        }
        start
    }

    /// Add a job unless it is already pending.
    ///
    /// Returns `true` when the caller must notify the flush driver.
    pub(crate) fn queue_job(&mut self, job: Job) -> bool {
        let search_from = if self.flushing && job.allows_recurse() {
            self.flush_index + 1
        } else {
            self.flush_index
        };
        let pending = self
            .queue
            .get(search_from..)
            .is_some_and(|rest| rest.contains(&job));
        if pending {
            return false;
        }

        match job.id() {
            Some(id) => {
                let at = self.find_insertion_index(id);
                self.queue.insert(at, job);
            }
            None => self.queue.push(job),
        }
        self.request_flush()
    }

    /// Remove a pending job that has not started.
    pub(crate) fn invalidate_job(&mut self, job: &Job) -> bool {
        let floor = self.insertion_floor();
        match self.queue.iter().position(|queued| queued == job) {
            Some(at) if at >= floor => {
                self.queue.remove(at);
                true
            }
            _ => false,
        }
    }

    /// Add a job to the post list unless the active post pass will still
    /// reach it.
    pub(crate) fn queue_post(&mut self, job: Job) -> bool {
        let in_active_pass = self.active_post.as_ref().is_some_and(|active| {
            let from = if job.allows_recurse() {
                self.post_index + 1
            } else {
                self.post_index
            };
            active.get(from..).is_some_and(|rest| rest.contains(&job))
        });
        if !in_active_pass {
            self.pending_post.push(job);
        }
        self.request_flush()
    }

    fn request_flush(&mut self) -> bool {
        if self.flushing || self.flush_pending {
            return false;
        }
        self.flush_pending = true;
        true
    }

    /// Enter the flushing state. Returns `false` if a flush is already running.
    pub(crate) fn begin_flush(&mut self) -> bool {
        if self.flushing {
            return false;
        }
        self.flushing = true;
        self.flush_pending = false;
        self.flush_index = 0;
        self.queue.sort_by(Job::compare);
        true
    }

    /// The job under the cursor.
    pub(crate) fn current_job(&self) -> Option<Job> {
        self.queue.get(self.flush_index).cloned()
    }

    pub(crate) fn advance(&mut self) {
        self.flush_index += 1;
    }

    /// Close the main pass. The finished jobs are handed back to be dropped
    /// by the caller.
    pub(crate) fn end_main_pass(&mut self) -> Vec<Job> {
        self.flush_index = 0;
        self.queue.drain(..).collect()
    }

    /// Move the pending post jobs into the active post pass.
    ///
    /// Returns `false` when there is nothing to run, or when a post pass is
    /// already active (the jobs join it instead).
    pub(crate) fn begin_post_pass(&mut self) -> bool {
        if self.pending_post.is_empty() {
            return false;
        }

        let mut seen = HashSet::new();
        let mut deduped: Vec<Job> = self
            .pending_post
            .drain(..)
            .filter(|job| seen.insert(job.key))
            .collect();
        deduped.sort_by_key(Job::priority);

        if let Some(active) = self.active_post.as_mut() {
            active.extend(deduped);
            return false;
        }

        self.active_post = Some(deduped);
        self.post_index = 0;
        true
    }

    pub(crate) fn current_post_job(&self) -> Option<Job> {
        self.active_post
            .as_ref()
            .and_then(|active| active.get(self.post_index).cloned())
    }

    pub(crate) fn advance_post(&mut self) {
        self.post_index += 1;
    }

    pub(crate) fn end_post_pass(&mut self) -> Vec<Job> {
        self.post_index = 0;
        self.active_post.take().unwrap_or_default()
    }

    /// Decide whether the flush needs another round. Leaves the flushing
    /// state when it does not.
    pub(crate) fn finish_round(&mut self) -> bool {
        if self.queue.is_empty() && self.pending_post.is_empty() {
            self.flushing = false;
            return false;
        }
        self.flush_index = 0;
        self.queue.sort_by(Job::compare);
        true
    }

    /// Take the next pending `pre` job at or after `cursor`.
    pub(crate) fn take_pre_job(&mut self, cursor: &mut usize) -> Option<Job> {
        while *cursor < self.queue.len() {
            if self.queue[*cursor].is_pre() {
                return Some(self.queue.remove(*cursor));
            }
            *cursor += 1;
        }
        None
    }

    /// Where a pre-job pass starts: after the running job when flushing.
    pub(crate) fn pre_pass_start(&self) -> usize {
        self.insertion_floor()
    }

    /// Drop everything. The jobs are handed back to be released by the caller.
    pub(crate) fn clear(&mut self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.queue.drain(..).collect();
        jobs.append(&mut self.pending_post);
        if let Some(active) = self.active_post.take() {
            jobs.extend(active);
        }
        self.flush_index = 0;
        self.post_index = 0;
        self.flush_pending = false;
        jobs
    }

    /// Leave the flushing state after a job unwound through the flush.
    pub(crate) fn abort_flush(&mut self) -> Vec<Job> {
        let jobs = self.clear();
        self.flushing = false;
        jobs
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Whether a flush is running or has been requested.
    pub(crate) fn is_busy(&self) -> bool {
        self.flushing || self.flush_pending
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queue.len().saturating_sub(if self.flushing { self.flush_index } else { 0 })
    }

    pub(crate) fn post_len(&self) -> usize {
        self.pending_post.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(queue: &JobQueue) -> Vec<Option<u64>> {
        queue.queue.iter().map(Job::id).collect()
    }

    #[test]
    fn jobs_are_inserted_by_priority() {
        let mut queue = JobQueue::new();

        assert!(queue.queue_job(Job::new(|| {}).with_id(3)));
        assert!(!queue.queue_job(Job::new(|| {}).with_id(1)));
        queue.queue_job(Job::new(|| {}));
        queue.queue_job(Job::new(|| {}).with_id(2));

        assert_eq!(ids(&queue), vec![Some(1), Some(2), Some(3), None]);
    }

    #[test]
    fn pre_jobs_sort_ahead_of_same_id() {
        let mut queue = JobQueue::new();
        let plain = Job::new(|| {}).with_id(1);
        let pre = Job::new(|| {}).with_id(1).pre();

        queue.queue_job(plain.clone());
        queue.queue_job(pre.clone());
        queue.begin_flush();

        assert_eq!(queue.current_job(), Some(pre));
        queue.advance();
        assert_eq!(queue.current_job(), Some(plain));
    }

    #[test]
    fn duplicate_jobs_are_ignored() {
        let mut queue = JobQueue::new();
        let job = Job::new(|| {}).with_id(1);

        queue.queue_job(job.clone());
        queue.queue_job(job.clone());
        queue.queue_job(job);

        assert_eq!(queue.queued_len(), 1);
    }

    #[test]
    fn running_job_cannot_requeue_itself_without_recursion() {
        let mut queue = JobQueue::new();
        let job = Job::new(|| {}).with_id(1);
        let recursive = Job::new(|| {}).with_id(2).allow_recurse();

        queue.queue_job(job.clone());
        queue.queue_job(recursive.clone());
        queue.begin_flush();

        // `job` is under the cursor.
        queue.queue_job(job.clone());
        assert_eq!(queue.queue.len(), 2);

        queue.advance();
        // `recursive` is under the cursor and may come back.
        queue.queue_job(recursive.clone());
        assert_eq!(queue.queue.len(), 3);
        assert_eq!(queue.queue[2], recursive);
    }

    #[test]
    fn jobs_queued_mid_flush_land_after_cursor() {
        let mut queue = JobQueue::new();
        queue.queue_job(Job::new(|| {}).with_id(5));
        queue.queue_job(Job::new(|| {}).with_id(10));
        queue.begin_flush();
        queue.advance(); // now running id 10

        // A lower id scheduled later must not jump behind the cursor.
        let late = Job::new(|| {}).with_id(1);
        queue.queue_job(late.clone());
        assert_eq!(queue.queue[2], late);
    }

    #[test]
    fn invalidate_removes_pending_job() {
        let mut queue = JobQueue::new();
        let job = Job::new(|| {}).with_id(1);
        queue.queue_job(job.clone());

        assert!(queue.invalidate_job(&job));
        assert_eq!(queue.queued_len(), 0);
        assert!(!queue.invalidate_job(&job));
    }

    #[test]
    fn flush_request_is_reported_once() {
        let mut queue = JobQueue::new();
        assert!(queue.queue_job(Job::new(|| {})));
        assert!(!queue.queue_job(Job::new(|| {})));
        assert!(!queue.queue_post(Job::new(|| {})));
        assert!(queue.is_busy());

        assert!(queue.begin_flush());
        assert!(!queue.begin_flush());
    }

    #[test]
    fn post_jobs_are_deduplicated_and_sorted() {
        let mut queue = JobQueue::new();
        let a = Job::new(|| {}).with_id(2);
        let b = Job::new(|| {}).with_id(1);
        queue.queue_post(a.clone());
        queue.queue_post(b.clone());
        queue.queue_post(a.clone());

        queue.begin_flush();
        queue.end_main_pass();
        assert!(queue.begin_post_pass());
        assert_eq!(queue.current_post_job(), Some(b));
        queue.advance_post();
        assert_eq!(queue.current_post_job(), Some(a));
        queue.advance_post();
        assert_eq!(queue.current_post_job(), None);
        queue.end_post_pass();

        assert!(!queue.finish_round());
        assert!(!queue.is_busy());
    }

    #[test]
    fn take_pre_job_skips_plain_jobs() {
        let mut queue = JobQueue::new();
        let plain = Job::new(|| {}).with_id(1);
        let pre = Job::new(|| {}).with_id(2).pre();
        queue.queue_job(plain);
        queue.queue_job(pre.clone());

        let mut cursor = queue.pre_pass_start();
        assert_eq!(queue.take_pre_job(&mut cursor), Some(pre));
        assert_eq!(queue.take_pre_job(&mut cursor), None);
        assert_eq!(queue.queued_len(), 1);
    }

    #[test]
    fn disposed_job_is_inactive() {
        let job = Job::new(|| {});
        let copy = job.clone();
        assert!(copy.is_active());
        job.dispose();
        assert!(!copy.is_active());
    }
}
