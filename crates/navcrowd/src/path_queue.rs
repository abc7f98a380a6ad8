//! Asynchronous, time-sliced path requests
//!
//! Requests are stored in a fixed number of slots and resolved a bounded
//! number of search iterations per update, so long searches are spread over
//! several ticks.

use glam::Vec3;
use log::{debug, trace};
use navcrowd_common::Status;
use navcrowd_query::{NavMeshQuery, PolyRef, QueryFilter};

pub const PATHQ_INVALID: PathQueueRef = 0;

/// Updates a resolved result survives without being read
const MAX_KEEP_ALIVE: u32 = 2;

pub type PathQueueRef = u32;

#[derive(Debug, Clone)]
struct PathQuery {
    reference: PathQueueRef,
    start_pos: Vec3,
    end_pos: Vec3,
    start_ref: PolyRef,
    end_ref: PolyRef,
    path: Vec<PolyRef>,
    /// `None` until the search has been started
    status: Option<Status>,
    keep_alive: u32,
    /// Search iterations spent on this request so far
    iterations: usize,
    /// Number of requesters waiting on this result
    readers: u32,
    filter: QueryFilter,
}

impl Default for PathQuery {
    fn default() -> Self {
        Self {
            reference: PATHQ_INVALID,
            start_pos: Vec3::ZERO,
            end_pos: Vec3::ZERO,
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            path: Vec::new(),
            status: None,
            keep_alive: 0,
            iterations: 0,
            readers: 0,
            filter: QueryFilter::default(),
        }
    }
}

impl PathQuery {
    fn is_pending(&self) -> bool {
        self.status.map_or(true, |s| s.is_in_progress())
    }

    fn matches(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> bool {
        self.start_ref == start_ref
            && self.end_ref == end_ref
            && self.start_pos == start_pos
            && self.end_pos == end_pos
            && self.filter == *filter
    }
}

/// Queue of sliced path searches sharing one navigation query
pub struct PathQueue<Q: NavMeshQuery> {
    queue: Vec<PathQuery>,
    next_handle: PathQueueRef,
    max_path_size: usize,
    max_iterations_per_request: usize,
    queue_head: usize,
    navquery: Q,
}

impl<Q: NavMeshQuery> PathQueue<Q> {
    /// Creates a queue with `queue_size` request slots
    ///
    /// Results are truncated to `max_path_size` polygons; a request that has
    /// used `max_iterations_per_request` search iterations is finalized with
    /// the best partial path found so far.
    pub fn new(
        navquery: Q,
        queue_size: usize,
        max_path_size: usize,
        max_iterations_per_request: usize,
    ) -> Self {
        Self {
            queue: vec![PathQuery::default(); queue_size],
            next_handle: 1,
            max_path_size,
            max_iterations_per_request,
            queue_head: 0,
            navquery,
        }
    }

    /// Advances pending requests using at most `max_iters` search iterations
    pub fn update(&mut self, max_iters: usize) {
        let queue_len = self.queue.len();
        if queue_len == 0 {
            return;
        }

        // Update path requests until there is nothing to update
        // or up to max_iters pathfinder iterations have been consumed.
        let mut iter_count = max_iters;

        for _ in 0..queue_len {
            let q = &mut self.queue[self.queue_head % queue_len];

            // Skip inactive requests
            if q.reference == PATHQ_INVALID {
                self.queue_head += 1;
                continue;
            }

            // Handle completed request
            if let Some(status) = q.status {
                if !status.is_in_progress() {
                    // If the path result has not been read in few frames, free the slot
                    q.keep_alive += 1;
                    if q.keep_alive > MAX_KEEP_ALIVE {
                        trace!("Path request {} expired unread", q.reference);
                        q.reference = PATHQ_INVALID;
                        q.status = None;
                        q.readers = 0;
                    }
                    self.queue_head += 1;
                    continue;
                }
            }

            // Handle query start
            if q.status.is_none() {
                q.status = Some(self.navquery.init_sliced_find_path(
                    q.start_ref,
                    q.end_ref,
                    q.start_pos,
                    q.end_pos,
                    &q.filter,
                ));
            }

            // Handle query in progress
            if q.status.is_some_and(|s| s.is_in_progress()) {
                let budget = iter_count
                    .min(self.max_iterations_per_request.saturating_sub(q.iterations));
                let (iters, status) = self.navquery.update_sliced_find_path(budget);
                iter_count = iter_count.saturating_sub(iters);
                q.iterations += iters;

                q.status = Some(
                    if status.is_in_progress()
                        && q.iterations >= self.max_iterations_per_request
                    {
                        debug!(
                            "Path request {} hit its iteration limit, finalizing partial path",
                            q.reference
                        );
                        Status::PartialResult
                    } else {
                        status
                    },
                );
            }

            if q.status.is_some_and(|s| s.is_success()) {
                let (status, path) = self.navquery.finalize_sliced_find_path(self.max_path_size);
                q.status = Some(status);
                q.path = path;
            }

            if iter_count == 0 {
                break;
            }

            self.queue_head += 1;
        }

        self.queue_head %= queue_len;
    }

    /// Enqueues a path request
    ///
    /// Returns `PATHQ_INVALID` when the start polygon is invalid or when no
    /// slot is free. An identical pending request is shared.
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> PathQueueRef {
        if !self.navquery.is_valid_poly_ref(start_ref, filter) {
            return PATHQ_INVALID;
        }

        if let Some(q) = self.queue.iter_mut().find(|q| {
            q.reference != PATHQ_INVALID
                && q.is_pending()
                && q.matches(start_ref, end_ref, start_pos, end_pos, filter)
        }) {
            q.readers += 1;
            return q.reference;
        }

        // Find empty slot
        let Some(slot) = self.queue.iter().position(|q| q.reference == PATHQ_INVALID) else {
            debug!("Path queue full, rejecting request");
            return PATHQ_INVALID;
        };

        let reference = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        if self.next_handle == PATHQ_INVALID {
            self.next_handle = 1;
        }

        let q = &mut self.queue[slot];
        q.reference = reference;
        q.start_pos = start_pos;
        q.start_ref = start_ref;
        q.end_pos = end_pos;
        q.end_ref = end_ref;
        q.status = None;
        q.path.clear();
        q.filter = filter.clone();
        q.keep_alive = 0;
        q.iterations = 0;
        q.readers = 1;

        reference
    }

    /// Gets the status of a request; unknown handles report `Failure`
    pub fn get_request_status(&self, reference: PathQueueRef) -> Status {
        self.queue
            .iter()
            .find(|q| q.reference == reference && reference != PATHQ_INVALID)
            .map_or(Status::Failure, |q| q.status.unwrap_or(Status::InProgress))
    }

    /// Takes the result of a resolved request
    ///
    /// The slot is released once every requester sharing it has read the
    /// result. Unknown handles report `Failure` with an empty path.
    pub fn get_path_result(
        &mut self,
        reference: PathQueueRef,
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        if reference == PATHQ_INVALID {
            return (Status::Failure, Vec::new());
        }

        let Some(q) = self.queue.iter_mut().find(|q| q.reference == reference) else {
            return (Status::Failure, Vec::new());
        };

        let status = q.status.unwrap_or(Status::InProgress);
        let path: Vec<PolyRef> = q.path.iter().take(max_path).copied().collect();

        if !status.is_in_progress() {
            q.readers = q.readers.saturating_sub(1);
            if q.readers == 0 {
                // Free request for reuse
                q.reference = PATHQ_INVALID;
                q.status = None;
                q.path.clear();
            }
        }

        (status, path)
    }

    pub fn get_nav_query(&self) -> &Q {
        &self.navquery
    }

    /// Releases every slot
    pub fn purge(&mut self) {
        for q in &mut self.queue {
            *q = PathQuery::default();
        }
        self.queue_head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_query::InstrumentedQuery;
    use navcrowd_query::{GridNavMesh, GridNavQuery};
    use std::sync::Arc;

    fn corridor_mesh() -> Arc<GridNavMesh> {
        Arc::new(
            GridNavMesh::from_ascii(
                Vec3::ZERO,
                1.0,
                &["..........", "#########.", ".........."],
            )
            .unwrap(),
        )
    }

    fn queue(size: usize) -> (PathQueue<GridNavQuery>, Arc<GridNavMesh>) {
        let mesh = corridor_mesh();
        let navquery = GridNavQuery::new(mesh.clone(), 512);
        (PathQueue::new(navquery, size, 256, 2048), mesh)
    }

    #[test]
    fn test_request_resolves_over_updates() {
        let (mut pq, mesh) = queue(4);
        let filter = QueryFilter::default();
        let start = mesh.poly_ref_at(0, 0);
        let end = mesh.poly_ref_at(0, 2);

        let handle = pq.request(start, end, mesh.cell_center(0, 0), mesh.cell_center(0, 2), &filter);
        assert_ne!(handle, PATHQ_INVALID);
        assert_eq!(pq.get_request_status(handle), Status::InProgress);

        let mut updates = 0;
        while pq.get_request_status(handle).is_in_progress() {
            pq.update(2);
            updates += 1;
            assert!(updates < 100);
        }
        assert!(updates > 1);

        let (status, path) = pq.get_path_result(handle, 256);
        assert_eq!(status, Status::Success);
        assert_eq!(path.first(), Some(&start));
        assert_eq!(path.last(), Some(&end));

        // Slot released after reading
        assert_eq!(pq.get_request_status(handle), Status::Failure);
    }

    #[test]
    fn test_invalid_start_and_full_queue() {
        let (mut pq, mesh) = queue(2);
        let filter = QueryFilter::default();
        let end = mesh.poly_ref_at(9, 2);
        let blocked = mesh.poly_ref_at(0, 1);

        assert_eq!(
            pq.request(blocked, end, Vec3::ZERO, Vec3::ZERO, &filter),
            PATHQ_INVALID
        );

        let a = pq.request(mesh.poly_ref_at(0, 0), end, Vec3::ZERO, Vec3::ZERO, &filter);
        let b = pq.request(mesh.poly_ref_at(1, 0), end, Vec3::ZERO, Vec3::ZERO, &filter);
        let c = pq.request(mesh.poly_ref_at(2, 0), end, Vec3::ZERO, Vec3::ZERO, &filter);
        assert_ne!(a, PATHQ_INVALID);
        assert_ne!(b, PATHQ_INVALID);
        assert_ne!(a, b);
        assert_eq!(c, PATHQ_INVALID);
    }

    #[test]
    fn test_identical_requests_are_shared() {
        let (mut pq, mesh) = queue(2);
        let filter = QueryFilter::default();
        let start = mesh.poly_ref_at(0, 0);
        let end = mesh.poly_ref_at(5, 2);
        let (sp, ep) = (mesh.cell_center(0, 0), mesh.cell_center(5, 2));

        let a = pq.request(start, end, sp, ep, &filter);
        let b = pq.request(start, end, sp, ep, &filter);
        assert_eq!(a, b);

        pq.update(1000);
        let (status_a, path_a) = pq.get_path_result(a, 256);
        let (status_b, path_b) = pq.get_path_result(b, 256);
        assert!(status_a.is_success());
        assert_eq!(status_a, status_b);
        assert_eq!(path_a, path_b);
        assert_eq!(pq.get_request_status(a), Status::Failure);
    }

    #[test]
    fn test_unread_results_expire() {
        let (mut pq, mesh) = queue(1);
        let filter = QueryFilter::default();
        let handle = pq.request(
            mesh.poly_ref_at(0, 0),
            mesh.poly_ref_at(3, 0),
            mesh.cell_center(0, 0),
            mesh.cell_center(3, 0),
            &filter,
        );
        pq.update(1000);
        assert_eq!(pq.get_request_status(handle), Status::Success);

        for _ in 0..=MAX_KEEP_ALIVE {
            pq.update(1000);
        }
        assert_eq!(pq.get_request_status(handle), Status::Failure);
    }

    #[test]
    fn test_iteration_limit_yields_partial_path() {
        let mesh = corridor_mesh();
        let navquery = GridNavQuery::new(mesh.clone(), 512);
        let mut pq = PathQueue::new(navquery, 2, 256, 3);
        let filter = QueryFilter::default();
        let start = mesh.poly_ref_at(0, 0);
        let end = mesh.poly_ref_at(0, 2);

        let handle = pq.request(start, end, mesh.cell_center(0, 0), mesh.cell_center(0, 2), &filter);
        for _ in 0..10 {
            pq.update(100);
        }
        let (status, path) = pq.get_path_result(handle, 256);
        assert_eq!(status, Status::PartialResult);
        assert_eq!(path.first(), Some(&start));
        assert_ne!(path.last(), Some(&end));
    }

    #[test]
    fn test_handle_wraps_past_invalid() {
        let (mut pq, mesh) = queue(1);
        let filter = QueryFilter::default();
        pq.next_handle = u32::MAX;
        let start = mesh.poly_ref_at(0, 0);

        let a = pq.request(start, start, Vec3::ZERO, Vec3::ZERO, &filter);
        assert_eq!(a, u32::MAX);
        pq.update(10);
        pq.get_path_result(a, 256);

        let b = pq.request(start, start, Vec3::ZERO, Vec3::ZERO, &filter);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_update_never_exceeds_iteration_budget() {
        let mesh = corridor_mesh();
        let navquery = InstrumentedQuery::new(GridNavQuery::new(mesh.clone(), 512));
        let mut pq = PathQueue::new(navquery, 4, 256, 7);
        let filter = QueryFilter::default();
        let end = mesh.poly_ref_at(0, 2);

        // Every search needs more than 7 iterations to reach the far row
        let mut pending: Vec<PathQueueRef> = (0..4)
            .map(|x| {
                pq.request(
                    mesh.poly_ref_at(x, 0),
                    end,
                    mesh.cell_center(x, 0),
                    mesh.cell_center(0, 2),
                    &filter,
                )
            })
            .collect();
        assert!(pending.iter().all(|&h| h != PATHQ_INVALID));

        let mut spent = Vec::new();
        let mut results = Vec::new();
        for _ in 0..20 {
            let before = pq.get_nav_query().iterations();
            pq.update(5);
            spent.push(pq.get_nav_query().iterations() - before);

            pending.retain(|&h| {
                if pq.get_request_status(h).is_in_progress() {
                    return true;
                }
                results.push(pq.get_path_result(h, 256));
                false
            });
        }

        assert!(pending.is_empty());
        assert!(spent.iter().all(|&n| n <= 5), "iterations per update: {spent:?}");
        assert_eq!(spent[0], 5);

        // Each request stopped at its own limit
        assert_eq!(pq.get_nav_query().iterations(), 4 * 7);
        assert_eq!(results.len(), 4);
        for (status, path) in results {
            assert_eq!(status, Status::PartialResult);
            assert!(!path.is_empty());
            assert_ne!(path.last(), Some(&end));
        }
    }
}
