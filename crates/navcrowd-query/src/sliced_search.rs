//! Incremental A* search over a grid navigation mesh
//!
//! The search can be advanced a bounded number of iterations at a time and
//! finalized at any point; an unfinished search yields the path to the node
//! closest to the goal.

use crate::{GridNavMesh, PolyRef, QueryFilter};
use glam::Vec3;
use navcrowd_common::Status;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Heuristic scale, slightly below one to keep the estimate admissible
const H_SCALE: f32 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Open,
    Closed,
}

/// Node of the search graph
#[derive(Debug, Clone)]
struct Node {
    poly: PolyRef,
    parent: Option<usize>,
    /// Position the node is entered at (portal midpoint)
    pos: Vec3,
    /// Cost from the start
    g: f32,
    /// Cost from the start plus the heuristic
    f: f32,
    state: NodeState,
}

/// Node wrapper for the binary heap (priority queue)
#[derive(Debug, Clone, Copy)]
struct HeapNode {
    index: usize,
    f: f32,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap on f; lower node index wins ties
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// State of one incremental path search
#[derive(Debug, Clone)]
pub(crate) struct SlicedSearch {
    active: bool,
    status: Status,
    start_ref: PolyRef,
    end_ref: PolyRef,
    end_pos: Vec3,
    filter: QueryFilter,
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, usize>,
    open: BinaryHeap<HeapNode>,
    best_node: usize,
    best_cost: f32,
    max_nodes: usize,
}

impl SlicedSearch {
    pub(crate) fn new(max_nodes: usize) -> Self {
        Self {
            active: false,
            status: Status::Failure,
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            end_pos: Vec3::ZERO,
            filter: QueryFilter::default(),
            nodes: Vec::new(),
            lookup: HashMap::new(),
            open: BinaryHeap::new(),
            best_node: 0,
            best_cost: f32::MAX,
            max_nodes,
        }
    }

    fn clear(&mut self) {
        self.active = false;
        self.nodes.clear();
        self.lookup.clear();
        self.open.clear();
        self.best_node = 0;
        self.best_cost = f32::MAX;
    }

    pub(crate) fn init(
        &mut self,
        mesh: &GridNavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Status {
        self.clear();
        self.active = true;
        self.start_ref = start_ref;
        self.end_ref = end_ref;
        self.end_pos = end_pos;
        self.filter = filter.clone();

        if self.max_nodes == 0
            || !mesh.is_passable(start_ref, filter)
            || !mesh.is_passable(end_ref, filter)
        {
            self.status = Status::InvalidParam;
            return self.status;
        }

        if start_ref == end_ref {
            self.status = Status::Success;
            return self.status;
        }

        let h = start_pos.distance(end_pos) * H_SCALE;
        self.nodes.push(Node {
            poly: start_ref,
            parent: None,
            pos: start_pos,
            g: 0.0,
            f: h,
            state: NodeState::Open,
        });
        self.lookup.insert(start_ref, 0);
        self.open.push(HeapNode { index: 0, f: h });
        self.best_cost = h;
        self.status = Status::InProgress;
        self.status
    }

    pub(crate) fn update(&mut self, mesh: &GridNavMesh, max_iter: usize) -> (usize, Status) {
        if !self.active || !self.status.is_in_progress() {
            return (0, self.status);
        }

        let mut iters = 0;
        while iters < max_iter {
            let Some(HeapNode { index, f }) = self.open.pop() else {
                // Exhausted all reachable nodes without reaching the goal
                self.status = Status::PartialResult;
                break;
            };

            // Skip heap entries superseded by a cheaper visit
            let node = &self.nodes[index];
            if node.state == NodeState::Closed || f != node.f {
                continue;
            }

            iters += 1;
            self.nodes[index].state = NodeState::Closed;

            let poly = self.nodes[index].poly;
            if poly == self.end_ref {
                self.best_node = index;
                self.best_cost = 0.0;
                self.status = Status::Success;
                break;
            }

            if !mesh.contains(poly) {
                self.status = Status::Failure;
                break;
            }

            self.expand(mesh, index);
        }

        (iters, self.status)
    }

    fn expand(&mut self, mesh: &GridNavMesh, index: usize) {
        let cur = self.nodes[index].clone();
        let cur_area = mesh.poly_area(cur.poly);
        let parent_poly = cur.parent.map(|p| self.nodes[p].poly);

        for nei in mesh.neighbours(cur.poly) {
            if Some(nei) == parent_poly || !mesh.is_passable(nei, &self.filter) {
                continue;
            }

            let existing = self.lookup.get(&nei).copied();
            let pos = match existing {
                Some(i) => self.nodes[i].pos,
                None => match mesh.portal(cur.poly, nei) {
                    Some(portal) => portal.mid(),
                    None => continue,
                },
            };

            let step = self.filter.get_cost(cur.pos, pos, cur_area);
            let (g, h) = if nei == self.end_ref {
                let end_cost = self.filter.get_cost(pos, self.end_pos, mesh.poly_area(nei));
                (cur.g + step + end_cost, 0.0)
            } else {
                (cur.g + step, pos.distance(self.end_pos) * H_SCALE)
            };
            let total = g + h;

            let slot = match existing {
                Some(i) => {
                    if total >= self.nodes[i].f {
                        continue;
                    }
                    i
                }
                None => {
                    if self.nodes.len() >= self.max_nodes {
                        continue;
                    }
                    self.nodes.push(Node {
                        poly: nei,
                        parent: None,
                        pos,
                        g: 0.0,
                        f: 0.0,
                        state: NodeState::Open,
                    });
                    let i = self.nodes.len() - 1;
                    self.lookup.insert(nei, i);
                    i
                }
            };

            let node = &mut self.nodes[slot];
            node.parent = Some(index);
            node.g = g;
            node.f = total;
            node.state = NodeState::Open;
            self.open.push(HeapNode { index: slot, f: total });

            if h < self.best_cost {
                self.best_cost = h;
                self.best_node = slot;
            }
        }
    }

    pub(crate) fn finalize(&mut self, max_path: usize) -> (Status, Vec<PolyRef>) {
        if !self.active {
            return (Status::Failure, Vec::new());
        }

        let result = if self.status.is_failure() {
            (self.status, Vec::new())
        } else if self.start_ref == self.end_ref {
            (Status::Success, vec![self.start_ref])
        } else {
            let path = self.reconstruct(self.best_node, max_path);
            (self.completeness(&path), path)
        };

        self.clear();
        result
    }

    pub(crate) fn finalize_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        if !self.active {
            return (Status::Failure, Vec::new());
        }

        let result = if existing.is_empty() {
            (Status::InvalidParam, Vec::new())
        } else if self.status.is_failure() {
            (self.status, Vec::new())
        } else if self.start_ref == self.end_ref {
            (Status::Success, vec![self.start_ref])
        } else {
            // Furthest polygon of the existing path that the search reached
            let node = existing
                .iter()
                .rev()
                .find_map(|poly| self.lookup.get(poly).copied())
                .unwrap_or(self.best_node);
            let path = self.reconstruct(node, max_path);
            (self.completeness(&path), path)
        };

        self.clear();
        result
    }

    fn completeness(&self, path: &[PolyRef]) -> Status {
        if path.last() == Some(&self.end_ref) {
            Status::Success
        } else {
            Status::PartialResult
        }
    }

    fn reconstruct(&self, index: usize, max_path: usize) -> Vec<PolyRef> {
        let mut path = Vec::new();
        let mut current = self.nodes.get(index).map(|_| index);
        while let Some(i) = current {
            path.push(self.nodes[i].poly);
            if path.len() > self.nodes.len() {
                break;
            }
            current = self.nodes[i].parent;
        }
        path.reverse();
        path.truncate(max_path);
        path
    }
}

