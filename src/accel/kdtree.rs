// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// SAH kd-tree built with the event sweep algorithm from "On building fast
// kd-Trees for Ray Tracing, and on doing that in O(N log N)" by Wald & Havran
// (2006).
//
// The build runs on the calling thread plus the workers of a ThreadPool:
// large right subtrees are offloaded as pool tasks while the left subtree is
// built in place. Each thread owns a scratch slot (side-classification
// buffer plus a bump arena for recursion-time nodes); the finished tree is a
// flat, pointer-free node array packed into 8 bytes per node.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use bumpalo::Bump;
use bytemuck::{Pod, Zeroable};

use super::aabb::Aabb;
use crate::concurrency::{Barrier, Cancellable, ThreadPool};
use crate::constants::{
    ABSOLUTE_MAX_DEPTH, MAX_EVENTS_PER_PRIMITIVE, SAH_EMPTY_BONUS, SAH_INTERSECTION_COST,
    SAH_TRAVERSAL_COST, THREAD_MIN_PRIMITIVES,
};
use crate::scene::primitive::{Hit, Primitive, Ray};

const AXIS_BITS: u32 = 2;
const AXIS_MASK: u32 = 0x03;
const LEAF_AXIS: u32 = 3;
const MAX_RIGHT_OFFSET: u32 = 0x3fff_ffff;
const MAX_INDEX_COUNT: u32 = 0x3fff_ffff;

/// Packed tree node, exactly 8 bytes.
///
/// Bits 0..=1 of the header hold the split axis, with 3 marking a leaf. The
/// remaining 30 bits hold the right child's offset relative to this node
/// (internal) or the leaf's index count. The payload word is the split
/// position (internal) or the offset into the shared index array (leaf); a
/// leaf with exactly one primitive stores that primitive's index directly in
/// the payload instead.
///
/// The left child of an internal node is always the next node in the array.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Node {
    value_and_axis: u32,
    payload: u32,
}

const _: () = assert!(size_of::<Node>() == 4 + size_of::<f32>());

impl Node {
    fn split(axis: u8, position: f32) -> Self {
        Self {
            value_and_axis: u32::from(axis) & AXIS_MASK,
            payload: position.to_bits(),
        }
    }

    fn leaf(index_count: u32, index_offset: u32) -> Self {
        assert!(
            index_count <= MAX_INDEX_COUNT,
            "leaf index count overflows packed node"
        );
        Self {
            value_and_axis: LEAF_AXIS | (index_count << AXIS_BITS),
            payload: index_offset,
        }
    }

    fn is_leaf(self) -> bool {
        self.value_and_axis & AXIS_MASK == LEAF_AXIS
    }

    fn split_axis(self) -> usize {
        (self.value_and_axis & AXIS_MASK) as usize
    }

    fn split_position(self) -> f32 {
        f32::from_bits(self.payload)
    }

    fn right_offset(self) -> usize {
        (self.value_and_axis >> AXIS_BITS) as usize
    }

    fn set_right_offset(&mut self, right_offset: usize) {
        assert!(
            right_offset <= MAX_RIGHT_OFFSET as usize,
            "right child offset overflows packed node"
        );
        self.value_and_axis |= (right_offset as u32) << AXIS_BITS;
    }

    fn index_count(self) -> u32 {
        self.value_and_axis >> AXIS_BITS
    }

    fn index_offset(self) -> u32 {
        self.payload
    }
}

/// Kd-tree over borrowed primitives. Immutable once built; traversals are
/// lock-free and may run concurrently.
pub struct KdTree<'a> {
    primitives: Vec<&'a dyn Primitive>,
    indices: Vec<u32>,
    nodes: Vec<Node>,
    aabb: Aabb,
}

#[derive(Clone, Copy, Default)]
struct StackFrame {
    node: u32,
    t_min: f32,
    t_max: f32,
}

impl KdTree<'_> {
    fn traverse(&self, ray: &Ray, mut hit: Option<&mut Hit>) -> bool {
        let Some((mut t_min, mut t_max)) = self.aabb.ray_slab(ray) else {
            return false;
        };

        let mut stack = [StackFrame::default(); ABSOLUTE_MAX_DEPTH];
        let mut stack_len = 0;
        let mut node_index = 0;
        let mut hit_anything = false;

        loop {
            let node = self.nodes[node_index];

            if !node.is_leaf() {
                let axis = node.split_axis();
                let split = node.split_position();
                let o = ray.origin[axis];
                let d = ray.direction[axis];
                let t = (split - o) / d;

                // A ray starting exactly on the split plane belongs to the
                // left child unless it points into positive territory.
                let (near, far) = if o < split || (o == split && d <= 0.0) {
                    (node_index + 1, node_index + node.right_offset())
                } else {
                    (node_index + node.right_offset(), node_index + 1)
                };

                if t > t_max || t <= 0.0 {
                    node_index = near;
                } else if t < t_min {
                    node_index = far;
                } else {
                    stack[stack_len] = StackFrame {
                        node: far as u32,
                        t_min: t,
                        t_max,
                    };
                    stack_len += 1;
                    node_index = near;
                    t_max = t;
                }
            } else {
                match hit.as_deref_mut() {
                    // No early exit for closest hit: a primitive recorded
                    // here may extend past this leaf's interval, so a farther
                    // leaf can still hold a closer intersection. Near-first
                    // descent plus the minimum kept in Hit stay correct.
                    Some(hit) => hit_anything |= self.intersect_leaf(ray, hit, node),
                    None => {
                        if self.intersects_leaf(ray, node) {
                            return true;
                        }
                    }
                }

                if stack_len == 0 {
                    break;
                }
                stack_len -= 1;
                let frame = stack[stack_len];
                node_index = frame.node as usize;
                t_min = frame.t_min;
                t_max = frame.t_max;
            }
        }

        hit_anything
    }

    fn intersects_leaf(&self, ray: &Ray, node: Node) -> bool {
        let count = node.index_count() as usize;
        let offset = node.index_offset() as usize;

        if count == 1 {
            return self.primitives[offset].intersects(ray);
        }

        self.indices[offset..offset + count]
            .iter()
            .any(|&index| self.primitives[index as usize].intersects(ray))
    }

    fn intersect_leaf(&self, ray: &Ray, hit: &mut Hit, node: Node) -> bool {
        let count = node.index_count() as usize;
        let offset = node.index_offset() as usize;

        if count == 1 {
            return self.primitives[offset].intersect(ray, hit);
        }

        let mut hit_anything = false;
        for &index in &self.indices[offset..offset + count] {
            if self.primitives[index as usize].intersect(ray, hit) {
                hit_anything = true;
            }
        }
        hit_anything
    }
}

impl Primitive for KdTree<'_> {
    fn aabb(&self) -> Aabb {
        self.aabb
    }

    fn intersects(&self, ray: &Ray) -> bool {
        self.traverse(ray, None)
    }

    fn intersect(&self, ray: &Ray, hit: &mut Hit) -> bool {
        self.traverse(ray, Some(hit))
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    End,
    Planar,
    Start,
}

/// Boundary of one primitive on one axis, the unit the SAH sweep works on.
#[derive(Debug, Clone, Copy)]
struct Event {
    position: f32,
    axis: u8,
    kind: EventKind,
    index: u32,
}

/// Lexicographic by (position, axis, kind) with End < Planar < Start, so all
/// events of one candidate plane are adjacent and ends come before starts.
fn event_cmp(a: &Event, b: &Event) -> Ordering {
    a.position
        .total_cmp(&b.position)
        .then(a.axis.cmp(&b.axis))
        .then(a.kind.cmp(&b.kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PlaneSide {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, Default)]
struct Plane {
    axis: u8,
    position: f32,
    /// Side that primitives lying exactly in the plane are sent to; decided
    /// by whichever side was cheaper when the plane was scored.
    side_if_in_plane: PlaneSide,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SideOfPlane {
    Both,
    LeftOnly,
    RightOnly,
}

/// Everything one recursion step consumes. Destroyed before recursing into
/// the children to keep peak memory bounded.
struct BuildInput {
    indices: Vec<u32>,
    events: Vec<Event>,
    aabb: Aabb,
}

/// Recursion-time tree, allocated from per-worker bump arenas. The child
/// pointers may point into another worker's arena; all arenas outlive
/// flattening.
enum BuildNode {
    Split {
        axis: u8,
        position: f32,
        left: *const BuildNode,
        right: *const BuildNode,
    },
    Leaf {
        indices: Vec<u32>,
    },
}

// Aligned to a cache line so neighbouring worker slots do not share one.
#[repr(align(64))]
#[derive(Default)]
struct ThreadState {
    sides_of_plane: RefCell<Vec<SideOfPlane>>,
    arena: Bump,
}

struct ThreadStates {
    states: Vec<ThreadState>,
}

// SAFETY: every slot is only ever touched by a single thread: slot 0 by the
// thread that called kdtree_build, slot i + 1 by pool worker i (see
// current()). The warm-up in prepare_build_context makes each worker
// populate its own slot before any splitting work is queued.
unsafe impl Sync for ThreadStates {}

impl ThreadStates {
    fn new(worker_count: usize) -> Self {
        Self {
            states: (0..worker_count + 1).map(|_| ThreadState::default()).collect(),
        }
    }

    fn current(&self) -> &ThreadState {
        let slot = ThreadPool::worker_index().map_or(0, |index| index + 1);
        &self.states[slot]
    }
}

struct BuildContext<'a, 'b> {
    primitives: Vec<&'a dyn Primitive>,
    cancellable: &'b Cancellable,
    thread_pool: &'b ThreadPool,
    thread_states: ThreadStates,
}

/// Type-erased pointer handed to pool tasks. The build guarantees the
/// pointee outlives every task: kdtree_build only drops the context after
/// the pool has drained, and every offloaded subtree is awaited through its
/// future before its parent returns.
struct TaskPtr(*const ());

unsafe impl Send for TaskPtr {}

impl TaskPtr {
    fn new<T>(value: &T) -> Self {
        Self((value as *const T).cast())
    }

    fn from_raw<T>(ptr: *const T) -> Self {
        Self(ptr.cast())
    }

    /// SAFETY: caller must guarantee the pointee is still alive and that the
    /// erased type matches.
    unsafe fn get<T>(&self) -> &T {
        unsafe { &*self.0.cast() }
    }

    fn as_raw<T>(&self) -> *const T {
        self.0.cast()
    }
}

/// Parks one warm-up task on every worker so each of them sets up its own
/// scratch slot; the barrier stops an early finisher from stealing another
/// worker's warm-up task.
fn prepare_build_context(context: &BuildContext) {
    let workers = context.thread_pool.size();
    let count = context.primitives.len();
    let barrier = Arc::new(Barrier::new(workers));

    for _ in 0..workers {
        let context_ptr = TaskPtr::new(context);
        let barrier = Arc::clone(&barrier);

        context.thread_pool.add_task(move || {
            // SAFETY: the pool is drained below before the context can die.
            let context = unsafe { context_ptr.get::<BuildContext>() };
            context
                .thread_states
                .current()
                .sides_of_plane
                .borrow_mut()
                .resize(count, SideOfPlane::Both);
            barrier.arrive_and_wait();
        });
    }

    context
        .thread_states
        .current()
        .sides_of_plane
        .borrow_mut()
        .resize(count, SideOfPlane::Both);

    context.thread_pool.wait();
}

fn generate_build_events(index: u32, aabb: &Aabb, events: &mut Vec<Event>) {
    for axis in 0..3u8 {
        let min = aabb.min[axis as usize];
        let max = aabb.max[axis as usize];

        if aabb.is_planar(axis as usize) {
            events.push(Event {
                position: min,
                axis,
                kind: EventKind::Planar,
                index,
            });
        } else {
            events.push(Event {
                position: min,
                axis,
                kind: EventKind::Start,
                index,
            });
            events.push(Event {
                position: max,
                axis,
                kind: EventKind::End,
                index,
            });
        }
    }
}

fn initial_build_input(context: &BuildContext) -> BuildInput {
    assert!(
        context.primitives.len() <= u32::MAX as usize,
        "primitive count overflows 32-bit indices"
    );

    let count = context.primitives.len();
    let mut input = BuildInput {
        indices: (0..count as u32).collect(),
        events: Vec::with_capacity(count * MAX_EVENTS_PER_PRIMITIVE),
        aabb: Aabb::EMPTY,
    };

    for (index, primitive) in context.primitives.iter().enumerate() {
        let aabb = primitive.aabb();
        generate_build_events(index as u32, &aabb, &mut input.events);
        input.aabb = input.aabb.merge(aabb);
    }

    input.events.sort_unstable_by(event_cmp);
    input
}

fn max_depth_limit(primitive_count: usize) -> u32 {
    const K1: f32 = 1.3;
    const K2: f32 = 8.0;

    let depth = (K1 * (primitive_count as f32).log2() + K2 + 0.5) as u32;
    depth.min(ABSOLUTE_MAX_DEPTH as u32)
}

fn split_cost(
    probability_left: f32,
    probability_right: f32,
    n_left: u32,
    n_right: u32,
) -> f32 {
    let mut cost = SAH_TRAVERSAL_COST
        + SAH_INTERSECTION_COST
            * (probability_left * n_left as f32 + probability_right * n_right as f32);

    if n_left == 0 || n_right == 0 {
        cost *= SAH_EMPTY_BONUS;
    }

    cost
}

/// Scores a candidate plane and records on it which side primitives lying in
/// the plane should go to.
fn surface_area_heuristic(
    plane: &mut Plane,
    aabb: &Aabb,
    aabb_inv_surface_area: f32,
    n_left: u32,
    n_right: u32,
    n_plane: u32,
) -> f32 {
    let (aabb_left, aabb_right) = aabb.split(plane.axis as usize, plane.position);

    let probability_left = aabb_left.surface_area() * aabb_inv_surface_area;
    let probability_right = aabb_right.surface_area() * aabb_inv_surface_area;

    let cost_left = split_cost(probability_left, probability_right, n_left + n_plane, n_right);
    let cost_right = split_cost(probability_left, probability_right, n_left, n_right + n_plane);

    plane.side_if_in_plane = if cost_left < cost_right {
        PlaneSide::Left
    } else {
        PlaneSide::Right
    };

    cost_left.min(cost_right)
}

struct FoundPlane {
    plane: Plane,
    n_left: u32,
    n_plane: u32,
    n_right: u32,
    cost: f32,
}

fn count_events_at(
    events: &[Event],
    start: usize,
    axis: u8,
    position: f32,
    kind: EventKind,
) -> usize {
    let mut i = start;
    while i < events.len()
        && events[i].axis == axis
        && events[i].position == position
        && events[i].kind == kind
    {
        i += 1;
    }
    i - start
}

/// One sweep over the sorted events, maintaining per-axis running counts of
/// primitives to the left of, in, and to the right of the sweep plane.
fn find_plane(input: &BuildInput) -> FoundPlane {
    let count = input.indices.len() as u32;
    let aabb_inv_surface_area = 1.0 / input.aabb.surface_area();

    let mut n_left = [0u32; 3];
    let mut n_plane = [0u32; 3];
    let mut n_right = [count; 3];

    let mut best = FoundPlane {
        plane: Plane::default(),
        n_left: 0,
        n_plane: 0,
        n_right: 0,
        cost: f32::INFINITY,
    };

    let events = &input.events;
    let mut i = 0;

    while i < events.len() {
        let axis = events[i].axis;
        let position = events[i].position;

        // Sort order guarantees ends, then planars, then starts for each
        // distinct (axis, position).
        let p_end = count_events_at(events, i, axis, position, EventKind::End);
        i += p_end;
        let p_planar = count_events_at(events, i, axis, position, EventKind::Planar);
        i += p_planar;
        let p_start = count_events_at(events, i, axis, position, EventKind::Start);
        i += p_start;

        let a = axis as usize;
        n_plane[a] = p_planar as u32;
        n_right[a] -= (p_planar + p_end) as u32;

        let mut plane = Plane {
            axis,
            position,
            side_if_in_plane: PlaneSide::Left,
        };
        let cost = surface_area_heuristic(
            &mut plane,
            &input.aabb,
            aabb_inv_surface_area,
            n_left[a],
            n_right[a],
            n_plane[a],
        );

        if cost < best.cost {
            best = FoundPlane {
                plane,
                n_left: n_left[a],
                n_plane: n_plane[a],
                n_right: n_right[a],
                cost,
            };
        }

        n_left[a] += (p_start + p_planar) as u32;
        n_plane[a] = 0;
    }

    best
}

/// Fills the per-worker side buffer for all primitives of `input`. Everything
/// starts as Both; events on the plane's axis then pin primitives that end
/// before, start after, or lie in the plane.
fn classify_primitives(sides: &mut [SideOfPlane], input: &BuildInput, plane: &Plane) {
    for &index in &input.indices {
        sides[index as usize] = SideOfPlane::Both;
    }

    for event in &input.events {
        if event.axis != plane.axis {
            continue;
        }

        match event.kind {
            EventKind::End if event.position <= plane.position => {
                sides[event.index as usize] = SideOfPlane::LeftOnly;
            }
            EventKind::Start if event.position >= plane.position => {
                sides[event.index as usize] = SideOfPlane::RightOnly;
            }
            EventKind::Planar => {
                if event.position < plane.position
                    || (event.position == plane.position
                        && plane.side_if_in_plane == PlaneSide::Left)
                {
                    sides[event.index as usize] = SideOfPlane::LeftOnly;
                } else {
                    sides[event.index as usize] = SideOfPlane::RightOnly;
                }
            }
            _ => {}
        }
    }
}

/// Straddling primitives get their events regenerated per side, clipped to
/// the child box, and appended after the still-sorted partitioned events.
/// Sort the new suffix, then let the stable sort merge the two runs in one
/// pass.
fn merge_new_events(events: &mut [Event], sorted_len: usize) {
    if sorted_len == events.len() {
        return;
    }

    events[sorted_len..].sort_unstable_by(event_cmp);
    events.sort_by(event_cmp);
}

fn split_build_input(
    context: &BuildContext,
    input: BuildInput,
    found: &FoundPlane,
) -> (BuildInput, BuildInput) {
    let plane = &found.plane;

    let num_indices_left = found.n_left
        + if plane.side_if_in_plane == PlaneSide::Left {
            found.n_plane
        } else {
            0
        };
    let num_indices_right = found.n_right
        + if plane.side_if_in_plane == PlaneSide::Right {
            found.n_plane
        } else {
            0
        };
    let max_num_events_left = num_indices_left as usize * MAX_EVENTS_PER_PRIMITIVE;
    let max_num_events_right = num_indices_right as usize * MAX_EVENTS_PER_PRIMITIVE;

    let (aabb_left, aabb_right) = input.aabb.split(plane.axis as usize, plane.position);

    let mut left = BuildInput {
        indices: Vec::with_capacity(num_indices_left as usize),
        events: Vec::with_capacity(max_num_events_left),
        aabb: aabb_left,
    };
    let mut right = BuildInput {
        indices: Vec::with_capacity(num_indices_right as usize),
        events: Vec::with_capacity(max_num_events_right),
        aabb: aabb_right,
    };

    let state = context.thread_states.current();
    let mut sides_of_plane = state.sides_of_plane.borrow_mut();
    classify_primitives(&mut sides_of_plane, &input, plane);

    // One-sided events keep their sort order when partitioned; events of
    // straddling primitives are dropped here and regenerated below.
    for event in &input.events {
        match sides_of_plane[event.index as usize] {
            SideOfPlane::LeftOnly => left.events.push(*event),
            SideOfPlane::RightOnly => right.events.push(*event),
            SideOfPlane::Both => {}
        }
    }

    let left_events_sorted = left.events.len();
    let right_events_sorted = right.events.len();

    for &index in &input.indices {
        match sides_of_plane[index as usize] {
            SideOfPlane::Both => {
                let aabb = context.primitives[index as usize].aabb();

                left.indices.push(index);
                generate_build_events(index, &aabb.intersection(left.aabb), &mut left.events);

                right.indices.push(index);
                generate_build_events(index, &aabb.intersection(right.aabb), &mut right.events);
            }
            SideOfPlane::LeftOnly => left.indices.push(index),
            SideOfPlane::RightOnly => right.indices.push(index),
        }
    }

    merge_new_events(&mut left.events, left_events_sorted);
    merge_new_events(&mut right.events, right_events_sorted);

    // No reallocation should have occurred.
    debug_assert_eq!(left.indices.len(), num_indices_left as usize);
    debug_assert_eq!(right.indices.len(), num_indices_right as usize);
    debug_assert!(left.events.len() <= max_num_events_left);
    debug_assert!(right.events.len() <= max_num_events_right);

    (left, right)
}

fn create_build_node(context: &BuildContext, max_depth: u32, input: BuildInput) -> *const BuildNode {
    let count = input.indices.len() as u32;

    let mut found = None;
    if max_depth > 0 && count > 1 && !context.cancellable.cancelled() {
        let candidate = find_plane(&input);
        if candidate.cost < SAH_INTERSECTION_COST * count as f32 {
            found = Some(candidate);
        }
    }

    let Some(found) = found else {
        let state = context.thread_states.current();
        return state.arena.alloc(BuildNode::Leaf {
            indices: input.indices,
        }) as *const BuildNode;
    };

    let plane = found.plane;
    let (left_input, right_input) = split_build_input(context, input, &found);

    let left;
    let right;

    if count > THREAD_MIN_PRIMITIVES && context.thread_pool.idle_workers() > 0 {
        let context_ptr = TaskPtr::new(context);
        let future = context.thread_pool.async_task(move || {
            // SAFETY: awaited below, before the context can die.
            let context = unsafe { context_ptr.get::<BuildContext>() };
            TaskPtr::from_raw(create_build_node(context, max_depth - 1, right_input))
        });

        left = create_build_node(context, max_depth - 1, left_input);
        right = future.get().as_raw::<BuildNode>();
    } else {
        left = create_build_node(context, max_depth - 1, left_input);
        right = create_build_node(context, max_depth - 1, right_input);
    }

    let state = context.thread_states.current();
    state.arena.alloc(BuildNode::Split {
        axis: plane.axis,
        position: plane.position,
        left,
        right,
    }) as *const BuildNode
}

/// Walks the recursion-time tree once so the packed buffers can be sized
/// exactly before emission.
fn count_build_nodes(node: *const BuildNode) -> (usize, usize) {
    // SAFETY: all build tasks have completed and the per-worker arenas are
    // still alive, so every node pointer is valid and fully written.
    let node = unsafe { &*node };

    match node {
        BuildNode::Split { left, right, .. } => {
            let (left_nodes, left_indices) = count_build_nodes(*left);
            let (right_nodes, right_indices) = count_build_nodes(*right);
            (1 + left_nodes + right_nodes, left_indices + right_indices)
        }
        BuildNode::Leaf { indices } => {
            (1, if indices.len() > 1 { indices.len() } else { 0 })
        }
    }
}

/// Depth-first preorder emission. An internal node is emitted before its
/// left subtree (which therefore starts right after it) and patched with the
/// right child's relative offset once the left subtree's size is known.
fn flatten_build_node(node: *const BuildNode, nodes: &mut Vec<Node>, indices: &mut Vec<u32>) {
    // SAFETY: see count_build_nodes().
    let node = unsafe { &*node };

    match node {
        BuildNode::Split {
            axis,
            position,
            left,
            right,
        } => {
            let position_in_nodes = nodes.len();
            nodes.push(Node::split(*axis, *position));

            flatten_build_node(*left, nodes, indices);
            let right_offset = nodes.len() - position_in_nodes;
            nodes[position_in_nodes].set_right_offset(right_offset);
            flatten_build_node(*right, nodes, indices);
        }
        BuildNode::Leaf {
            indices: leaf_indices,
        } => {
            if leaf_indices.len() == 1 {
                nodes.push(Node::leaf(1, leaf_indices[0]));
            } else {
                assert!(
                    indices.len() <= u32::MAX as usize,
                    "index offset overflows packed node"
                );
                nodes.push(Node::leaf(leaf_indices.len() as u32, indices.len() as u32));
                indices.extend_from_slice(leaf_indices);
            }
        }
    }
}

/// Builds a kd-tree over the primitives. Always returns a well-formed tree;
/// if `cancellable` is triggered mid-build the remaining subtrees are closed
/// off as leaves and the caller decides whether to keep the result.
pub fn kdtree_build<'a>(
    primitives: Vec<&'a dyn Primitive>,
    cancellable: &Cancellable,
    thread_pool: &ThreadPool,
) -> KdTree<'a> {
    let build_start = Instant::now();

    let context = BuildContext {
        primitives,
        cancellable,
        thread_pool,
        thread_states: ThreadStates::new(thread_pool.size()),
    };
    prepare_build_context(&context);

    let input = initial_build_input(&context);
    let aabb = input.aabb;
    let max_depth = max_depth_limit(context.primitives.len());
    let root = create_build_node(&context, max_depth, input);

    // Every offloaded subtree has been awaited; the drain additionally orders
    // all worker writes before the single-threaded flattening below.
    thread_pool.wait();

    let (node_count, index_count) = count_build_nodes(root);
    let mut nodes = Vec::with_capacity(node_count);
    let mut indices = Vec::with_capacity(index_count);
    flatten_build_node(root, &mut nodes, &mut indices);

    // No reallocation should have occurred.
    debug_assert_eq!(nodes.len(), node_count);
    debug_assert_eq!(indices.len(), index_count);

    let BuildContext { primitives, .. } = context;
    let tree = KdTree {
        primitives,
        indices,
        nodes,
        aabb,
    };

    if !cancellable.cancelled() {
        log_build_info(build_start.elapsed(), &tree);
    }

    tree
}

// ---------------------------------------------------------------------------
// Build diagnostics
// ---------------------------------------------------------------------------

struct SavedBuildStats {
    total_time: Duration,
    total_builds: u32,
}

static BUILD_STATS: LazyLock<Mutex<HashMap<u64, SavedBuildStats>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Repeated builds of the same scene are keyed on the primitive count and all
/// six root box corner components so unrelated scenes stay distinct.
fn build_stats_key(primitive_count: usize, aabb: &Aabb) -> u64 {
    let mut hasher = DefaultHasher::new();

    primitive_count.hash(&mut hasher);
    for component in [
        aabb.min.x, aabb.min.y, aabb.min.z, aabb.max.x, aabb.max.y, aabb.max.z,
    ] {
        component.to_bits().hash(&mut hasher);
    }

    hasher.finish()
}

fn log_build_info(build_time: Duration, tree: &KdTree) {
    let mut min_depth = usize::MAX;
    let mut max_depth = 0;
    let mut leafs = 0u32;
    let mut leaf_index_counts = [0u32; 10];
    let mut max_index_count = 0;

    let mut stack = [(0u32, 0usize); ABSOLUTE_MAX_DEPTH];
    let mut stack_len = 0;
    let mut current = (0usize, 0usize);

    loop {
        let (node_index, depth) = current;
        let node = tree.nodes[node_index];

        if node.is_leaf() {
            min_depth = min_depth.min(depth);
            max_depth = max_depth.max(depth);
            leafs += 1;

            let index_count = node.index_count();
            leaf_index_counts[index_count.min(9) as usize] += 1;
            max_index_count = max_index_count.max(index_count);

            if stack_len == 0 {
                break;
            }
            stack_len -= 1;
            current = (stack[stack_len].0 as usize, stack[stack_len].1);
        } else {
            stack[stack_len] = ((node_index + node.right_offset()) as u32, depth + 1);
            stack_len += 1;
            current = (node_index + 1, depth + 1);
        }
    }

    let average_time;
    let total_builds;
    {
        let mut stats = BUILD_STATS.lock().unwrap();
        let saved = stats
            .entry(build_stats_key(tree.primitives.len(), &tree.aabb))
            .or_insert(SavedBuildStats {
                total_time: Duration::ZERO,
                total_builds: 0,
            });
        saved.total_time += build_time;
        saved.total_builds += 1;
        average_time = saved.total_time / saved.total_builds;
        total_builds = saved.total_builds;
    }

    let mb = |bytes: usize| bytes as f64 / (1024.0 * 1024.0);
    let primitives_mb = mb(tree.primitives.len() * size_of::<&dyn Primitive>());
    let nodes_mb = mb(tree.nodes.len() * size_of::<Node>());
    let indices_mb = mb(tree.indices.len() * size_of::<u32>());

    log::info!(
        "kd-tree build information:\n\
         \x20 Time to build        : {:?}\n\
         \x20 Average time to build: {:?} (builds: {})\n\
         \x20 Primitives           : {} ({:.2}Mb)\n\
         \x20 Nodes                : {} ({:.2}Mb)\n\
         \x20 Indices              : {} ({:.2}Mb)\n\
         \x20 Memory usage         : {:.2}Mb\n\
         \x20 Min depth            : {}\n\
         \x20 Max depth (limit)    : {} ({})\n\
         \x20 Leafs (ceil log2)    : {} ({})\n\
         \x20 Leafs with  0 indices: {}\n\
         \x20 Leafs with  1 indices: {}\n\
         \x20 Leafs with  2 indices: {}\n\
         \x20 Leafs with  3 indices: {}\n\
         \x20 Leafs with  4 indices: {}\n\
         \x20 Leafs with  5 indices: {}\n\
         \x20 Leafs with  6 indices: {}\n\
         \x20 Leafs with  7 indices: {}\n\
         \x20 Leafs with  8 indices: {}\n\
         \x20 Leafs with >8 indices: {}\n\
         \x20 Max indices in leaf  : {}\n\
         \x20 AABB minimum         : ({}, {}, {})\n\
         \x20 AABB maximum         : ({}, {}, {})",
        build_time,
        average_time,
        total_builds,
        tree.primitives.len(),
        primitives_mb,
        tree.nodes.len(),
        nodes_mb,
        tree.indices.len(),
        indices_mb,
        primitives_mb + nodes_mb + indices_mb,
        min_depth,
        max_depth,
        max_depth_limit(tree.primitives.len()),
        leafs,
        (leafs as f32).log2().ceil() as u32,
        leaf_index_counts[0],
        leaf_index_counts[1],
        leaf_index_counts[2],
        leaf_index_counts[3],
        leaf_index_counts[4],
        leaf_index_counts[5],
        leaf_index_counts[6],
        leaf_index_counts[7],
        leaf_index_counts[8],
        leaf_index_counts[9],
        max_index_count,
        tree.aabb.min.x,
        tree.aabb.min.y,
        tree.aabb.min.z,
        tree.aabb.max.x,
        tree.aabb.max.y,
        tree.aabb.max.z,
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use glam::vec3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::scene::shape::{Shape, ShapeType};

    fn test_pool() -> ThreadPool {
        ThreadPool::new(2).unwrap()
    }

    fn as_primitives<'a, P: Primitive>(shapes: &'a [P]) -> Vec<&'a dyn Primitive> {
        shapes.iter().map(|shape| shape as &dyn Primitive).collect()
    }

    fn linear_closest(primitives: &[&dyn Primitive], ray: &Ray) -> Hit {
        let mut hit = Hit::none();
        for primitive in primitives {
            primitive.intersect(ray, &mut hit);
        }
        hit
    }

    fn linear_any(primitives: &[&dyn Primitive], ray: &Ray) -> bool {
        primitives.iter().any(|primitive| primitive.intersects(ray))
    }

    fn random_triangles(count: usize, seed: u64) -> Vec<Shape> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut point = move || {
            [
                rng.gen_range(0.0f32..1.0),
                rng.gen_range(0.0f32..1.0),
                rng.gen_range(0.0f32..1.0),
            ]
        };

        (0..count)
            .map(|_| {
                let v0 = point();
                let mut v1 = point();
                let mut v2 = point();
                // Shrink to local size so the soup is not wall-to-wall slivers.
                for axis in 0..3 {
                    v1[axis] = v0[axis] + (v1[axis] - v0[axis]) * 0.1;
                    v2[axis] = v0[axis] + (v2[axis] - v0[axis]) * 0.1;
                }
                Shape::triangle(v0, v1, v2)
            })
            .collect()
    }

    fn random_rays(count: usize, seed: u64) -> Vec<Ray> {
        let mut rng = StdRng::seed_from_u64(seed);

        (0..count)
            .map(|_| {
                let origin = vec3(
                    rng.gen_range(-0.5f32..1.5),
                    rng.gen_range(-0.5f32..1.5),
                    -1.0,
                );
                let target = vec3(
                    rng.gen_range(0.0f32..1.0),
                    rng.gen_range(0.0f32..1.0),
                    rng.gen_range(0.0f32..1.0),
                );
                Ray::new(origin, (target - origin).normalize())
            })
            .collect()
    }

    #[test]
    fn test_event_generation_for_regular_aabb() {
        let aabb = Aabb::new(vec3(0.0, 0.0, 0.0), vec3(1.0, 2.0, 3.0));
        let mut events = Vec::new();

        generate_build_events(7, &aabb, &mut events);

        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|event| event.index == 7));
        assert_eq!(
            events
                .iter()
                .filter(|event| event.kind == EventKind::Start)
                .count(),
            3
        );
        assert_eq!(
            events
                .iter()
                .filter(|event| event.kind == EventKind::End)
                .count(),
            3
        );
    }

    #[test]
    fn test_event_generation_for_planar_aabb() {
        let aabb = Aabb::new(vec3(0.0, 2.0, 0.0), vec3(1.0, 2.0, 3.0));
        let mut events = Vec::new();

        generate_build_events(0, &aabb, &mut events);

        assert_eq!(events.len(), 5);

        let planar: Vec<_> = events
            .iter()
            .filter(|event| event.kind == EventKind::Planar)
            .collect();
        assert_eq!(planar.len(), 1);
        assert_eq!(planar[0].axis, 1);
        assert_eq!(planar[0].position, 2.0);
    }

    #[test]
    fn test_event_ordering() {
        let mut events = Vec::new();
        generate_build_events(0, &Aabb::new(vec3(0.0, 0.0, 0.0), vec3(1.0, 1.0, 1.0)), &mut events);
        generate_build_events(1, &Aabb::new(vec3(1.0, 1.0, 1.0), vec3(2.0, 2.0, 2.0)), &mut events);

        events.sort_unstable_by(event_cmp);

        // At the shared coordinate 1.0 on each axis, the end of the first box
        // must sort before the start of the second.
        let at_one: Vec<_> = events
            .iter()
            .filter(|event| event.position == 1.0 && event.axis == 0)
            .collect();
        assert_eq!(at_one.len(), 2);
        assert_eq!(at_one[0].kind, EventKind::End);
        assert_eq!(at_one[1].kind, EventKind::Start);
    }

    #[test]
    fn test_max_depth_limit() {
        assert_eq!(max_depth_limit(1), 8);
        assert!(max_depth_limit(1000) <= ABSOLUTE_MAX_DEPTH as u32);
        assert_eq!(max_depth_limit(usize::MAX), ABSOLUTE_MAX_DEPTH as u32);
    }

    #[test]
    fn test_single_sphere() {
        let shapes = vec![Shape::sphere([0.0, 0.0, 0.0], 1.0)];
        let cancellable = Cancellable::new();
        let pool = test_pool();

        let tree = kdtree_build(as_primitives(&shapes), &cancellable, &pool);

        let ray = Ray::new(vec3(0.0, 0.0, -5.0), vec3(0.0, 0.0, 1.0));
        assert!(tree.intersects(&ray));

        let mut hit = Hit::none();
        assert!(tree.intersect(&ray, &mut hit));
        assert!((hit.t - 4.0).abs() < 1e-5);

        let miss = Ray::new(vec3(0.0, 5.0, -5.0), vec3(0.0, 0.0, 1.0));
        assert!(!tree.intersects(&miss));
    }

    #[test]
    fn test_two_spheres_closest_hit() {
        let shapes = vec![
            Shape::sphere([-2.0, 0.0, 0.0], 1.0),
            Shape::sphere([2.0, 0.0, 0.0], 1.0),
        ];
        let cancellable = Cancellable::new();
        let pool = test_pool();

        let tree = kdtree_build(as_primitives(&shapes), &cancellable, &pool);

        let ray = Ray::new(vec3(-10.0, 0.0, 0.0), vec3(1.0, 0.0, 0.0));
        let mut hit = Hit::none();
        assert!(tree.intersect(&ray, &mut hit));
        assert!((hit.t - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_build() {
        let cancellable = Cancellable::new();
        let pool = test_pool();

        let tree = kdtree_build(Vec::new(), &cancellable, &pool);

        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.nodes[0].is_leaf());
        assert_eq!(tree.nodes[0].index_count(), 0);

        let ray = Ray::new(vec3(0.0, 0.0, -5.0), vec3(0.0, 0.0, 1.0));
        assert!(!tree.intersects(&ray));
        let mut hit = Hit::none();
        assert!(!tree.intersect(&ray, &mut hit));
    }

    #[test]
    fn test_agreement_with_linear_search() {
        let shapes = random_triangles(1000, 42);
        let primitives = as_primitives(&shapes);
        let cancellable = Cancellable::new();
        let pool = test_pool();

        let tree = kdtree_build(primitives.clone(), &cancellable, &pool);

        for ray in random_rays(10, 4242) {
            assert_eq!(tree.intersects(&ray), linear_any(&primitives, &ray));

            let mut tree_hit = Hit::none();
            tree.intersect(&ray, &mut tree_hit);
            let linear_hit = linear_closest(&primitives, &ray);
            assert_eq!(tree_hit.t, linear_hit.t);
        }
    }

    #[test]
    fn test_packed_node_invariants() {
        let shapes = random_triangles(1000, 7);
        let cancellable = Cancellable::new();
        let pool = test_pool();

        let tree = kdtree_build(as_primitives(&shapes), &cancellable, &pool);

        assert!(!tree.nodes.is_empty());

        let depth_limit = max_depth_limit(shapes.len()) as usize;
        let mut stack = vec![(0usize, 0usize)];

        while let Some((node_index, depth)) = stack.pop() {
            assert!(depth <= depth_limit);
            let node = tree.nodes[node_index];

            if node.is_leaf() {
                let count = node.index_count() as usize;
                let offset = node.index_offset() as usize;
                if count == 1 {
                    assert!(offset < tree.primitives.len());
                } else if count > 1 {
                    assert!(offset + count <= tree.indices.len());
                }
            } else {
                assert!(node.right_offset() >= 2);
                assert!(node_index + node.right_offset() < tree.nodes.len());
                stack.push((node_index + 1, depth + 1));
                stack.push((node_index + node.right_offset(), depth + 1));
            }
        }
    }

    #[test]
    fn test_cancelled_before_build_creates_single_leaf() {
        let shapes = random_triangles(100, 3);
        let cancellable = Cancellable::new();
        cancellable.cancel();
        let pool = test_pool();

        let tree = kdtree_build(as_primitives(&shapes), &cancellable, &pool);

        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.nodes[0].is_leaf());
        assert_eq!(tree.nodes[0].index_count(), 100);

        let mut leaf_indices = tree.indices.clone();
        leaf_indices.sort_unstable();
        assert_eq!(leaf_indices, (0..100).collect::<Vec<_>>());

        // The single leaf degenerates to a linear scan but stays correct.
        let primitives = as_primitives(&shapes);
        for ray in random_rays(5, 99) {
            assert_eq!(tree.intersects(&ray), linear_any(&primitives, &ray));
        }
    }

    /// Cancels the build from inside a primitive's aabb() call. With
    /// `cancel_at` pointing at the first call after initial event generation,
    /// the flag flips between the root's plane selection and its recursion.
    struct CancellingShape<'a> {
        shape: Shape,
        cancellable: &'a Cancellable,
        calls: Arc<AtomicUsize>,
        cancel_at: usize,
    }

    impl Primitive for CancellingShape<'_> {
        fn aabb(&self) -> Aabb {
            if self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1 == self.cancel_at {
                self.cancellable.cancel();
            }
            self.shape.aabb()
        }

        fn intersects(&self, ray: &Ray) -> bool {
            self.shape.intersects(ray)
        }

        fn intersect(&self, ray: &Ray, hit: &mut Hit) -> bool {
            self.shape.intersect(ray, hit)
        }
    }

    #[test]
    fn test_cancelled_after_root_split_keeps_tree_well_formed() {
        let cancellable = Cancellable::new();
        let calls = Arc::new(AtomicUsize::new(0));

        // Two separated spheres and one triangle straddling the split that
        // separates them. The triangle's aabb() is re-read when the root
        // input is split, which is call number four and triggers the cancel.
        let shapes = [
            Shape::sphere([-2.0, 0.0, 0.0], 1.0),
            Shape::triangle([-2.5, 0.0, -0.5], [2.5, 0.0, -0.5], [0.0, 0.0, 0.5]),
            Shape::sphere([2.0, 0.0, 0.0], 1.0),
        ];
        let wrapped: Vec<CancellingShape> = shapes
            .iter()
            .map(|shape| CancellingShape {
                shape: shape.clone(),
                cancellable: &cancellable,
                calls: Arc::clone(&calls),
                cancel_at: 4,
            })
            .collect();

        let pool = test_pool();
        let tree = kdtree_build(as_primitives(&wrapped), &cancellable, &pool);

        assert!(cancellable.cancelled());
        assert!(!tree.nodes[0].is_leaf());
        assert_eq!(tree.nodes.len(), 3);

        let primitives = as_primitives(&wrapped);
        let ray = Ray::new(vec3(-10.0, 0.0, 0.0), vec3(1.0, 0.0, 0.0));
        let mut tree_hit = Hit::none();
        tree.intersect(&ray, &mut tree_hit);
        assert_eq!(tree_hit.t, linear_closest(&primitives, &ray).t);
    }

    /// Pins the near/far tie rule: a ray travelling inside the split plane
    /// with a non-positive direction component must visit the left child
    /// first. Both spheres touch the plane at the same point, so in any-hit
    /// mode only the near (left) one gets tested.
    struct RecordingShape {
        shape: Shape,
        name: &'static str,
        visits: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Primitive for RecordingShape {
        fn aabb(&self) -> Aabb {
            self.shape.aabb()
        }

        fn intersects(&self, ray: &Ray) -> bool {
            self.visits.lock().unwrap().push(self.name);
            self.shape.intersects(ray)
        }

        fn intersect(&self, ray: &Ray, hit: &mut Hit) -> bool {
            self.visits.lock().unwrap().push(self.name);
            self.shape.intersect(ray, hit)
        }
    }

    #[test]
    fn test_ray_in_split_plane_visits_left_child_first() {
        let visits = Arc::new(Mutex::new(Vec::new()));
        let shapes = [
            RecordingShape {
                shape: Shape::sphere([-1.0, 0.0, 0.0], 1.0),
                name: "left",
                visits: Arc::clone(&visits),
            },
            RecordingShape {
                shape: Shape::sphere([1.0, 0.0, 0.0], 1.0),
                name: "right",
                visits: Arc::clone(&visits),
            },
        ];

        let cancellable = Cancellable::new();
        let pool = test_pool();
        let tree = kdtree_build(as_primitives(&shapes), &cancellable, &pool);

        // Both spheres only touch x = 0, so the SAH picks that plane.
        assert!(!tree.nodes[0].is_leaf());
        assert_eq!(tree.nodes[0].split_axis(), 0);
        assert_eq!(tree.nodes[0].split_position(), 0.0);

        // Origin exactly on the plane, direction component zero (<= 0).
        let ray = Ray::new(vec3(0.0, -5.0, 0.0), vec3(0.0, 1.0, 0.0));
        assert!(tree.intersects(&ray));

        let visits = visits.lock().unwrap();
        assert_eq!(visits.first().copied(), Some("left"));
    }

    #[test]
    fn test_parallel_and_sequential_builds_agree() {
        // Large enough that the right subtree gets offloaded to the pool.
        let shapes = random_triangles(12_000, 11);
        let primitives = as_primitives(&shapes);
        let cancellable = Cancellable::new();

        let sequential_pool = ThreadPool::new(1).unwrap();
        let parallel_pool = ThreadPool::new(4).unwrap();

        let sequential = kdtree_build(primitives.clone(), &cancellable, &sequential_pool);
        let parallel = kdtree_build(primitives.clone(), &cancellable, &parallel_pool);

        for ray in random_rays(20, 123) {
            assert_eq!(sequential.intersects(&ray), parallel.intersects(&ray));

            let mut sequential_hit = Hit::none();
            sequential.intersect(&ray, &mut sequential_hit);
            let mut parallel_hit = Hit::none();
            parallel.intersect(&ray, &mut parallel_hit);
            assert_eq!(sequential_hit.t, parallel_hit.t);
        }
    }

    #[test]
    fn test_planar_primitives_build() {
        // A row of coplanar discs exercises planar events and the
        // side-if-in-plane tie breaking.
        let mut shapes = vec![Shape::sphere([0.0, -2.0, 0.0], 1.0)];
        for i in 0..10 {
            shapes.push(Shape {
                shape_type: ShapeType::Disc,
                position: [i as f32 * 0.1, 1.0, 0.0],
                normal: [0.0, 1.0, 0.0],
                radius: 1.0,
                radius2: 0.0,
                height: 0.0,
                v0: [0.0; 3],
                v1: [0.0; 3],
                v2: [0.0; 3],
            });
        }

        let primitives = as_primitives(&shapes);
        let cancellable = Cancellable::new();
        let pool = test_pool();

        let tree = kdtree_build(primitives.clone(), &cancellable, &pool);

        let down = Ray::new(vec3(0.0, 5.0, 0.0), vec3(0.0, -1.0, 0.0));
        let mut hit = Hit::none();
        tree.intersect(&down, &mut hit);
        assert_eq!(hit.t, linear_closest(&primitives, &down).t);
        assert!((hit.t - 4.0).abs() < 1e-5);
    }
}
