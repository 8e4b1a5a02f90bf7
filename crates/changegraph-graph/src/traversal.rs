use crate::GraphSnapshot;
use changegraph_core::{
    ChangeGraphError, CycleReport, Deadline, DeadlineProbe, Direction, PartialResult,
    ReachableSet, ReachedResource, ResourceKey, Result,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl GraphSnapshot {
    /// Bounded BFS from `start`, recording the shortest hop distance of every
    /// reached resource. `start` itself is reported at depth 0.
    ///
    /// Neighbors past `max_depth` are never expanded; `depth_limit_hit` records
    /// that some were left unvisited.
    pub fn reachable_from(
        &self,
        start: &ResourceKey,
        max_depth: usize,
        direction: Direction,
        deadline: &Deadline,
    ) -> Result<ReachableSet> {
        let mut result = ReachableSet::empty(start.clone(), max_depth);
        let mut visited: HashSet<&ResourceKey> = HashSet::new();
        let mut queue: VecDeque<(&ResourceKey, usize)> = VecDeque::new();
        let mut probe = DeadlineProbe::new(deadline);

        visited.insert(start);
        queue.push_back((start, 0));
        result.nodes.push(ReachedResource {
            key: start.clone(),
            depth: 0,
        });

        while let Some((current, depth)) = queue.pop_front() {
            if probe.expired() {
                result.partial = true;
                warn!(origin = %start, reached = result.nodes.len(), "reachability deadline hit");
                return Err(ChangeGraphError::deadline(
                    deadline.elapsed(),
                    PartialResult::Reachable(result),
                ));
            }

            let Some(neighbors) = self.adjacent(current, direction) else {
                continue;
            };

            for neighbor in neighbors {
                if visited.contains(neighbor) {
                    result.revisits_seen = true;
                    continue;
                }
                if depth >= max_depth {
                    result.depth_limit_hit = true;
                    continue;
                }
                visited.insert(neighbor);
                result.nodes.push(ReachedResource {
                    key: neighbor.clone(),
                    depth: depth + 1,
                });
                queue.push_back((neighbor, depth + 1));
            }
        }

        debug!(
            origin = %start,
            reached = result.nodes.len(),
            depth_limit_hit = result.depth_limit_hit,
            "reachability computed"
        );
        Ok(result)
    }

    /// Find cycles with an iterative white/gray/black DFS over
    /// dependency edges.
    ///
    /// Every back edge yields one cycle, listed in edge order from the
    /// resource the back edge points at. Rotations of an already reported
    /// cycle are dropped.
    pub fn detect_cycles(&self, deadline: &Deadline) -> Result<CycleReport> {
        let keys = self.keys();
        let mut color: HashMap<&ResourceKey, Color> =
            keys.iter().map(|k| (k, Color::White)).collect();
        let mut report = CycleReport {
            cycles: Vec::new(),
            partial: false,
        };
        let mut seen: HashSet<Vec<ResourceKey>> = HashSet::new();
        let mut probe = DeadlineProbe::new(deadline);
        let empty = BTreeSet::new();

        for root in &keys {
            if color.get(root) != Some(&Color::White) {
                continue;
            }

            // (node, iterator over its dependencies)
            let mut stack: Vec<(&ResourceKey, std::collections::btree_set::Iter<'_, ResourceKey>)> =
                Vec::new();
            let mut path: Vec<&ResourceKey> = Vec::new();

            color.insert(root, Color::Gray);
            path.push(root);
            stack.push((
                root,
                self.adjacent(root, Direction::Dependencies)
                    .unwrap_or(&empty)
                    .iter(),
            ));

            while let Some((node, iter)) = stack.last_mut() {
                if probe.expired() {
                    report.partial = true;
                    warn!(cycles = report.cycles.len(), "cycle detection deadline hit");
                    return Err(ChangeGraphError::deadline(
                        deadline.elapsed(),
                        PartialResult::Cycles(report),
                    ));
                }

                let node = *node;
                match iter.next() {
                    Some(next) => match color.get(next).copied().unwrap_or(Color::White) {
                        Color::White => {
                            color.insert(next, Color::Gray);
                            path.push(next);
                            stack.push((
                                next,
                                self.adjacent(next, Direction::Dependencies)
                                    .unwrap_or(&empty)
                                    .iter(),
                            ));
                        }
                        Color::Gray => {
                            if let Some(pos) = path.iter().position(|k| *k == next) {
                                let cycle: Vec<ResourceKey> =
                                    path[pos..].iter().map(|k| (*k).clone()).collect();
                                if seen.insert(canonical_rotation(&cycle)) {
                                    report.cycles.push(cycle);
                                }
                            }
                        }
                        Color::Black => {}
                    },
                    None => {
                        color.insert(node, Color::Black);
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }

        debug!(cycles = report.cycles.len(), nodes = keys.len(), "cycle detection finished");
        Ok(report)
    }

    /// Strongly connected components (iterative Tarjan). Members of each
    /// component are sorted; components come out in reverse topological order
    /// of the dependency edges.
    pub fn strongly_connected(&self) -> Vec<Vec<ResourceKey>> {
        let keys = self.keys();
        let mut index_of: HashMap<&ResourceKey, usize> = HashMap::new();
        let mut lowlink: HashMap<&ResourceKey, usize> = HashMap::new();
        let mut on_stack: HashSet<&ResourceKey> = HashSet::new();
        let mut stack: Vec<&ResourceKey> = Vec::new();
        let mut components: Vec<Vec<ResourceKey>> = Vec::new();
        let mut counter = 0usize;
        let empty = BTreeSet::new();

        for root in &keys {
            if index_of.contains_key(root) {
                continue;
            }

            let mut work: Vec<(&ResourceKey, std::collections::btree_set::Iter<'_, ResourceKey>)> =
                Vec::new();
            index_of.insert(root, counter);
            lowlink.insert(root, counter);
            counter += 1;
            stack.push(root);
            on_stack.insert(root);
            work.push((
                root,
                self.adjacent(root, Direction::Dependencies)
                    .unwrap_or(&empty)
                    .iter(),
            ));

            while let Some((node, iter)) = work.last_mut() {
                let node = *node;
                if let Some(next) = iter.next() {
                    if !index_of.contains_key(next) {
                        index_of.insert(next, counter);
                        lowlink.insert(next, counter);
                        counter += 1;
                        stack.push(next);
                        on_stack.insert(next);
                        work.push((
                            next,
                            self.adjacent(next, Direction::Dependencies)
                                .unwrap_or(&empty)
                                .iter(),
                        ));
                    } else if on_stack.contains(next) {
                        let low = lowlink[node].min(index_of[next]);
                        lowlink.insert(node, low);
                    }
                    continue;
                }

                work.pop();
                if let Some((parent, _)) = work.last() {
                    let low = lowlink[*parent].min(lowlink[node]);
                    lowlink.insert(*parent, low);
                }

                if lowlink[node] == index_of[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack.remove(member);
                        component.push(member.clone());
                        if member == node {
                            break;
                        }
                    }
                    component.sort();
                    components.push(component);
                }
            }
        }

        components
    }

    /// Components that actually form a cycle (more than one member).
    pub fn cyclic_components(&self) -> Vec<Vec<ResourceKey>> {
        self.strongly_connected()
            .into_iter()
            .filter(|c| c.len() > 1)
            .collect()
    }
}

/// Layered Kahn ordering. `deps[n]` lists what `n` depends on; each layer
/// holds nodes whose dependencies all sit in earlier layers, sorted.
///
/// On a cycle returns the nodes that could not be placed.
pub fn topological_levels<N>(
    nodes: &BTreeSet<N>,
    deps: &BTreeMap<N, BTreeSet<N>>,
) -> std::result::Result<Vec<Vec<N>>, BTreeSet<N>>
where
    N: Ord + Clone,
{
    let mut remaining: BTreeMap<&N, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&N, Vec<&N>> = BTreeMap::new();

    for node in nodes {
        let inside: Vec<&N> = deps
            .get(node)
            .map(|d| d.iter().filter(|x| nodes.contains(*x) && *x != node).collect())
            .unwrap_or_default();
        remaining.insert(node, inside.len());
        for dep in inside {
            dependents.entry(dep).or_default().push(node);
        }
    }

    let mut levels = Vec::new();
    let mut ready: Vec<&N> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut placed = 0usize;

    while !ready.is_empty() {
        ready.sort();
        let mut next = Vec::new();
        for node in &ready {
            if let Some(children) = dependents.get(*node) {
                for child in children {
                    if let Some(count) = remaining.get_mut(*child) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(*child);
                        }
                    }
                }
            }
        }
        placed += ready.len();
        levels.push(ready.iter().map(|n| (*n).clone()).collect());
        ready = next;
    }

    if placed == nodes.len() {
        Ok(levels)
    } else {
        let placed_set: BTreeSet<&N> = levels.iter().flatten().collect();
        Err(nodes
            .iter()
            .filter(|n| !placed_set.contains(n))
            .cloned()
            .collect())
    }
}

/// Rotate a cycle so its smallest member comes first.
fn canonical_rotation(cycle: &[ResourceKey]) -> Vec<ResourceKey> {
    let Some((start, _)) = cycle.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)) else {
        return Vec::new();
    };
    cycle[start..]
        .iter()
        .chain(cycle[..start].iter())
        .cloned()
        .collect()
}
