//! Per-tick extraction planning ("smart batch priority").
//!
//! Mesh-queued chunks are grouped into neighbor batches (face adjacency,
//! transitive). Batches are taken smallest first while they fit the budget.
//! A batch that does not fit is deferred whole, except when no batch fits
//! at all: then the smallest one is split so it cannot starve, and its
//! remainder is carried to the next tick as a single batch.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::voxel::chunk::ChunkCoord;

/// A neighbor batch selected for this tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedBatch {
    /// Chunks to synchronize and extract together, sorted
    pub chunks: Vec<ChunkCoord>,
    /// True when this is the first slice of a split batch
    pub partial: bool,
}

/// What to do with the mesh queue this tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractionPlan {
    pub batches: Vec<PlannedBatch>,
    /// Batches left untouched, whole
    pub deferred: Vec<Vec<ChunkCoord>>,
    /// Groups that must stay grouped next tick (split remainders and
    /// deferred batches that were already carried)
    pub carried: Vec<Vec<ChunkCoord>>,
}

impl ExtractionPlan {
    /// Number of chunks that will be extracted
    pub fn extracted_count(&self) -> usize {
        self.batches.iter().map(|b| b.chunks.len()).sum()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.iter().map(Vec::len).sum::<usize>()
            + self
                .carried
                .iter()
                .filter(|c| !self.deferred.contains(c))
                .map(Vec::len)
                .sum::<usize>()
    }
}

/// Union-find over indices
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // keep the smaller index as root for stable output
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Group queued chunks into neighbor batches.
///
/// Members of a carried group stay together even if they are no longer
/// face-connected. Each batch is sorted; batches are ordered by size, then
/// by their smallest coordinate.
pub fn group_batches(queued: &[ChunkCoord], carried: &[Vec<ChunkCoord>]) -> Vec<Vec<ChunkCoord>> {
    let coords: Vec<ChunkCoord> = queued.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    let index: HashMap<ChunkCoord, usize> = coords.iter().enumerate().map(|(i, c)| (*c, i)).collect();
    let mut sets = DisjointSet::new(coords.len());

    for group in carried {
        let mut members = group.iter().filter_map(|c| index.get(c).copied());
        if let Some(first) = members.next() {
            for other in members {
                sets.union(first, other);
            }
        }
    }

    for (i, coord) in coords.iter().enumerate() {
        for n in coord.face_neighbors() {
            if let Some(&j) = index.get(&n) {
                sets.union(i, j);
            }
        }
    }

    let mut groups: HashMap<usize, Vec<ChunkCoord>> = HashMap::new();
    for (i, coord) in coords.iter().enumerate() {
        let root = sets.find(i);
        groups.entry(root).or_default().push(*coord);
    }

    let mut out: Vec<Vec<ChunkCoord>> = groups.into_values().collect();
    // members were pushed in sorted order
    out.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a[0].cmp(&b[0])));
    out
}

/// Breadth-first order over face adjacency inside `group`, starting at its
/// smallest coordinate. Disconnected leftovers follow in coordinate order.
fn connected_order(group: &[ChunkCoord]) -> Vec<ChunkCoord> {
    let members: BTreeSet<ChunkCoord> = group.iter().copied().collect();
    let mut seen: HashSet<ChunkCoord> = HashSet::new();
    let mut order = Vec::with_capacity(members.len());

    for &start in &members {
        if !seen.insert(start) {
            continue;
        }
        let mut queue = VecDeque::from([start]);
        while let Some(c) = queue.pop_front() {
            order.push(c);
            let mut next: Vec<ChunkCoord> = c
                .face_neighbors()
                .into_iter()
                .filter(|n| members.contains(n))
                .collect();
            next.sort();
            for n in next {
                if seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
    }
    order
}

/// Decide which mesh-queued chunks to extract under `budget`.
pub fn plan_extraction(
    queued: &[ChunkCoord],
    carried: &[Vec<ChunkCoord>],
    budget: usize,
) -> ExtractionPlan {
    let carried_members: HashSet<ChunkCoord> = carried.iter().flatten().copied().collect();
    let groups = group_batches(queued, carried);

    let mut plan = ExtractionPlan::default();
    let mut remaining = budget;
    let mut processed_any = false;

    for (i, group) in groups.into_iter().enumerate() {
        if group.len() <= remaining {
            remaining -= group.len();
            processed_any = true;
            plan.batches.push(PlannedBatch {
                chunks: group,
                partial: false,
            });
        } else if i == 0 && !processed_any && remaining > 0 {
            // Smallest batch and nothing fits: split it so it cannot starve
            let order = connected_order(&group);
            let mut head: Vec<ChunkCoord> = order[..remaining].to_vec();
            let mut tail: Vec<ChunkCoord> = order[remaining..].to_vec();
            head.sort();
            tail.sort();
            remaining = 0;
            processed_any = true;
            plan.batches.push(PlannedBatch {
                chunks: head,
                partial: true,
            });
            plan.carried.push(tail);
        } else {
            if group.iter().any(|c| carried_members.contains(c)) {
                plan.carried.push(group.clone());
            }
            plan.deferred.push(group);
        }
    }

    plan
}
