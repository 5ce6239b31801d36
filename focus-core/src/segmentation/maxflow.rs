//! Dinic max-flow / min-cut on a compact arc list.
//!
//! Arcs are stored in pairs: arc `e` and its residual twin `e ^ 1`. The
//! augmenting search is iterative so grid-sized graphs with long paths do not
//! blow the stack.

use std::collections::VecDeque;

const EPS: f64 = 1e-9;

pub struct GraphBuilder {
    nodes: usize,
    tail: Vec<u32>,
    head: Vec<u32>,
    cap: Vec<f64>,
}

impl GraphBuilder {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            tail: Vec::new(),
            head: Vec::new(),
            cap: Vec::new(),
        }
    }

    pub fn with_capacity(nodes: usize, arc_pairs: usize) -> Self {
        Self {
            nodes,
            tail: Vec::with_capacity(arc_pairs * 2),
            head: Vec::with_capacity(arc_pairs * 2),
            cap: Vec::with_capacity(arc_pairs * 2),
        }
    }

    /// Add `u → v` with capacity `forward` and `v → u` with `backward`.
    pub fn add_edge(&mut self, u: usize, v: usize, forward: f64, backward: f64) {
        debug_assert!(u < self.nodes && v < self.nodes);
        self.tail.extend([u as u32, v as u32]);
        self.head.extend([v as u32, u as u32]);
        self.cap.extend([forward.max(0.0), backward.max(0.0)]);
    }

    pub fn build(self) -> FlowGraph {
        let mut offsets = vec![0usize; self.nodes + 1];
        for &t in &self.tail {
            offsets[t as usize + 1] += 1;
        }
        for i in 0..self.nodes {
            offsets[i + 1] += offsets[i];
        }
        let mut fill = offsets.clone();
        let mut adjacency = vec![0u32; self.tail.len()];
        for (arc, &t) in self.tail.iter().enumerate() {
            adjacency[fill[t as usize]] = arc as u32;
            fill[t as usize] += 1;
        }
        FlowGraph {
            offsets,
            adjacency,
            head: self.head,
            cap: self.cap,
        }
    }
}

pub struct FlowGraph {
    offsets: Vec<usize>,
    adjacency: Vec<u32>,
    head: Vec<u32>,
    /// Residual capacities.
    cap: Vec<f64>,
}

impl FlowGraph {
    pub fn node_count(&self) -> usize {
        self.offsets.len() - 1
    }

    fn arcs(&self, u: usize) -> &[u32] {
        &self.adjacency[self.offsets[u]..self.offsets[u + 1]]
    }

    /// Push the maximum flow from `s` to `t`; returns its value.
    pub fn max_flow(&mut self, s: usize, t: usize) -> f64 {
        if s == t {
            return 0.0;
        }
        let n = self.node_count();
        let mut level = vec![-1i32; n];
        let mut next = vec![0usize; n];
        let mut total = 0.0;

        while self.build_levels(s, t, &mut level) {
            next.iter_mut().enumerate().for_each(|(u, i)| *i = self.offsets[u]);
            total += self.blocking_flow(s, t, &mut level, &mut next);
        }
        total
    }

    fn build_levels(&self, s: usize, t: usize, level: &mut [i32]) -> bool {
        level.fill(-1);
        level[s] = 0;
        let mut queue = VecDeque::from([s]);
        while let Some(u) = queue.pop_front() {
            for &arc in self.arcs(u) {
                let v = self.head[arc as usize] as usize;
                if level[v] < 0 && self.cap[arc as usize] > EPS {
                    level[v] = level[u] + 1;
                    queue.push_back(v);
                }
            }
        }
        level[t] >= 0
    }

    fn blocking_flow(&mut self, s: usize, t: usize, level: &mut [i32], next: &mut [usize]) -> f64 {
        let mut total = 0.0;
        let mut path: Vec<usize> = Vec::new();
        let mut u = s;

        loop {
            if u == t {
                let bottleneck = path
                    .iter()
                    .map(|&a| self.cap[a])
                    .fold(f64::INFINITY, f64::min);
                for &a in &path {
                    self.cap[a] -= bottleneck;
                    self.cap[a ^ 1] += bottleneck;
                }
                total += bottleneck;
                // Retreat to just before the first saturated arc.
                let cut = path.iter().position(|&a| self.cap[a] <= EPS).unwrap_or(0);
                path.truncate(cut);
                u = path.last().map_or(s, |&a| self.head[a] as usize);
                continue;
            }

            let mut advanced = false;
            while next[u] < self.offsets[u + 1] {
                let arc = self.adjacency[next[u]] as usize;
                let v = self.head[arc] as usize;
                if self.cap[arc] > EPS && level[v] == level[u] + 1 {
                    path.push(arc);
                    u = v;
                    advanced = true;
                    break;
                }
                next[u] += 1;
            }
            if advanced {
                continue;
            }

            // Dead end: prune `u` from this phase and step back.
            level[u] = -1;
            match path.pop() {
                Some(arc) => {
                    u = self.head[arc ^ 1] as usize;
                    next[u] += 1;
                }
                None => return total,
            }
        }
    }

    /// Nodes reachable from `s` in the residual graph; after
    /// [`max_flow`](Self::max_flow) this is the source side of a minimum cut.
    pub fn source_side(&self, s: usize) -> Vec<bool> {
        let mut seen = vec![false; self.node_count()];
        seen[s] = true;
        let mut queue = VecDeque::from([s]);
        while let Some(u) = queue.pop_front() {
            for &arc in self.arcs(u) {
                let v = self.head[arc as usize] as usize;
                if !seen[v] && self.cap[arc as usize] > EPS {
                    seen[v] = true;
                    queue.push_back(v);
                }
            }
        }
        seen
    }
}
