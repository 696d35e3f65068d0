use std::collections::BTreeMap;

use trellis_base::ConceptId;

// Dependency graph between the types rules read and produce: an edge
// t -> t' says "facts about t can produce facts about t'", negative when t
// is read under negation. A rule set is stratifiable exactly when no
// strongly connected component contains a negative edge.
pub(crate) struct RuleGraph {
    index: BTreeMap<ConceptId, usize>,
    nodes: Vec<ConceptId>,
    adj: Vec<Vec<usize>>,
    edges: Vec<(usize, usize, bool)>,
}

impl RuleGraph {
    pub(crate) fn new() -> RuleGraph {
        RuleGraph {
            index: BTreeMap::new(),
            nodes: Vec::new(),
            adj: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn node(&mut self, id: ConceptId) -> usize {
        if let Some(i) = self.index.get(&id) {
            return *i;
        }
        let i = self.nodes.len();
        self.index.insert(id, i);
        self.nodes.push(id);
        self.adj.push(Vec::new());
        i
    }

    pub(crate) fn add_edge(&mut self, from: ConceptId, to: ConceptId, negative: bool) {
        let f = self.node(from);
        let t = self.node(to);
        if !self.edges.contains(&(f, t, negative)) {
            self.adj[f].push(t);
            self.edges.push((f, t, negative));
        }
    }

    // Tarjan's strongly-connected components, iterative so deep chains of
    // rules cannot blow the call stack. Returns the component id per node.
    fn components(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let unvisited = usize::MAX;
        let mut order = vec![unvisited; n];
        let mut low = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut comp = vec![0usize; n];
        let mut next_order = 0usize;
        let mut next_comp = 0usize;

        for root in 0..n {
            if order[root] != unvisited {
                continue;
            }
            let mut call: Vec<(usize, usize)> = vec![(root, 0)];
            while let Some(&(v, ci)) = call.last() {
                if order[v] == unvisited {
                    order[v] = next_order;
                    low[v] = next_order;
                    next_order += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }
                if ci < self.adj[v].len() {
                    if let Some(frame) = call.last_mut() {
                        frame.1 += 1;
                    }
                    let w = self.adj[v][ci];
                    if order[w] == unvisited {
                        call.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(order[w]);
                    }
                } else {
                    if low[v] == order[v] {
                        while let Some(w) = stack.pop() {
                            on_stack[w] = false;
                            comp[w] = next_comp;
                            if w == v {
                                break;
                            }
                        }
                        next_comp += 1;
                    }
                    call.pop();
                    if let Some(&(parent, _)) = call.last() {
                        low[parent] = low[parent].min(low[v]);
                    }
                }
            }
        }
        comp
    }

    // The negative edges that close a cycle, as (from, to) type pairs.
    // Empty means the rule set is stratifiable.
    pub(crate) fn negative_cycle_edges(&self) -> Vec<(ConceptId, ConceptId)> {
        let comp = self.components();
        self.edges
            .iter()
            .filter(|(f, t, negative)| *negative && comp[*f] == comp[*t])
            .map(|(f, t, _)| (self.nodes[*f], self.nodes[*t]))
            .collect()
    }
}
