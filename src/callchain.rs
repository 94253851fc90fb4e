//! Call-chain trie: repeated stacks are folded into shared prefixes, each
//! node weighted by the samples ending at it and passing through it.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallChainNode<F> {
    /// Frames shared by every chain through this node; never empty.
    pub chain: Vec<F>,
    /// Weight of chains ending exactly here.
    pub period: u64,
    /// Weight of chains continuing into `children`.
    pub children_period: u64,
    pub children: Vec<CallChainNode<F>>,
}

impl<F> CallChainNode<F> {
    fn new(chain: Vec<F>, period: u64) -> Self {
        CallChainNode {
            chain,
            period,
            children_period: 0,
            children: Vec::new(),
        }
    }

    pub fn total_period(&self) -> u64 {
        self.period + self.children_period
    }

    /// Keep the first `at` frames here and push the rest, with all weight
    /// and children, into a single new child.
    fn split(&mut self, at: usize) {
        let tail = CallChainNode {
            chain: self.chain.split_off(at),
            period: self.period,
            children_period: self.children_period,
            children: std::mem::take(&mut self.children),
        };
        self.period = 0;
        self.children_period = tail.total_period();
        self.children = vec![tail];
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallChainRoot<F> {
    pub children_period: u64,
    pub children: Vec<CallChainNode<F>>,
}

impl<F> Default for CallChainRoot<F> {
    fn default() -> Self {
        CallChainRoot {
            children_period: 0,
            children: Vec::new(),
        }
    }
}

impl<F: PartialEq + Clone> CallChainRoot<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Insert one chain, outermost frame first. Empty chains are ignored.
    pub fn add_call_chain(&mut self, chain: &[F], period: u64) {
        if chain.is_empty() {
            return;
        }
        self.children_period += period;
        insert(&mut self.children, chain, period);
    }

    /// Order every sibling list by total weight, heaviest first.
    pub fn sort_by_period(&mut self) {
        let mut queue: VecDeque<&mut Vec<CallChainNode<F>>> = VecDeque::new();
        queue.push_back(&mut self.children);
        while let Some(nodes) = queue.pop_front() {
            nodes.sort_by(|a, b| b.total_period().cmp(&a.total_period()));
            for node in nodes.iter_mut() {
                queue.push_back(&mut node.children);
            }
        }
    }

    /// Visit nodes depth-first with their depth, parents before children.
    pub fn visit(&self, mut f: impl FnMut(usize, &CallChainNode<F>)) {
        fn walk<F>(nodes: &[CallChainNode<F>], depth: usize, f: &mut impl FnMut(usize, &CallChainNode<F>)) {
            for node in nodes {
                f(depth, node);
                walk(&node.children, depth + 1, f);
            }
        }
        walk(&self.children, 0, &mut f);
    }
}

fn insert<F: PartialEq + Clone>(nodes: &mut Vec<CallChainNode<F>>, chain: &[F], period: u64) {
    let Some(node) = nodes.iter_mut().find(|n| n.chain.first() == chain.first()) else {
        nodes.push(CallChainNode::new(chain.to_vec(), period));
        return;
    };
    let matched = node
        .chain
        .iter()
        .zip(chain)
        .take_while(|(a, b)| a == b)
        .count();
    if matched < node.chain.len() {
        node.split(matched);
    }
    let rest = &chain[matched..];
    if rest.is_empty() {
        node.period += period;
        return;
    }
    node.children_period += period;
    insert(&mut node.children, rest, period);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_node(node: &CallChainNode<&str>) {
        assert!(!node.chain.is_empty());
        let children: u64 = node.children.iter().map(|c| c.total_period()).sum();
        assert_eq!(node.children_period, children);
        check_siblings(&node.children);
    }

    fn check_siblings(nodes: &[CallChainNode<&str>]) {
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                assert_ne!(a.chain[0], b.chain[0]);
            }
            check_node(a);
        }
    }

    fn check(root: &CallChainRoot<&str>) {
        let children: u64 = root.children.iter().map(|c| c.total_period()).sum();
        assert_eq!(root.children_period, children);
        check_siblings(&root.children);
    }

    #[test]
    fn test_shared_prefix_is_split() {
        let mut root = CallChainRoot::new();
        root.add_call_chain(&["main", "a", "b"], 1);
        check(&root);
        root.add_call_chain(&["main", "a", "c"], 2);
        check(&root);
        assert_eq!(root.children.len(), 1);
        let main = &root.children[0];
        assert_eq!(main.chain, vec!["main", "a"]);
        assert_eq!(main.period, 0);
        assert_eq!(main.children_period, 3);
        assert_eq!(main.children.len(), 2);
        assert_eq!(main.children[0].chain, vec!["b"]);
        assert_eq!(main.children[1].chain, vec!["c"]);
        assert_eq!(main.children[1].period, 2);
    }

    #[test]
    fn test_chain_ending_inside_a_node() {
        let mut root = CallChainRoot::new();
        root.add_call_chain(&["main", "a", "b"], 5);
        root.add_call_chain(&["main"], 3);
        check(&root);
        let main = &root.children[0];
        assert_eq!(main.chain, vec!["main"]);
        assert_eq!(main.period, 3);
        assert_eq!(main.children_period, 5);
        assert_eq!(main.children[0].chain, vec!["a", "b"]);

        root.add_call_chain(&["main", "a", "b"], 1);
        check(&root);
        assert_eq!(root.children[0].children[0].period, 6);
        assert_eq!(root.children_period, 9);
    }

    #[test]
    fn test_weight_through_prefix() {
        let chains: &[(&[&str], u64)] = &[
            (&["m", "x", "y"], 1),
            (&["m", "x"], 2),
            (&["m", "z"], 4),
            (&["n"], 8),
            (&["m", "x", "y", "w"], 16),
            (&["m", "x", "q"], 32),
        ];
        let mut root = CallChainRoot::new();
        for (i, (chain, period)) in chains.iter().enumerate() {
            root.add_call_chain(chain, *period);
            check(&root);
            // Every chain so far starting with "m" passes through the "m" node.
            let expected: u64 = chains[..=i]
                .iter()
                .filter(|(c, _)| c[0] == "m")
                .map(|(_, p)| p)
                .sum();
            let m = root.children.iter().find(|n| n.chain[0] == "m").unwrap();
            assert_eq!(m.total_period(), expected);
        }
        assert_eq!(root.children_period, 63);
        root.add_call_chain(&[], 100);
        assert_eq!(root.children_period, 63);
    }

    #[test]
    fn test_sort_by_period_is_breadth_first() {
        let mut root = CallChainRoot::new();
        root.add_call_chain(&["a", "x"], 1);
        root.add_call_chain(&["b"], 5);
        root.add_call_chain(&["a", "y"], 3);
        root.add_call_chain(&["a", "z"], 2);
        root.sort_by_period();
        let order: Vec<(usize, &str)> = {
            let mut v = Vec::new();
            root.visit(|depth, node| v.push((depth, node.chain[0])));
            v
        };
        assert_eq!(
            order,
            vec![(0, "a"), (1, "y"), (1, "z"), (1, "x"), (0, "b")]
        );
    }
}
