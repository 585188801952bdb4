//! Validation of the calculator dependency graph.

use petgraph::visit::{depth_first_search, Control, DfsEvent, IntoNeighbors, IntoNodeIdentifiers, Visitable};

/// Find a node on a cycle of the graph, if there is one.
///
/// Calculators must form a directed acyclic graph: calculator `A` may not require `B`
/// if `B` (directly or not) requires `A`.
/// Unlike time-stepped models a calculator requiring itself is also a cycle.
pub(crate) fn find_cycle<G>(g: G) -> Option<G::NodeId>
where
    G: IntoNodeIdentifiers + IntoNeighbors + Visitable,
{
    let result = depth_first_search(g, g.node_identifiers(), |event| match event {
        DfsEvent::BackEdge(_, b) => Control::Break(b),
        _ => Control::Continue,
    });
    result.break_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::Graph;

    #[test]
    fn acyclic() {
        let mut graph: Graph<&str, ()> = Graph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_edge(a, b, ());
        graph.add_edge(a, c, ());
        graph.add_edge(b, c, ());
        assert_eq!(find_cycle(&graph), None);
    }

    #[test]
    fn cycle() {
        let mut graph: Graph<&str, ()> = Graph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        graph.add_edge(a, b, ());
        graph.add_edge(b, a, ());
        assert!(find_cycle(&graph).is_some());
    }

    #[test]
    fn self_loop() {
        let mut graph: Graph<&str, ()> = Graph::new();
        let a = graph.add_node("a");
        graph.add_edge(a, a, ());
        assert_eq!(find_cycle(&graph), Some(a));
    }
}
