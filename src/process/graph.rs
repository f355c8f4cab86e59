use std::collections::HashMap;
use std::sync::Mutex;

/// Parent-pid to child-pids mapping, used only to cascade a termination
/// signal one hop down to the children this process spawned.
///
/// One graph instance is owned by the orchestrator and shared by reference;
/// it is deliberately not process-global state.
#[derive(Debug, Default)]
pub struct ProcessGraph {
    children: Mutex<HashMap<i32, Vec<i32>>>,
}

impl ProcessGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `child` as spawned by `parent`.
    pub fn record_child(&self, parent: i32, child: i32) {
        self.children
            .lock()
            .unwrap()
            .entry(parent)
            .or_default()
            .push(child);
    }

    /// All pids recorded as children of `parent`, in spawn order.
    pub fn children_of(&self, parent: i32) -> Vec<i32> {
        self.children
            .lock()
            .unwrap()
            .get(&parent)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_recorded_in_spawn_order() {
        let graph = ProcessGraph::new();
        graph.record_child(100, 101);
        graph.record_child(100, 102);
        graph.record_child(200, 201);

        assert_eq!(graph.children_of(100), vec![101, 102]);
        assert_eq!(graph.children_of(200), vec![201]);
    }

    #[test]
    fn test_unknown_parent_has_no_children() {
        let graph = ProcessGraph::new();
        assert!(graph.children_of(42).is_empty());
    }
}
