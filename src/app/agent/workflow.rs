use crate::app::agent::model::AgentState;
use crate::app::agent::nodes::{input_node, process_node, recommend_node};
use crate::utils::error::{BootstrapError, Result};
use std::collections::HashMap;

/// Terminal pseudo-node.
pub const END: &str = "__end__";

pub type NodeFn = Box<dyn Fn(&mut AgentState) -> Result<()> + Send + Sync>;

fn workflow_error(message: impl Into<String>) -> BootstrapError {
    BootstrapError::WorkflowError {
        message: message.into(),
    }
}

/// Collects nodes and edges before they are checked by [`StateGraph::compile`].
#[derive(Default)]
pub struct StateGraph {
    nodes: Vec<(String, NodeFn)>,
    edges: Vec<(String, String)>,
    entry: Option<String>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node<F>(&mut self, name: impl Into<String>, node: F) -> &mut Self
    where
        F: Fn(&mut AgentState) -> Result<()> + Send + Sync + 'static,
    {
        self.nodes.push((name.into(), Box::new(node)));
        self
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn set_entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry = Some(name.into());
        self
    }

    pub fn compile(self) -> Result<Workflow> {
        let entry = self
            .entry
            .ok_or_else(|| workflow_error("no entry point set"))?;

        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for (name, node) in self.nodes {
            if name == END {
                return Err(workflow_error(format!("'{}' is reserved", END)));
            }
            if nodes.insert(name.clone(), node).is_some() {
                return Err(workflow_error(format!("node '{}' added twice", name)));
            }
        }
        if !nodes.contains_key(&entry) {
            return Err(workflow_error(format!("entry point '{}' is not a node", entry)));
        }

        let mut edges = HashMap::with_capacity(self.edges.len());
        for (from, to) in self.edges {
            if !nodes.contains_key(&from) {
                return Err(workflow_error(format!("edge from unknown node '{}'", from)));
            }
            if to != END && !nodes.contains_key(&to) {
                return Err(workflow_error(format!("edge to unknown node '{}'", to)));
            }
            if edges.insert(from.clone(), to).is_some() {
                return Err(workflow_error(format!("node '{}' has more than one edge", from)));
            }
        }

        Ok(Workflow {
            nodes,
            edges,
            entry,
        })
    }
}

/// A checked graph that can be invoked repeatedly.
pub struct Workflow {
    nodes: HashMap<String, NodeFn>,
    edges: HashMap<String, String>,
    entry: String,
}

impl Workflow {
    pub fn invoke(&self, input_data: serde_json::Value) -> Result<AgentState> {
        let mut state = AgentState::new(input_data);
        let mut current = self.entry.clone();
        let mut visited = 0;

        while current != END {
            visited += 1;
            if visited > self.nodes.len() {
                return Err(workflow_error(format!("cycle detected at '{}'", current)));
            }
            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| workflow_error(format!("unknown node '{}'", current)))?;
            tracing::debug!("Running node {}", current);
            node(&mut state)?;

            current = self
                .edges
                .get(&current)
                .cloned()
                .ok_or_else(|| workflow_error(format!("node '{}' has no outgoing edge", current)))?;
        }
        Ok(state)
    }
}

/// input → process → recommend → END
pub fn create_workflow() -> Result<Workflow> {
    let mut builder = StateGraph::new();
    builder
        .add_node("input", input_node)
        .add_node("process", process_node)
        .add_node("recommend", recommend_node)
        .set_entry_point("input")
        .add_edge("input", "process")
        .add_edge("process", "recommend")
        .add_edge("recommend", END);
    builder.compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::agent::model::{sample_input, ProfitStatus};
    use serde_json::json;

    #[test]
    fn test_sample_input() {
        let workflow = create_workflow().unwrap();
        let state = workflow.invoke(sample_input()).unwrap();
        let report = state.report.unwrap();

        assert_eq!(report.profit_status, ProfitStatus::Positive);
        assert!(report.alerts.is_empty());
        assert_eq!(
            report.recommendations,
            vec!["Consider increasing advertising budget to capitalize on growth"]
        );
    }

    #[test]
    fn test_input_error_stops_workflow() {
        let workflow = create_workflow().unwrap();
        let err = workflow.invoke(json!({"today": {}})).unwrap_err();
        assert!(matches!(err, BootstrapError::AgentInputError { .. }));
    }

    #[test]
    fn test_compile_rejects_bad_graphs() {
        assert!(StateGraph::new().compile().is_err());

        let mut unknown = StateGraph::new();
        unknown
            .add_node("a", |_: &mut AgentState| Ok(()))
            .set_entry_point("a")
            .add_edge("a", "b");
        assert!(unknown.compile().is_err());

        let mut forked = StateGraph::new();
        forked
            .add_node("a", |_: &mut AgentState| Ok(()))
            .add_node("b", |_: &mut AgentState| Ok(()))
            .set_entry_point("a")
            .add_edge("a", "b")
            .add_edge("a", END);
        assert!(forked.compile().is_err());
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut graph = StateGraph::new();
        graph
            .add_node("a", |_: &mut AgentState| Ok(()))
            .add_node("b", |_: &mut AgentState| Ok(()))
            .set_entry_point("a")
            .add_edge("a", "b")
            .add_edge("b", "a");
        let workflow = graph.compile().unwrap();

        let err = workflow.invoke(json!({})).unwrap_err();
        assert!(matches!(err, BootstrapError::WorkflowError { .. }));
    }
}
