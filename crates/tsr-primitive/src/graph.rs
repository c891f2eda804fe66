use std::sync::Arc;

use tsr_core::{NodeId, Value};

use crate::{ErrorKind, Primitive, PrimitiveError, PrimitiveInfo};

#[derive(Debug, Clone)]
pub struct PrimitiveNode {
    pub info: PrimitiveInfo,
    pub primitive: Arc<dyn Primitive>,
    pub operands: Vec<Value>,
}

/// Immutable arena of primitive nodes. Operands may only point at earlier
/// nodes, so every graph is a DAG; shared subexpressions are allowed.
#[derive(Debug, Clone)]
pub struct PrimitiveGraph {
    nodes: Vec<PrimitiveNode>,
    root: NodeId,
}

impl PrimitiveGraph {
    #[must_use]
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&PrimitiveNode> {
        self.nodes.get(id.0)
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Codenames in arena order.
    pub fn codenames(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.info.codename.as_str())
    }
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<PrimitiveNode>,
}

impl GraphBuilder {
    /// Appends a node with a generated codename `<name>_<index>`.
    pub fn add(
        &mut self,
        primitive: impl Primitive + 'static,
        operands: Vec<Value>,
    ) -> Result<NodeId, PrimitiveError> {
        let codename = format!("{}_{}", primitive.name(), self.nodes.len());
        self.add_named(primitive, operands, codename)
    }

    pub fn add_named(
        &mut self,
        primitive: impl Primitive + 'static,
        operands: Vec<Value>,
        codename: impl Into<String>,
    ) -> Result<NodeId, PrimitiveError> {
        let info = PrimitiveInfo::new(primitive.name(), codename);
        let id = NodeId(self.nodes.len());
        for operand in &operands {
            self.check_operand(&info, operand)?;
        }
        self.nodes.push(PrimitiveNode {
            info,
            primitive: Arc::new(primitive),
            operands,
        });
        Ok(id)
    }

    fn check_operand(&self, info: &PrimitiveInfo, operand: &Value) -> Result<(), PrimitiveError> {
        match operand {
            Value::PrimitiveHandle(target) if target.0 >= self.nodes.len() => Err(info.error(
                ErrorKind::InvalidArgument,
                format!("operand refers to node {} which does not exist yet", target.0),
            )),
            Value::List(items) => items
                .iter()
                .try_for_each(|item| self.check_operand(info, item)),
            _ => Ok(()),
        }
    }

    /// Finishes the graph with the last node as root.
    pub fn build(self) -> Result<PrimitiveGraph, PrimitiveError> {
        let Some(last) = self.nodes.len().checked_sub(1) else {
            return Err(PrimitiveInfo::new("graph", "graph").error(
                ErrorKind::InvalidArgument,
                "graph has no nodes",
            ));
        };
        self.build_with_root(NodeId(last))
    }

    pub fn build_with_root(self, root: NodeId) -> Result<PrimitiveGraph, PrimitiveError> {
        if root.0 >= self.nodes.len() {
            return Err(PrimitiveInfo::new("graph", "graph").error(
                ErrorKind::InvalidArgument,
                format!("root node {} does not exist", root.0),
            ));
        }
        Ok(PrimitiveGraph {
            nodes: self.nodes,
            root,
        })
    }
}
