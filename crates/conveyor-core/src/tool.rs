use crate::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named tool configuration: which agents may run for it, in what
/// default order, and how outputs flow between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool identifier referenced by tasks.
    pub tool_id: String,
    /// Ordered eligible agent set; also the default pipeline.
    pub agents: Vec<String>,
    /// When true, each agent's outputs become inputs of the next one.
    #[serde(default)]
    pub chain_outputs: bool,
    /// When true, agent outputs are persisted as the pipeline advances and
    /// survive a later agent's failure; otherwise outputs are buffered and
    /// persisted only on successful completion.
    #[serde(default)]
    pub checkpoint_partial: bool,
}

/// Registry of the tools a deployment offers.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolSpec>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a tool.
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.tool_id.clone(), spec);
    }

    /// Look up a tool by id.
    pub fn get(&self, tool_id: &str) -> Option<&ToolSpec> {
        self.tools.get(tool_id)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a task's agent selection against a tool.
    ///
    /// With no explicit selection the tool's default ordered set is used.
    /// An explicit selection must be non-empty and every agent must be
    /// eligible for the tool; the caller's ordering is preserved.
    pub fn validate_selection(
        &self,
        tool_id: &str,
        agents: Option<&[String]>,
    ) -> ConveyorResult<Vec<String>> {
        let spec = self
            .tools
            .get(tool_id)
            .ok_or_else(|| ConveyorError::Validation(format!("unknown tool '{tool_id}'")))?;

        match agents {
            None => Ok(spec.agents.clone()),
            Some([]) => Err(ConveyorError::Validation(format!(
                "empty agent selection for tool '{tool_id}'"
            ))),
            Some(selection) => {
                for agent in selection {
                    if !spec.agents.contains(agent) {
                        return Err(ConveyorError::Validation(format!(
                            "agent '{agent}' is not eligible for tool '{tool_id}'"
                        )));
                    }
                }
                Ok(selection.to_vec())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn catalog() -> ToolCatalog {
        let mut catalog = ToolCatalog::new();
        catalog.register(ToolSpec {
            tool_id: "dedup".into(),
            agents: vec!["profile".into(), "cleanse".into(), "resolve".into()],
            chain_outputs: true,
            checkpoint_partial: false,
        });
        catalog
    }

    #[test]
    fn default_selection_uses_tool_order() {
        let agents = catalog().validate_selection("dedup", None).unwrap();
        assert_eq!(agents, vec!["profile", "cleanse", "resolve"]);
    }

    #[test]
    fn explicit_selection_preserves_caller_order() {
        let selection = vec!["cleanse".to_string(), "profile".to_string()];
        let agents = catalog()
            .validate_selection("dedup", Some(&selection))
            .unwrap();
        assert_eq!(agents, vec!["cleanse", "profile"]);
    }

    #[test]
    fn unknown_tool_rejected() {
        let err = catalog().validate_selection("nope", None).unwrap_err();
        assert!(matches!(err, ConveyorError::Validation(_)));
    }

    #[test]
    fn ineligible_agent_rejected() {
        let selection = vec!["profile".to_string(), "launder".to_string()];
        let err = catalog()
            .validate_selection("dedup", Some(&selection))
            .unwrap_err();
        assert!(err.to_string().contains("launder"));
    }

    #[test]
    fn empty_selection_rejected() {
        let err = catalog().validate_selection("dedup", Some(&[])).unwrap_err();
        assert!(matches!(err, ConveyorError::Validation(_)));
    }
}
