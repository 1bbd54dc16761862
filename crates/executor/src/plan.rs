use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub estimated_duration_ms: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle detected among steps: {0:?}")]
    DependencyCycle(Vec<String>),
}

/// Reject duplicate ids, unknown `dependsOn` references, and dependency
/// cycles. Unknown tool ids are a per-step failure surfaced during
/// execution, not a whole-plan validation failure.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanValidationError> {
    let mut seen = HashSet::with_capacity(plan.steps.len());
    for step in &plan.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(PlanValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(PlanValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    detect_cycle(plan)
}

fn detect_cycle(plan: &Plan) -> Result<(), PlanValidationError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    let by_id: HashMap<&str, &PlanStep> =
        plan.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> =
        plan.steps.iter().map(|s| (s.id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a PlanStep>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<String>,
    ) -> Result<(), PlanValidationError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InStack) => {
                stack.push(id.to_string());
                return Err(PlanValidationError::DependencyCycle(stack.clone()));
            },
            _ => {},
        }
        marks.insert(id, Mark::InStack);
        stack.push(id.to_string());
        if let Some(step) = by_id.get(id) {
            for dep in &step.depends_on {
                visit(dep, by_id, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for step in &plan.steps {
        let mut stack = Vec::new();
        visit(&step.id, &by_id, &mut marks, &mut stack)?;
    }
    Ok(())
}

/// Dependency-respecting execution order. Assumes `validate_plan` already
/// passed; steps with no mutual dependency keep their original relative
/// order.
pub fn topological_order(plan: &Plan) -> Vec<&PlanStep> {
    let mut resolved: Vec<&str> = Vec::with_capacity(plan.steps.len());
    let mut resolved_set: HashSet<&str> = HashSet::with_capacity(plan.steps.len());
    let by_id: HashMap<&str, &PlanStep> =
        plan.steps.iter().map(|s| (s.id.as_str(), s)).collect();

    fn resolve<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a PlanStep>,
        resolved: &mut Vec<&'a str>,
        resolved_set: &mut HashSet<&'a str>,
    ) {
        if resolved_set.contains(id) {
            return;
        }
        if let Some(step) = by_id.get(id) {
            for dep in &step.depends_on {
                resolve(dep, by_id, resolved, resolved_set);
            }
        }
        resolved.push(id);
        resolved_set.insert(id);
    }

    for step in &plan.steps {
        resolve(&step.id, &by_id, &mut resolved, &mut resolved_set);
    }

    resolved
        .into_iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect()
}

/// Produces an ordered step list for a user message. An LLM-backed
/// implementation lives outside this crate; [`KeywordPlanner`] is the
/// always-available fallback.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, message: &str, session_history: Option<&[Value]>) -> Plan;
}

/// Deterministic, total fallback planner: keyword-matches a small set of
/// known intents to tool steps, always terminated by a `respond` step so a
/// plan is never empty.
pub struct KeywordPlanner {
    keyword_tools: Vec<(&'static str, &'static str)>,
}

impl Default for KeywordPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordPlanner {
    pub fn new() -> Self {
        Self {
            keyword_tools: vec![
                ("search", "web_search"),
                ("browse", "web_search"),
                ("file", "read_file"),
                ("read", "read_file"),
                ("run", "exec"),
                ("execute", "exec"),
            ],
        }
    }
}

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, message: &str, _session_history: Option<&[Value]>) -> Plan {
        let lower = message.to_lowercase();
        let mut steps = Vec::new();
        let mut matched_tools: HashSet<&'static str> = HashSet::new();

        for (keyword, tool_id) in &self.keyword_tools {
            if lower.contains(keyword) && matched_tools.insert(tool_id) {
                let step_id = format!("step-{}", steps.len() + 1);
                steps.push(PlanStep {
                    id: step_id,
                    description: format!("invoke {tool_id} for keyword '{keyword}'"),
                    tool_id: Some((*tool_id).to_string()),
                    input: Some(serde_json::json!({ "query": message })),
                    depends_on: Vec::new(),
                });
            }
        }

        let respond_depends_on: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        steps.push(PlanStep {
            id: "respond".to_string(),
            description: "compose the final reply".to_string(),
            tool_id: None,
            input: None,
            depends_on: respond_depends_on,
        });

        Plan {
            estimated_duration_ms: 500 * steps.len() as u64,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            description: String::new(),
            tool_id: None,
            input: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let plan = Plan {
            steps: vec![step("a", &[]), step("a", &[])],
            estimated_duration_ms: 0,
        };
        assert_eq!(
            validate_plan(&plan),
            Err(PlanValidationError::DuplicateStepId("a".into()))
        );
    }

    #[test]
    fn rejects_unknown_dependency() {
        let plan = Plan {
            steps: vec![step("a", &["ghost"])],
            estimated_duration_ms: 0,
        };
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let plan = Plan {
            steps: vec![step("a", &["b"]), step("b", &["a"])],
            estimated_duration_ms: 0,
        };
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanValidationError::DependencyCycle(_))
        ));
    }

    #[test]
    fn accepts_valid_dag() {
        let plan = Plan {
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])],
            estimated_duration_ms: 0,
        };
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let plan = Plan {
            steps: vec![step("c", &["a", "b"]), step("b", &["a"]), step("a", &[])],
            estimated_duration_ms: 0,
        };
        let order: Vec<&str> = topological_order(&plan).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn keyword_planner_always_ends_in_respond() {
        let planner = KeywordPlanner::new();
        let plan = planner.plan("please search for rust news", None).await;
        assert_eq!(plan.steps.last().unwrap().id, "respond");
        assert!(validate_plan(&plan).is_ok());
    }

    #[tokio::test]
    async fn keyword_planner_is_total_for_unmatched_input() {
        let planner = KeywordPlanner::new();
        let plan = planner.plan("hello there", None).await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].id, "respond");
    }
}
