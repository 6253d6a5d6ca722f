//! Goal decomposition, complexity estimation, and plan adaptation.
//!
//! Decomposition is a keyword-driven strategy selection: the goal text is
//! matched against a set of categories (create, refactor, audit, document,
//! optimize, test, fix, cleanup) and each category emits an ordered step
//! list forming a valid topological order (a linear dependency chain).
//! Natural-language understanding quality is explicitly out of scope; the
//! strategy is pluggable at the category table.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::task::{
    ActionKind, AgentAction, AgenticTask, RiskLevel, RuleCategory, RuleSeverity, TaskStep,
    ValidationRule,
};

/// Errors that can occur during planning.
#[derive(Debug, Error)]
pub enum PlanningError {
    /// The goal text was empty or whitespace.
    #[error("goal is empty")]
    EmptyGoal,

    /// The goal did not resolve to any actionable step.
    #[error("goal resolved to zero actionable steps: {0}")]
    NoActionableSteps(String),
}

/// Result type for planning operations.
pub type Result<T> = std::result::Result<T, PlanningError>;

/// Complexity classification for a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComplexityLevel {
    /// Single obvious action.
    Trivial,
    /// A short, well-scoped task.
    Low,
    /// Several coordinated steps.
    Medium,
    /// Broad or cross-cutting work.
    High,
    /// Open-ended, project-wide work.
    VeryHigh,
}

/// Side-effect-free complexity estimate for a goal.
#[derive(Debug, Clone)]
pub struct ComplexityEstimate {
    /// Estimated complexity level.
    pub level: ComplexityLevel,
    /// Estimated total time in milliseconds.
    pub estimated_ms: u64,
    /// Confidence in the estimate (0.0-1.0).
    pub confidence: f32,
    /// Factors contributing to the estimate.
    pub factors: Vec<String>,
}

/// Validation report for a decomposed plan.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Whether the plan is valid.
    pub is_valid: bool,
    /// Validation errors.
    pub errors: Vec<String>,
    /// Validation warnings.
    pub warnings: Vec<String>,
}

/// Decomposition strategy category, selected by keyword heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GoalCategory {
    Create,
    Refactor,
    Audit,
    Document,
    Optimize,
    Test,
    Fix,
    Cleanup,
    General,
}

impl GoalCategory {
    fn classify(goal: &str) -> Self {
        let lower = goal.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        // Destructive intents win over creative ones when both appear
        // ("delete old files and create a summary" is a cleanup).
        if has(&["delete", "remove", "clean", "cleanup", "purge"]) {
            GoalCategory::Cleanup
        } else if has(&["refactor", "restructure", "rework", "extract"]) {
            GoalCategory::Refactor
        } else if has(&["audit", "security", "vulnerab", "review"]) {
            GoalCategory::Audit
        } else if has(&["document", "docs", "readme", "comment"]) {
            GoalCategory::Document
        } else if has(&["optimize", "performance", "speed up", "faster"]) {
            GoalCategory::Optimize
        } else if has(&["test", "coverage", "spec"]) {
            GoalCategory::Test
        } else if has(&["fix", "bug", "repair", "broken"]) {
            GoalCategory::Fix
        } else if has(&["create", "add", "new", "implement", "write", "build", "generate"]) {
            GoalCategory::Create
        } else {
            GoalCategory::General
        }
    }
}

/// Turns free-form goals into structured tasks.
#[derive(Debug, Default)]
pub struct GoalPlanner;

impl GoalPlanner {
    /// Creates a new planner.
    pub fn new() -> Self {
        Self
    }

    /// Decomposes a goal into a task with an ordered, dependency-chained
    /// step list.
    ///
    /// # Errors
    /// Returns `PlanningError` if the goal is empty or resolves to zero
    /// actionable steps.
    pub fn decompose_goal(&self, goal: &str) -> Result<AgenticTask> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(PlanningError::EmptyGoal);
        }

        let category = GoalCategory::classify(goal);
        debug!(?category, goal, "selected decomposition strategy");

        let specs: Vec<(ActionKind, String)> = match category {
            GoalCategory::Create => vec![
                (ActionKind::CreateFile, format!("Create file for: {goal}")),
                (ActionKind::RunTests, "Run tests over the new file".to_string()),
            ],
            GoalCategory::Refactor => vec![
                (ActionKind::AnalyzeCode, "Analyze current structure".to_string()),
                (ActionKind::RefactorCode, format!("Apply refactoring for: {goal}")),
                (ActionKind::RunTests, "Run tests to confirm behavior".to_string()),
                (ActionKind::CommitChanges, "Commit the refactoring".to_string()),
            ],
            GoalCategory::Audit => vec![
                (ActionKind::AnalyzeCode, "Analyze code for audit".to_string()),
                (ActionKind::ValidateSecurity, format!("Run security validation for: {goal}")),
                (ActionKind::AnalyzeDependencies, "Audit dependency tree".to_string()),
            ],
            GoalCategory::Document => vec![
                (ActionKind::AnalyzeCode, "Analyze code to document".to_string()),
                (ActionKind::GenerateDocumentation, format!("Generate documentation for: {goal}")),
            ],
            GoalCategory::Optimize => vec![
                (ActionKind::AnalyzeCode, "Profile current hot paths".to_string()),
                (ActionKind::OptimizePerformance, format!("Optimize for: {goal}")),
                (ActionKind::RunTests, "Run tests to confirm behavior".to_string()),
            ],
            GoalCategory::Test => vec![
                (ActionKind::AnalyzeCode, "Analyze untested code paths".to_string()),
                (ActionKind::RunTests, format!("Run test suite for: {goal}")),
            ],
            GoalCategory::Fix => vec![
                (ActionKind::AnalyzeCode, "Locate the defect".to_string()),
                (ActionKind::EditFile, format!("Apply fix for: {goal}")),
                (ActionKind::RunTests, "Run tests to confirm the fix".to_string()),
            ],
            GoalCategory::Cleanup => vec![
                (ActionKind::AnalyzeCode, "Identify files to remove".to_string()),
                (ActionKind::DeleteFile, format!("Delete files for: {goal}")),
                (ActionKind::RunCommand, "Verify workspace builds after cleanup".to_string()),
            ],
            GoalCategory::General => vec![
                (ActionKind::AnalyzeCode, format!("Analyze workspace for: {goal}")),
            ],
        };

        if specs.is_empty() {
            return Err(PlanningError::NoActionableSteps(goal.to_string()));
        }

        let mut steps: Vec<TaskStep> = Vec::with_capacity(specs.len());
        for (kind, description) in specs {
            let action = AgentAction::new(kind, description.clone(), Self::default_target(kind, goal))
                .with_rule(Self::default_rule(kind));
            let mut step = TaskStep::new(action, description);
            if let Some(prev) = steps.last() {
                step = step.depends_on(prev.id.clone());
            }
            steps.push(step);
        }

        let mut task = AgenticTask::new(goal, steps);
        task.metadata.source = format!("goal:{category:?}").to_lowercase();
        Ok(task)
    }

    /// Estimates goal complexity without side effects.
    pub fn estimate_complexity(&self, goal: &str) -> ComplexityEstimate {
        let goal = goal.trim();
        let words = goal.split_whitespace().count();
        let mut score = words / 6;
        let mut factors = vec![format!("{words} words in goal")];

        let lower = goal.to_lowercase();
        for (marker, weight, label) in [
            ("all", 2usize, "goal spans the whole workspace"),
            ("entire", 2, "goal spans the whole workspace"),
            (" and ", 1, "goal combines multiple intents"),
            ("migrate", 2, "migration work is cross-cutting"),
            ("rewrite", 2, "rewrites touch many files"),
        ] {
            if lower.contains(marker) {
                score += weight;
                factors.push(label.to_string());
            }
        }

        let level = match score {
            0 => ComplexityLevel::Trivial,
            1 => ComplexityLevel::Low,
            2..=3 => ComplexityLevel::Medium,
            4..=5 => ComplexityLevel::High,
            _ => ComplexityLevel::VeryHigh,
        };
        let estimated_ms = 10_000 * (score as u64 + 1);
        // Confidence drops as the goal gets vaguer.
        let confidence = (0.9 - 0.1 * score as f32).max(0.3);

        ComplexityEstimate { level, estimated_ms, confidence, factors }
    }

    /// Produces an adapted copy of a task according to feedback text.
    ///
    /// The input task is never mutated; the returned task carries an
    /// incremented `metadata.version`. Feedback implying excess risk
    /// tightens approval requirements and inserts a security-validation
    /// step; feedback asking for tests appends a test step.
    pub fn adapt_plan(&self, task: &AgenticTask, feedback: &str) -> AgenticTask {
        let mut adapted = task.clone();
        adapted.metadata.version += 1;
        adapted.metadata.touch();
        adapted.metadata.source = format!("adapted:{}", task.metadata.source);

        let lower = feedback.to_lowercase();
        if ["risk", "danger", "careful", "unsafe", "cautious"].iter().any(|w| lower.contains(w)) {
            adapted.approval_required = true;
            for step in &mut adapted.steps {
                if step.action.kind.is_destructive() {
                    step.approval_required = true;
                    step.action.requires_approval = true;
                }
            }
            // Front-load a security check before any pending work runs.
            let action = AgentAction::new(
                ActionKind::ValidateSecurity,
                "Validate security before continuing",
                adapted.context.workspace_root.clone(),
            );
            let validation = TaskStep::new(action, "Validate security before continuing");
            let first_pending = adapted
                .steps
                .iter()
                .position(|s| !s.status.is_terminal())
                .unwrap_or(adapted.steps.len());
            adapted.steps.insert(first_pending, validation);
        }

        if lower.contains("test") && !adapted.steps.iter().any(|s| s.action.kind == ActionKind::RunTests) {
            let action = AgentAction::new(ActionKind::RunTests, "Run tests requested by feedback", "");
            let mut step = TaskStep::new(action, "Run tests requested by feedback");
            if let Some(last) = adapted.steps.last() {
                step = step.depends_on(last.id.clone());
            }
            adapted.steps.push(step);
        }

        adapted.risk_level = adapted.steps.iter().map(|s| s.risk_level).max().unwrap_or(RiskLevel::Low);
        adapted.estimated_ms = adapted.steps.iter().map(|s| s.action.estimated_ms).sum();
        adapted.refresh_progress();
        adapted
    }

    /// Validates a decomposed plan: every dependency must reference a known
    /// step and the dependency graph must be acyclic.
    pub fn validate_plan(&self, task: &AgenticTask) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for step in &task.steps {
            nodes.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
        }

        for step in &task.steps {
            for dep in &step.dependencies {
                match nodes.get(dep.as_str()) {
                    Some(&dep_node) => {
                        graph.add_edge(dep_node, nodes[step.id.as_str()], ());
                    }
                    None => errors.push(format!(
                        "step '{}' references unknown dependency '{}'",
                        step.id, dep
                    )),
                }
            }
        }

        if is_cyclic_directed(&graph) {
            errors.push("dependency cycle detected".to_string());
        }

        if task.steps.is_empty() {
            errors.push("plan has no steps".to_string());
        }
        if task.progress.total_steps as usize != task.steps.len() {
            warnings.push("progress.total_steps does not match step count".to_string());
        }

        ValidationReport { is_valid: errors.is_empty(), errors, warnings }
    }

    fn default_target(kind: ActionKind, goal: &str) -> String {
        match kind {
            ActionKind::RunCommand => "build".to_string(),
            ActionKind::RunTests => "test".to_string(),
            _ => goal.split_whitespace().take(4).collect::<Vec<_>>().join("-").to_lowercase(),
        }
    }

    fn default_rule(kind: ActionKind) -> ValidationRule {
        match kind {
            ActionKind::CreateFile | ActionKind::EditFile | ActionKind::RefactorCode => {
                ValidationRule::new(RuleCategory::Security, RuleSeverity::Error, "secret_scan")
            }
            ActionKind::DeleteFile | ActionKind::RunCommand => {
                ValidationRule::new(RuleCategory::Compliance, RuleSeverity::Error, "workspace_path")
            }
            _ => ValidationRule::new(RuleCategory::Quality, RuleSeverity::Warning, "non_empty_output"),
        }
    }
}
