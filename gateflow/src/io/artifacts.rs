//! Markdown artifacts written into each run directory.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::analysis::diff_paths;
use crate::core::router::Stage;
use crate::core::types::Run;

pub const CHANGE_REQUEST: &str = "change-request.md";
pub const TEST_PLAN: &str = "test-plan.md";
pub const RUN_REPORT: &str = "run-report.md";
pub const RISK_REPORT: &str = "risk-report.md";
pub const FINAL_SUMMARY: &str = "final-summary.md";
pub const PR_COMMENT: &str = "pr-comment.md";
pub const METRICS: &str = "metrics.json";

const CHANGE_REQUEST_TEMPLATE: &str = include_str!("templates/change_request.md");
const TEST_PLAN_TEMPLATE: &str = include_str!("templates/test_plan.md");
const RUN_REPORT_TEMPLATE: &str = include_str!("templates/run_report.md");
const RISK_REPORT_TEMPLATE: &str = include_str!("templates/risk_report.md");
const FINAL_SUMMARY_TEMPLATE: &str = include_str!("templates/final_summary.md");
const PR_COMMENT_TEMPLATE: &str = include_str!("templates/pr_comment.md");

/// Renders run artifacts from the bundled templates.
pub struct ArtifactRenderer {
    env: Environment<'static>,
}

impl Default for ArtifactRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            (CHANGE_REQUEST, CHANGE_REQUEST_TEMPLATE),
            (TEST_PLAN, TEST_PLAN_TEMPLATE),
            (RUN_REPORT, RUN_REPORT_TEMPLATE),
            (RISK_REPORT, RISK_REPORT_TEMPLATE),
            (FINAL_SUMMARY, FINAL_SUMMARY_TEMPLATE),
            (PR_COMMENT, PR_COMMENT_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled artifact template should be valid");
        }
        Self { env }
    }

    /// Deterministic change request used when no generated plan is available.
    ///
    /// Always satisfies the change-request contract.
    pub fn fallback_change_request(&self, run: &Run, test_command: &[String]) -> Result<String> {
        let objective = run.inputs.story.trim();
        let objective = if objective.is_empty() {
            "Implement the change described for this run."
        } else {
            objective
        };
        self.render(
            CHANGE_REQUEST,
            context! {
                run_id => &run.run_id,
                objective => objective,
                scope => diff_paths(&run.context.current_diff),
                test_command => test_command.join(" "),
            },
        )
    }

    pub fn fallback_test_plan(&self, run: &Run, test_command: &[String]) -> Result<String> {
        self.render(
            TEST_PLAN,
            context! {
                scope => diff_paths(&run.context.current_diff),
                test_command => test_command.join(" "),
            },
        )
    }

    pub fn run_report(&self, run: &Run) -> Result<String> {
        let story = run.inputs.story.trim();
        self.render(
            RUN_REPORT,
            context! {
                run_id => &run.run_id,
                created_at => run.created_at.to_rfc3339(),
                story => if story.is_empty() { "(not provided)" } else { story },
            },
        )
    }

    pub fn risk_report(&self, run: &Run) -> Result<String> {
        self.render(
            RISK_REPORT,
            context! {
                level => run.risk.regression_level.as_str(),
                impacted => &run.risk.impacted_paths,
                suggested_tests => &run.risk.suggested_tests,
                notes => &run.risk.notes,
            },
        )
    }

    pub fn final_summary(&self, run: &Run) -> Result<String> {
        let test_failures = run.tests.results.iter().filter(|r| !r.passed).count();
        self.render(
            FINAL_SUMMARY,
            context! {
                run_id => &run.run_id,
                status => run.status.as_str(),
                loop_iters => run.loop_iters,
                applied_files => &run.edits.applied_files,
                risk_level => run.risk.regression_level.as_str(),
                test_runs => run.tests.results.len(),
                test_failures => test_failures,
                command_count => run.commands.len(),
                approvals => &run.approvals,
            },
        )
    }

    pub fn pr_comment(&self, run: &Run) -> Result<String> {
        let story = run.inputs.story.trim();
        let last_test = match run.tests.results.last() {
            Some(result) if result.passed => "passed",
            Some(_) => "failed, see run-report.md",
            None => "not run",
        };
        self.render(
            PR_COMMENT,
            context! {
                story => if story.is_empty() { "(not provided)" } else { story },
                status => run.status.as_str(),
                branch => &run.edits.branch_name,
                applied_files => &run.edits.applied_files,
                last_test => last_test,
                risk_level => run.risk.regression_level.as_str(),
                impacted => &run.risk.impacted_paths,
                notes => &run.risk.notes,
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let mut rendered = template.render(ctx)?;
        if !rendered.ends_with('\n') {
            rendered.push('\n');
        }
        Ok(rendered)
    }
}

/// Section appended to run-report.md by each stage.
pub fn node_section(stage: Stage, body: &str) -> String {
    format!("\n## Node {stage}\n{}\n", body.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contract::validate_change_request;
    use crate::core::types::{RiskLevel, RunInputs, now};

    fn run(story: &str, diff: &str) -> Run {
        let inputs = RunInputs {
            story: story.to_string(),
            ..RunInputs::default()
        };
        let mut run = Run::new("20260101_000000_beef".to_string(), inputs, now());
        run.context.current_diff = diff.to_string();
        run
    }

    fn cargo_test() -> Vec<String> {
        vec!["cargo".to_string(), "test".to_string()]
    }

    #[test]
    fn fallback_change_request_satisfies_contract() {
        let renderer = ArtifactRenderer::new();
        for (story, diff) in [
            ("Add a greeting", "--- a/src/lib.rs\n+++ b/src/lib.rs\n"),
            ("", ""),
        ] {
            let text = renderer
                .fallback_change_request(&run(story, diff), &cargo_test())
                .expect("render");
            let report = validate_change_request(text.as_bytes());
            assert!(report.ok, "{:?}\n{text}", report.issues);
            assert!(text.contains("`cargo test`"));
        }
    }

    #[test]
    fn test_plan_lists_changed_paths() {
        let text = ArtifactRenderer::new()
            .fallback_test_plan(
                &run("x", "--- a/src/a.rs\n+++ b/src/a.rs\n"),
                &cargo_test(),
            )
            .expect("render");
        assert!(text.contains("- `src/a.rs`"));
    }

    #[test]
    fn risk_report_and_pr_comment_reflect_state() {
        let renderer = ArtifactRenderer::new();
        let mut run = run("Ship it", "");
        run.risk.regression_level = RiskLevel::Medium;
        run.risk.impacted_paths = vec!["a.txt".to_string(), "b.txt".to_string()];
        run.risk.notes = vec!["contract warning: missing required section: Risks".to_string()];

        let risk = renderer.risk_report(&run).expect("risk");
        assert!(risk.contains("- Level: medium"));
        assert!(risk.contains("- Impacted paths: a.txt, b.txt"));
        assert!(risk.contains("contract warning"));

        let comment = renderer.pr_comment(&run).expect("comment");
        assert!(comment.contains("- Story: Ship it"));
        assert!(comment.contains("- Last test result: not run"));
        assert!(comment.contains("- Branch: (none)"));
    }

    #[test]
    fn node_section_has_stage_heading() {
        assert_eq!(
            node_section(Stage::RunTests, "Exit code: 0\n\n"),
            "\n## Node RUN_TESTS\nExit code: 0\n"
        );
    }
}
