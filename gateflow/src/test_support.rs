//! Test-only helpers: a throwaway git repository and a scripted generator.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use tempfile::TempDir;

use crate::core::types::ProposedStep;
use crate::engine::Pipeline;
use crate::io::config::FlowConfig;
use crate::io::generator::{
    Generator, GeneratorError, PlanRequest, PlanResponse, PlannerOutput, ProposeRequest,
    ProposerOutput,
};
use crate::io::store::RunStore;

/// Patch turning the seeded `hello.txt` into "hello world".
pub const HELLO_PATCH: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1 +1 @@
-hello
+hello world
";

/// Passes only once `hello.txt` has been patched.
pub fn hello_test_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        "grep -q 'hello world' hello.txt".to_string(),
    ]
}

/// A git repository with one commit containing `hello.txt`.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let repo = Self { _temp: temp, root };
        repo.git(&["init", "-q"]);
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.write("hello.txt", "hello\n");
        repo.write("README.md", "# demo\n");
        repo.git(&["add", "."]);
        repo.git(&[
            "-c",
            "user.name=gateflow",
            "-c",
            "user.email=gateflow@example.com",
            "commit",
            "-q",
            "-m",
            "seed",
        ]);
        repo
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root.join(rel)).expect("read file")
    }

    /// Run git in the repo, panicking on failure. Returns stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// Defaults with the hello test command allow-listed.
    pub fn config(&self) -> FlowConfig {
        let mut cfg = FlowConfig::default();
        cfg.runs.test_command = hello_test_command();
        cfg.runs.timeout_seconds = 30;
        cfg.security.allowed_commands = vec![hello_test_command()];
        cfg
    }

    pub fn pipeline<G: Generator>(&self, generator: G) -> Pipeline<G> {
        Pipeline::with_generator(&self.root, self.config(), generator).expect("pipeline")
    }

    pub fn store(&self) -> RunStore {
        self.pipeline(ScriptedGenerator::disabled()).store().clone()
    }
}

/// Generator returning canned responses; unset responses behave as disabled.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    plan: Option<PlanResponse>,
    steps: Option<Vec<ProposedStep>>,
}

impl ScriptedGenerator {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, change_request_md: &str, test_plan_md: &str) -> Self {
        self.plan = Some(PlanResponse::Plan(PlannerOutput {
            change_request_md: change_request_md.to_string(),
            test_plan_md: test_plan_md.to_string(),
        }));
        self
    }

    pub fn refusing(mut self, reason: &str) -> Self {
        self.plan = Some(PlanResponse::Refusal(reason.to_string()));
        self
    }

    pub fn with_steps(mut self, steps: Vec<ProposedStep>) -> Self {
        self.steps = Some(steps);
        self
    }
}

impl Generator for ScriptedGenerator {
    fn plan(&self, _request: &PlanRequest) -> Result<PlanResponse> {
        self.plan
            .clone()
            .ok_or_else(|| GeneratorError::Disabled.into())
    }

    fn propose(&self, _request: &ProposeRequest) -> Result<ProposerOutput> {
        match &self.steps {
            Some(steps) => Ok(ProposerOutput {
                steps: steps.clone(),
            }),
            None => Err(GeneratorError::Disabled.into()),
        }
    }
}
