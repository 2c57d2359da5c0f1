// src/pipelines/plan.rs: structured execution plan and its bash rendering

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::Serialize;
use shell_escape::unix::escape;


/// One external program and its arguments, each argument a separate token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }
}


/// A step's command: a pipeline of tools with optional stdout redirection, plus
/// the files it reads and the files it is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub pipeline: Vec<ToolCommand>,
    pub stdout: Option<PathBuf>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

impl Invocation {
    pub fn single(command: ToolCommand) -> Self {
        Self {
            pipeline: vec![command],
            stdout: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn piped(commands: Vec<ToolCommand>) -> Self {
        Self {
            pipeline: commands,
            stdout: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout = Some(path);
        self
    }

    pub fn reads(mut self, inputs: &[&Path]) -> Self {
        self.inputs.extend(inputs.iter().map(|p| p.to_path_buf()));
        self
    }

    pub fn writes(mut self, outputs: &[&Path]) -> Self {
        self.outputs.extend(outputs.iter().map(|p| p.to_path_buf()));
        self
    }

    /// Bash text for this command, every token escaped.
    fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.pipeline.len());
        for command in &self.pipeline {
            let mut tokens = vec![quote(&command.program)];
            tokens.extend(command.args.iter().map(|a| quote(a)));
            parts.push(tokens.join(" "));
        }
        let mut line = parts.join(" | ");
        if let Some(path) = &self.stdout {
            line.push_str(" > ");
            line.push_str(&quote_path(path));
        }
        line
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub label: String,
    pub command: Invocation,
}


/// The ordered steps run for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleStages {
    pub sample: String,
    pub steps: Vec<Step>,
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub out_dir: PathBuf,
    /// Created before the first step runs.
    pub directories: Vec<PathBuf>,
    pub genome_index: Step,
    pub samples: Vec<SampleStages>,
    pub aggregate: Step,
}

impl ExecutionPlan {
    /// All steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        std::iter::once(&self.genome_index)
            .chain(self.samples.iter().flat_map(|s| s.steps.iter()))
            .chain(std::iter::once(&self.aggregate))
    }

    pub fn labels(&self) -> Vec<String> {
        self.steps().map(|s| s.label.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps().count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the plan as a bash script. Each step echoes its label, runs,
    /// and on failure reports the label and exit code and stops the script.
    pub fn render_script(&self) -> String {
        let mut script = String::new();
        script.push_str("#!/usr/bin/env bash\n");
        script.push_str("set -euo pipefail\n\n");

        if !self.directories.is_empty() {
            let dirs: Vec<String> = self.directories.iter().map(|d| quote_path(d)).collect();
            script.push_str(&format!("mkdir -p {}\n\n", dirs.join(" ")));
        }

        for step in self.steps() {
            let label = quote(&step.label);
            let failure = quote(&format!("Step failed: {}", step.label));
            script.push_str(&format!("echo {}\n", label));
            script.push_str(&format!(
                "{} || {{ rc=$?; printf '%s (exit code %s)\\n' {} \"$rc\" >&2; exit \"$rc\"; }}\n\n",
                step.command.render(),
                failure
            ));
        }

        script
    }
}


fn quote(token: &str) -> String {
    escape(Cow::Borrowed(token)).into_owned()
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn step(label: &str, invocation: Invocation) -> Step {
        Step { label: label.to_string(), command: invocation }
    }

    #[test]
    fn test_render_escapes_every_token() {
        let invocation = Invocation::single(ToolCommand::new(
            "samtools",
            vec!["view".to_string(), "-b".to_string(), "/data/my sample; rm -rf.sam".to_string()],
        ))
        .stdout_to(PathBuf::from("/data/out $HOME.bam"));

        assert_eq!(
            invocation.render(),
            "samtools view -b '/data/my sample; rm -rf.sam' > '/data/out $HOME.bam'"
        );
    }

    #[test]
    fn test_render_pipeline() {
        let invocation = Invocation::piped(vec![
            ToolCommand::new("samtools", vec!["depth".to_string(), "a.bam".to_string()]),
            ToolCommand::new("awk", vec!["$3 < 5 {print $1}".to_string()]),
        ])
        .stdout_to(PathBuf::from("cov.txt"));

        assert_eq!(
            invocation.render(),
            "samtools depth a.bam | awk '$3 < 5 {print $1}' > cov.txt"
        );
    }

    #[test]
    fn test_script_shape() {
        let plan = ExecutionPlan {
            out_dir: PathBuf::from("/out"),
            directories: vec![PathBuf::from("/out/qc")],
            genome_index: step("Index", Invocation::single(ToolCommand::new("idx", vec![]))),
            samples: vec![SampleStages {
                sample: "s1".to_string(),
                steps: vec![step("Step A for s1", Invocation::single(ToolCommand::new("a", vec![])))],
            }],
            aggregate: step("Report", Invocation::single(ToolCommand::new("r", vec![]))),
        };

        let script = plan.render_script();
        assert!(script.starts_with("#!/usr/bin/env bash\nset -euo pipefail\n"));
        assert!(script.contains("mkdir -p /out/qc\n"));
        assert!(script.contains("echo 'Step A for s1'\n"));
        assert!(script.contains("a || { rc=$?; printf '%s (exit code %s)\\n' 'Step failed: Step A for s1' \"$rc\" >&2; exit \"$rc\"; }"));

        let index_pos = script.find("echo Index").unwrap();
        let step_pos = script.find("echo 'Step A for s1'").unwrap();
        let report_pos = script.find("echo Report").unwrap();
        assert!(index_pos < step_pos && step_pos < report_pos);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.labels(), vec!["Index", "Step A for s1", "Report"]);
    }
}
