//! Sequential experiment runner: one `psw-sweep` child process per experiment.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::process::Command;

use psw_core::types::{DatasetKind, PoisonMode};
use psw_train::model::Backbone;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub dataset: DatasetKind,
    pub backbone: Backbone,
    pub mode: PoisonMode,
}

impl Experiment {
    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.backbone, self.dataset, self.mode)
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "--dataset".to_string(),
            self.dataset.to_string(),
            "--backbone".to_string(),
            self.backbone.to_string(),
            "--mode".to_string(),
            self.mode.to_string(),
        ]
    }
}

/// The twelve backbone/dataset/mode combinations run by default.
pub fn default_experiments() -> Vec<Experiment> {
    use Backbone::*;
    use DatasetKind::*;
    use PoisonMode::*;

    [
        (EfficientnetV2B0, Cifar100, Label),
        (EfficientnetV2B0, Cifar100, Trigger),
        (EfficientnetV2B0, Cifar10, Label),
        (EfficientnetV2B0, Cifar10, Trigger),
        (EfficientnetV2B0, Imagenet, Label),
        (EfficientnetV2B0, Imagenet, Trigger),
        (Resnet18, Imagenet, Label),
        (Resnet18, Imagenet, Trigger),
        (Vgg16, Cifar100, Label),
        (Vgg16, Cifar100, Trigger),
        (Vgg16, Cifar10, Label),
        (Vgg16, Cifar10, Trigger),
    ]
    .into_iter()
    .map(|(backbone, dataset, mode)| Experiment {
        dataset,
        backbone,
        mode,
    })
    .collect()
}

/// Keeps experiments whose name is in `only`; an empty filter keeps everything.
pub fn select(experiments: Vec<Experiment>, only: &[String]) -> Vec<Experiment> {
    if only.is_empty() {
        return experiments;
    }
    experiments
        .into_iter()
        .filter(|e| only.iter().any(|o| o == &e.name()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

/// Runs `program args...` to completion with both streams captured.
///
/// The child is killed if the returned future is dropped.
pub async fn run_captured(program: &Path, args: &[String]) -> Result<RunOutput> {
    let started = Instant::now();
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("spawning {}", program.display()))?;
    Ok(RunOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        elapsed_ms: psw_observe::time::elapsed_ms(started),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentResult {
    pub name: String,
    pub success: bool,
    pub code: Option<i32>,
    pub elapsed_ms: u64,
}

/// `(succeeded, failed)` counts.
pub fn tally(results: &[ExperimentResult]) -> (usize, usize) {
    let ok = results.iter().filter(|r| r.success).count();
    (ok, results.len() - ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_list_has_twelve_unique_names() {
        let list = default_experiments();
        assert_eq!(list.len(), 12);
        let mut names: Vec<String> = list.iter().map(Experiment::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 12);
        assert!(names.contains(&"vgg16-cifar10-trigger".to_string()));
    }

    #[test]
    fn experiment_args_round_trip_through_parsers() {
        let e = &default_experiments()[4];
        let args = e.args();
        assert_eq!(args[1].parse::<DatasetKind>().unwrap(), e.dataset);
        assert_eq!(args[3].parse::<Backbone>().unwrap(), e.backbone);
        assert_eq!(args[5].parse::<PoisonMode>().unwrap(), e.mode);
    }

    #[test]
    fn select_filters_by_name() {
        let only = vec!["resnet18-imagenet-label".to_string()];
        let picked = select(default_experiments(), &only);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].backbone, Backbone::Resnet18);
        assert_eq!(select(default_experiments(), &[]).len(), 12);
    }

    #[tokio::test]
    async fn captures_streams_and_exit_code() {
        let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()];
        let out = run_captured(Path::new("sh"), &args).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");

        let ok = run_captured(Path::new("sh"), &["-c".to_string(), "true".to_string()])
            .await
            .unwrap();
        assert!(ok.success);
    }

    #[test]
    fn tally_counts_failures() {
        let r = |success| ExperimentResult {
            name: "x".to_string(),
            success,
            code: Some(0),
            elapsed_ms: 0,
        };
        assert_eq!(tally(&[r(true), r(false), r(true)]), (2, 1));
    }
}
