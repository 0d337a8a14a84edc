//! Static and dynamic checks on an artifact's program.

use std::sync::atomic::AtomicBool;

use regex::Regex;

use super::{TaskContext, ValidationPhase, ValidatorConfig, Verdict};
use crate::artifact::{run_program, Artifact, Capability, RunControl};
use crate::data::Dataset;
use crate::error::ExecutionError;

pub(crate) fn check_static(
    config: &ValidatorConfig,
    patterns: &[Regex],
    artifact: &Artifact,
    ctx: &TaskContext<'_>,
    verdict: &mut Verdict,
) {
    let program = &artifact.program;
    let phase = ValidationPhase::Static;

    if program.is_empty() {
        verdict.add_error(phase, "empty_program", "program has no steps");
    }
    if program.len() > config.max_steps {
        verdict.add_error(
            phase,
            "step_limit",
            format!("{} steps exceeds the limit of {}", program.len(), config.max_steps),
        );
    }
    let depth = program.max_expr_depth();
    if depth > config.max_expr_depth {
        verdict.add_error(
            phase,
            "expr_depth",
            format!("expression depth {} exceeds the limit of {}", depth, config.max_expr_depth),
        );
    }

    for capability in program.required_capabilities() {
        let allowed = match &capability {
            Capability::Network(_) => ctx.scope.allow_network,
            Capability::Process(_) => ctx.scope.allow_process,
            Capability::FileRead(path) => ctx.scope.can_read(path),
            Capability::FileWrite(path) => ctx.scope.can_write(path),
            Capability::DatasetRead(data_ref) => ctx.scope.can_read_ref(data_ref),
        };
        if !allowed {
            verdict.add_error(
                phase,
                "capability",
                format!("{} is outside the declared scope", capability),
            );
        } else if matches!(capability, Capability::Network(_) | Capability::Process(_)) {
            verdict.add_warning(format!("{} is in scope but refused by the executor", capability));
        }
    }

    if let Some(text) = &artifact.source_text {
        for pattern in patterns {
            if let Some(m) = pattern.find(text) {
                verdict.add_error(
                    phase,
                    "forbidden_pattern",
                    format!("source matches /{}/ at '{}'", pattern.as_str(), m.as_str()),
                );
            }
        }
    }
}

pub(crate) fn check_dynamic(
    config: &ValidatorConfig,
    artifact: &Artifact,
    ctx: &TaskContext<'_>,
    verdict: &mut Verdict,
) {
    let phase = ValidationPhase::Dynamic;
    let schema_only = ctx.sample.is_none();
    let sample = match ctx.sample {
        Some(data) => data.head(config.sample_rows),
        None => Dataset::new(
            ctx.input_schema
                .fields
                .iter()
                .map(|f| f.name.clone())
                .collect(),
            Vec::new(),
        ),
    };

    let cancel = AtomicBool::new(false);
    let control = RunControl {
        cancel: &cancel,
        max_rows: usize::MAX,
        max_bytes: usize::MAX,
        scope: ctx.scope,
        dry_run: true,
        sources: ctx.sources,
    };

    let output = match run_program(&artifact.program, sample, &control) {
        Ok(output) => output,
        // Without rows, steps that need data (a holdout, a mean) cannot be
        // judged; only unresolved columns are conclusive.
        Err(e) if schema_only && !matches!(e, ExecutionError::ColumnNotFound(_)) => {
            verdict.add_warning(format!("schema-only dry run inconclusive: {}", e));
            return;
        }
        Err(e) => {
            verdict.add_error(phase, "dry_run", e.to_string());
            return;
        }
    };

    if let Some(expected) = ctx.expected_schema {
        for problem in expected.mismatches(&output.schema()) {
            verdict.add_error(phase, "output_shape", problem);
        }
    }
}
