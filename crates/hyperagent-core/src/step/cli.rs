//! CLI step executor — external command invocation with stdin piping.
//!
//! Arguments come from `args` (list order) or `argsObject` (lexicographic
//! key order); either form is rendered, then optionally coerced through
//! `argsSchema`. A non-zero exit code is data in `parsed`, not a failure;
//! only spawning errors are fatal. Captured buffers surface in the scope
//! as base64 and stay addressable as raw bytes via `stdinFrom`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use crate::document::CaptureMode;
use crate::engine::RunContext;
use crate::error::WorkflowError;
use crate::parser::{compile, ParserSchema};
use crate::process::ProcessRequest;
use crate::provenance::truncate_text;
use crate::step::StepResult;
use crate::template;

#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute(
    ctx: &RunContext,
    key: &str,
    command: &str,
    args: Option<&[String]>,
    args_object: Option<&BTreeMap<String, String>>,
    args_schema: Option<&ParserSchema>,
    cwd: Option<&str>,
    stdin_from: Option<&str>,
    capture: CaptureMode,
) -> Result<StepResult, WorkflowError> {
    let scope = ctx.scope();
    let command = template::render(command, &scope)?;

    let candidate = match (args, args_object) {
        (Some(list), _) => Value::Array(
            list.iter()
                .map(|a| Ok(Value::String(template::render(a, &scope)?)))
                .collect::<Result<_, WorkflowError>>()?,
        ),
        (None, Some(map)) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), Value::String(template::render(v, &scope)?))))
                .collect::<Result<Map<_, _>, WorkflowError>>()?,
        ),
        (None, None) => Value::Array(Vec::new()),
    };

    let coerced = match args_schema {
        Some(schema) => compile(schema).validate(Some(&candidate)).map_err(|issue| {
            WorkflowError::Schema(format!("step '{key}' argsSchema: {issue}"))
        })?,
        None => candidate,
    };

    // Object arguments flatten in key order (serde_json maps iterate
    // sorted), so the invocation is stable however the document spells it.
    let rendered_args: Vec<String> = match &coerced {
        Value::Array(items) => items.iter().map(crate::scope::to_display_string).collect(),
        Value::Object(map) => map.values().map(crate::scope::to_display_string).collect(),
        other => vec![crate::scope::to_display_string(other)],
    };

    let stdin = match stdin_from {
        Some(path) => Some(ctx.resolve_stdin(path)?),
        None => None,
    };

    let cwd_path = match cwd {
        Some(raw) => {
            let rendered = template::render(raw, &scope)?;
            let path = PathBuf::from(rendered);
            if path.is_absolute() {
                path
            } else {
                ctx.session_dir.join(path)
            }
        }
        None => ctx.session_dir.clone(),
    };

    let output = ctx
        .runner
        .run(
            ProcessRequest {
                command: command.clone(),
                args: rendered_args.clone(),
                cwd: Some(cwd_path),
                stdin,
                capture,
            },
            &ctx.cancel,
        )
        .await
        .map_err(|error| match error {
            WorkflowError::Cli { details, .. } => WorkflowError::Cli {
                step: key.to_string(),
                details,
            },
            other => other,
        })?;

    let args_value = Value::Array(
        rendered_args
            .iter()
            .map(|a| Value::String(a.clone()))
            .collect(),
    );

    let mut parsed = json!({
        "stdout": &output.stdout,
        "stderr": &output.stderr,
        "exitCode": output.exit_code,
        "args": &args_value,
    });
    if let Some(buffer) = &output.stdout_buffer {
        parsed["stdoutBuffer"] = Value::String(BASE64.encode(buffer));
    }
    if let Some(buffer) = &output.stderr_buffer {
        parsed["stderrBuffer"] = Value::String(BASE64.encode(buffer));
    }

    ctx.log(
        format!("{}.cli.{key}", ctx.label),
        json!({
            "command": &command,
            "args": &args_value,
            "exitCode": output.exit_code,
            "stdout": truncate_text(&output.stdout, ctx.log_cap),
            "stderr": truncate_text(&output.stderr, ctx.log_cap),
        }),
    )
    .await?;

    if output.exit_code != 0 {
        tracing::debug!(
            "[Step] cli '{key}' exited with {} (surfaced in parsed.exitCode)",
            output.exit_code
        );
    }

    let mut result = StepResult::new("cli", key, output.stdout.clone(), parsed);
    result.args = Some(args_value);
    result.stdout_buffer = output.stdout_buffer;
    result.stderr_buffer = output.stderr_buffer;
    Ok(result)
}
