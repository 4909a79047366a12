//! Executor: invokes operations and the visualizer, containing their failures.
//!
//! Operations are external code. Errors they return and panics they raise are
//! both turned into an [`OperationError`] so a bad operation costs one request,
//! never the process.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::{Map, Value};

use super::errors::OperationError;
use super::registry::{DataHandle, OperationRegistry, Visualizer};
use super::types::StructuredResult;

/// Run operation `name` with `params` against `data`.
pub fn execute(
    registry: &OperationRegistry,
    name: &str,
    data: &DataHandle,
    params: &Map<String, Value>,
) -> Result<StructuredResult, OperationError> {
    let operation = registry
        .callable(name)
        .ok_or_else(|| OperationError::failed(format!("unknown operation '{name}'")))?;

    let started = std::time::Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| operation.call(data, params)))
        .unwrap_or_else(|payload| {
            Err(OperationError::Panicked {
                reason: panic_message(payload.as_ref()),
            })
        });

    match &outcome {
        Ok(result) => tracing::info!(
            operation = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            visualizable = result.visualizable,
            "operation executed"
        ),
        Err(e) => tracing::warn!(operation = %name, error = %e, "operation failed"),
    }
    outcome
}

/// Render `visualization` for `result` and mark it as visualized.
pub fn render_visualization(
    visualizer: &dyn Visualizer,
    result: &StructuredResult,
    visualization: &str,
) -> Result<StructuredResult, OperationError> {
    let artifact = catch_unwind(AssertUnwindSafe(|| visualizer.render(result, visualization)))
        .unwrap_or_else(|payload| {
            Err(OperationError::Panicked {
                reason: panic_message(payload.as_ref()),
            })
        })?;

    let mut rendered = result.clone();
    rendered.visualization = Some(artifact);
    rendered.already_visualized = true;
    Ok(rendered)
}

/// User-facing message for a failed operation call.
pub fn failure_message(name: &str, error: &OperationError) -> String {
    format!("Error while calling {name}: {error}")
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BarChart;

    impl Visualizer for BarChart {
        fn render(&self, result: &StructuredResult, visualization: &str) -> Result<Value, OperationError> {
            if !result.available_visualizations.iter().any(|v| v == visualization) {
                return Err(OperationError::failed(format!("cannot draw {visualization}")));
            }
            Ok(serde_json::json!({"kind": visualization, "points": result.data.len()}))
        }
    }

    fn registry() -> OperationRegistry {
        let mut reg = OperationRegistry::new();
        reg.register("ok", "", &["n"], |_, params| {
            let n = params.get("n").and_then(Value::as_u64).ok_or(OperationError::InvalidParameter {
                name: "n".into(),
                reason: "expected an integer".into(),
            })?;
            let mut result = StructuredResult::default();
            result.data.insert("n".into(), Value::from(n * 2));
            Ok(result)
        })
        .register("boom", "", &[], |_, _| panic!("division by zero in policy simulation"));
        reg
    }

    #[test]
    fn successful_call_returns_result() {
        let mut params = Map::new();
        params.insert("n".into(), Value::from(21));
        let result = execute(&registry(), "ok", &DataHandle::new(()), &params).unwrap();
        assert_eq!(result.data["n"], 42);
    }

    #[test]
    fn operation_errors_are_reported() {
        let err = execute(&registry(), "ok", &DataHandle::new(()), &Map::new()).unwrap_err();
        assert_eq!(
            failure_message("ok", &err),
            "Error while calling ok: invalid parameter 'n': expected an integer"
        );
    }

    #[test]
    fn panics_are_contained() {
        let err = execute(&registry(), "boom", &DataHandle::new(()), &Map::new()).unwrap_err();
        match err {
            OperationError::Panicked { reason } => assert!(reason.contains("division by zero")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_operation_fails() {
        assert!(execute(&registry(), "missing", &DataHandle::new(()), &Map::new()).is_err());
    }

    #[test]
    fn render_marks_result_visualized() {
        let result = StructuredResult {
            visualizable: true,
            available_visualizations: vec!["bar".into()],
            ..Default::default()
        };
        let rendered = render_visualization(&BarChart, &result, "bar").unwrap();
        assert!(rendered.already_visualized);
        assert_eq!(rendered.visualization.unwrap()["kind"], "bar");
        assert!(render_visualization(&BarChart, &result, "pie").is_err());
    }
}
