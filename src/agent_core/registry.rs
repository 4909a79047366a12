//! Operation registry and the external capability seams.
//!
//! The registry is populated once by the hosting service and only read by the
//! orchestrator. Each request works on a [`TurnRegistry`], a filtered view that
//! hides operations discarded during that request and is thrown away when the
//! request ends, so the full registry is always what the next request sees.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::OperationError;
use super::types::StructuredResult;

// ─── Data Handle ────────────────────────────────────────────────────────────

/// Opaque reference to the dataset, passed unchanged to operations.
#[derive(Clone)]
pub struct DataHandle(Arc<dyn Any + Send + Sync>);

impl DataHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the dataset as `T`, if that is what the handle holds.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataHandle(..)")
    }
}

// ─── Capabilities ───────────────────────────────────────────────────────────

/// An analytic operation callable by the executor.
pub trait Operation: Send + Sync {
    fn call(
        &self,
        data: &DataHandle,
        params: &Map<String, Value>,
    ) -> Result<StructuredResult, OperationError>;
}

impl<F> Operation for F
where
    F: Fn(&DataHandle, &Map<String, Value>) -> Result<StructuredResult, OperationError>
        + Send
        + Sync,
{
    fn call(
        &self,
        data: &DataHandle,
        params: &Map<String, Value>,
    ) -> Result<StructuredResult, OperationError> {
        self(data, params)
    }
}

/// External chart renderer.
pub trait Visualizer: Send + Sync {
    /// Render `visualization` (one of the result's available visualizations)
    /// and return the renderer's artifact.
    fn render(&self, result: &StructuredResult, visualization: &str) -> Result<Value, OperationError>;
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// What the pipeline knows about an operation without calling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub documentation: String,
    /// Parameters the oracle may fill. The data handle is never listed.
    pub parameter_names: Vec<String>,
}

struct RegisteredOperation {
    descriptor: OperationDescriptor,
    callable: Arc<dyn Operation>,
}

/// Static name → descriptor + callable table.
#[derive(Default)]
pub struct OperationRegistry {
    entries: BTreeMap<String, RegisteredOperation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure as an operation.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        documentation: impl Into<String>,
        parameter_names: &[&str],
        operation: F,
    ) -> &mut Self
    where
        F: Fn(&DataHandle, &Map<String, Value>) -> Result<StructuredResult, OperationError>
            + Send
            + Sync
            + 'static,
    {
        self.register_operation(name, documentation, parameter_names, Arc::new(operation))
    }

    /// Register any [`Operation`], replacing a previous entry with the same name.
    pub fn register_operation(
        &mut self,
        name: impl Into<String>,
        documentation: impl Into<String>,
        parameter_names: &[&str],
        operation: Arc<dyn Operation>,
    ) -> &mut Self {
        let name = name.into();
        let descriptor = OperationDescriptor {
            name: name.clone(),
            documentation: documentation.into(),
            parameter_names: parameter_names.iter().map(|p| p.to_string()).collect(),
        };
        let previous = self.entries.insert(
            name.clone(),
            RegisteredOperation {
                descriptor,
                callable: operation,
            },
        );
        if previous.is_some() {
            tracing::warn!(operation = %name, "operation re-registered, previous entry replaced");
        }
        self
    }

    pub fn descriptor(&self, name: &str) -> Option<&OperationDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    pub fn callable(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.entries.get(name).map(|e| Arc::clone(&e.callable))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-request view with `discarded` already hidden.
    pub fn turn_view<'a>(&'a self, discarded: &[String]) -> TurnRegistry<'a> {
        TurnRegistry {
            base: self,
            discarded: discarded.iter().cloned().collect(),
        }
    }
}

// ─── Turn Registry ──────────────────────────────────────────────────────────

/// Request-scoped filtered copy of the registry.
pub struct TurnRegistry<'a> {
    base: &'a OperationRegistry,
    discarded: BTreeSet<String>,
}

impl<'a> TurnRegistry<'a> {
    /// Operations still selectable in this request, in name order.
    pub fn available(&self) -> impl Iterator<Item = &'a OperationDescriptor> + '_ {
        self.base
            .descriptors()
            .filter(move |d| !self.discarded.contains(&d.name))
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.discarded.contains(name) && self.base.descriptor(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.available().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty(_: &DataHandle, _: &Map<String, Value>) -> Result<StructuredResult, OperationError> {
        Ok(StructuredResult::default())
    }

    fn registry() -> OperationRegistry {
        let mut reg = OperationRegistry::new();
        reg.register("mean_utilization", "Average desk utilization.", &["start_date"], empty)
            .register("weekday_breakdown", "Bookings per weekday.", &[], |_, _| {
                Ok(StructuredResult {
                    visualizable: true,
                    ..Default::default()
                })
            })
            .register("forecast_employees", "Forecast headcount.", &["weeks"], empty);
        reg
    }

    #[test]
    fn descriptors_are_name_ordered() {
        let reg = registry();
        let names: Vec<_> = reg.descriptors().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["forecast_employees", "mean_utilization", "weekday_breakdown"]);
        assert_eq!(reg.descriptor("mean_utilization").unwrap().parameter_names, vec!["start_date"]);
    }

    #[test]
    fn turn_view_hides_discarded_without_touching_base() {
        let reg = registry();
        let discarded = vec!["forecast_employees".to_string(), "weekday_breakdown".to_string()];
        let view = reg.turn_view(&discarded);
        assert!(!view.contains("forecast_employees"));
        assert!(view.contains("mean_utilization"));

        let left: Vec<_> = view.available().map(|d| d.name.clone()).collect();
        assert_eq!(left, vec!["mean_utilization"]);

        // A fresh view sees everything again.
        assert_eq!(reg.turn_view(&[]).available().count(), 3);
    }

    #[test]
    fn closures_are_operations() {
        let reg = registry();
        let op = reg.callable("weekday_breakdown").unwrap();
        let result = op.call(&DataHandle::new(()), &Map::new()).unwrap();
        assert!(result.visualizable);
    }

    #[test]
    fn data_handle_downcasts() {
        let handle = DataHandle::new(vec![1u32, 2, 3]);
        assert_eq!(handle.downcast_ref::<Vec<u32>>().map(|v| v.len()), Some(3));
        assert!(handle.downcast_ref::<String>().is_none());
    }
}
