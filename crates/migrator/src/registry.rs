//! Explicit registration of migration units and their change steps.
//!
//! Units are declared in code and handed to the engine through a
//! [`MigrationSource`]. Before a run the engine calls [`normalize`], which
//! orders units and steps and rejects duplicate ids.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use doc_store::DocumentStore;
use futures_util::future::BoxFuture;

use crate::error::{MigrationError, Result, StepError};

/// Future returned by a change step body.
pub type StepFuture = BoxFuture<'static, std::result::Result<(), StepError>>;

type StandaloneFn = dyn Fn() -> StepFuture + Send + Sync;
type WithStoreFn = dyn Fn(Arc<dyn DocumentStore>) -> StepFuture + Send + Sync;

/// How a change step body is called.
#[derive(Clone)]
pub enum StepInvoker {
    /// The body takes no argument.
    Standalone(Arc<StandaloneFn>),

    /// The body receives the store handle.
    WithStore(Arc<WithStoreFn>),
}

impl StepInvoker {
    /// Calls the step body.
    pub async fn invoke(
        &self,
        store: Arc<dyn DocumentStore>,
    ) -> std::result::Result<(), StepError> {
        match self {
            StepInvoker::Standalone(body) => body().await,
            StepInvoker::WithStore(body) => body(store).await,
        }
    }
}

impl fmt::Debug for StepInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepInvoker::Standalone(_) => f.write_str("StepInvoker::Standalone"),
            StepInvoker::WithStore(_) => f.write_str("StepInvoker::WithStore"),
        }
    }
}

/// One change step: a unit of work applied at most once per `id`.
#[derive(Debug, Clone)]
pub struct ChangeStep {
    /// Unique across the whole run.
    pub id: String,
    pub author: String,
    /// Order key within the unit, compared as a string.
    pub order: String,
    /// Recorded in history for diagnostics. Defaults to `id`.
    pub name: String,
    /// Invoke on every run, even when already recorded.
    pub run_always: bool,
    /// Raw commands that undo this step, snapshotted into history on apply.
    pub rollback_commands: Vec<String>,
    pub invoker: StepInvoker,
}

impl ChangeStep {
    /// Declares a step whose body receives the store handle.
    pub fn new<F, Fut>(
        id: impl Into<String>,
        author: impl Into<String>,
        order: impl Into<String>,
        body: F,
    ) -> Self
    where
        F: Fn(Arc<dyn DocumentStore>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), StepError>> + Send + 'static,
    {
        let invoker = StepInvoker::WithStore(Arc::new(move |store| -> StepFuture {
            Box::pin(body(store))
        }));
        Self::with_invoker(id, author, order, invoker)
    }

    /// Declares a step whose body takes no argument.
    pub fn standalone<F, Fut>(
        id: impl Into<String>,
        author: impl Into<String>,
        order: impl Into<String>,
        body: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), StepError>> + Send + 'static,
    {
        let invoker =
            StepInvoker::Standalone(Arc::new(move || -> StepFuture { Box::pin(body()) }));
        Self::with_invoker(id, author, order, invoker)
    }

    /// Declares a step with an explicit invoker.
    pub fn with_invoker(
        id: impl Into<String>,
        author: impl Into<String>,
        order: impl Into<String>,
        invoker: StepInvoker,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            author: author.into(),
            order: order.into(),
            run_always: false,
            rollback_commands: Vec::new(),
            invoker,
        }
    }

    /// Sets the step name recorded in history.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Marks the step as run-always.
    pub fn run_always(mut self) -> Self {
        self.run_always = true;
        self
    }

    /// Appends one rollback command.
    pub fn rollback_command(mut self, command: impl Into<String>) -> Self {
        self.rollback_commands.push(command.into());
        self
    }

    /// Appends the commands of a rollback script.
    ///
    /// Commands are separated by a blank line. Surrounding whitespace is
    /// trimmed and empty commands are dropped.
    pub fn rollback_script(mut self, script: &str) -> Self {
        self.rollback_commands.extend(
            script
                .replace("\r\n", "\n")
                .split("\n\n")
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        );
        self
    }
}

/// A named, ordered group of change steps.
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    /// Stable identity recorded in history. Renaming a unit orphans its history.
    pub name: String,
    /// Order key among units, compared as a string.
    pub order: String,
    pub steps: Vec<ChangeStep>,
}

impl MigrationUnit {
    pub fn new(name: impl Into<String>, order: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: order.into(),
            steps: Vec::new(),
        }
    }

    /// Adds a step.
    pub fn step(mut self, step: ChangeStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// Provides the migration units for a run.
pub trait MigrationSource: Send + Sync {
    /// Returns every declared unit. Order does not matter; the engine sorts them.
    fn units(&self) -> Result<Vec<MigrationUnit>>;
}

/// A source holding units declared in code.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    units: Vec<MigrationUnit>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit.
    pub fn unit(mut self, unit: MigrationUnit) -> Self {
        self.units.push(unit);
        self
    }
}

impl MigrationSource for StaticSource {
    fn units(&self) -> Result<Vec<MigrationUnit>> {
        Ok(self.units.clone())
    }
}

impl MigrationSource for Vec<MigrationUnit> {
    fn units(&self) -> Result<Vec<MigrationUnit>> {
        Ok(self.clone())
    }
}

/// Orders units by `(order, name)` and steps by `order`, and rejects
/// duplicate unit names and duplicate step ids across the whole run.
pub fn normalize(mut units: Vec<MigrationUnit>) -> Result<Vec<MigrationUnit>> {
    units.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

    let mut unit_names = HashSet::new();
    let mut change_ids = HashSet::new();
    for unit in &mut units {
        if !unit_names.insert(unit.name.clone()) {
            return Err(MigrationError::DuplicateUnitName(unit.name.clone()));
        }

        unit.steps.sort_by(|a, b| a.order.cmp(&b.order));
        for step in &unit.steps {
            if !change_ids.insert(step.id.clone()) {
                return Err(MigrationError::DuplicateChangeId(step.id.clone()));
            }
        }
    }

    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_store::InMemoryDocumentStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(id: &str, order: &str) -> ChangeStep {
        ChangeStep::standalone(id, "tester", order, || async { Ok(()) })
    }

    #[test]
    fn normalize_orders_units_and_steps() {
        let units = vec![
            MigrationUnit::new("b_unit", "002")
                .step(noop("b2", "2"))
                .step(noop("b1", "1")),
            MigrationUnit::new("a_unit", "001").step(noop("a1", "1")),
        ];

        let units = normalize(units).unwrap();
        assert_eq!(units[0].name, "a_unit");
        assert_eq!(units[1].name, "b_unit");
        let ids: Vec<_> = units[1].steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[test]
    fn normalize_breaks_unit_order_ties_by_name() {
        let units = vec![MigrationUnit::new("zeta", ""), MigrationUnit::new("alpha", "")];
        let units = normalize(units).unwrap();
        assert_eq!(units[0].name, "alpha");
    }

    #[test]
    fn normalize_rejects_duplicate_ids_across_units() {
        let units = vec![
            MigrationUnit::new("first", "1").step(noop("shared", "1")),
            MigrationUnit::new("second", "2").step(noop("shared", "1")),
        ];
        assert!(matches!(
            normalize(units),
            Err(MigrationError::DuplicateChangeId(id)) if id == "shared"
        ));
    }

    #[test]
    fn normalize_rejects_duplicate_unit_names() {
        let units = vec![MigrationUnit::new("same", "1"), MigrationUnit::new("same", "2")];
        assert!(matches!(
            normalize(units),
            Err(MigrationError::DuplicateUnitName(_))
        ));
    }

    #[test]
    fn rollback_script_splits_on_blank_lines() {
        let step = noop("s", "1").rollback_script(
            "{\"drop\": \"a\"}\n\n{\"drop\": \"b\"}\r\n\r\n\n\n  {\"ping\": 1}  \n",
        );
        assert_eq!(
            step.rollback_commands,
            vec![
                "{\"drop\": \"a\"}".to_string(),
                "{\"drop\": \"b\"}".to_string(),
                "{\"ping\": 1}".to_string(),
            ]
        );
    }

    #[test]
    fn step_defaults() {
        let step = noop("001", "1");
        assert_eq!(step.name, "001");
        assert!(!step.run_always);
        assert!(step.rollback_commands.is_empty());

        let step = step.named("create_users").run_always().rollback_command("x");
        assert_eq!(step.name, "create_users");
        assert!(step.run_always);
        assert_eq!(step.rollback_commands, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn invokers_call_their_bodies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());

        let counter = calls.clone();
        let standalone = ChangeStep::standalone("a", "t", "1", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        standalone.invoker.invoke(store.clone()).await.unwrap();

        let with_store = ChangeStep::new("b", "t", "2", |store: Arc<dyn DocumentStore>| async move {
            let mut document = doc_store::Document::new();
            document.insert("seen".to_string(), serde_json::json!(true));
            store.insert_one("touched", document).await?;
            Ok::<(), StepError>(())
        });
        with_store.invoker.invoke(store.clone()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let touched = store
            .find("touched", &doc_store::Document::new())
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
    }
}
