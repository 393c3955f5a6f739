//! Observers and the registry that maps observed columns to them
//!
//! Observer implementations are registered in code under a string id
//! ([`ObserverFactories`]). The shared configuration names which id runs
//! for which column; [`ObserverRegistry::build`] resolves those names once,
//! when the configuration is loaded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use seep_concurrency::Transaction;
use seep_core::{
    Bytes, Column, NotificationType, ObservedColumns, ObserverSpecification, SeepError,
    SeepResult, SharedConfig,
};

/// Application code run when an observed column changes
///
/// `process` runs inside a transaction that the worker commits afterwards.
/// It may read and write anything through `tx`. Returning an error aborts
/// the transaction and leaves the notification pending.
///
/// The same notification may be handed to `process` more than once (after
/// a conflict, or by racing workers); only one of those transactions commits.
pub trait Observer: Send + Sync {
    /// Handle a change of `column` in `row`
    fn process(&self, tx: &mut Transaction, row: &Bytes, column: &Column) -> anyhow::Result<()>;
}

impl<F> Observer for F
where
    F: Fn(&mut Transaction, &Bytes, &Column) -> anyhow::Result<()> + Send + Sync,
{
    fn process(&self, tx: &mut Transaction, row: &Bytes, column: &Column) -> anyhow::Result<()> {
        self(tx, row, column)
    }
}

type Factory = Arc<dyn Fn(&ObserverSpecification) -> anyhow::Result<Arc<dyn Observer>> + Send + Sync>;

/// Observer implementations by id
#[derive(Clone, Default)]
pub struct ObserverFactories {
    factories: BTreeMap<String, Factory>,
}

impl fmt::Debug for ObserverFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl ObserverFactories {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `id`, replacing any earlier one
    ///
    /// The factory receives the configuration entry, parameters included.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ObserverSpecification) -> anyhow::Result<Arc<dyn Observer>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ObserverSpecification) -> anyhow::Result<Arc<dyn Observer>> + Send + Sync + 'static,
    {
        self.register(id, factory);
        self
    }

    /// Register one shared observer instance under `id`
    pub fn with_instance(self, id: impl Into<String>, observer: Arc<dyn Observer>) -> Self {
        self.with(id, move |_| Ok(Arc::clone(&observer)))
    }

    /// True if `id` is registered
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    fn build(&self, spec: &ObserverSpecification) -> SeepResult<Arc<dyn Observer>> {
        let factory = self.factories.get(&spec.id).ok_or_else(|| {
            SeepError::configuration(format!("unknown observer id '{}'", spec.id))
        })?;
        factory(spec).map_err(|e| {
            SeepError::configuration(format!("observer '{}' failed to start: {:#}", spec.id, e))
        })
    }
}

/// One resolved configuration entry
#[derive(Clone)]
pub struct RegisteredObserver {
    spec: ObserverSpecification,
    observer: Arc<dyn Observer>,
}

impl fmt::Debug for RegisteredObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredObserver")
            .field("id", &self.spec.id)
            .field("notification", &self.spec.notification)
            .finish()
    }
}

impl RegisteredObserver {
    /// Implementation id
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// How the column is observed
    pub fn notification_type(&self) -> NotificationType {
        self.spec.notification
    }

    /// Configuration entry, parameters included
    pub fn specification(&self) -> &ObserverSpecification {
        &self.spec
    }

    /// The observer
    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }
}

/// Observed column → observer, resolved from one configuration version
#[derive(Debug, Clone, Default)]
pub struct ObserverRegistry {
    version: u64,
    observed: ObservedColumns,
    entries: BTreeMap<Column, RegisteredObserver>,
}

impl ObserverRegistry {
    /// Registry with no observers
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolve every observer entry of `config`
    ///
    /// # Errors
    ///
    /// `Configuration` if a column is registered twice or as both weak and
    /// strong, if an id is unknown, or if a factory fails.
    /// `InvalidArgument` if an observed column is in a reserved family.
    pub fn build(config: &SharedConfig, factories: &ObserverFactories) -> SeepResult<Self> {
        let mut observed = ObservedColumns::new();
        let mut entries = BTreeMap::new();
        for spec in &config.observers {
            let column = spec.column();
            if entries.contains_key(&column) {
                return Err(SeepError::configuration(format!(
                    "column {} has more than one observer",
                    column
                )));
            }
            observed.add(column.clone(), spec.notification)?;
            let observer = factories.build(spec)?;
            entries.insert(
                column,
                RegisteredObserver {
                    spec: spec.clone(),
                    observer,
                },
            );
        }
        info!(
            version = config.version,
            observers = entries.len(),
            "Observer registry built"
        );
        Ok(ObserverRegistry {
            version: config.version,
            observed,
            entries,
        })
    }

    /// Configuration version this registry was built from
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Weak and strong observed columns
    pub fn observed(&self) -> &ObservedColumns {
        &self.observed
    }

    /// Observer for `column`
    pub fn get(&self, column: &Column) -> Option<&RegisteredObserver> {
        self.entries.get(column)
    }

    /// Observed columns in order
    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.entries.keys()
    }

    /// Number of observers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is observed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
