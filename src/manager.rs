//! Transaction manager.
//!
//! The stateful owner of the definition catalogue: persists definitions,
//! registers scheduled ones with the scheduler, tracks the latest result per
//! transaction, and fans results out to emitters. Scheduled runs retry up to
//! the definition's `retry_count`, with a fresh invocation UUID per attempt.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::emitter::Emitter;
use crate::error::{Error, ManagerError, SchedulerError, StoreError};
use crate::executor::{Runner, new_uuid};
use crate::scheduler::{Entry, Scheduler};
use crate::store::Store;
use crate::transaction::{Definition, TransactionResult};
use crate::util::SyncMap;

pub struct Manager {
    store: Box<dyn Store>,
    scheduler: Scheduler,
    shared: Arc<Shared>,
}

/// State reachable from scheduled task thunks.
struct Shared {
    runner: Arc<dyn Runner>,
    results: SyncMap<TransactionResult>,
    // Copy-on-write: mutation swaps the Arc, fan-out iterates a clone taken
    // outside the critical section.
    emitters: Mutex<Arc<Vec<Arc<dyn Emitter>>>>,
}

impl Shared {
    /// One scheduled fire: run with retries, cache, fan out.
    async fn run_scheduled(&self, definition: &Definition) {
        let mut result = TransactionResult::default();

        for attempt in 0..=definition.retry_count {
            result = self.runner.run(&new_uuid(), definition).await;
            result.retry_count = attempt;
            if !result.failed && result.error.is_none() {
                break;
            }

            debug!(
                name = %result.name,
                uuid = %result.uuid,
                retry = attempt,
                error = result.error.as_deref().unwrap_or(""),
                "transaction failed"
            );
        }

        self.results.insert(definition.name.clone(), result.clone());

        let emitters = self
            .emitters
            .lock()
            .expect("emitter list poisoned")
            .clone();
        for emitter in emitters.iter() {
            emitter.emit(&result);
        }
    }
}

impl Manager {
    /// Create a manager over the given store and runner, rescheduling any
    /// stored definitions that carry a schedule. A malformed stored
    /// definition is logged and skipped so it cannot block boot.
    pub async fn new(store: Box<dyn Store>, runner: Arc<dyn Runner>) -> Result<Self, Error> {
        let manager = Self {
            store,
            scheduler: Scheduler::new(),
            shared: Arc::new(Shared {
                runner,
                results: SyncMap::new(),
                emitters: Mutex::new(Arc::new(Vec::new())),
            }),
        };

        let mut stored = Vec::new();
        manager
            .store
            .iter(&mut |name, definition| {
                stored.push((name.to_string(), definition.clone()));
                true
            })
            .await
            .map_err(Error::from)?;

        for (name, definition) in stored {
            if definition.schedule.is_empty() {
                info!(name = %name, driver = %definition.driver, "stored transaction has no schedule");
                continue;
            }
            match manager.schedule(&definition) {
                Ok(()) => info!(
                    name = %name,
                    driver = %definition.driver,
                    schedule = %definition.schedule,
                    "loaded stored transaction"
                ),
                Err(e) => error!(name = %name, "error scheduling stored transaction: {e}"),
            }
        }

        Ok(manager)
    }

    fn schedule(&self, definition: &Definition) -> Result<(), SchedulerError> {
        let shared = self.shared.clone();
        let definition = definition.clone();
        let name = definition.name.clone();
        let schedule = definition.schedule.clone();

        self.scheduler.add_task(&name, &schedule, move || {
            let shared = shared.clone();
            let definition = definition.clone();
            async move { shared.run_scheduled(&definition).await }
        })
    }

    /// Add a transaction to the catalogue, scheduling it when it carries a
    /// schedule spec. The definition is validated for admission first and
    /// persisted last; a failed persist rolls the schedule registration back.
    pub async fn add(&self, definition: Definition) -> Result<(), Error> {
        if self.store.has(&definition.name).await.map_err(Error::from)? {
            return Err(ManagerError::AlreadyExists(definition.name).into());
        }

        self.shared.runner.validate(&definition)?;

        let scheduled = !definition.schedule.is_empty();
        if scheduled {
            self.schedule(&definition).map_err(ManagerError::from)?;
        }

        if let Err(e) = self.store.set(&definition.name, &definition).await {
            if scheduled {
                let _ = self.scheduler.remove_task(&definition.name);
            }
            return Err(Error::from(e));
        }
        Ok(())
    }

    /// Remove a transaction: from the store, the scheduler, and the result
    /// cache, in that order.
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.store.delete(name).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                return Err(ManagerError::NotFound(name.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        }

        let _ = self.scheduler.remove_task(name);
        self.shared.results.remove(name);
        Ok(())
    }

    /// Fetch a definition by name.
    pub async fn get(&self, name: &str) -> Result<Definition, Error> {
        match self.store.get(name).await {
            Ok(definition) => Ok(definition),
            Err(StoreError::NotFound(_)) => Err(ManagerError::NotFound(name.to_string()).into()),
            Err(e) => Err(e.into()),
        }
    }

    /// All definitions in the catalogue.
    pub async fn get_all(&self) -> Result<Vec<Definition>, Error> {
        let mut definitions = Vec::new();
        self.store
            .iter(&mut |_, definition| {
                definitions.push(definition.clone());
                true
            })
            .await
            .map_err(Error::from)?;
        Ok(definitions)
    }

    /// Run a definition ad hoc under a fresh invocation UUID.
    ///
    /// `retry_count` is honoured by scheduled runs only; ad-hoc runs execute
    /// a single attempt. Failures are encoded into the result.
    pub async fn run(&self, definition: &Definition) -> TransactionResult {
        self.shared.runner.run(&new_uuid(), definition).await
    }

    /// Run a catalogued definition ad hoc.
    pub async fn run_by_name(&self, name: &str) -> Result<TransactionResult, Error> {
        let definition = self.get(name).await?;
        Ok(self.run(&definition).await)
    }

    /// The latest result for a transaction.
    pub fn result(&self, name: &str) -> Result<TransactionResult, Error> {
        self.shared
            .results
            .get(name)
            .ok_or_else(|| ManagerError::NoResults(name.to_string()).into())
    }

    /// The latest result of every transaction that has run.
    pub fn results(&self) -> Vec<TransactionResult> {
        self.shared.results.values()
    }

    /// Snapshot of the scheduler's registered tasks.
    pub fn scheduled(&self) -> Vec<Entry> {
        self.scheduler.entries()
    }

    /// Append an emitter to the fan-out list.
    pub fn add_emitter(&self, emitter: Arc<dyn Emitter>) {
        let mut emitters = self
            .shared
            .emitters
            .lock()
            .expect("emitter list poisoned");
        let mut next = emitters.as_ref().clone();
        next.push(emitter);
        *emitters = Arc::new(next);
    }

    /// Stop the scheduler, wait for in-flight runs, then close the store.
    pub async fn close(&self) -> Result<(), Error> {
        self.scheduler.stop().wait().await;
        self.store.close().await.map_err(Error::from)
    }
}
