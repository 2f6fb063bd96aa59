//! Shared state handed to the background services.
//!
//! The facade owns the context and the services borrow it through an
//! `Arc`, which keeps the dependency direction one-way: services never
//! hold the facade itself.

use crate::backoff::Backoff;
use crate::config::MonqueOptions;
use crate::events::EventBus;
use crate::repository::JobRepository;

/// Everything a background service needs: the repository, the resolved
/// options, this instance's id, and the event bus.
pub(crate) struct SchedulerContext {
    pub repository: JobRepository,
    pub options: MonqueOptions,
    pub instance_id: String,
    pub events: EventBus,
}

impl SchedulerContext {
    pub(crate) fn new(repository: JobRepository, options: MonqueOptions) -> Self {
        let instance_id = options.resolve_instance_id();
        Self {
            repository,
            options,
            instance_id,
            events: EventBus::new(),
        }
    }

    pub(crate) fn backoff(&self) -> Backoff {
        self.options.backoff()
    }
}
