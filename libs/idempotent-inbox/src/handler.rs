//! Handler dispatch: a static event-type registry built at startup.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

use event_schema::EventEnvelope;

use crate::HandlerError;

/// Business logic invoked for one logical event.
///
/// The handler runs inside the transaction that marks the inbox row
/// processed. Domain writes and outbox appends made through `tx` commit
/// together with the mark, which is what makes the domain effect
/// exactly-once under at-least-once delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
    ) -> Result<(), HandlerError>;
}

/// Static `event_type -> handler` table. Built once during startup wiring;
/// no runtime registration.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
