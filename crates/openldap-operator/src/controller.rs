//! # Trigger dispatch
//!
//! Delivers triggers to the reconciler one at a time. Deferred triggers are
//! persisted and re-delivered, oldest first, ahead of the next trigger.

use crate::events::{ActionResult, Disposition, Trigger};
use crate::reconciler::Reconciler;
use crate::status::UnitStatus;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a single trigger was handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandledTrigger {
    pub trigger: String,
    pub disposition: Disposition,
}

/// Summary of one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub handled: Vec<HandledTrigger>,

    /// Number of triggers still waiting for re-delivery
    pub deferred: usize,

    pub status: Option<UnitStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionResult>,
}

/// Dispatcher for a single unit
pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Re-deliver deferred triggers, then handle `trigger`
    pub async fn dispatch(&self, trigger: Trigger) -> DispatchReport {
        let previously_deferred = match self.reconciler.unit_state().deferred().await {
            Ok(deferred) => deferred,
            Err(e) => {
                warn!("Failed to load deferred triggers: {}", e);
                Vec::new()
            }
        };

        let mut still_deferred = Vec::new();
        let mut handled = Vec::new();
        let mut action = None;

        for deferred in previously_deferred {
            debug!("Re-delivering deferred {}", deferred);
            self.run(deferred, &mut still_deferred, &mut handled, &mut action)
                .await;
        }
        self.run(trigger, &mut still_deferred, &mut handled, &mut action)
            .await;

        if let Err(e) = self.reconciler.unit_state().set_deferred(&still_deferred).await {
            warn!("Failed to persist deferred triggers: {}", e);
        }

        DispatchReport {
            handled,
            deferred: still_deferred.len(),
            status: self.reconciler.current_status(),
            action,
        }
    }

    /// Handle a trigger and everything it emits, in order
    async fn run(
        &self,
        trigger: Trigger,
        deferred: &mut Vec<Trigger>,
        handled: &mut Vec<HandledTrigger>,
        action: &mut Option<ActionResult>,
    ) {
        let mut queue = VecDeque::from([trigger]);
        while let Some(next) = queue.pop_front() {
            let outcome = self.reconciler.handle(&next).await;
            handled.push(HandledTrigger {
                trigger: next.name().to_string(),
                disposition: outcome.disposition,
            });

            if let Some(result) = outcome.action {
                *action = Some(result);
            }
            // Emitted triggers run before anything queued behind the emitter
            for emitted in outcome.emitted.into_iter().rev() {
                queue.push_front(emitted);
            }
            if outcome.disposition == Disposition::Retry {
                info!("Deferring {}", next);
                deferred.push(next);
            }
        }
    }
}
