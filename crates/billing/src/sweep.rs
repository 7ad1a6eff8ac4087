//! Expiry sweep
//!
//! Moves grants whose `expires_at` has passed to the terminal `expired` state
//! through the same conditional update used by webhook handlers.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::state_machine::{on_lapse, Transition};
use crate::store::GrantStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// Grants modified concurrently; picked up by the next run
    pub conflicts: usize,
}

pub struct ExpirySweep {
    store: Arc<dyn GrantStore>,
    batch_size: i64,
}

impl ExpirySweep {
    pub fn new(store: Arc<dyn GrantStore>, batch_size: i64) -> Self {
        Self { store, batch_size }
    }

    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let lapsed = self.store.list_lapsed(now, self.batch_size).await?;
        let mut report = SweepReport {
            examined: lapsed.len(),
            ..Default::default()
        };

        for grant in lapsed {
            let Transition::Apply(patch) = on_lapse(&grant, now) else {
                continue;
            };
            match self.store.update_grant(grant.id, grant.version, &patch).await? {
                Some(_) => {
                    tracing::info!(
                        grant_id = %grant.id,
                        user_id = %grant.user_id,
                        expires_at = ?grant.expires_at,
                        "Grant expired"
                    );
                    report.expired += 1;
                }
                None => report.conflicts += 1,
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                expired = report.expired,
                conflicts = report.conflicts,
                "Expiry sweep completed"
            );
        }
        Ok(report)
    }
}
