use kt_common::error::VaultError;
use kt_common::types::{FinalizedResult, LedgerId, Operation, SubmissionOutcome};

use crate::ledger::LedgerClient;

/// Submits operations to one ledger as a single atomic unit.
///
/// Holds the client's submission slot for the whole call, so a signer never
/// has two outstanding submissions on the same ledger, even across
/// submitters built on the same client.
pub struct BatchSubmitter<'a, C: LedgerClient + ?Sized> {
    client: &'a C,
}

impl<'a, C: LedgerClient + ?Sized> BatchSubmitter<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    pub fn ledger(&self) -> LedgerId {
        self.client.ledger()
    }

    /// Resolves once the ledger finalizes or rejects the submission.
    ///
    /// A single operation goes through `submit`; several go through
    /// `submit_batch` so they commit together or not at all.
    pub async fn submit(&self, ops: Vec<Operation>) -> Result<FinalizedResult, VaultError> {
        let ledger = self.client.ledger();
        if ops.is_empty() {
            return Err(VaultError::SubmissionInvalid {
                ledger,
                reason: "empty submission".to_string(),
            });
        }

        let _slot = self.client.submission_slot().lock().await;
        let calls = ops
            .iter()
            .map(Operation::label)
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(%ledger, calls = %calls, "Submitting");

        let outcome = match <[Operation; 1]>::try_from(ops) {
            Ok([op]) => self.client.submit(op).await?,
            Err(ops) => self.client.submit_batch(ops).await?,
        };

        match outcome {
            SubmissionOutcome::Finalized(result) if result.is_batch_interrupted() => {
                tracing::error!(%ledger, block = %result.block_hash, calls = %calls, "Atomic batch finalized partially");
                Err(VaultError::BatchPartialFailure {
                    ledger,
                    detail: format!("batch [{calls}] interrupted in block {}", result.block_hash),
                })
            }
            SubmissionOutcome::Finalized(result) => {
                tracing::info!(%ledger, block = %result.block_hash, events = result.events.len(), "Finalized");
                Ok(result)
            }
            SubmissionOutcome::Dropped { reason } => {
                tracing::warn!(%ledger, reason = %reason, "Submission dropped before finalization");
                Err(VaultError::SubmissionDropped { ledger, reason })
            }
            SubmissionOutcome::Invalid { reason } => {
                tracing::warn!(%ledger, reason = %reason, "Submission rejected as invalid");
                Err(VaultError::SubmissionInvalid { ledger, reason })
            }
        }
    }
}
