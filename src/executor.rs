// ============================================================================
// Transaction Executor
// ============================================================================
//
// Runs inside the remote store's atomic update. The transform may be
// invoked more than once on contention, so every invocation recomputes
// its decisions from the value it is handed; record state is only
// mutated after the transaction has committed.

use std::sync::Arc;

use crate::record::Record;
use crate::remote::{Metadata, RemoteError, RemoteStore, StoredValue, Transform};
use crate::session::session_now_ms;

/// Successful transaction outcomes, as seen by the scheduler.
pub(crate) enum ExecOutcome {
    /// The record adopted the remote value (first load or reload).
    Loaded,
    /// The record's local payload was written out.
    Saved,
}

/// Failed transaction outcomes.
pub(crate) enum ExecFailure {
    /// Another session owns the key; non-retryable, the record must be
    /// closed and reopened to try again.
    Conflict,
    /// A migration step rejected the payload; non-retryable.
    Migration { index: usize, message: String },
    /// Transport failure; retryable unless the code is terminal.
    Remote(RemoteError),
}

enum AbortReason {
    Conflict,
    Migration { index: usize, message: String },
}

pub(crate) async fn run(
    record: &Arc<Record>,
    remote: &dyn RemoteStore,
) -> Result<ExecOutcome, ExecFailure> {
    let store = record.store_ref().clone();
    let session = record.session_id().to_string();
    let started_at = record.session_started_at();

    let mut abort: Option<AbortReason> = None;
    let mut is_load = false;

    let result = remote
        .update(
            store.name(),
            record.key(),
            Box::new(|current| {
                // Reset per invocation: the store may retry the transform.
                abort = None;
                is_load = false;

                let (local_data, local_user_ids) = record.local_snapshot();
                let now = session_now_ms();

                let mut working = match current {
                    Some(value) => value,
                    None => StoredValue {
                        data: store.template_data().clone(),
                        metadata: Metadata {
                            session: Some(session.clone()),
                            session_started_at: now,
                            data_version: store.latest_version(),
                            extra: store.template_metadata().clone(),
                        },
                        user_ids: local_user_ids.clone(),
                    },
                };

                // Session arbitration. A remote session that started
                // strictly after ours supersedes us; anything else we
                // claim. Equal start instants keep the incumbent writer.
                if working.metadata.session.as_deref() != Some(session.as_str()) {
                    if working.metadata.session.is_some()
                        && working.metadata.session_started_at > started_at
                    {
                        abort = Some(AbortReason::Conflict);
                        return Transform::Abort;
                    }
                    working.metadata.session = Some(session.clone());
                    working.metadata.session_started_at = now;
                }

                // Forward migration, one version step at a time. The
                // stored version advances after each step so progress is
                // never re-applied.
                let latest = store.latest_version() as usize;
                while (working.metadata.data_version as usize) < latest {
                    let index = working.metadata.data_version as usize;
                    if let Err(err) = store.apply_migration(index, &mut working.data) {
                        abort = Some(AbortReason::Migration {
                            index,
                            message: err.to_string(),
                        });
                        return Transform::Abort;
                    }
                    working.metadata.data_version = (index + 1) as u32;
                }

                // First load adopts the remote value; a save pushes the
                // local payload, discarding the remote one except for the
                // bookkeeping above.
                match local_data {
                    None => {
                        is_load = true;
                        // Remote user ids stand when the record has none
                        // locally; otherwise local associations win.
                        if !local_user_ids.is_empty() {
                            working.user_ids = local_user_ids;
                        }
                    }
                    Some(data) => {
                        working.data = data;
                        if !local_user_ids.is_empty() {
                            working.user_ids = local_user_ids;
                        }
                    }
                }

                Transform::Write(working)
            }),
        )
        .await;

    match result {
        Err(err) => Err(ExecFailure::Remote(err)),
        Ok(None) => match abort {
            Some(AbortReason::Conflict) => Err(ExecFailure::Conflict),
            Some(AbortReason::Migration { index, message }) => {
                Err(ExecFailure::Migration { index, message })
            }
            // The store aborted on its own; surface as a transient error.
            None => Err(ExecFailure::Remote(RemoteError::new(
                None,
                "transaction aborted by remote store",
            ))),
        },
        Ok(Some(committed)) => {
            if is_load {
                record.adopt_loaded(committed);
                Ok(ExecOutcome::Loaded)
            } else {
                record.adopt_saved(committed.metadata, committed.user_ids);
                Ok(ExecOutcome::Saved)
            }
        }
    }
}
