//! Wraps every mutating Collection operation in a virtual transaction
//! against the MasterIndex: acquire the collection's lock with
//! retry/backoff, verify the modification token hasn't moved since the
//! caller's initial read, force-reload the collection blob, apply the
//! mutation, persist it, and update the MasterIndex — releasing the lock
//! on every exit path via a scope-bound guard.

use std::thread;
use std::time::{Duration, Instant};

use blobdb_common::{DbError, DbResult, RetryPolicy};
use blobdb_store::{ObjectStoreClient, PropertyBagClient};

use crate::collection::Collection;
use crate::master_index::{CollectionMetadataPatch, MasterIndex};
use crate::settings::Settings;

struct LockGuard<'a, P: PropertyBagClient> {
    master_index: &'a MasterIndex<P>,
    name: String,
    operation_id: String,
    released: bool,
}

impl<'a, P: PropertyBagClient> LockGuard<'a, P> {
    fn release(&mut self) {
        if !self.released {
            // Best-effort: a failed release here just leaves a lock that
            // will expire on its own timeout and be stolen or cleaned up.
            let _ = self.master_index.release_collection_lock(&self.name, &self.operation_id);
            self.released = true;
        }
    }
}

impl<'a, P: PropertyBagClient> Drop for LockGuard<'a, P> {
    fn drop(&mut self) {
        self.release();
    }
}

fn acquire_lock_with_backoff<P: PropertyBagClient>(
    master_index: &MasterIndex<P>,
    name: &str,
    operation_id: &str,
    policy: &RetryPolicy,
    deadline: Instant,
) -> DbResult<()> {
    for attempt in 0..policy.attempts {
        if Instant::now() >= deadline {
            return Err(DbError::coordination_timeout(format!(
                "timed out waiting for the lock on '{name}'"
            )));
        }
        if master_index.acquire_collection_lock(name, operation_id)? {
            return Ok(());
        }
        if attempt + 1 == policy.attempts {
            break;
        }
        thread::sleep(policy.delay_for(attempt).min(deadline.saturating_duration_since(Instant::now())));
    }
    Err(DbError::lock_acquisition_failure(format!(
        "failed to acquire the lock on '{name}' after {} attempts",
        policy.attempts
    )))
}

/// Run `mutate` against `collection` under the full coordination protocol,
/// returning whatever `mutate` returns on success.
pub fn run_mutation<S, P, T>(
    collection: &Collection<S>,
    master_index: &MasterIndex<P>,
    settings: &Settings,
    operation_label: &str,
    mutate: impl FnOnce(&Collection<S>) -> DbResult<T>,
) -> DbResult<T>
where
    S: ObjectStoreClient,
    P: PropertyBagClient,
{
    let name = collection.name().to_owned();

    let _ = master_index.cleanup_expired_locks();

    let expected_token = master_index
        .get_collection(&name)?
        .ok_or_else(|| DbError::collection_not_found(&name))?
        .modification_token;

    let operation_id = master_index.fresh_operation_id();
    let deadline = Instant::now()
        .checked_add(settings.coordination_timeout())
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(0));
    acquire_lock_with_backoff(
        master_index,
        &name,
        &operation_id,
        &settings.lock_retry_policy(),
        deadline,
    )?;
    let mut guard = LockGuard {
        master_index,
        name: name.clone(),
        operation_id,
        released: false,
    };

    let current_token = master_index
        .get_collection(&name)?
        .ok_or_else(|| DbError::collection_not_found(&name))?
        .modification_token;
    if current_token != expected_token {
        warn!("modification conflict detected before write"; "collection" => name.as_str());
        return Err(DbError::modification_conflict(format!(
            "modification token for '{name}' changed since the caller's last read"
        )));
    }

    collection.force_reload()?;

    let result = mutate(collection)?;

    collection.save()?;

    let metadata = collection.metadata();
    let patch = CollectionMetadataPatch {
        file_id: None,
        document_count: Some(metadata.document_count),
        modification_token: Some(metadata.modification_token),
    };
    master_index.update_collection_metadata(&name, &patch, operation_label)?;

    guard.release();
    Ok(result)
}
