//! Optimistic concurrency verification for stream appends.
//!
//! Backend-independent: adapters feed it the stream's actual last version
//! and the version they are about to write, and surface the classified
//! conflict unchanged. The three-way classification determines distinct
//! user-visible error messages and must stay intact.

use crate::events::FIRST_VERSION;

/// A classified optimistic-concurrency conflict.
///
/// Returned to the caller for retry-with-fresh-read; never retried inside
/// the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyConflict {
    /// The stream is empty but the caller expected prior events. The
    /// stream was reset or destroyed out from under the caller.
    #[error(
        "stream is empty but next event version is {next}; \
         expected an empty stream to start at version {FIRST_VERSION}"
    )]
    StreamReset { next: u32 },

    /// The stream has already been updated at or beyond the version the
    /// caller is trying to write.
    #[error("stream already updated to version {latest}; version {next} is stale")]
    AlreadyUpdated { latest: u32, next: u32 },

    /// The caller skipped ahead: updates between the stored version and
    /// the next version are missing.
    #[error(
        "missing updates between stored version {latest} and next version {next}; \
         expected version {}", .latest + 1
    )]
    MissingUpdates { latest: u32, next: u32 },
}

/// Verify that `next` is the contiguous successor of `latest_stored`.
///
/// `latest_stored` is the version of the last event the backend has for
/// the stream (`None` when the stream has never been written). A batch may
/// only begin at `latest_stored + 1`, or at [`FIRST_VERSION`] on an empty
/// stream.
pub fn verify_next_version(
    latest_stored: Option<u32>,
    next: u32,
) -> Result<(), ConcurrencyConflict> {
    match latest_stored {
        None => {
            if next == FIRST_VERSION {
                Ok(())
            } else {
                Err(ConcurrencyConflict::StreamReset { next })
            }
        }
        Some(latest) => {
            if next <= latest {
                Err(ConcurrencyConflict::AlreadyUpdated { latest, next })
            } else if next > latest + 1 {
                Err(ConcurrencyConflict::MissingUpdates { latest, next })
            } else {
                Ok(())
            }
        }
    }
}
