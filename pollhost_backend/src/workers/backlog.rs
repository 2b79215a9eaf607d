use anyhow::{Context, Result};

use crate::store::MessageStore;

/// Mark every message that is already waiting as processed, without replying.
///
/// Stops at the first failed update; callers treat that as fatal and must not
/// start listening.
pub async fn drain_backlog(store: &dyn MessageStore) -> Result<usize> {
    let backlog = store
        .unprocessed_messages()
        .await
        .context("error scanning unprocessed messages")?;

    let mut drained = 0;
    for message in backlog {
        store
            .mark_processed(&message.id)
            .await
            .with_context(|| format!("error marking message {} as processed", message.id))?;
        tracing::debug!("Existing message marked as processed: {}", message.id);
        drained += 1;
    }

    tracing::info!("Backlog drained ({} message(s) skipped)", drained);
    Ok(drained)
}
