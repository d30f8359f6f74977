//! Dead-letter inspection commands

use crate::error::Result;
use crate::messages::PushEnvelope;
use crate::meta::{DeadLetterRecord, MetaDb};
use crate::workers::record_push;
use tracing::error;

/// List persisted dead-letter records, newest first
pub async fn cmd_list_dead_letters(db: &MetaDb, limit: i64) -> Result<Vec<DeadLetterRecord>> {
    db.list_dead_letters(limit).await
}

/// Persist a push envelope read from `input`.
///
/// Never fails: an envelope that does not parse is logged and dropped so the
/// pushing transport does not redeliver it.
pub async fn cmd_record_dead_letter(db: &MetaDb, input: &str) -> Result<()> {
    match serde_json::from_str::<PushEnvelope>(input) {
        Ok(envelope) => record_push(db, &envelope).await,
        Err(e) => {
            error!(error = %e, "Ignoring unparseable dead-letter envelope");
            Ok(())
        }
    }
}

/// Print dead-letter records
pub fn print_dead_letters(records: &[DeadLetterRecord]) {
    if records.is_empty() {
        println!("No dead-letter messages.");
        return;
    }

    for record in records {
        println!("\n{} [{}]", record.message_id, record.status);
        println!("  Subscription: {}", record.subscription_name);
        println!("  Received: {}", record.received_at);
        println!("  Payload: {}", record.payload);
        if let Some(attributes) = &record.attributes {
            println!("  Attributes: {}", attributes);
        }
    }
}
