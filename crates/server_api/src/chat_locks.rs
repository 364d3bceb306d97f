use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use shared::domain::ChatId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-conversation mutual-exclusion table. Every mutating operation against
/// one chat (send, membership change) holds its lock across the
/// authorize-and-persist sequence, so concurrent writers never interleave
/// their read-modify-write of the chat summary and a membership change never
/// races a send's authorization check.
///
/// Entries are tiny and keyed by chat id; they are kept for the life of the
/// process rather than reference-counted away.
#[derive(Clone, Default)]
pub struct ChatLocks {
    table: Arc<StdMutex<HashMap<ChatId, Arc<Mutex<()>>>>>,
}

impl ChatLocks {
    pub async fn acquire(&self, chat_id: ChatId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().expect("chat lock table poisoned");
            table
                .entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
