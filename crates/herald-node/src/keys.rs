use herald_core::AnnouncementType;

/// Store key of the open batch's metadata for a queue.
pub fn batch_metadata_key(kind: AnnouncementType) -> String {
    format!("batchMetadata:{}", kind.queue_name())
}

/// Store key of the open batch's entries for a queue.
pub fn batch_data_key(kind: AnnouncementType) -> String {
    format!("batchData:{}", kind.queue_name())
}

/// Key a batch key is moved to while its batch is being closed.
pub fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

/// Counter of capacity consumed by this service during `epoch`.
pub fn epoch_capacity_key(epoch: u64) -> String {
    format!("epochCapacity:{epoch}")
}

/// The four keys involved in closing one queue's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchKeys {
    pub metadata: String,
    pub data: String,
    pub locked_metadata: String,
    pub locked_data: String,
}

impl BatchKeys {
    pub fn for_type(kind: AnnouncementType) -> Self {
        let metadata = batch_metadata_key(kind);
        let data = batch_data_key(kind);
        Self {
            locked_metadata: lock_key(&metadata),
            locked_data: lock_key(&data),
            metadata,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use herald_core::AnnouncementType;

    use super::{epoch_capacity_key, BatchKeys};

    #[test]
    fn keys_are_distinct_across_queues() {
        let mut seen = HashSet::new();
        for kind in AnnouncementType::ALL {
            let keys = BatchKeys::for_type(kind);
            for key in [
                keys.metadata,
                keys.data,
                keys.locked_metadata,
                keys.locked_data,
            ] {
                assert!(seen.insert(key));
            }
        }
    }

    #[test]
    fn locked_keys_wrap_open_keys() {
        let keys = BatchKeys::for_type(AnnouncementType::Broadcast);
        assert_eq!(keys.metadata, "batchMetadata:broadcastQueue");
        assert_eq!(keys.locked_metadata, "lock:batchMetadata:broadcastQueue");
        assert_eq!(epoch_capacity_key(12), "epochCapacity:12");
    }
}
