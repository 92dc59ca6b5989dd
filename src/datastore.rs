/*!
 * In-memory data storage for block entities
 *
 * All the data is stored in the `data` field, protected by one big lock.
 * The methods exposed here should reflect what we expect would be exposed
 * if this were a document database, since that's ultimately what we expect
 * to put here.
 *
 * Updates are expressed as closures applied to the *stored* copy of the
 * entity while the store lock is held.  Between acquisitions of the blocks
 * lock, in-memory copies of a `Block` are treated as stale: every mutation
 * re-derives from what the store holds, and the embedded replica list is
 * replaced whole on every write.
 *
 * Soft deletion: removing a block sets `time_deleted` and releases its name
 * for reuse.  Soft-deleted blocks are excluded from every default read,
 * including pod-handle resolution.
 */

use chrono::Utc;
use futures::lock::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::api_model::Block;
use crate::api_model::CreateResult;
use crate::api_model::DeleteResult;
use crate::api_model::ListResult;
use crate::api_model::LookupResult;
use crate::api_model::Name;
use crate::api_model::UpdateResult;

/**
 * Data storage interface exposed to the rest of the control plane
 */
pub struct BlockStore {
    data: Mutex<StoreData>,
}

struct StoreData {
    /** all block entities, live and soft-deleted, by id */
    blocks_by_id: BTreeMap<Uuid, Arc<Block>>,
    /** index mapping block name to block id, live entities only */
    blocks_by_name: BTreeMap<Name, Uuid>,
}

impl BlockStore {
    pub fn new() -> BlockStore {
        BlockStore {
            data: Mutex::new(StoreData {
                blocks_by_id: BTreeMap::new(),
                blocks_by_name: BTreeMap::new(),
            }),
        }
    }

    pub async fn block_create(&self, block: Block) -> CreateResult<Block> {
        let mut data = self.data.lock().await;
        assert!(!data.blocks_by_id.contains_key(&block.id));
        if data.blocks_by_name.contains_key(&block.name) {
            return Err(ApiError::BlockExists {
                name: block.name.as_str().to_string(),
            });
        }

        let block = Arc::new(block);
        let rv = Arc::clone(&block);
        data.blocks_by_name.insert(block.name.clone(), block.id);
        data.blocks_by_id.insert(block.id, block);
        Ok(rv)
    }

    pub async fn block_lookup(&self, id: &Uuid) -> LookupResult<Block> {
        let data = self.data.lock().await;
        match data.blocks_by_id.get(id) {
            Some(block) if block.time_deleted.is_none() => {
                Ok(Arc::clone(block))
            }
            _ => Err(ApiError::BlockNotFound { lookup: id.to_string() }),
        }
    }

    pub async fn block_lookup_by_name(
        &self,
        name: &Name,
    ) -> LookupResult<Block> {
        let data = self.data.lock().await;
        let id = data.blocks_by_name.get(name).ok_or_else(|| {
            ApiError::BlockNotFound {
                lookup: format!("name \"{}\"", name),
            }
        })?;
        /*
         * The name index only holds live entities, so the id lookup must
         * succeed or our data structures are internally inconsistent.
         */
        Ok(Arc::clone(data.blocks_by_id.get(id).unwrap()))
    }

    /** Lists live blocks in id order. */
    pub async fn blocks_list(&self) -> ListResult<Block> {
        let data = self.data.lock().await;
        Ok(data
            .blocks_by_id
            .values()
            .filter(|b| b.time_deleted.is_none())
            .map(Arc::clone)
            .collect())
    }

    /**
     * Applies `update` to the stored copy of the block and persists the
     * result, bumping `time_modified`.  The closure runs under the store
     * lock; callers must already hold the blocks lock for any multi-step
     * reconciliation.
     */
    pub async fn block_update<F>(
        &self,
        id: &Uuid,
        update: F,
    ) -> UpdateResult<Block>
    where
        F: FnOnce(&mut Block),
    {
        let mut data = self.data.lock().await;
        let stored = match data.blocks_by_id.get(id) {
            Some(block) if block.time_deleted.is_none() => block,
            _ => {
                return Err(ApiError::BlockNotFound {
                    lookup: id.to_string(),
                })
            }
        };

        let mut block = (**stored).clone();
        update(&mut block);
        block.time_modified = Utc::now();

        let block = Arc::new(block);
        let rv = Arc::clone(&block);
        data.blocks_by_id.insert(*id, block);
        Ok(rv)
    }

    /**
     * Soft-deletes a block: sets `time_deleted` and releases the name for
     * reuse.  The entity itself is retained.
     */
    pub async fn block_soft_remove(&self, id: &Uuid) -> DeleteResult {
        let mut data = self.data.lock().await;
        let stored = match data.blocks_by_id.get(id) {
            Some(block) if block.time_deleted.is_none() => block,
            _ => {
                return Err(ApiError::BlockNotFound {
                    lookup: id.to_string(),
                })
            }
        };

        let mut block = (**stored).clone();
        let name = block.name.clone();
        let now = Utc::now();
        block.time_deleted = Some(now);
        block.time_modified = now;

        data.blocks_by_id.insert(*id, Arc::new(block));
        data.blocks_by_name.remove(&name);
        Ok(())
    }

    /**
     * Resolves the live block owning the given pod handle, matching either
     * the controller pod or any replica pod.  Returns `None` when no live
     * block matches (the pod belongs to somebody else, or its block has
     * been soft-deleted).
     */
    pub async fn block_find_by_pod(&self, uid: &str) -> Option<Arc<Block>> {
        let data = self.data.lock().await;
        data.blocks_by_id
            .values()
            .filter(|b| b.time_deleted.is_none())
            .find(|b| {
                b.controller.as_deref() == Some(uid)
                    || b.replicas
                        .iter()
                        .any(|r| r.pod.as_deref() == Some(uid))
            })
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod test {
    use super::BlockStore;
    use crate::api_model::Block;
    use crate::api_model::Gibibytes;
    use crate::api_model::Locality;
    use crate::api_model::Name;
    use crate::api_model::Replica;
    use crate::api_model::ReplicaMode;
    use crate::api_model::ReplicaStatus;
    use crate::api_model::Disk;
    use crate::api_model::Folder;
    use chrono::Utc;
    use std::convert::TryFrom;
    use uuid::Uuid;

    fn make_block(name: &str) -> Block {
        let now = Utc::now();
        Block {
            id: Uuid::new_v4(),
            name: Name::try_from(name).unwrap(),
            cluster: "default".to_string(),
            namespace: "storage".to_string(),
            node: "n-1".to_string(),
            size: Gibibytes::new(10),
            used_gib: 0.0,
            replica_count: 3,
            controller: None,
            device: None,
            mount_point: None,
            formatted: false,
            mounted: false,
            online: false,
            frontend_state: false,
            locality: Locality::Unknown,
            healthy: false,
            replicas: vec![],
            time_created: now,
            time_modified: now,
            time_deleted: None,
        }
    }

    fn make_replica(name: &str, pod: &str) -> Replica {
        Replica {
            id: Uuid::new_v4(),
            name: name.to_string(),
            pod: Some(pod.to_string()),
            disk: Disk {
                id: "disk-1".to_string(),
                node: "n-1".to_string(),
                path: "/var/lib/storage/disk-1".to_string(),
                available_mib: 1 << 20,
            },
            node: "n-1".to_string(),
            folder: Folder {
                id: "folder-1".to_string(),
                path: "/var/lib/storage/disk-1/block-replica-1".to_string(),
                disk: "disk-1".to_string(),
                node: "n-1".to_string(),
            },
            status: ReplicaStatus::Pending,
            healthy: false,
            attached: false,
            ip: None,
            endpoint: None,
            mode: ReplicaMode::RW,
        }
    }

    #[tokio::test]
    async fn test_create_lookup_and_duplicate_name() {
        let store = BlockStore::new();
        let block = store.block_create(make_block("v1")).await.unwrap();
        let found = store.block_lookup(&block.id).await.unwrap();
        assert_eq!(found.id, block.id);
        let by_name = store
            .block_lookup_by_name(&Name::try_from("v1").unwrap())
            .await
            .unwrap();
        assert_eq!(by_name.id, block.id);

        let error =
            store.block_create(make_block("v1")).await.unwrap_err();
        assert_eq!(error.kind(), "BlockExists");
    }

    #[tokio::test]
    async fn test_update_applies_to_stored_copy() {
        let store = BlockStore::new();
        let block = store.block_create(make_block("v1")).await.unwrap();

        /*
         * Two successive closure updates must both land, even though the
         * second caller never saw the first caller's in-memory copy.
         */
        store
            .block_update(&block.id, |b| b.online = true)
            .await
            .unwrap();
        let updated = store
            .block_update(&block.id, |b| b.formatted = true)
            .await
            .unwrap();
        assert!(updated.online);
        assert!(updated.formatted);
        assert!(updated.time_modified >= block.time_modified);
    }

    #[tokio::test]
    async fn test_soft_remove_hides_and_releases_name() {
        let store = BlockStore::new();
        let block = store.block_create(make_block("v1")).await.unwrap();
        store.block_soft_remove(&block.id).await.unwrap();

        assert!(store.block_lookup(&block.id).await.is_err());
        assert!(store
            .block_lookup_by_name(&Name::try_from("v1").unwrap())
            .await
            .is_err());
        assert!(store.blocks_list().await.unwrap().is_empty());

        /* the name is reusable after soft deletion */
        let again = store.block_create(make_block("v1")).await.unwrap();
        assert_ne!(again.id, block.id);

        /* double-remove reports not-found */
        let error = store.block_soft_remove(&block.id).await.unwrap_err();
        assert_eq!(error.kind(), "BlockNotFound");
    }

    #[tokio::test]
    async fn test_find_by_pod() {
        let store = BlockStore::new();
        let mut block = make_block("v1");
        block.controller = Some("uid-ctl".to_string());
        block.replicas.push(make_replica("block-replica-v1-a", "uid-r1"));
        let block = store.block_create(block).await.unwrap();

        let by_controller =
            store.block_find_by_pod("uid-ctl").await.unwrap();
        assert_eq!(by_controller.id, block.id);
        let by_replica = store.block_find_by_pod("uid-r1").await.unwrap();
        assert_eq!(by_replica.id, block.id);
        assert!(store.block_find_by_pod("uid-other").await.is_none());

        /* soft-deleted blocks are excluded from pod resolution */
        store.block_soft_remove(&block.id).await.unwrap();
        assert!(store.block_find_by_pod("uid-ctl").await.is_none());
    }
}
