use std::time::Duration;

use crate::{
    backend::{BackingStore, ListEnd},
    keys::QueueKeys,
    QueueResult,
};

const PAGE_SIZE: i64 = 100;

/// The forefront and normal FIFO lists of ids awaiting dispatch.
///
/// Forefront inserts go to the back of the forefront list, so forefront
/// requests keep their relative insertion order too.
pub struct OrderingLists<'a, S: BackingStore + ?Sized> {
    store: &'a S,
    keys: &'a QueueKeys,
    ttl: Option<Duration>,
}

impl<'a, S: BackingStore + ?Sized> OrderingLists<'a, S> {
    pub fn new(store: &'a S, keys: &'a QueueKeys, ttl: Option<Duration>) -> Self {
        Self { store, keys, ttl }
    }

    fn list(&self, forefront: bool) -> String {
        if forefront {
            self.keys.forefront_list()
        } else {
            self.keys.normal_list()
        }
    }

    pub async fn push(&self, request_id: &str, forefront: bool) -> QueueResult<()> {
        let list = self.list(forefront);
        self.store.list_push(&list, request_id, ListEnd::Back).await?;
        if let Some(ttl) = self.ttl {
            self.store.expire(&list, ttl).await?;
        }
        Ok(())
    }

    /// Remove `request_id` from both lists, returning how many entries went away
    pub async fn remove(&self, request_id: &str) -> QueueResult<u64> {
        let forefront = self.store.list_remove(&self.keys.forefront_list(), request_id).await?;
        let normal = self.store.list_remove(&self.keys.normal_list(), request_id).await?;
        Ok(forefront + normal)
    }

    /// Move an id to the back of the forefront list
    pub async fn move_to_forefront(&self, request_id: &str) -> QueueResult<()> {
        self.remove(request_id).await?;
        self.push(request_id, true).await
    }

    pub async fn len(&self) -> QueueResult<u64> {
        let forefront = self.store.list_len(&self.keys.forefront_list()).await?;
        let normal = self.store.list_len(&self.keys.normal_list()).await?;
        Ok(forefront + normal)
    }

    pub async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Walk both lists in dispatch order, one page at a time
    pub fn cursor(&self) -> DispatchCursor {
        DispatchCursor {
            lists: [self.keys.forefront_list(), self.keys.normal_list()],
            current: 0,
            offset: 0,
        }
    }

    /// Every id in dispatch order: the forefront list, then the normal list
    pub async fn dispatch_order(&self) -> QueueResult<Vec<String>> {
        let mut ids = self.store.list_range(&self.keys.forefront_list(), 0, -1).await?;
        ids.extend(self.store.list_range(&self.keys.normal_list(), 0, -1).await?);
        Ok(ids)
    }
}

/// Paging position over the two ordering lists.
///
/// Offsets are only stable while nobody removes entries, so callers that
/// prune collect stale ids and remove them after the walk.
pub struct DispatchCursor {
    lists: [String; 2],
    current: usize,
    offset: i64,
}

impl DispatchCursor {
    /// Next page of ids and whether they come from the forefront list;
    /// `None` once both lists are exhausted
    pub async fn next_page<S: BackingStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> QueueResult<Option<(Vec<String>, bool)>> {
        while self.current < self.lists.len() {
            let list = &self.lists[self.current];
            let page = store
                .list_range(list, self.offset, self.offset + PAGE_SIZE - 1)
                .await?;

            if page.is_empty() {
                self.current += 1;
                self.offset = 0;
                continue;
            }

            let forefront = self.current == 0;
            self.offset += page.len() as i64;
            return Ok(Some((page, forefront)));
        }
        Ok(None)
    }
}
