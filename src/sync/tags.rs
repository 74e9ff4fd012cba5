//! Tags & categories sync: one-pass diff against the stored dimension.
//!
//! Pairs present in the upstream response are upserted with a bumped
//! timestamp, stored pairs that vanished are soft-deleted, and previously
//! deleted pairs that reappear are restored.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::bus::JobHandler;
use crate::error::ServiceError;
use crate::store::MarketStore;
use crate::upstream::ExchangeApi;

pub struct TagsSyncHandler {
    store: MarketStore,
    api: Arc<dyn ExchangeApi>,
}

impl TagsSyncHandler {
    pub fn new(store: MarketStore, api: Arc<dyn ExchangeApi>) -> Self {
        Self { store, api }
    }
}

#[async_trait]
impl JobHandler for TagsSyncHandler {
    async fn handle(&self, _payload: serde_json::Value) -> Result<(), ServiceError> {
        let now = Utc::now().timestamp();
        let upstream = self.api.tags_by_categories().await?;

        let mut present: HashSet<(String, String)> = HashSet::new();
        let mut upserted = 0usize;
        for (category, tags) in &upstream {
            for tag in tags {
                present.insert((category.clone(), tag.clone()));
                self.store
                    .upsert_tag(category, tag, now)
                    .map_err(ServiceError::store)?;
                upserted += 1;
            }
        }

        let mut removed = 0usize;
        for row in self.store.all_tags().map_err(ServiceError::store)? {
            if row.deleted {
                continue;
            }
            if !present.contains(&(row.category.clone(), row.tag.clone())) {
                self.store
                    .soft_delete_tag(&row.category, &row.tag, now)
                    .map_err(ServiceError::store)?;
                removed += 1;
            }
        }

        info!(upserted, removed, "tags-by-categories synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::temp_store;
    use crate::testing::MockExchange;
    use serde_json::json;
    use std::collections::HashMap;

    fn tags(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(cat, ts)| {
                (
                    cat.to_string(),
                    ts.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn diff_upserts_deletes_and_restores() {
        let (store, _dir) = temp_store();
        let mock = Arc::new(MockExchange::default());
        let handler = TagsSyncHandler::new(store.clone(), mock.clone());

        mock.set_tags(tags(&[("Economics", &["cpi", "gdp"])]));
        handler.handle(json!({})).await.unwrap();
        assert_eq!(store.all_tags().unwrap().len(), 2);

        // gdp disappears: soft delete. politics appears.
        mock.set_tags(tags(&[("Economics", &["cpi"]), ("Politics", &["senate"])]));
        handler.handle(json!({})).await.unwrap();

        let rows = store.all_tags().unwrap();
        let gdp = rows
            .iter()
            .find(|r| r.tag == "gdp")
            .expect("gdp row retained");
        assert!(gdp.deleted);
        assert!(rows.iter().any(|r| r.tag == "senate" && !r.deleted));

        // gdp comes back: restored.
        mock.set_tags(tags(&[("Economics", &["cpi", "gdp"])]));
        handler.handle(json!({})).await.unwrap();
        let rows = store.all_tags().unwrap();
        assert!(!rows.iter().find(|r| r.tag == "gdp").unwrap().deleted);
    }
}
