//! Dimension upserts (latest-wins), watchlist access, and the per-ticker
//! cascade delete used by cleanup.

use anyhow::Result;
use rusqlite::{params, Row};

use crate::models::{EventRecord, HighPriorityMarket, Series, TagsCategoryRow};

use super::MarketStore;

fn series_from_row(row: &Row) -> rusqlite::Result<(Series, String, String)> {
    Ok((
        Series {
            ticker: row.get("ticker")?,
            title: row.get("title")?,
            category: row.get("category")?,
            tags: Vec::new(),
            frequency: row.get("frequency")?,
            metadata: serde_json::Value::Null,
            last_update: row.get("last_update")?,
            deleted: row.get::<_, i64>("deleted")? != 0,
        },
        row.get("tags")?,
        row.get("metadata")?,
    ))
}

fn event_from_row(row: &Row) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        event_ticker: row.get("event_ticker")?,
        series_ticker: row.get("series_ticker")?,
        title: row.get("title")?,
        category: row.get("category")?,
        strike_date: row.get("strike_date")?,
        strike_period: row.get("strike_period")?,
        mutually_exclusive: row.get::<_, i64>("mutually_exclusive")? != 0,
        last_update: row.get("last_update")?,
        deleted: row.get::<_, i64>("deleted")? != 0,
    })
}

impl MarketStore {
    /// Upsert a series row; the stored version only moves forward in
    /// `last_update`. Re-upserting clears the soft-delete flag.
    pub fn upsert_series(&self, series: &Series) -> Result<()> {
        let mut tags = series.tags.clone();
        tags.sort();
        tags.dedup();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO series (ticker, title, category, tags, frequency, metadata, last_update, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
             ON CONFLICT(ticker) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                tags = excluded.tags,
                frequency = excluded.frequency,
                metadata = excluded.metadata,
                last_update = excluded.last_update,
                deleted = 0
             WHERE excluded.last_update >= series.last_update",
            params![
                series.ticker,
                series.title,
                series.category,
                serde_json::to_string(&tags)?,
                series.frequency,
                serde_json::to_string(&series.metadata)?,
                series.last_update,
            ],
        )?;
        Ok(())
    }

    pub fn get_series(&self, ticker: &str) -> Result<Option<Series>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, title, category, tags, frequency, metadata, last_update, deleted
             FROM series WHERE ticker = ?1",
        )?;
        let mut rows = stmt.query_map(params![ticker], series_from_row)?;
        match rows.next().transpose()? {
            None => Ok(None),
            Some((mut series, tags_json, metadata_json)) => {
                series.tags = serde_json::from_str(&tags_json).unwrap_or_default();
                series.metadata =
                    serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);
                Ok(Some(series))
            }
        }
    }

    pub fn upsert_event(&self, event: &EventRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (event_ticker, series_ticker, title, category, strike_date,
                                 strike_period, mutually_exclusive, last_update, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
             ON CONFLICT(event_ticker) DO UPDATE SET
                series_ticker = excluded.series_ticker,
                title = excluded.title,
                category = excluded.category,
                strike_date = excluded.strike_date,
                strike_period = excluded.strike_period,
                mutually_exclusive = excluded.mutually_exclusive,
                last_update = excluded.last_update,
                deleted = 0
             WHERE excluded.last_update >= events.last_update",
            params![
                event.event_ticker,
                event.series_ticker,
                event.title,
                event.category,
                event.strike_date,
                event.strike_period,
                event.mutually_exclusive as i64,
                event.last_update,
            ],
        )?;
        Ok(())
    }

    pub fn get_event(&self, event_ticker: &str) -> Result<Option<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_ticker, series_ticker, title, category, strike_date, strike_period,
                    mutually_exclusive, last_update, deleted
             FROM events WHERE event_ticker = ?1",
        )?;
        let mut rows = stmt.query_map(params![event_ticker], event_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// All live and soft-deleted tag rows, for the sync diff.
    pub fn all_tags(&self) -> Result<Vec<TagsCategoryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT category, tag, last_update, deleted FROM tags_categories",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TagsCategoryRow {
                    category: row.get("category")?,
                    tag: row.get("tag")?,
                    last_update: row.get("last_update")?,
                    deleted: row.get::<_, i64>("deleted")? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert one (category, tag) pair, bumping its timestamp and restoring
    /// it if it had been soft-deleted.
    pub fn upsert_tag(&self, category: &str, tag: &str, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tags_categories (category, tag, last_update, deleted)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT(category, tag) DO UPDATE SET
                last_update = excluded.last_update,
                deleted = 0",
            params![category, tag, now],
        )?;
        Ok(())
    }

    pub fn soft_delete_tag(&self, category: &str, tag: &str, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tags_categories SET deleted = 1, last_update = ?3
             WHERE category = ?1 AND tag = ?2 AND deleted = 0",
            params![category, tag, now],
        )?;
        Ok(())
    }

    /// Watchlist snapshot, ordered by priority. Consumers take this once at
    /// job start.
    pub fn watchlist(&self) -> Result<Vec<HighPriorityMarket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker_id, priority, enable_l1, enable_l2, enable_l3,
                    fetch_candlesticks, fetch_orderbook
             FROM market_high_priority ORDER BY priority DESC, ticker_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(HighPriorityMarket {
                    ticker_id: row.get("ticker_id")?,
                    priority: row.get("priority")?,
                    enable_l1: row.get::<_, i64>("enable_l1")? != 0,
                    enable_l2: row.get::<_, i64>("enable_l2")? != 0,
                    enable_l3: row.get::<_, i64>("enable_l3")? != 0,
                    fetch_candlesticks: row.get::<_, i64>("fetch_candlesticks")? != 0,
                    fetch_orderbook: row.get::<_, i64>("fetch_orderbook")? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_watchlist(&self, entry: &HighPriorityMarket) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_high_priority
                (ticker_id, priority, enable_l1, enable_l2, enable_l3,
                 fetch_candlesticks, fetch_orderbook)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(ticker_id) DO UPDATE SET
                priority = excluded.priority,
                enable_l1 = excluded.enable_l1,
                enable_l2 = excluded.enable_l2,
                enable_l3 = excluded.enable_l3,
                fetch_candlesticks = excluded.fetch_candlesticks,
                fetch_orderbook = excluded.fetch_orderbook",
            params![
                entry.ticker_id,
                entry.priority,
                entry.enable_l1 as i64,
                entry.enable_l2 as i64,
                entry.enable_l3 as i64,
                entry.fetch_candlesticks as i64,
                entry.fetch_orderbook as i64,
            ],
        )?;
        Ok(())
    }

    /// Category for a market: its event's category, falling back to the
    /// series row for the market's series key.
    pub fn category_for_market(&self, ticker: &str) -> Result<Option<String>> {
        let latest = self.latest_snapshot(ticker)?;
        let Some(snap) = latest else { return Ok(None) };

        if let Some(event_ticker) = &snap.event_ticker {
            if let Some(event) = self.get_event(event_ticker)? {
                if !event.category.is_empty() {
                    return Ok(Some(event.category));
                }
            }
        }
        if let Some(series) = self.get_series(&snap.series_key)? {
            if !series.category.is_empty() {
                return Ok(Some(series.category));
            }
        }
        Ok(None)
    }

    /// Series ticker for a market, resolved through its event when present.
    pub fn series_ticker_for_market(&self, ticker: &str) -> Result<Option<String>> {
        let Some(snap) = self.latest_snapshot(ticker)? else {
            return Ok(None);
        };
        if let Some(event_ticker) = &snap.event_ticker {
            if let Some(event) = self.get_event(event_ticker)? {
                if !event.series_ticker.is_empty() {
                    return Ok(Some(event.series_ticker));
                }
            }
        }
        Ok(Some(snap.series_key))
    }

    /// Delete every derived row for a ticker. Returns total rows removed;
    /// re-running for an already-clean ticker removes nothing.
    pub fn delete_market_cascade(&self, ticker: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0usize;
        for sql in [
            "DELETE FROM market_snapshots WHERE ticker = ?1",
            "DELETE FROM candlesticks WHERE ticker = ?1",
            "DELETE FROM orderbook_snapshots WHERE market_id = ?1",
            "DELETE FROM orderbook_events WHERE market_id = ?1",
            "DELETE FROM market_features WHERE ticker = ?1",
            "DELETE FROM market_high_priority WHERE ticker_id = ?1",
        ] {
            removed += tx.execute(sql, params![ticker])?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_store;
    use crate::models::{EventRecord, HighPriorityMarket, Series};

    fn series(ticker: &str, last_update: i64) -> Series {
        Series {
            ticker: ticker.into(),
            title: "Title".into(),
            category: "Economics".into(),
            tags: vec!["cpi".into(), "inflation".into(), "cpi".into()],
            frequency: "monthly".into(),
            metadata: serde_json::json!({"source": "exchange"}),
            last_update,
            deleted: false,
        }
    }

    #[test]
    fn upsert_series_is_idempotent() {
        let (store, _dir) = temp_store();
        let s = series("SER-CPI", 100);
        store.upsert_series(&s).unwrap();
        store.upsert_series(&s).unwrap();

        let loaded = store.get_series("SER-CPI").unwrap().unwrap();
        assert_eq!(loaded.last_update, 100);
        // Tag set is deduped on write.
        assert_eq!(loaded.tags, vec!["cpi".to_string(), "inflation".to_string()]);
    }

    #[test]
    fn stale_series_write_loses() {
        let (store, _dir) = temp_store();
        store.upsert_series(&series("SER-CPI", 200)).unwrap();

        let mut stale = series("SER-CPI", 100);
        stale.title = "Old title".into();
        store.upsert_series(&stale).unwrap();

        let loaded = store.get_series("SER-CPI").unwrap().unwrap();
        assert_eq!(loaded.title, "Title");
        assert_eq!(loaded.last_update, 200);
    }

    #[test]
    fn tag_diff_lifecycle() {
        let (store, _dir) = temp_store();
        store.upsert_tag("Economics", "cpi", 100).unwrap();
        store.soft_delete_tag("Economics", "cpi", 110).unwrap();

        let rows = store.all_tags().unwrap();
        assert!(rows[0].deleted);

        // Reappearing tag is restored.
        store.upsert_tag("Economics", "cpi", 120).unwrap();
        let rows = store.all_tags().unwrap();
        assert!(!rows[0].deleted);
        assert_eq!(rows[0].last_update, 120);
    }

    #[test]
    fn category_falls_back_to_series() {
        let (store, _dir) = temp_store();
        let mut snap = crate::models::tests::sample_snapshot();
        snap.event_ticker = None;
        snap.series_key = "SER-CPI".into();
        store.insert_snapshots(&[snap]).unwrap();
        store.upsert_series(&series("SER-CPI", 100)).unwrap();

        assert_eq!(
            store.category_for_market("MKT-A").unwrap(),
            Some("Economics".to_string())
        );
    }

    #[test]
    fn event_category_wins_over_series() {
        let (store, _dir) = temp_store();
        let snap = crate::models::tests::sample_snapshot();
        store.insert_snapshots(&[snap]).unwrap();
        store
            .upsert_event(&EventRecord {
                event_ticker: "EVT-A".into(),
                series_ticker: "SER-A".into(),
                title: "Event".into(),
                category: "Politics".into(),
                strike_date: None,
                strike_period: None,
                mutually_exclusive: false,
                last_update: 100,
                deleted: false,
            })
            .unwrap();

        assert_eq!(
            store.category_for_market("MKT-A").unwrap(),
            Some("Politics".to_string())
        );
    }

    #[test]
    fn cascade_delete_clears_everything_and_is_reentrant() {
        let (store, _dir) = temp_store();
        let snap = crate::models::tests::sample_snapshot();
        store.insert_snapshots(&[snap]).unwrap();
        store
            .upsert_watchlist(&HighPriorityMarket {
                ticker_id: "MKT-A".into(),
                priority: 5,
                enable_l1: true,
                enable_l2: true,
                enable_l3: true,
                fetch_candlesticks: true,
                fetch_orderbook: true,
            })
            .unwrap();

        let removed = store.delete_market_cascade("MKT-A").unwrap();
        assert!(removed >= 2);
        assert_eq!(store.delete_market_cascade("MKT-A").unwrap(), 0);
        assert!(store.watchlist().unwrap().is_empty());
    }
}
