//! Datastore and log store — redb-backed catalog persistence.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter
//! for testing), and one `RedbStore` can serve as both the catalog
//! datastore and the log store.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use kiln_core::models::TriggerType;
use kiln_core::{App, Call, Fn, Route, Trigger};

use crate::error::{StoreError, StoreResult};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Catalog read/write capability.
pub trait Datastore: Send + Sync {
    fn insert_app(&self, app: &App) -> StoreResult<()>;
    fn get_app(&self, id: &str) -> StoreResult<Option<App>>;
    fn get_app_by_name(&self, name: &str) -> StoreResult<Option<App>>;
    fn update_app(&self, app: &App) -> StoreResult<()>;
    /// Delete an app and everything it owns. Returns false if absent.
    fn delete_app(&self, id: &str) -> StoreResult<bool>;
    fn list_apps(&self, cursor: Option<&str>, limit: usize) -> StoreResult<Vec<App>>;

    fn insert_route(&self, route: &Route) -> StoreResult<()>;
    fn get_route(&self, app_name: &str, path: &str) -> StoreResult<Option<Route>>;
    fn update_route(&self, route: &Route) -> StoreResult<()>;
    fn delete_route(&self, app_name: &str, path: &str) -> StoreResult<bool>;
    fn list_routes(
        &self,
        app_name: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Route>>;

    fn insert_fn(&self, f: &Fn) -> StoreResult<()>;
    fn get_fn(&self, id: &str) -> StoreResult<Option<Fn>>;
    fn update_fn(&self, f: &Fn) -> StoreResult<()>;
    fn delete_fn(&self, id: &str) -> StoreResult<bool>;
    fn list_fns(
        &self,
        app_id: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Fn>>;

    fn insert_trigger(&self, trigger: &Trigger) -> StoreResult<()>;
    fn get_trigger(&self, id: &str) -> StoreResult<Option<Trigger>>;
    fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> StoreResult<Option<Trigger>>;
    fn update_trigger(&self, trigger: &Trigger) -> StoreResult<()>;
    fn delete_trigger(&self, id: &str) -> StoreResult<bool>;
    fn list_triggers(
        &self,
        app_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Trigger>>;

    /// Insert or update a call record. Calls are upserted: the start
    /// record lands before any log bytes, the completion record last.
    fn upsert_call(&self, call: &Call) -> StoreResult<()>;
    fn get_call(&self, app_name: &str, call_id: &str) -> StoreResult<Option<Call>>;
    fn list_calls(
        &self,
        app_name: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Call>>;
}

/// Opaque per-call log blobs.
pub trait LogStore: Send + Sync {
    fn insert_log(&self, call_id: &str, log: &[u8]) -> StoreResult<()>;
    fn get_log(&self, call_id: &str) -> StoreResult<Option<Vec<u8>>>;
    fn delete_log(&self, call_id: &str) -> StoreResult<bool>;
}

/// Thread-safe catalog + log store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "datastore opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory datastore opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
        txn.open_table(ROUTES).map_err(map_err!(Table))?;
        txn.open_table(FNS).map_err(map_err!(Table))?;
        txn.open_table(FN_NAMES).map_err(map_err!(Table))?;
        txn.open_table(TRIGGERS).map_err(map_err!(Table))?;
        txn.open_table(TRIGGER_NAMES).map_err(map_err!(Table))?;
        txn.open_table(TRIGGER_SOURCES).map_err(map_err!(Table))?;
        txn.open_table(CALLS).map_err(map_err!(Table))?;
        txn.open_table(LOGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ───────────────────────────────────────────

    fn read_json<T: DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Scan JSON rows whose key starts with `prefix`, beginning strictly
    /// after `cursor` when given, up to `limit`.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<T>> {
        let start: Bound<&str> = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Included(prefix),
        };
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in table
            .range::<&str>((start, Bound::<&str>::Unbounded))
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let item: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            out.push(item);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn route_key(app_name: &str, path: &str) -> String {
        format!("{app_name}:{path}")
    }

    fn call_key(app_name: &str, call_id: &str) -> String {
        format!("{app_name}:{call_id}")
    }

    fn source_key(app_id: &str, trigger_type: TriggerType, source: &str) -> String {
        let t = match trigger_type {
            TriggerType::Http => "http",
        };
        format!("{app_id}:{t}:{source}")
    }
}

impl Datastore for RedbStore {
    // ── Apps ──────────────────────────────────────────────────────

    fn insert_app(&self, app: &App) -> StoreResult<()> {
        let bytes = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            if names
                .get(app.name.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StoreError::AlreadyExists("app"));
            }
            names
                .insert(app.name.as_str(), app.id.as_str())
                .map_err(map_err!(Write))?;
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            apps.insert(app.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %app.name, "app stored");
        Ok(())
    }

    fn get_app(&self, id: &str) -> StoreResult<Option<App>> {
        self.read_json(APPS, id)
    }

    fn get_app_by_name(&self, name: &str) -> StoreResult<Option<App>> {
        let id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            match names.get(name).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_string(),
                None => return Ok(None),
            }
        };
        self.get_app(&id)
    }

    fn update_app(&self, app: &App) -> StoreResult<()> {
        if self.get_app(&app.id)?.is_none() {
            return Err(StoreError::NotFound("app"));
        }
        self.write_json(APPS, &app.id, app)
    }

    fn delete_app(&self, id: &str) -> StoreResult<bool> {
        let Some(app) = self.get_app(id)? else {
            return Ok(false);
        };

        // Gather owned entity keys in a read transaction first.
        let route_keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let routes = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            collect_prefix_keys(&routes, &format!("{}:", app.name))?
        };
        let fn_ids: Vec<(String, String)> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let names = txn.open_table(FN_NAMES).map_err(map_err!(Table))?;
            collect_prefix_pairs(&names, &format!("{id}:"))?
        };
        let trigger_ids: Vec<(String, String)> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let names = txn.open_table(TRIGGER_NAMES).map_err(map_err!(Table))?;
            collect_prefix_pairs(&names, &format!("{id}:"))?
        };
        let source_keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let sources = txn.open_table(TRIGGER_SOURCES).map_err(map_err!(Table))?;
            collect_prefix_keys_str(&sources, &format!("{id}:"))?
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            apps.remove(id).map_err(map_err!(Write))?;
            let mut names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            names.remove(app.name.as_str()).map_err(map_err!(Write))?;

            let mut routes = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            for key in &route_keys {
                routes.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut fns = txn.open_table(FNS).map_err(map_err!(Table))?;
            let mut fn_names = txn.open_table(FN_NAMES).map_err(map_err!(Table))?;
            for (name_key, fn_id) in &fn_ids {
                fn_names.remove(name_key.as_str()).map_err(map_err!(Write))?;
                fns.remove(fn_id.as_str()).map_err(map_err!(Write))?;
            }

            let mut triggers = txn.open_table(TRIGGERS).map_err(map_err!(Table))?;
            let mut trigger_names = txn.open_table(TRIGGER_NAMES).map_err(map_err!(Table))?;
            for (name_key, trigger_id) in &trigger_ids {
                trigger_names
                    .remove(name_key.as_str())
                    .map_err(map_err!(Write))?;
                triggers.remove(trigger_id.as_str()).map_err(map_err!(Write))?;
            }
            let mut sources = txn.open_table(TRIGGER_SOURCES).map_err(map_err!(Table))?;
            for key in &source_keys {
                sources.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %app.name, routes = route_keys.len(), fns = fn_ids.len(), "app deleted");
        Ok(true)
    }

    fn list_apps(&self, cursor: Option<&str>, limit: usize) -> StoreResult<Vec<App>> {
        self.scan_prefix(APPS, "", cursor, limit)
    }

    // ── Routes ────────────────────────────────────────────────────

    fn insert_route(&self, route: &Route) -> StoreResult<()> {
        let key = Self::route_key(&route.app_name, &route.path);
        if self.get_route(&route.app_name, &route.path)?.is_some() {
            return Err(StoreError::AlreadyExists("route"));
        }
        self.write_json(ROUTES, &key, route)
    }

    fn get_route(&self, app_name: &str, path: &str) -> StoreResult<Option<Route>> {
        self.read_json(ROUTES, &Self::route_key(app_name, path))
    }

    fn update_route(&self, route: &Route) -> StoreResult<()> {
        if self.get_route(&route.app_name, &route.path)?.is_none() {
            return Err(StoreError::NotFound("route"));
        }
        self.write_json(ROUTES, &Self::route_key(&route.app_name, &route.path), route)
    }

    fn delete_route(&self, app_name: &str, path: &str) -> StoreResult<bool> {
        let key = Self::route_key(app_name, path);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn list_routes(
        &self,
        app_name: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Route>> {
        let prefix = format!("{app_name}:");
        let cursor_key = cursor.map(|c| Self::route_key(app_name, c));
        self.scan_prefix(ROUTES, &prefix, cursor_key.as_deref(), limit)
    }

    // ── Fns ───────────────────────────────────────────────────────

    fn insert_fn(&self, f: &Fn) -> StoreResult<()> {
        let bytes = serde_json::to_vec(f).map_err(map_err!(Serialize))?;
        let name_key = format!("{}:{}", f.app_id, f.name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut names = txn.open_table(FN_NAMES).map_err(map_err!(Table))?;
            if names
                .get(name_key.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StoreError::AlreadyExists("fn"));
            }
            names
                .insert(name_key.as_str(), f.id.as_str())
                .map_err(map_err!(Write))?;
            let mut fns = txn.open_table(FNS).map_err(map_err!(Table))?;
            fns.insert(f.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_fn(&self, id: &str) -> StoreResult<Option<Fn>> {
        self.read_json(FNS, id)
    }

    fn update_fn(&self, f: &Fn) -> StoreResult<()> {
        if self.get_fn(&f.id)?.is_none() {
            return Err(StoreError::NotFound("fn"));
        }
        self.write_json(FNS, &f.id, f)
    }

    fn delete_fn(&self, id: &str) -> StoreResult<bool> {
        let Some(f) = self.get_fn(id)? else {
            return Ok(false);
        };
        let name_key = format!("{}:{}", f.app_id, f.name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut fns = txn.open_table(FNS).map_err(map_err!(Table))?;
            fns.remove(id).map_err(map_err!(Write))?;
            let mut names = txn.open_table(FN_NAMES).map_err(map_err!(Table))?;
            names.remove(name_key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    fn list_fns(
        &self,
        app_id: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Fn>> {
        let all: Vec<Fn> = self.scan_prefix(FNS, "", cursor, usize::MAX)?;
        Ok(all
            .into_iter()
            .filter(|f| app_id.map_or(true, |id| f.app_id == id))
            .take(limit)
            .collect())
    }

    // ── Triggers ──────────────────────────────────────────────────

    fn insert_trigger(&self, trigger: &Trigger) -> StoreResult<()> {
        let bytes = serde_json::to_vec(trigger).map_err(map_err!(Serialize))?;
        let name_key = format!("{}:{}", trigger.app_id, trigger.name);
        let source_key =
            Self::source_key(&trigger.app_id, trigger.trigger_type, &trigger.source);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut names = txn.open_table(TRIGGER_NAMES).map_err(map_err!(Table))?;
            if names
                .get(name_key.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StoreError::AlreadyExists("trigger"));
            }
            names
                .insert(name_key.as_str(), trigger.id.as_str())
                .map_err(map_err!(Write))?;
            let mut sources = txn.open_table(TRIGGER_SOURCES).map_err(map_err!(Table))?;
            sources
                .insert(source_key.as_str(), trigger.id.as_str())
                .map_err(map_err!(Write))?;
            let mut triggers = txn.open_table(TRIGGERS).map_err(map_err!(Table))?;
            triggers
                .insert(trigger.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_trigger(&self, id: &str) -> StoreResult<Option<Trigger>> {
        self.read_json(TRIGGERS, id)
    }

    fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> StoreResult<Option<Trigger>> {
        let key = Self::source_key(app_id, trigger_type, source);
        let id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let sources = txn.open_table(TRIGGER_SOURCES).map_err(map_err!(Table))?;
            match sources.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_string(),
                None => return Ok(None),
            }
        };
        self.get_trigger(&id)
    }

    fn update_trigger(&self, trigger: &Trigger) -> StoreResult<()> {
        let Some(old) = self.get_trigger(&trigger.id)? else {
            return Err(StoreError::NotFound("trigger"));
        };
        let bytes = serde_json::to_vec(trigger).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            // The source may move; keep the index in step.
            if old.source != trigger.source {
                let mut sources = txn.open_table(TRIGGER_SOURCES).map_err(map_err!(Table))?;
                let old_key = Self::source_key(&old.app_id, old.trigger_type, &old.source);
                sources.remove(old_key.as_str()).map_err(map_err!(Write))?;
                let new_key =
                    Self::source_key(&trigger.app_id, trigger.trigger_type, &trigger.source);
                sources
                    .insert(new_key.as_str(), trigger.id.as_str())
                    .map_err(map_err!(Write))?;
            }
            let mut triggers = txn.open_table(TRIGGERS).map_err(map_err!(Table))?;
            triggers
                .insert(trigger.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_trigger(&self, id: &str) -> StoreResult<bool> {
        let Some(trigger) = self.get_trigger(id)? else {
            return Ok(false);
        };
        let name_key = format!("{}:{}", trigger.app_id, trigger.name);
        let source_key =
            Self::source_key(&trigger.app_id, trigger.trigger_type, &trigger.source);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut triggers = txn.open_table(TRIGGERS).map_err(map_err!(Table))?;
            triggers.remove(id).map_err(map_err!(Write))?;
            let mut names = txn.open_table(TRIGGER_NAMES).map_err(map_err!(Table))?;
            names.remove(name_key.as_str()).map_err(map_err!(Write))?;
            let mut sources = txn.open_table(TRIGGER_SOURCES).map_err(map_err!(Table))?;
            sources.remove(source_key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    fn list_triggers(
        &self,
        app_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Trigger>> {
        let all: Vec<Trigger> = self.scan_prefix(TRIGGERS, "", cursor, usize::MAX)?;
        Ok(all
            .into_iter()
            .filter(|t| t.app_id == app_id)
            .take(limit)
            .collect())
    }

    // ── Calls ─────────────────────────────────────────────────────

    fn upsert_call(&self, call: &Call) -> StoreResult<()> {
        self.write_json(CALLS, &Self::call_key(&call.app_name, &call.id), call)
    }

    fn get_call(&self, app_name: &str, call_id: &str) -> StoreResult<Option<Call>> {
        self.read_json(CALLS, &Self::call_key(app_name, call_id))
    }

    fn list_calls(
        &self,
        app_name: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Call>> {
        let prefix = format!("{app_name}:");
        let cursor_key = cursor.map(|c| Self::call_key(app_name, c));
        self.scan_prefix(CALLS, &prefix, cursor_key.as_deref(), limit)
    }
}

impl LogStore for RedbStore {
    fn insert_log(&self, call_id: &str, log: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOGS).map_err(map_err!(Table))?;
            table.insert(call_id, log).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_log(&self, call_id: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOGS).map_err(map_err!(Table))?;
        match table.get(call_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(guard.value().to_vec())),
            None => Ok(None),
        }
    }

    fn delete_log(&self, call_id: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOGS).map_err(map_err!(Table))?;
            existed = table.remove(call_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

// ── Prefix-scan helpers over index tables ─────────────────────────

fn collect_prefix_keys(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StoreResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table
        .range::<&str>((Bound::Included(prefix), Bound::<&str>::Unbounded))
        .map_err(map_err!(Read))?
    {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

fn collect_prefix_keys_str(
    table: &impl ReadableTable<&'static str, &'static str>,
    prefix: &str,
) -> StoreResult<Vec<String>> {
    Ok(collect_prefix_pairs(table, prefix)?
        .into_iter()
        .map(|(k, _)| k)
        .collect())
}

fn collect_prefix_pairs(
    table: &impl ReadableTable<&'static str, &'static str>,
    prefix: &str,
) -> StoreResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for entry in table
        .range::<&str>((Bound::Included(prefix), Bound::<&str>::Unbounded))
        .map_err(map_err!(Read))?
    {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        pairs.push((key.value().to_string(), value.value().to_string()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::models::*;
    use std::collections::BTreeMap;

    fn test_app(id: &str, name: &str) -> App {
        App {
            id: id.to_string(),
            name: name.to_string(),
            config: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_route(app_name: &str, path: &str) -> Route {
        Route {
            app_name: app_name.to_string(),
            path: path.to_string(),
            image: "hello:v1".to_string(),
            memory_mb: 128,
            cpu_shares: 0,
            timeout_secs: 30,
            idle_timeout_secs: 30,
            route_type: RouteType::Sync,
            format: Format::Default,
            config: BTreeMap::new(),
        }
    }

    fn test_fn(id: &str, app_id: &str, name: &str) -> kiln_core::Fn {
        kiln_core::Fn {
            id: id.to_string(),
            app_id: app_id.to_string(),
            name: name.to_string(),
            image: "hello:v1".to_string(),
            memory_mb: 128,
            cpu_shares: 0,
            timeout_secs: 30,
            idle_timeout_secs: 30,
            format: Format::Default,
            config: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_trigger(id: &str, app_id: &str, fn_id: &str, name: &str, source: &str) -> Trigger {
        Trigger {
            id: id.to_string(),
            app_id: app_id.to_string(),
            fn_id: fn_id.to_string(),
            name: name.to_string(),
            trigger_type: TriggerType::Http,
            source: source.to_string(),
            annotations: BTreeMap::new(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Apps ──────────────────────────────────────────────────────

    #[test]
    fn app_insert_get_by_id_and_name() {
        let store = RedbStore::open_in_memory().unwrap();
        let app = test_app("a-1", "myapp");
        store.insert_app(&app).unwrap();

        assert_eq!(store.get_app("a-1").unwrap(), Some(app.clone()));
        assert_eq!(store.get_app_by_name("myapp").unwrap(), Some(app));
        assert!(store.get_app("a-2").unwrap().is_none());
        assert!(store.get_app_by_name("other").unwrap().is_none());
    }

    #[test]
    fn app_duplicate_name_conflicts() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert_app(&test_app("a-1", "myapp")).unwrap();
        let err = store.insert_app(&test_app("a-2", "myapp")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists("app")));
    }

    #[test]
    fn app_delete_cascades() {
        let store = RedbStore::open_in_memory().unwrap();
        let app = test_app("a-1", "myapp");
        store.insert_app(&app).unwrap();
        store.insert_route(&test_route("myapp", "/hello")).unwrap();
        store.insert_route(&test_route("myapp", "/world")).unwrap();
        store.insert_fn(&test_fn("f-1", "a-1", "hello")).unwrap();
        store
            .insert_trigger(&test_trigger("t-1", "a-1", "f-1", "hello-http", "/hello"))
            .unwrap();

        assert!(store.delete_app("a-1").unwrap());

        assert!(store.get_app("a-1").unwrap().is_none());
        assert!(store.get_app_by_name("myapp").unwrap().is_none());
        assert!(store.get_route("myapp", "/hello").unwrap().is_none());
        assert!(store.get_fn("f-1").unwrap().is_none());
        assert!(store.get_trigger("t-1").unwrap().is_none());
        assert!(store
            .get_trigger_by_source("a-1", TriggerType::Http, "/hello")
            .unwrap()
            .is_none());

        // A second delete reports absence.
        assert!(!store.delete_app("a-1").unwrap());
    }

    #[test]
    fn app_list_pagination() {
        let store = RedbStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_app(&test_app(&format!("a-{i}"), &format!("app{i}")))
                .unwrap();
        }
        let first = store.list_apps(None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let next = store.list_apps(Some(&first[1].id), 10).unwrap();
        assert_eq!(next.len(), 3);
        assert_ne!(first[1].id, next[0].id);
    }

    // ── Routes ────────────────────────────────────────────────────

    #[test]
    fn route_crud() {
        let store = RedbStore::open_in_memory().unwrap();
        let mut route = test_route("myapp", "/hello");
        store.insert_route(&route).unwrap();

        assert!(matches!(
            store.insert_route(&route).unwrap_err(),
            StoreError::AlreadyExists("route")
        ));

        route.memory_mb = 256;
        store.update_route(&route).unwrap();
        assert_eq!(
            store.get_route("myapp", "/hello").unwrap().unwrap().memory_mb,
            256
        );

        assert!(store.delete_route("myapp", "/hello").unwrap());
        assert!(!store.delete_route("myapp", "/hello").unwrap());
        assert!(matches!(
            store.update_route(&route).unwrap_err(),
            StoreError::NotFound("route")
        ));
    }

    #[test]
    fn route_listing_is_scoped_to_app() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert_route(&test_route("app1", "/a")).unwrap();
        store.insert_route(&test_route("app1", "/b")).unwrap();
        store.insert_route(&test_route("app2", "/c")).unwrap();

        let app1 = store.list_routes("app1", None, 10).unwrap();
        assert_eq!(app1.len(), 2);
        assert!(app1.iter().all(|r| r.app_name == "app1"));
    }

    // ── Fns and triggers ──────────────────────────────────────────

    #[test]
    fn fn_unique_per_app_by_name() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert_fn(&test_fn("f-1", "a-1", "hello")).unwrap();
        assert!(matches!(
            store.insert_fn(&test_fn("f-2", "a-1", "hello")).unwrap_err(),
            StoreError::AlreadyExists("fn")
        ));
        // Same name under a different app is fine.
        store.insert_fn(&test_fn("f-3", "a-2", "hello")).unwrap();
    }

    #[test]
    fn trigger_lookup_by_source() {
        let store = RedbStore::open_in_memory().unwrap();
        let t = test_trigger("t-1", "a-1", "f-1", "hook", "/hook");
        store.insert_trigger(&t).unwrap();

        let found = store
            .get_trigger_by_source("a-1", TriggerType::Http, "/hook")
            .unwrap();
        assert_eq!(found, Some(t));
        assert!(store
            .get_trigger_by_source("a-2", TriggerType::Http, "/hook")
            .unwrap()
            .is_none());
    }

    #[test]
    fn trigger_source_index_follows_update() {
        let store = RedbStore::open_in_memory().unwrap();
        let mut t = test_trigger("t-1", "a-1", "f-1", "hook", "/old");
        store.insert_trigger(&t).unwrap();

        t.source = "/new".to_string();
        store.update_trigger(&t).unwrap();

        assert!(store
            .get_trigger_by_source("a-1", TriggerType::Http, "/old")
            .unwrap()
            .is_none());
        assert!(store
            .get_trigger_by_source("a-1", TriggerType::Http, "/new")
            .unwrap()
            .is_some());
    }

    // ── Calls and logs ────────────────────────────────────────────

    #[test]
    fn call_upsert_and_listing() {
        let store = RedbStore::open_in_memory().unwrap();
        let app = test_app("a-1", "myapp");
        let mut call = Call::new("01abc".into(), &app, Some("/hello".into()), None);
        store.upsert_call(&call).unwrap();

        call.status = CallStatus::Success;
        call.completed_at = Some(2000);
        store.upsert_call(&call).unwrap();

        let got = store.get_call("myapp", "01abc").unwrap().unwrap();
        assert_eq!(got.status, CallStatus::Success);

        let listed = store.list_calls("myapp", None, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_calls("other", None, 10).unwrap().is_empty());
    }

    #[test]
    fn log_roundtrip() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert_log("c-1", b"line one\nline two\n").unwrap();
        assert_eq!(
            store.get_log("c-1").unwrap().unwrap(),
            b"line one\nline two\n".to_vec()
        );
        assert!(store.get_log("c-2").unwrap().is_none());
        assert!(store.delete_log("c-1").unwrap());
        assert!(!store.delete_log("c-1").unwrap());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.insert_app(&test_app("a-1", "prod")).unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert!(store.get_app_by_name("prod").unwrap().is_some());
    }
}
