use crate::config::StorageConfig;
use crate::order::{self, Allocation};
use crate::storage::{Storage, StorageError};
use crate::types::{
    NodeKind, Node, Operation, ROOT_ID, Tab, Tree, UNINITIALIZED_VERSION, new_node_id, now_millis,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, trace, warn};

pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite implementation of the Storage trait
///
/// The tree version lives in a sidecar next to the database (`state.db` →
/// `state.version`). Recording the hash of a commit that contains the
/// database must not modify the committed file.
pub struct SqliteStorage {
    pool: RwLock<DbPool>,
    path: PathBuf,
    version_path: PathBuf,
    config: StorageConfig,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `path` and initialise it
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let storage = SqliteStorage {
            pool: RwLock::new(build_pool(path_ref, config)?),
            path: path_ref.to_path_buf(),
            version_path: path_ref.with_extension("version"),
            config: config.clone(),
        };
        storage.init()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        // Clone the handle so a concurrent reopen never waits on a checkout
        let pool = self
            .pool
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        Ok(pool.get()?)
    }

    pub fn version_path(&self) -> &Path {
        &self.version_path
    }

    fn read_version(&self) -> Result<String, StorageError> {
        match std::fs::read_to_string(&self.version_path) {
            Ok(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Ok(_) => Ok(UNINITIALIZED_VERSION.to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(UNINITIALIZED_VERSION.to_string()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Storage for SqliteStorage {
    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../sql/schema.sql"))?;

        let now = now_millis();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO nodes(id, parent_id, kind, title, ord, created_at, updated_at)
            VALUES (?1, NULL, 'folder', 'Root', 0, ?2, ?2);
            "#,
            params![ROOT_ID, now],
        )?;
        if inserted > 0 {
            debug!("created root node");
        }
        Ok(())
    }

    fn load_tree(&self) -> Result<Tree, StorageError> {
        let conn = self.conn()?;
        let version = self.read_version()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, parent_id, kind, title, url, ord, created_at, updated_at
            FROM nodes
            ORDER BY parent_id IS NOT NULL, parent_id, ord, id;
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (id, parent_id, kind, title, url, ord, created_at, updated_at) = row?;
            let kind: NodeKind = kind
                .parse()
                .map_err(|e| StorageError::Corrupt(format!("node {id}: {e}")))?;
            nodes.push(Node {
                id,
                kind,
                title,
                url,
                parent_id,
                ord,
                created_at,
                updated_at,
            });
        }

        Ok(Tree::from_nodes(version, nodes))
    }

    fn apply_ops(&self, ops: &[Operation]) -> Result<Tree, StorageError> {
        {
            let mut conn = self.conn()?;
            // IMMEDIATE takes the write lock up front so sibling reads and the
            // writes based on them see one generation
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_millis();
            for op in ops {
                trace!(op = op.name(), "applying operation");
                // Dropping `tx` on error rolls the batch back
                apply_op(&tx, op, now)?;
            }
            tx.commit()?;
        }
        debug!("committed batch of {} operations", ops.len());
        self.load_tree()
    }

    fn record_version(&self, version: &str) -> Result<(), StorageError> {
        let mut tmp = self.version_path.clone().into_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, format!("{version}\n"))?;
        std::fs::rename(&tmp, &self.version_path)?;
        trace!(version, "recorded tree version");
        Ok(())
    }

    fn reopen(&self) -> Result<(), StorageError> {
        let fresh = build_pool(&self.path, &self.config)?;
        *self.pool.write().unwrap_or_else(|p| p.into_inner()) = fresh;
        debug!("reopened database at {:?}", self.path);
        self.init()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn build_pool(path: &Path, config: &StorageConfig) -> Result<DbPool, StorageError> {
    let cache_size = config.sqlite_cache_size;
    let busy_timeout = config.sqlite_busy_timeout;
    let synchronous = config.synchronous.clone();

    // Journal mode is a property of the database file; set it once
    {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "busy_timeout", busy_timeout)?;
        conn.pragma_update(None, "journal_mode", &config.journal_mode)?;
    }

    // foreign_keys is per connection and carries the subtree cascade
    let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "cache_size", cache_size)?;
        conn.pragma_update(None, "busy_timeout", busy_timeout)?;
        conn.pragma_update(None, "synchronous", &synchronous)?;
        Ok(())
    });

    Ok(Pool::builder()
        .max_size(config.pool_size.max(1))
        .min_idle(Some(1))
        .build(manager)?)
}

fn apply_op(tx: &Transaction<'_>, op: &Operation, now: i64) -> Result<(), StorageError> {
    match op {
        Operation::AddFolder {
            parent_id,
            title,
            index,
        } => {
            let ord = allocate_ord(tx, parent_id, *index, None)?;
            insert_node(tx, parent_id, NodeKind::Folder, title, None, ord, now)?;
        }
        Operation::AddBookmark {
            parent_id,
            title,
            url,
            index,
        } => {
            let ord = allocate_ord(tx, parent_id, *index, None)?;
            insert_node(tx, parent_id, NodeKind::Bookmark, title, Some(url), ord, now)?;
        }
        Operation::RenameNode { node_id, title } => {
            let n = tx.execute(
                "UPDATE nodes SET title = ?1, updated_at = ?2 WHERE id = ?3 AND parent_id IS NOT NULL",
                params![title, now, node_id],
            )?;
            expect_rows(n, op, node_id)?;
        }
        Operation::MoveNode {
            node_id,
            new_parent_id,
            new_index,
        } => {
            let ord = allocate_ord(tx, new_parent_id, *new_index, Some(node_id))?;
            let n = tx.execute(
                "UPDATE nodes SET parent_id = ?1, ord = ?2, updated_at = ?3
                 WHERE id = ?4 AND parent_id IS NOT NULL",
                params![new_parent_id, ord, now, node_id],
            )?;
            expect_rows(n, op, node_id)?;
        }
        Operation::DeleteNode { node_id, .. } => {
            let n = tx.execute(
                "DELETE FROM nodes WHERE id = ?1 AND parent_id IS NOT NULL",
                [node_id],
            )?;
            expect_rows(n, op, node_id)?;
        }
        Operation::UpdateBookmark {
            node_id,
            title,
            url,
        } => {
            if title.is_none() && url.is_none() {
                let found = tx
                    .query_row(
                        "SELECT 1 FROM nodes WHERE id = ?1 AND kind = 'bookmark'",
                        [node_id],
                        |_| Ok(()),
                    )
                    .optional()?;
                return expect_rows(usize::from(found.is_some()), op, node_id);
            }
            let n = tx.execute(
                "UPDATE nodes SET title = COALESCE(?1, title), url = COALESCE(?2, url), updated_at = ?3
                 WHERE id = ?4 AND kind = 'bookmark'",
                params![title, url, now, node_id],
            )?;
            expect_rows(n, op, node_id)?;
        }
        Operation::SaveSession {
            parent_id,
            title,
            tabs,
            index,
        } => {
            let ord = allocate_ord(tx, parent_id, *index, None)?;
            let folder_id = insert_node(tx, parent_id, NodeKind::Folder, title, None, ord, now)?;
            for (i, Tab { title, url }) in tabs.iter().enumerate() {
                insert_node(
                    tx,
                    &folder_id,
                    NodeKind::Bookmark,
                    title,
                    Some(url),
                    i as f64,
                    now,
                )?;
            }
        }
    }
    Ok(())
}

fn insert_node(
    tx: &Transaction<'_>,
    parent_id: &str,
    kind: NodeKind,
    title: &str,
    url: Option<&String>,
    ord: f64,
    now: i64,
) -> Result<String, StorageError> {
    let id = new_node_id();
    tx.execute(
        r#"
        INSERT INTO nodes(id, parent_id, kind, title, url, ord, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
        params![id, parent_id, kind.as_str(), title, url, ord, now],
    )?;
    Ok(id)
}

fn expect_rows(affected: usize, op: &Operation, node_id: &str) -> Result<(), StorageError> {
    if affected == 0 {
        return Err(StorageError::NoRowsAffected {
            op: op.name(),
            node_id: node_id.to_string(),
        });
    }
    Ok(())
}

/// Persisted children of `parent_id` in display order, minus `exclude`
fn sibling_ords(
    tx: &Transaction<'_>,
    parent_id: &str,
    exclude: Option<&str>,
) -> Result<Vec<(String, f64)>, StorageError> {
    let mut stmt = tx.prepare_cached(
        "SELECT id, ord FROM nodes WHERE parent_id = ?1 ORDER BY ord ASC, id ASC",
    )?;
    let rows = stmt.query_map([parent_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

    let mut siblings = Vec::new();
    for row in rows {
        let (id, ord): (String, f64) = row?;
        if Some(id.as_str()) != exclude {
            siblings.push((id, ord));
        }
    }
    Ok(siblings)
}

fn allocate_ord(
    tx: &Transaction<'_>,
    parent_id: &str,
    index: Option<i64>,
    exclude: Option<&str>,
) -> Result<f64, StorageError> {
    let siblings = sibling_ords(tx, parent_id, exclude)?;
    let ords: Vec<f64> = siblings.iter().map(|(_, ord)| *ord).collect();

    match order::allocate(&ords, index) {
        Allocation::Ord(ord) => Ok(ord),
        Allocation::NeedsRebalance => {
            warn!(
                parent_id,
                siblings = siblings.len(),
                "sibling ord gap below epsilon, renumbering"
            );
            let fresh = order::renumbered(siblings.len());
            {
                let mut stmt = tx.prepare_cached("UPDATE nodes SET ord = ?1 WHERE id = ?2")?;
                for ((id, _), ord) in siblings.iter().zip(&fresh) {
                    stmt.execute(params![ord, id])?;
                }
            }
            match order::allocate(&fresh, index) {
                Allocation::Ord(ord) => Ok(ord),
                Allocation::NeedsRebalance => Err(StorageError::Corrupt(format!(
                    "cannot allocate ord under {parent_id} after renumbering"
                ))),
            }
        }
    }
}
