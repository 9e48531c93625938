//! The typed statement tree the routing engine consumes.
//!
//! The full SQL grammar lives in the external parser; this tree carries
//! exactly what routing, caching, and invalidation decisions need. Variants
//! map one-to-one onto the statement classes those decisions distinguish;
//! everything else collapses into `Other`.

pub type Oid = u32;

/// A possibly schema-qualified relation reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    pub fn bare(name: &str) -> Self {
        Self::new(None, name)
    }

    /// `schema.table`, defaulting the schema to `public`.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => format!("public.{}", self.name),
        }
    }

    /// System catalogs are routed to the primary and never cached.
    pub fn is_system_catalog(&self) -> bool {
        match self.schema.as_deref() {
            Some("pg_catalog") | Some("information_schema") => true,
            Some(_) => false,
            None => self.name.starts_with("pg_"),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// PostgreSQL table lock modes, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    AccessShare = 1,
    RowShare = 2,
    RowExclusive = 3,
    ShareUpdateExclusive = 4,
    Share = 5,
    ShareRowExclusive = 6,
    Exclusive = 7,
    AccessExclusive = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options attached to BEGIN / START TRANSACTION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    /// `Some(true)` for READ WRITE, `Some(false)` for READ ONLY.
    pub read_write: Option<bool>,
    pub isolation: IsolationLevel,
}

impl TransactionOptions {
    /// True when standbys must receive a plain BEGIN instead.
    pub fn needs_rewrite(&self) -> bool {
        self.read_write == Some(true) || self.isolation == IsolationLevel::Serializable
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionVerb {
    Begin(TransactionOptions),
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    PrepareTransaction(String),
    CommitPrepared(String),
    RollbackPrepared(String),
}

/// SELECT with the attributes cache-safety and routing care about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectStmt {
    /// FROM-list relations, CTE names excluded.
    pub tables: Vec<TableRef>,
    /// Relations written by INSERT/UPDATE/DELETE CTEs.
    pub cte_write_tables: Vec<TableRef>,
    pub has_select_into: bool,
    pub has_locking_clause: bool,
    pub has_tablesample: bool,
    /// Function names invoked anywhere in the statement.
    pub functions: Vec<String>,
    /// Literal pid argument of a pg_terminate_backend() call, when present.
    pub terminate_backend_pid: Option<i32>,
}

impl SelectStmt {
    pub fn has_modifying_cte(&self) -> bool {
        !self.cte_write_tables.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSetStmt {
    /// Lower-cased variable name, or `transaction` / `session characteristics`
    /// for the multi-option forms.
    pub name: String,
    /// Lower-cased argument words.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyTarget {
    /// COPY table FROM/TO.
    Table(TableRef),
    /// COPY (query) TO; true when the inner query is a plain SELECT.
    Query { is_select: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Select(SelectStmt),
    Insert {
        table: TableRef,
    },
    Update {
        table: TableRef,
    },
    Delete {
        table: TableRef,
    },
    Truncate {
        tables: Vec<TableRef>,
    },
    CreateTable {
        table: TableRef,
        temp: bool,
        unlogged: bool,
    },
    DropTable {
        tables: Vec<TableRef>,
    },
    AlterTable {
        table: TableRef,
    },
    DropDatabase {
        name: String,
    },
    Copy {
        target: CopyTarget,
        is_from: bool,
    },
    Lock {
        tables: Vec<TableRef>,
        mode: LockMode,
    },
    Transaction(TransactionVerb),
    Set(VariableSetStmt),
    Show {
        name: String,
    },
    Discard {
        what: String,
    },
    Prepare {
        name: String,
        query: Box<Stmt>,
    },
    Execute {
        name: String,
    },
    Deallocate {
        /// `None` means DEALLOCATE ALL.
        name: Option<String>,
    },
    Explain {
        analyze: bool,
        query: Box<Stmt>,
    },
    /// Anything the routing engine has no special handling for.
    Other,
}

impl Stmt {
    pub fn is_select(&self) -> bool {
        matches!(self, Stmt::Select(_))
    }

    /// Statements that modify table contents or schema; drives both the
    /// writing-transaction latch and cache invalidation.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Stmt::Insert { .. }
                | Stmt::Update { .. }
                | Stmt::Delete { .. }
                | Stmt::Truncate { .. }
                | Stmt::CreateTable { .. }
                | Stmt::DropTable { .. }
                | Stmt::AlterTable { .. }
                | Stmt::DropDatabase { .. }
                | Stmt::Copy { is_from: true, .. }
        ) || matches!(self, Stmt::Select(s) if s.has_modifying_cte() || s.has_select_into)
    }
}
