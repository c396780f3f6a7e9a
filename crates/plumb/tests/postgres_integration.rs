//! Integration tests against real PostgreSQL.
//!
//! These tests verify that:
//! 1. Units commit or roll back as a whole, and later units are skipped
//! 2. The catalog reader sees every object kind the reconciler checks
//! 3. Reconciliation of a live snapshot reports the true state
//!
//! Run with: cargo nextest run -p plumb --test postgres_integration
//!
//! A throwaway server is started with testcontainers. Set
//! `PLUMB_TEST_DATABASE_URL` to use an existing server instead; every test
//! works in its own schema. Without either, the tests print why and pass.

use plumb::{
    CatalogObject, ConnectionProvider, DirectConnector, ExecutionStatus, ExpectedSchemaSpec,
    MigrationOrchestrator, MigrationUnit, MissingObject, PolicyCommand, RowCounts,
    SchemaCatalogReader, SnapshotFilter, TableStatus, Verdict, Verification,
};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use tokio_postgres::Client;

struct TestDb {
    url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

impl TestDb {
    fn connector(&self) -> DirectConnector {
        DirectConnector::new(&self.url).unwrap()
    }

    async fn client(&self) -> Client {
        self.connector().connect().await.unwrap()
    }

    /// Drop and recreate `schema`, returning its name.
    async fn fresh_schema(&self, schema: &str) -> String {
        let client = self.client().await;
        client
            .batch_execute(&format!(
                "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema};"
            ))
            .await
            .unwrap();
        schema.to_string()
    }
}

async fn start_postgres() -> Option<TestDb> {
    if let Ok(url) = std::env::var("PLUMB_TEST_DATABASE_URL") {
        return Some(TestDb {
            url,
            _container: None,
        });
    }

    let container = match Postgres::default().with_tag("16-alpine").start().await {
        Ok(container) => container,
        Err(e) => {
            eprintln!("skipping: could not start postgres container: {e}");
            return None;
        }
    };
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(5432).await.unwrap();

    Some(TestDb {
        url: format!("postgres://postgres:postgres@{host}:{port}/postgres"),
        _container: Some(container),
    })
}

#[tokio::test]
async fn applies_and_verifies_widgets() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("widgets_run").await;

    let units = vec![MigrationUnit::new(
        "001_widgets.sql",
        format!("CREATE TABLE {s}.widgets (id serial PRIMARY KEY, name text NOT NULL);"),
    )];
    let spec = ExpectedSchemaSpec::builder()
        .schema(&s)
        .table("widgets")
        .build()
        .unwrap();

    let outcome = MigrationOrchestrator::new(db.connector())
        .run(&units, &spec)
        .await;
    assert_eq!(outcome.results[0].status, ExecutionStatus::Committed);
    assert_eq!(outcome.verdict(), Verdict::Passed);
    assert_eq!(
        outcome.report().unwrap().table("widgets").unwrap().status,
        TableStatus::Present { row_count: Some(0) }
    );

    let client = db.client().await;
    let snapshot = SchemaCatalogReader::new(&client)
        .snapshot(&s, &SnapshotFilter::all())
        .await
        .unwrap();
    assert_eq!(snapshot.tables().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["widgets"]);
    let columns: Vec<_> = snapshot
        .columns("widgets")
        .map(|c| (c.name.as_str(), c.data_type.as_str(), c.nullable))
        .collect();
    assert_eq!(
        columns,
        vec![("id", "integer", false), ("name", "text", false)]
    );
}

#[tokio::test]
async fn failed_unit_leaves_earlier_commits() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("ghost_run").await;

    let units = vec![
        MigrationUnit::new(
            "001_orders.sql",
            format!("CREATE TABLE {s}.orders (id serial PRIMARY KEY, total numeric(10, 2));"),
        ),
        MigrationUnit::new(
            "002_ghost_ref.sql",
            format!(
                "CREATE TABLE {s}.order_ghosts (order_id int REFERENCES {s}.orders(id), \
                 ghost_id int REFERENCES {s}.ghost(id));"
            ),
        ),
    ];
    let spec = ExpectedSchemaSpec::builder()
        .schema(&s)
        .tables(["orders", "ghost"])
        .build()
        .unwrap();

    let outcome = MigrationOrchestrator::new(db.connector())
        .run(&units, &spec)
        .await;
    assert_eq!(outcome.results[0].status, ExecutionStatus::Committed);
    assert_eq!(outcome.results[1].status, ExecutionStatus::RolledBack);
    let error = outcome.results[1].error.as_ref().unwrap();
    assert_eq!(error.code.as_deref(), Some("42P01"));
    assert!(error.message.contains("ghost"), "{}", error.message);

    let report = outcome.report().unwrap();
    assert!(report.table("orders").unwrap().status.is_present());
    assert_eq!(report.table("ghost").unwrap().status, TableStatus::Missing);
    assert!(!report.fully_satisfied);
    assert_eq!(outcome.verdict(), Verdict::ExecutionFailed);
}

#[tokio::test]
async fn rolled_back_unit_leaves_no_trace() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("atomic_run").await;

    let units = vec![
        MigrationUnit::new("a.sql", format!("CREATE TABLE {s}.a (id int PRIMARY KEY);")),
        MigrationUnit::new(
            "b.sql",
            format!(
                "CREATE TABLE {s}.b (id int PRIMARY KEY);\n\
                 INSERT INTO {s}.a VALUES (1);\n\
                 CREATE TABLE {s}.b_broken (id int REFERENCES {s}.nowhere(id));"
            ),
        ),
        MigrationUnit::new("c.sql", format!("CREATE TABLE {s}.c (id int);")),
    ];
    let spec = ExpectedSchemaSpec::builder()
        .schema(&s)
        .tables(["a", "b", "c"])
        .build()
        .unwrap();

    let outcome = MigrationOrchestrator::new(db.connector())
        .run(&units, &spec)
        .await;
    let statuses: Vec<_> = outcome.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Committed,
            ExecutionStatus::RolledBack,
            ExecutionStatus::NotAttempted,
        ]
    );

    let report = outcome.report().unwrap();
    // The insert into `a` was part of the failed unit.
    assert_eq!(
        report.table("a").unwrap().status,
        TableStatus::Present { row_count: Some(0) }
    );
    assert_eq!(report.table("b").unwrap().status, TableStatus::Missing);
    assert_eq!(report.table("c").unwrap().status, TableStatus::Missing);
}

#[tokio::test]
async fn reports_error_position() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("syntax_run").await;

    let sql = format!("CREATE TABLE {s}.t (id int);\nSELEC 1;");
    let units = vec![MigrationUnit::new("typo.sql", sql.clone())];
    let spec = ExpectedSchemaSpec::builder()
        .schema(&s)
        .table("t")
        .build()
        .unwrap();

    let outcome = MigrationOrchestrator::new(db.connector())
        .run(&units, &spec)
        .await;
    let error = outcome.results[0].error.as_ref().unwrap();
    assert_eq!(error.code.as_deref(), Some("42601"));
    assert_eq!(error.location(&sql), Some((2, 1)));
    assert_eq!(outcome.report().unwrap().table("t").unwrap().status, TableStatus::Missing);
}

#[tokio::test]
async fn missing_index_is_incomplete() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("index_run").await;

    let client = db.client().await;
    client
        .batch_execute(&format!(
            "CREATE TABLE {s}.orders (id serial PRIMARY KEY, created_at timestamptz);"
        ))
        .await
        .unwrap();

    let spec = ExpectedSchemaSpec::builder()
        .schema(&s)
        .table("orders")
        .require_indexes("orders", ["orders_pkey", "idx_orders_created_at"])
        .build()
        .unwrap();
    let outcome = MigrationOrchestrator::new(db.connector()).run(&[], &spec).await;

    let report = outcome.report().unwrap();
    assert_eq!(
        report.table("orders").unwrap().status,
        TableStatus::PresentIncomplete {
            row_count: Some(0),
            missing: vec![MissingObject::Index("idx_orders_created_at".to_string())],
        }
    );
    assert_eq!(outcome.verdict(), Verdict::Incomplete);
}

#[tokio::test]
async fn reads_every_object_kind() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("catalog_run").await;

    let client = db.client().await;
    client
        .batch_execute(&format!(
            r#"
            CREATE FUNCTION {s}.touch() RETURNS trigger LANGUAGE plpgsql AS $$
            BEGIN
                NEW.updated_at = now();
                RETURN NEW;
            END
            $$;
            CREATE TABLE {s}.accounts (
                id serial PRIMARY KEY,
                code varchar(16) NOT NULL,
                updated_at timestamptz
            );
            CREATE TRIGGER accounts_touch BEFORE UPDATE ON {s}.accounts
                FOR EACH ROW EXECUTE FUNCTION {s}.touch();
            ALTER TABLE {s}.accounts ENABLE ROW LEVEL SECURITY;
            CREATE POLICY accounts_read ON {s}.accounts FOR SELECT USING (true);
            CREATE POLICY accounts_owner ON {s}.accounts USING (true);
            CREATE TABLE {s}.ledger (
                id serial PRIMARY KEY,
                account_id int REFERENCES {s}.accounts(id),
                amount bigint NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_ledger_account ON {s}.ledger (account_id);
            CREATE FUNCTION {s}.balance(p_account int) RETURNS bigint LANGUAGE sql AS $$
                SELECT 0::bigint
            $$;
            INSERT INTO {s}.accounts (code) VALUES ('cash'), ('bank');
            "#
        ))
        .await
        .unwrap();

    let reader = SchemaCatalogReader::new(&client);
    let snapshot = reader.snapshot(&s, &SnapshotFilter::all()).await.unwrap();

    assert_eq!(snapshot.table("accounts").unwrap().row_count, Some(2));
    let code = snapshot.columns("accounts").find(|c| c.name == "code").unwrap();
    assert_eq!(code.max_length, Some(16));
    assert_eq!(code.ordinal, 2);
    let amount = snapshot.columns("ledger").find(|c| c.name == "amount").unwrap();
    assert_eq!(amount.default.as_deref(), Some("0"));

    let indexes: Vec<_> = snapshot.indexes("ledger").map(|i| i.name.as_str()).collect();
    assert_eq!(indexes, vec!["idx_ledger_account", "ledger_pkey"]);

    let fk = snapshot.foreign_keys("ledger").next().unwrap();
    assert_eq!(
        (fk.column.as_str(), fk.ref_table.as_str(), fk.ref_column.as_str()),
        ("account_id", "accounts", "id")
    );

    let trigger = snapshot.triggers("accounts").next().unwrap();
    assert_eq!((trigger.name.as_str(), trigger.function_name.as_str()), ("accounts_touch", "touch"));

    assert_eq!(snapshot.row_security("accounts"), Some(true));
    assert_eq!(snapshot.row_security("ledger"), Some(false));
    let policies: Vec<_> = snapshot
        .policies("accounts")
        .map(|p| (p.name.as_str(), p.command))
        .collect();
    assert_eq!(
        policies,
        vec![
            ("accounts_owner", PolicyCommand::All),
            ("accounts_read", PolicyCommand::Select),
        ]
    );

    let functions: Vec<_> = snapshot
        .functions()
        .map(|f| (f.name.as_str(), f.arguments.as_str(), f.return_type.as_str()))
        .collect();
    assert_eq!(
        functions,
        vec![
            ("balance", "p_account integer", "bigint"),
            ("touch", "", "trigger"),
        ]
    );

    // Nothing changed, so a second read compares equal.
    let again = reader.snapshot(&s, &SnapshotFilter::all()).await.unwrap();
    assert_eq!(snapshot, again);

    let filtered = reader
        .snapshot(
            &s,
            &SnapshotFilter::only_tables(["ledger"])
                .with_functions(false)
                .with_row_counts(RowCounts::Skip),
        )
        .await
        .unwrap();
    assert!(filtered.table("accounts").is_none());
    assert_eq!(filtered.table("ledger").unwrap().row_count, None);
    assert_eq!(filtered.functions().count(), 0);
    assert!(
        filtered
            .iter()
            .all(|o| matches!(o, CatalogObject::Function(_)) || o.owning_table() == Some("ledger"))
    );

    let spec = ExpectedSchemaSpec::from_toml(&format!(
        r#"
        schema = "{s}"
        functions = ["balance"]

        [[groups]]
        name = "Accounting"
        tables = ["accounts", "ledger"]

        [requirements.accounts]
        policies = ["select", "update"]
        triggers = ["accounts_touch"]
        row_security = true

        [requirements.ledger]
        indexes = ["idx_ledger_*"]
        "#
    ))
    .unwrap();
    let outcome = MigrationOrchestrator::new(db.connector()).run(&[], &spec).await;
    assert_eq!(outcome.verdict(), Verdict::Passed);
}

#[tokio::test]
async fn dropped_connection_is_catalog_unavailable() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("dropped_run").await;

    let victim = db.client().await;
    let pid: i32 = victim
        .query_one("SELECT pg_backend_pid()", &[])
        .await
        .unwrap()
        .get(0);
    let admin = db.client().await;
    admin
        .execute("SELECT pg_terminate_backend($1)", &[&pid])
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let err = SchemaCatalogReader::new(&victim)
        .snapshot(&s, &SnapshotFilter::all())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "catalog_unavailable");
}

#[tokio::test]
async fn unreachable_server_marks_everything_not_attempted() {
    // Port 1 on localhost is reliably closed.
    let connector = DirectConnector::new("postgres://postgres@127.0.0.1:1/postgres").unwrap();
    let spec = ExpectedSchemaSpec::builder().table("widgets").build().unwrap();
    let units = vec![MigrationUnit::new("001.sql", "CREATE TABLE widgets (id int);")];

    let outcome = MigrationOrchestrator::new(connector).run(&units, &spec).await;
    assert_eq!(outcome.results[0].status, ExecutionStatus::NotAttempted);
    let Verification::Unavailable(err) = &outcome.verification else {
        panic!("expected unavailable verification");
    };
    assert_eq!(err.kind(), "connect");
    assert_eq!(outcome.verdict(), Verdict::VerificationUnavailable);
}

#[tokio::test]
async fn runs_through_a_deadpool_pool() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("pooled_run").await;

    let manager =
        deadpool_postgres::Manager::new(db.url.parse().unwrap(), tokio_postgres::NoTls);
    let pool = deadpool_postgres::Pool::builder(manager)
        .max_size(2)
        .build()
        .unwrap();

    let units = vec![MigrationUnit::new(
        "001_accounts.sql",
        format!("CREATE TABLE {s}.accounts (id int PRIMARY KEY, owner text);"),
    )];
    let spec = ExpectedSchemaSpec::builder()
        .schema(&s)
        .table("accounts")
        .require_columns("accounts", ["id", "owner"])
        .require_indexes("accounts", ["accounts_pkey"])
        .build()
        .unwrap();

    let orchestrator = MigrationOrchestrator::new(pool);
    let outcome = orchestrator.run(&units, &spec).await;
    assert_eq!(outcome.results[0].status, ExecutionStatus::Committed);
    assert_eq!(outcome.verdict(), Verdict::Passed);

    // The connection went back to the pool when the run ended.
    let status = orchestrator.provider().status();
    assert_eq!(status.size, 1);
    assert_eq!(status.available, 1);
}

#[tokio::test]
async fn estimated_row_counts_follow_analyze() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let client = db.client().await;
    let version: i32 = client
        .query_one("SELECT current_setting('server_version_num')::int", &[])
        .await
        .unwrap()
        .get(0);
    if version < 140000 {
        // Before 14, a never-analysed table reports 0 tuples instead of -1.
        eprintln!("skipping: server {version} predates reltuples = -1");
        return;
    }
    let s = db.fresh_schema("estimate_run").await;

    client
        .batch_execute(&format!(
            "CREATE TABLE {s}.ledger (amount int); \
             INSERT INTO {s}.ledger SELECT g FROM generate_series(1, 25) g;"
        ))
        .await
        .unwrap();

    let filter = SnapshotFilter::only_tables(["ledger"])
        .with_functions(false)
        .with_row_counts(RowCounts::Estimated);
    let reader = SchemaCatalogReader::new(&client);

    let before = reader.snapshot(&s, &filter).await.unwrap();
    assert_eq!(before.table("ledger").unwrap().row_count, None);

    client
        .batch_execute(&format!("ANALYZE {s}.ledger;"))
        .await
        .unwrap();
    let after = reader.snapshot(&s, &filter).await.unwrap();
    assert_eq!(after.table("ledger").unwrap().row_count, Some(25));
}

#[tokio::test]
async fn commit_inside_a_unit_escapes_rollback() {
    let Some(db) = start_postgres().await else {
        return;
    };
    let s = db.fresh_schema("self_commit_run").await;

    let units = vec![MigrationUnit::new(
        "001_self_commit.sql",
        format!(
            "CREATE TABLE {s}.early (id int);\n\
             COMMIT;\n\
             CREATE TABLE {s}.late (id int REFERENCES {s}.nowhere(id));"
        ),
    )];
    let spec = ExpectedSchemaSpec::builder()
        .schema(&s)
        .tables(["early", "late"])
        .build()
        .unwrap();

    let outcome = MigrationOrchestrator::new(db.connector())
        .run(&units, &spec)
        .await;
    assert_eq!(outcome.results[0].status, ExecutionStatus::RolledBack);

    // Everything before the unit's own COMMIT stays applied.
    let report = outcome.report().unwrap();
    assert!(report.table("early").unwrap().status.is_present());
    assert_eq!(report.table("late").unwrap().status, TableStatus::Missing);
}
