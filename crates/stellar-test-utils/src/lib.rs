//! Integration-test support for the stellar workspace.
//!
//! [`TestDb`] hands each test its own migrated scratch database on a
//! PostgreSQL server shared across the test binary, and [`fixtures`]
//! provides the recurring stellar entities (worker nodes, subdomain tasks,
//! take-over rules) so tests describe scenarios instead of row plumbing.
//!
//! The backing server comes from `STELLAR_TEST_PG_URL` when a CI setup
//! script already started one, and from a testcontainers instance
//! otherwise.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use stellar_db::pool::{default_migrations_path, run_migrations};

/// Where the shared server lives.
enum Backing {
    /// Externally managed server (CI); nothing to keep alive.
    External { base_url: String },
    /// Container started by this process, held so it stays up for the
    /// whole binary.
    Container {
        base_url: String,
        _handle: ContainerAsync<Postgres>,
    },
}

impl Backing {
    fn base_url(&self) -> &str {
        match self {
            Self::External { base_url } | Self::Container { base_url, .. } => base_url,
        }
    }
}

static SERVER: OnceCell<Backing> = OnceCell::const_new();

async fn server() -> &'static Backing {
    SERVER
        .get_or_init(|| async {
            if let Ok(base_url) = std::env::var("STELLAR_TEST_PG_URL") {
                return Backing::External { base_url };
            }

            let handle = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = handle.get_host().await.expect("container host");
            let port = handle
                .get_host_port_ipv4(5432)
                .await
                .expect("container port mapping");

            Backing::Container {
                base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _handle: handle,
            }
        })
        .await
}

/// Connect to the server's `postgres` database for create/drop statements.
async fn admin_pool(base_url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to the shared test server")
}

/// One test's private, migrated database.
///
/// Call [`TestDb::teardown`] at the end of the test; the scratch database
/// is dropped along with any connections still holding it open.
pub struct TestDb {
    pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a fresh scratch database and run the stellar migrations.
    pub async fn create() -> Self {
        let base_url = server().await.base_url();
        let name = format!("stellar_it_{}", Uuid::new_v4().simple());

        let admin = admin_pool(base_url).await;
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create scratch database {name}: {e}"));
        admin.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{base_url}/{name}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to scratch database {name}: {e}"));

        run_migrations(&pool, default_migrations_path())
            .await
            .expect("migrations should apply to a fresh database");

        Self { pool, name }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool and drop the scratch database. Stray connections
    /// (e.g. from coordinator tasks a test spawned) are terminated first.
    pub async fn teardown(self) {
        self.pool.close().await;

        let admin = admin_pool(server().await.base_url()).await;
        let _ = admin
            .execute(
                format!(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                     WHERE datname = '{}' AND pid <> pg_backend_pid()",
                    self.name
                )
                .as_str(),
            )
            .await;
        let _ = admin
            .execute(format!("DROP DATABASE IF EXISTS {}", self.name).as_str())
            .await;
        admin.close().await;
    }
}

/// Ready-made stellar entities for scenario tests.
pub mod fixtures {
    use chrono::Utc;
    use uuid::Uuid;

    use stellar_db::models::{NodeConfigDecl, NodeRole, TakeoverRule, TaskType};
    use stellar_db::queries::nodes::NewNode;
    use stellar_db::queries::tasks::NewTask;

    /// A worker in the `edge` pool with the subdomain-enum capability and
    /// the default declared limits.
    pub fn worker_node(name: &str) -> NewNode {
        NewNode {
            name: name.into(),
            address: "10.3.0.1".into(),
            port: 8441,
            role: NodeRole::Worker,
            tags: vec!["edge".into()],
            config: NodeConfigDecl::default(),
            api_secret: "test-secret".into(),
        }
    }

    /// A subdomain-enumeration task under a throwaway project.
    pub fn subdomain_task(name: &str) -> NewTask {
        NewTask::new(name, TaskType::SubdomainEnum, Uuid::new_v4())
    }

    /// A take-over fingerprint rule without a body pattern.
    pub fn takeover_rule(service: &str, cname_pattern: &str) -> TakeoverRule {
        TakeoverRule {
            id: Uuid::new_v4(),
            service: service.into(),
            cname_pattern: cname_pattern.into(),
            body_pattern: None,
            position: 0,
            created_at: Utc::now(),
        }
    }
}
