mod promo_code_trigger;

use log::{info, warn};

use crate::Error;

/// One statement of a migration, committed on its own
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub description: &'static str,
    pub sql: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub id: &'static str,
    pub description: &'static str,
    pub steps: &'static [Step],
    /// Query returning the installed trigger, run after the last step
    pub verify_trigger: Option<&'static str>,
    /// Known problems in the SQL, logged before it is run
    pub caveats: &'static [&'static str],
}

pub static MIGRATIONS: [Migration; 1] = [promo_code_trigger::MIGRATION];

pub fn find(id: &str) -> Result<&'static Migration, Error> {
    MIGRATIONS
        .iter()
        .find(|m| m.id == id)
        .ok_or_else(|| format!("Unknown migration: {}", id).into())
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TriggerRow {
    pub trigger_name: String,
    pub event_manipulation: String,
    pub action_statement: String,
}

impl TriggerRow {
    /// Action statement cut to 50 characters for display
    pub fn action_preview(&self) -> String {
        self.action_statement.chars().take(50).collect()
    }
}

/// Where migration statements are sent
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Executes and commits a single statement
    async fn execute(&self, sql: &str) -> Result<(), Error>;

    async fn fetch_trigger(&self, sql: &str) -> Result<Option<TriggerRow>, Error>;
}

pub struct PgTarget {
    pool: sqlx::PgPool,
}

impl PgTarget {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MigrationTarget for PgTarget {
    async fn execute(&self, sql: &str) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        // Simple query protocol, function bodies contain `$$` and no binds are needed
        let conn: &mut sqlx::PgConnection = &mut tx;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;

        tx.commit().await?;

        Ok(())
    }

    async fn fetch_trigger(&self, sql: &str) -> Result<Option<TriggerRow>, Error> {
        let row = sqlx::query_as::<_, TriggerRow>(sql)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }
}

/// Runs every step of `migration` in order, stopping at the first failure
///
/// Steps committed before a failure stay committed.
pub async fn run(
    target: &dyn MigrationTarget,
    migration: &Migration,
) -> Result<Option<TriggerRow>, Error> {
    info!("Running migration {}: {}", migration.id, migration.description);

    for caveat in migration.caveats {
        warn!("{}: {}", migration.id, caveat);
    }

    let total = migration.steps.len();
    for (i, step) in migration.steps.iter().enumerate() {
        info!("Step {}/{}: {}...", i + 1, total, step.description);
        target.execute(step.sql).await?;
        info!("Step {}/{} done", i + 1, total);
    }

    let Some(verify) = migration.verify_trigger else {
        return Ok(None);
    };

    info!("Verifying trigger...");
    target.fetch_trigger(verify).await
}
