use log::{error, info};
use rand::Rng;
use uuid::Uuid;

use crate::promo::PromoCodeSet;
use crate::Error;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VendorRow {
    pub id: Uuid,
    pub business_name: Option<String>,
    pub owner_name: Option<String>,
    pub promo_code: Option<String>,
}

fn non_blank(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl VendorRow {
    pub fn has_promo_code(&self) -> bool {
        non_blank(&self.promo_code).is_some()
    }

    /// Name the promo code is derived from
    pub fn code_source(&self) -> String {
        non_blank(&self.business_name)
            .or_else(|| non_blank(&self.owner_name))
            .map(str::to_string)
            .unwrap_or_else(|| format!("VENDOR{}", self.id))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VendorStore: Send + Sync {
    /// All vendors, oldest first
    async fn list_vendors(&self) -> Result<Vec<VendorRow>, Error>;

    async fn set_promo_code(&self, id: Uuid, code: &str) -> Result<(), Error>;
}

pub struct PgVendorStore {
    pool: sqlx::PgPool,
}

impl PgVendorStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl VendorStore for PgVendorStore {
    async fn list_vendors(&self) -> Result<Vec<VendorRow>, Error> {
        let rows = sqlx::query_as::<_, VendorRow>(
            "SELECT id, business_name, owner_name, promo_code FROM vendors ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn set_promo_code(&self, id: Uuid, code: &str) -> Result<(), Error> {
        sqlx::query("UPDATE vendors SET promo_code = $1 WHERE id = $2")
            .bind(code)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub total: usize,
    pub existing: usize,
    /// Vendor id, name and the code given to it
    pub assigned: Vec<(Uuid, String, String)>,
    pub failed: usize,
    /// Vendor id and name of every vendor still without a code after the run
    pub still_missing: Vec<(Uuid, String)>,
}

/// Gives every vendor without a promo code a fresh one
///
/// A failed update is logged and counted, the remaining vendors are still processed.
pub async fn backfill<R: Rng + ?Sized>(
    store: &dyn VendorStore,
    rng: &mut R,
    dry_run: bool,
) -> Result<BackfillReport, Error> {
    info!("Fetching all vendors...");
    let vendors = store.list_vendors().await?;

    let mut codes = PromoCodeSet::default();
    for vendor in &vendors {
        if let Some(code) = &vendor.promo_code {
            codes.insert_existing(code);
        }
    }

    let mut report = BackfillReport {
        total: vendors.len(),
        existing: codes.len(),
        ..Default::default()
    };

    let missing: Vec<&VendorRow> = vendors.iter().filter(|v| !v.has_promo_code()).collect();
    info!(
        "{} vendors, {} existing promo codes, {} vendors without a promo code",
        report.total,
        report.existing,
        missing.len()
    );

    for vendor in missing {
        let name = vendor.code_source();
        let code = codes.next_for(&name, rng);

        if dry_run {
            info!("Would assign {} to {}", code, name);
        } else if let Err(e) = store.set_promo_code(vendor.id, &code).await {
            error!("Failed to update {} ({}): {}", name, vendor.id, e);
            report.failed += 1;
            continue;
        } else {
            info!("Assigned {} to {}", code, name);
        }

        report.assigned.push((vendor.id, name, code));
    }

    if !dry_run {
        info!("Checking for vendors still without a promo code...");
        report.still_missing = store
            .list_vendors()
            .await?
            .into_iter()
            .filter(|v| !v.has_promo_code())
            .map(|v| (v.id, v.code_source()))
            .collect();
    }

    Ok(report)
}
