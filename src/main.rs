mod backfill;
mod config;
mod migrations;
mod objectstore;
mod promo;
mod upload;

use crate::config::{Command, Config, CMD_ARGS};
use crate::migrations::{PgTarget, MIGRATIONS};
use crate::upload::{UploadFailed, UploadJob};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;

pub type Error = Box<dyn std::error::Error + Send + Sync>; // This is constant and should be copy pasted

/// The main function is just a command handling function
#[tokio::main]
async fn main() {
    let _ = &*CMD_ARGS;

    let mut env_builder = env_logger::builder();

    env_builder
        .format(move |buf, record| {
            writeln!(
                buf,
                "({}) {} - {}",
                record.target(),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_default_env();

    env_builder.init();

    let res = match &CMD_ARGS.command {
        Command::Migrate { id, list } => migrate(id.as_deref(), *list).await,
        Command::UploadApk { file, bucket, key } => {
            upload_apk(file.as_deref(), bucket.as_deref(), key.as_deref()).await
        }
        Command::BackfillPromoCodes { dry_run } => backfill_promo_codes(*dry_run).await,
    };

    if let Err(e) = res {
        let mut lines = error_report(&e).into_iter();

        if let Some(headline) = lines.next() {
            error!("{}", headline);
        }

        for line in lines {
            println!("{}", line);
        }

        std::process::exit(1); // Clean exit with status code of 1
    }
}

/// Lines to show for a failed command, the first one is logged as the error
fn error_report(e: &Error) -> Vec<String> {
    let mut lines = vec![];

    if let Some(db_err) = e.downcast_ref::<sqlx::Error>() {
        lines.push(format!("Database error: {}", db_err));
    } else {
        lines.push(format!("Error: {}", e));
    }

    if let Some(failed) = e.downcast_ref::<UploadFailed>() {
        lines.push(String::new());
        lines.push(failed.instructions.clone());
    }

    lines
}

async fn migrate(id: Option<&str>, list: bool) -> Result<(), Error> {
    if list {
        for m in MIGRATIONS.iter() {
            println!("{} - {}", m.id, m.description);
        }
        return Ok(());
    }

    let selected = match id {
        Some(id) => vec![migrations::find(id)?],
        None => MIGRATIONS.iter().collect(),
    };

    let config = Config::load(&CMD_ARGS.config)?;

    info!("Connecting to database");
    let pool = config.database()?.connect().await?;
    info!("Connected to database");

    let target = PgTarget::new(pool.clone());

    for migration in selected {
        let verified = migrations::run(&target, migration).await?;

        match verified {
            Some(row) => {
                println!("Trigger verified!");
                println!("   Trigger Name: {}", row.trigger_name);
                println!("   Event: {}", row.event_manipulation);
                println!("   Action: {}...", row.action_preview());
            }
            None if migration.verify_trigger.is_some() => {
                warn!("{}: trigger not found after install", migration.id);
            }
            None => {}
        }

        info!("Migration {} complete", migration.id);
    }

    pool.close().await;

    Ok(())
}

async fn upload_apk(
    file: Option<&str>,
    bucket: Option<&str>,
    key: Option<&str>,
) -> Result<(), Error> {
    let config = Config::load(&CMD_ARGS.config)?;
    let settings = config.upload()?;
    let job = UploadJob::resolve(settings, file, bucket, key)?;

    info!(
        "Uploading {} to {}/{}",
        job.file_path.display(),
        job.bucket,
        job.object_key
    );

    let res = match config.object_storage().and_then(|s| s.build()) {
        Ok(store) => upload::upload_apk(&store, &job).await,
        Err(e) => Err(e),
    };

    let public_url = upload::with_fallback(res, settings.dashboard_url.as_deref(), &job)?;

    println!("Public URL: {}", public_url);

    if let Some(ref page) = settings.download_page {
        println!("Users can now download from: {}", page);
    }

    Ok(())
}

async fn backfill_promo_codes(dry_run: bool) -> Result<(), Error> {
    let config = Config::load(&CMD_ARGS.config)?;

    info!("Connecting to database");
    let pool = config.database()?.connect().await?;

    let store = backfill::PgVendorStore::new(pool.clone());
    let mut rng = StdRng::from_os_rng();

    let report = backfill::backfill(&store, &mut rng, dry_run).await?;

    pool.close().await;

    for (id, name, code) in &report.assigned {
        println!("{}  {}  {}", code, id, name);
    }

    info!(
        "{} of {} vendors had a promo code, {} {}, {} failed",
        report.existing,
        report.total,
        report.assigned.len(),
        if dry_run { "would be assigned" } else { "assigned" },
        report.failed
    );

    if !report.still_missing.is_empty() {
        warn!(
            "{} vendors still have no promo code:",
            report.still_missing.len()
        );

        for (id, name) in &report.still_missing {
            println!("   {}  {}", id, name);
        }
    }

    if report.failed > 0 {
        return Err(format!("{} vendor updates failed", report.failed).into());
    }

    Ok(())
}
