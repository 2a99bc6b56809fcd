use std::env;

use anyhow::{anyhow, bail, Context, Result};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use docledger::{
    auth::password::hash_password,
    config::AppConfig,
    db,
    models::{DocumentVersion, NewUser},
    records::{integrity, Role},
    s3,
    schema::{document_versions, users},
    storage::{content_checksum, ObjectStorage},
};

const USAGE: &str = "Usage:
  maintenance migrate
  maintenance create-user <username> <password> <admin|editor|viewer>
  maintenance verify [--content]";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let outcome = match args.first().map(String::as_str) {
        Some("migrate") => migrate(),
        Some("create-user") => create_user(&args[1..]),
        Some("verify") => verify(args[1..].iter().any(|arg| arg == "--content")).await,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(2);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(err) => Err(err),
    }
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        "loaded configuration"
    );
    Ok(config)
}

fn migrate() -> Result<bool> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let applied = db::run_migrations(&mut conn)?;
    println!("Applied {applied} migration(s).");
    Ok(true)
}

fn create_user(args: &[String]) -> Result<bool> {
    let [username, password, role] = args else {
        bail!("create-user expects <username> <password> <role>\n{USAGE}");
    };
    let role = Role::parse(role)
        .ok_or_else(|| anyhow!("unknown role '{role}'; expected admin, editor or viewer"))?;
    let username = username.trim();
    if username.is_empty() {
        bail!("username must not be empty");
    }

    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let id = Uuid::new_v4();
    diesel::insert_into(users::table)
        .values(&NewUser {
            id,
            username: username.to_string(),
            password_hash: hash_password(password)?,
            role: role.as_str().to_string(),
        })
        .execute(&mut conn)
        .with_context(|| format!("failed to create user {username}"))?;

    tracing::info!(user_id = %id, username = %username, role = %role, "user created");
    println!("Created {role} user {username} ({id}).");
    Ok(true)
}

/// Prints the integrity report as JSON. Returns false when anything is off.
async fn verify(check_content: bool) -> Result<bool> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;

    let (report, versions) = {
        let mut conn = pool.get().context("failed to get database connection")?;
        let report = integrity::verify(&mut conn).context("integrity check failed")?;
        let versions: Vec<DocumentVersion> = if check_content {
            document_versions::table
                .order(document_versions::uploaded_at.asc())
                .load(&mut conn)
                .context("failed to load document versions")?
        } else {
            Vec::new()
        };
        (report, versions)
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    let mut clean = report.is_clean();

    if check_content {
        let storage = s3::build_storage(&config).await?;
        let mut mismatched = 0usize;
        for version in &versions {
            match storage.get_object(&version.s3_key).await {
                Ok(bytes) if content_checksum(&bytes) == version.checksum => {}
                Ok(_) => {
                    mismatched += 1;
                    eprintln!(
                        "checksum mismatch: version {} (document {}, v{})",
                        version.id, version.document_id, version.version_number
                    );
                }
                Err(err) => {
                    mismatched += 1;
                    eprintln!("missing content for version {}: {err}", version.id);
                }
            }
        }
        println!(
            "Checked content of {} version(s); {mismatched} problem(s).",
            versions.len()
        );
        clean &= mismatched == 0;
    }

    Ok(clean)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
