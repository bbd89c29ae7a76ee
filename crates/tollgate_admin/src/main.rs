use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tollgate_client::validity::ValidityChecker;
use tollgate_client::{HttpAuthority, Licensing, LicensingOptions, SiteConfig};
use tollgate_core::crypto::{
    decode_unverified, generate_keypair, generate_signed_key, private_key_from_pem,
    private_key_to_pem, public_key_to_pem,
};
use tollgate_core::{BasicFeature, LicenseInfo, Plan, SqliteStore};

#[derive(Parser)]
#[command(name = "tollgate-admin", about = "Tollgate license administration tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an RSA keypair for license signing
    Keygen {
        /// Key size in bits
        #[arg(long, default_value = "2048")]
        bits: usize,
        /// Output directory for key files
        #[arg(long, default_value = ".")]
        output_dir: String,
    },

    /// Generate a signed license key and print it to stdout
    Generate {
        /// Path to private key PEM file
        #[arg(long, env = "TOLLGATE_PRIVATE_KEY", default_value = "private.pem")]
        private_key: String,
        /// Comma-separated tags (plans, features, true-up)
        #[arg(long, default_value = "")]
        tags: String,
        /// Plan name, added as a plan: tag
        #[arg(long)]
        plan: Option<String>,
        /// Licensed user count (0 = unlimited)
        #[arg(long)]
        users: u32,
        /// Expiry date (YYYY-MM-DD)
        #[arg(long, group = "expiry")]
        expires: Option<String>,
        /// Days until expiry (alternative to --expires)
        #[arg(long, group = "expiry")]
        days: Option<i64>,
        /// Billing subscription id
        #[arg(long)]
        subscription_id: Option<String>,
        /// Billing opportunity id
        #[arg(long)]
        opportunity_id: Option<String>,
    },

    /// Read a license key from stdin and print its payload without verifying it
    Read,

    /// Show the entitlements and stored state of a site
    Status {
        /// Site configuration JSON file
        #[arg(long, env = "TOLLGATE_SITE_CONFIG", default_value = "site.json")]
        config: String,
        /// Path to SQLite state database
        #[arg(long, env = "TOLLGATE_DB", default_value = "tollgate.db")]
        db: String,
    },

    /// Run one license validity check against the licensing authority
    Check {
        /// Site configuration JSON file
        #[arg(long, env = "TOLLGATE_SITE_CONFIG", default_value = "site.json")]
        config: String,
        /// Path to SQLite state database
        #[arg(long, env = "TOLLGATE_DB", default_value = "tollgate.db")]
        db: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { bits, output_dir } => cmd_keygen(bits, &output_dir),
        Commands::Generate {
            private_key,
            tags,
            plan,
            users,
            expires,
            days,
            subscription_id,
            opportunity_id,
        } => {
            let mut tags = parse_tags(&tags);
            if let Some(plan) = plan {
                let plan = Plan::from_name(&plan)
                    .with_context(|| format!("Unknown plan: {}", plan))?;
                tags.push(plan.tag());
            }
            let mut info = LicenseInfo::new(tags, users, expiry_from(expires, days, Utc::now())?);
            info.subscription_id = subscription_id;
            info.opportunity_id = opportunity_id;
            cmd_generate(&private_key, &info)
        }
        Commands::Read => cmd_read(),
        Commands::Status { config, db } => cmd_status(&config, &db),
        Commands::Check { config, db } => cmd_check(&config, &db),
    }
}

fn cmd_keygen(bits: usize, output_dir: &str) -> Result<()> {
    println!("Generating {}-bit RSA keypair...", bits);
    let (private, public) = generate_keypair(bits)?;

    let priv_path = format!("{}/private.pem", output_dir);
    let pub_path = format!("{}/public.pem", output_dir);

    std::fs::create_dir_all(output_dir)?;
    std::fs::write(&priv_path, private_key_to_pem(&private)?)
        .with_context(|| format!("Failed to write {}", priv_path))?;
    std::fs::write(&pub_path, public_key_to_pem(&public)?)
        .with_context(|| format!("Failed to write {}", pub_path))?;

    println!("Private key: {}", priv_path);
    println!("Public key:  {}", pub_path);
    println!();
    println!("IMPORTANT: Keep private.pem secure! Only distribute public.pem.");
    Ok(())
}

fn cmd_generate(private_key_path: &str, info: &LicenseInfo) -> Result<()> {
    let key = generate_key(private_key_path, info)?;
    log::info!("generated {}", info);
    println!("{}", key);
    Ok(())
}

fn cmd_read() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read license key from stdin")?;
    println!("{}", render_payload(&input)?);
    Ok(())
}

fn cmd_status(config_path: &str, db_path: &str) -> Result<()> {
    let licensing = open_licensing(config_path, db_path)?;

    let Some(license) = licensing.configured_license()? else {
        println!("No license configured.");
        println!("  Max users: {}", tollgate_client::NO_LICENSE_MAXIMUM_ALLOWED_USER_COUNT);
        return Ok(());
    };
    let info = &license.info;
    let plan = info.plan();

    println!("License:    {}", info);
    println!("  Plan:       {} ({})", plan.details().title, plan);
    println!(
        "  Users:      {}",
        if info.user_count == 0 {
            "unlimited".to_string()
        } else {
            info.user_count.to_string()
        }
    );
    println!(
        "  Expires:    {}{}",
        info.expires_at.format("%Y-%m-%d"),
        if info.is_expired() { " (EXPIRED)" } else { "" }
    );
    println!("  Features:   {}", enabled_features(&licensing).join(", "));
    println!("  Batch changes:        {}", licensing.batch_changes()?);
    println!("  Private repositories: {}", licensing.private_repositories()?);
    println!(
        "  Valid:      {}",
        if licensing.is_license_valid()? { "yes" } else { "NO" }
    );
    println!(
        "  Last check: {}",
        licensing
            .last_validity_check()?
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "  Max users:  {}{}",
        licensing.actual_user_count()?,
        licensing
            .actual_user_count_date()?
            .map(|t| format!(" (reached {})", t.format("%Y-%m-%d")))
            .unwrap_or_default()
    );
    Ok(())
}

fn cmd_check(config_path: &str, db_path: &str) -> Result<()> {
    let licensing = open_licensing(config_path, db_path)?;
    let authority = Arc::new(HttpAuthority::from_options(licensing.options())?);
    let checker = ValidityChecker::new(Arc::clone(&licensing), authority);

    if let Some(key_text) = licensing.site_config().license_key() {
        checker.first_check_delay(key_text, licensing.options().check_interval)?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let outcome = runtime
        .block_on(checker.run_once())
        .context("License validity check failed; stored verdict unchanged")?;
    println!("{:?}", outcome);
    Ok(())
}

fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Expiry from an explicit date (end of day UTC) or a day count; a year out
/// when neither is given.
fn expiry_from(
    expires: Option<String>,
    days: Option<i64>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match (expires, days) {
        (Some(date_str), _) => {
            let date = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d")
                .with_context(|| format!("Invalid date format: {}. Use YYYY-MM-DD.", date_str))?;
            let end_of_day = date
                .and_hms_opt(23, 59, 59)
                .with_context(|| format!("Invalid date: {}", date_str))?;
            Ok(end_of_day.and_utc())
        }
        (_, Some(d)) if d <= 0 => bail!("--days must be positive, got {}", d),
        (_, Some(d)) => Ok(now + Duration::days(d)),
        _ => Ok(now + Duration::days(365)),
    }
}

fn generate_key(private_key_path: &str, info: &LicenseInfo) -> Result<String> {
    let priv_pem = std::fs::read_to_string(private_key_path)
        .with_context(|| format!("Failed to read private key from {}", private_key_path))?;
    let private_key = private_key_from_pem(&priv_pem)?;
    Ok(generate_signed_key(info, &private_key)?)
}

fn render_payload(key: &str) -> Result<String> {
    let key = key.trim();
    if key.is_empty() {
        bail!("No license key on stdin");
    }
    let info = decode_unverified(key).context("Failed to decode license key")?;
    Ok(serde_json::to_string_pretty(&info)?)
}

fn open_licensing(config_path: &str, db_path: &str) -> Result<Arc<Licensing>> {
    let config = if Path::new(config_path).exists() {
        SiteConfig::from_json_file(config_path)
            .with_context(|| format!("Failed to read site config {}", config_path))?
    } else {
        log::warn!("site config {} not found, assuming no license", config_path);
        SiteConfig::default()
    };
    let (_tx, rx) = tollgate_client::config_channel(config);
    let store = SqliteStore::open(db_path)
        .with_context(|| format!("Failed to open state database {}", db_path))?;
    let licensing = Licensing::new(rx, Arc::new(store), LicensingOptions::from_env())?;
    Ok(Arc::new(licensing))
}

fn enabled_features(licensing: &Licensing) -> Vec<&'static str> {
    BasicFeature::ALL
        .into_iter()
        .filter(|f| licensing.check(*f).is_ok())
        .map(|f| f.as_str())
        .collect()
}
