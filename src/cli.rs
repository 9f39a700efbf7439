use crate::config::FixtureConfig;
use crate::engine::RcgenEngine;
use crate::error::{Error, Result};
use crate::hierarchy::{provision, Outcome, ProvisionReport};
use crate::inspect::{display_certificate_chain, parse_chain, parse_crl_pem, verify_store, OutputFormat};
use crate::ledger::{format_serial, format_time, Ledger};
use crate::store::ArtifactStore;
use crate::types::CaLevel;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pki-fixtures")]
#[command(version, about = "Provision a disposable test PKI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Create or refresh the fixture PKI")]
    Provision {
        #[arg(short, long, default_value = "pki-fixtures.toml", help = "Configuration file")]
        config: PathBuf,

        #[arg(short, long, help = "Override the store directory")]
        base_dir: Option<PathBuf>,

        #[arg(long, help = "Regenerate every private key (implies --force-new-certs)")]
        force_new_keys: bool,

        #[arg(long, help = "Regenerate every certificate, ledger and CRL")]
        force_new_certs: bool,

        #[arg(short, long, default_value = "pretty", help = "Output format: pretty, json")]
        format: String,
    },

    #[command(about = "Print the issuance ledger of a CA")]
    Ledger {
        #[arg(long, default_value = "intermediate", help = "CA level: root, intermediate")]
        ca: String,

        #[arg(short, long, default_value = "pki-fixtures.toml", help = "Configuration file")]
        config: PathBuf,

        #[arg(short, long, help = "Override the store directory")]
        base_dir: Option<PathBuf>,

        #[arg(short, long, default_value = "pretty", help = "Output format: pretty, json")]
        format: String,
    },

    #[command(about = "Show a certificate, chain or CRL")]
    Inspect {
        #[arg(help = "PEM file")]
        path: PathBuf,

        #[arg(short, long, default_value = "pretty", help = "Output format: pretty, json")]
        format: String,
    },

    #[command(about = "Check signatures, chain and CRLs of a provisioned store")]
    Verify {
        #[arg(short, long, default_value = "pki-fixtures.toml", help = "Configuration file")]
        config: PathBuf,

        #[arg(short, long, help = "Override the store directory")]
        base_dir: Option<PathBuf>,
    },

    #[command(about = "Print the default configuration")]
    Config,
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Provision {
            config,
            base_dir,
            force_new_keys,
            force_new_certs,
            format,
        } => {
            let mut config = load_config(&config, base_dir)?;
            if force_new_keys {
                config.force.new_keys = true;
                config.force.new_certs = true;
            }
            if force_new_certs {
                config.force.new_certs = true;
            }
            let output_format = format.parse::<OutputFormat>()?;

            let engine = RcgenEngine::from(&config);
            let report = provision(&engine, &config)?;

            match output_format {
                OutputFormat::Pretty => print_report(&config, &report),
                #[cfg(feature = "json")]
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }

        Commands::Ledger {
            ca,
            config,
            base_dir,
            format,
        } => {
            let config = load_config(&config, base_dir)?;
            let level = ca.parse::<CaLevel>()?;
            let output_format = format.parse::<OutputFormat>()?;
            let index_path = ArtifactStore::new(&config.base_dir).ca(level).index_path();
            let ledger = Ledger::parse(&std::fs::read_to_string(&index_path)?)?;

            match output_format {
                OutputFormat::Pretty => print_ledger(level, &ledger),
                #[cfg(feature = "json")]
                OutputFormat::Json => {
                    let rows: Vec<serde_json::Value> = ledger
                        .entries()
                        .iter()
                        .map(|e| {
                            serde_json::json!({
                                "status": e.status.to_string(),
                                "serial": e.serial_hex(),
                                "expires_at": e.expires_at,
                                "revoked_at": e.revocation.map(|r| r.at),
                                "reason": e.revocation.and_then(|r| r.reason).map(|r| r.to_string()),
                                "subject": e.subject,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }

        Commands::Inspect { path, format } => {
            let output_format = format.parse::<OutputFormat>()?;
            let text = std::fs::read_to_string(&path)?;

            if text.contains("-----BEGIN X509 CRL-----") {
                let crl = parse_crl_pem(&text)?;
                match output_format {
                    OutputFormat::Pretty => {
                        println!("{}", "Certificate Revocation List".bold().cyan());
                        println!("{}", "=".repeat(80));
                        println!("  {}: {}", "Issuer".bold().yellow(), crl.issuer);
                        if let Some(number) = crl.crl_number {
                            println!("  {}: {}", "CRL Number".bold().yellow(), format_serial(number));
                        }
                        println!(
                            "  {}: {}",
                            "This Update".bold().yellow(),
                            crl.this_update.to_rfc3339().dimmed()
                        );
                        if let Some(next) = crl.next_update {
                            println!(
                                "  {}: {}",
                                "Next Update".bold().yellow(),
                                next.to_rfc3339().dimmed()
                            );
                        }
                        println!("  {}: {}", "Revoked".bold().yellow(), crl.revoked.len());
                        for entry in &crl.revoked {
                            println!(
                                "    - {} at {}{}",
                                format_serial(entry.serial).red(),
                                entry.revoked_at.to_rfc3339(),
                                entry
                                    .reason_code
                                    .map(|code| format!(" (reason {})", code))
                                    .unwrap_or_default()
                            );
                        }
                    }
                    #[cfg(feature = "json")]
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&crl)?),
                }
            } else {
                let chain = parse_chain(&text)?;
                println!("{}", display_certificate_chain(&chain, output_format)?);
            }
        }

        Commands::Verify { config, base_dir } => {
            let config = load_config(&config, base_dir)?;
            let store = ArtifactStore::new(&config.base_dir);

            println!(
                "{}",
                format!("Verifying {}...", store.base().display()).cyan()
            );
            for check in verify_store(&store)? {
                println!("  {} {}", "ok".green().bold(), check);
            }
            println!("{}", "Fixture PKI is consistent.".green().bold());
        }

        Commands::Config => {
            print!("{}", FixtureConfig::default().to_toml()?);
        }
    }

    Ok(())
}

fn load_config(path: &std::path::Path, base_dir: Option<PathBuf>) -> Result<FixtureConfig> {
    let mut config = FixtureConfig::load(path)?;
    config.apply_env();
    if let Some(dir) = base_dir {
        config.base_dir = dir;
    }
    if config.base_dir.as_os_str().is_empty() {
        return Err(Error::Config("base_dir must not be empty".to_string()));
    }
    Ok(config)
}

fn print_report(config: &FixtureConfig, report: &ProvisionReport) {
    if report.is_noop() {
        println!("{}", "Fixture PKI is up to date.".green().bold());
    } else {
        println!("{}", "Fixture PKI provisioned successfully!".green().bold());
    }
    println!("  {}: {}", "Store".cyan(), config.base_dir.display());

    for step in &report.steps {
        let outcome = match step.outcome {
            Outcome::Produced => "produced".green(),
            Outcome::Reused => "reused".dimmed(),
        };
        let serial = step
            .serial
            .as_ref()
            .map(|s| format!(" [{}]", s))
            .unwrap_or_default();
        println!(
            "  {:<26} {:<9}{} {}",
            step.artifact.cyan(),
            outcome,
            serial.yellow(),
            step.path.display().to_string().dimmed()
        );
    }

    if let Some(serial) = report.revoked_serial {
        println!(
            "  {}: {} as of {}",
            "Revoked".red(),
            format_serial(serial),
            config.revocation.at.to_rfc3339()
        );
    }
}

fn print_ledger(level: CaLevel, ledger: &Ledger) {
    println!(
        "{} {}",
        "Issuance ledger".bold().cyan(),
        format!("({})", level).dimmed()
    );
    println!("{}", "=".repeat(80));
    for entry in ledger.entries() {
        let status = match entry.status {
            crate::ledger::EntryStatus::Valid => entry.status.to_string().green(),
            _ => entry.status.to_string().red(),
        };
        let revoked = entry
            .revocation
            .map(|r| format!(" revoked {}", format_time(&r.at)))
            .unwrap_or_default();
        println!(
            "  {:<6} {:<8} expires {}{}  {}",
            entry.serial_hex().yellow(),
            status,
            format_time(&entry.expires_at),
            revoked,
            entry.subject
        );
    }
    println!("{}", "=".repeat(80));
    println!("{}: {}", "Total Entries".bold().cyan(), ledger.len());
}
