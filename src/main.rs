use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use std::path::PathBuf;
use std::time::Instant;

use wildclean::config::{Config, IndexScope, LayoutConfig, MatchMode};
use wildclean::core::audit::audit_species;
use wildclean::core::history::{HistoryAction, read_history};
use wildclean::core::scanner::SpeciesPaths;
use wildclean::{CleanOptions, logging, run};

#[derive(Parser, Debug)]
#[command(
    name = "wildclean",
    version,
    about = "Clean, normalize and deduplicate scraped wildlife observation images"
)]
struct Cli {
    /// Config file (default: ./wildclean.toml, then the user config directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding `raw/` and `metadata/` (overrides the config layout)
    #[arg(long, global = true, value_name = "DIR")]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate, normalize and deduplicate species images and rewrite their tables
    Clean {
        /// Species to clean (default: the `species` list from the config)
        species: Vec<String>,
        /// Only report what would change
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Decode and fingerprint images on all cores
        #[arg(long)]
        parallel: bool,
        /// Whether duplicates are detected across species or within each species
        #[arg(long, value_enum, value_name = "SCOPE")]
        index_scope: Option<ScopeArg>,
        /// Treat fingerprints within this Hamming distance as duplicates
        #[arg(long, value_name = "MAX_DISTANCE")]
        near_duplicates: Option<u32>,
        /// Print the per-species reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that tables and image directories agree (read-only)
    Audit {
        /// Species to audit (default: the `species` list from the config)
        species: Vec<String>,
        /// Print the audit reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the cleaning journal of a species
    History {
        species: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ScopeArg {
    Global,
    PerSpecies,
}

impl From<ScopeArg> for IndexScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Global => IndexScope::Global,
            ScopeArg::PerSpecies => IndexScope::PerSpecies,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("info");

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(root) = &cli.data_root {
        config.layout = LayoutConfig {
            metadata_file: config.layout.metadata_file.clone(),
            ..LayoutConfig::rooted_at(root)
        };
    }

    match cli.command {
        Commands::Clean {
            species,
            dry_run,
            yes,
            parallel,
            index_scope,
            near_duplicates,
            json,
        } => {
            if parallel {
                config.parallel = true;
            }
            if let Some(scope) = index_scope {
                config.dedup.scope = scope.into();
            }
            if let Some(max_distance) = near_duplicates {
                config.dedup.mode = MatchMode::Near;
                config.dedup.max_distance = max_distance;
            }
            let species = species_or_default(species, &config)?;

            if !dry_run && !yes {
                let proceed = Confirm::new()
                    .with_prompt(format!(
                        "Permanently delete invalid and duplicate images and rewrite {} metadata table(s)?",
                        species.len()
                    ))
                    .default(false)
                    .interact()
                    .context("Confirmation prompt failed; pass --yes to skip it")?;
                if !proceed {
                    println!("Aborted; nothing was changed.");
                    return Ok(());
                }
            }

            let options = CleanOptions {
                dry_run,
                show_progress: !json,
            };
            let start = Instant::now();
            let summary = run(&config, &species, options);

            if json {
                println!("{}", serde_json::to_string_pretty(&summary.reports)?);
            } else {
                for report in &summary.reports {
                    println!(
                        "✅ Cleaned {}: {} valid entries retained ({} missing, {} corrupt, {} below {}x{}, {} duplicates, {} shared, {} normalized)",
                        report.species,
                        report.kept,
                        report.missing,
                        report.corrupt,
                        report.sub_resolution,
                        config.validation.min_width,
                        config.validation.min_height,
                        report.duplicates,
                        report.shared_files,
                        report.normalized,
                    );
                }
                if dry_run {
                    println!("\n⚠️  Dry-run only; no files were changed.");
                }
                println!(
                    "⏱ {} species, {} entries retained, took {:.2?}",
                    summary.reports.len(),
                    summary.total_kept(),
                    start.elapsed()
                );
            }

            if !summary.failures.is_empty() {
                for (name, err) in &summary.failures {
                    eprintln!("❌ {}: {}", name, err);
                }
                anyhow::bail!("{} species failed to clean", summary.failures.len());
            }
        }

        Commands::Audit { species, json } => {
            let species = species_or_default(species, &config)?;
            let mut reports = Vec::new();
            for name in &species {
                let paths = SpeciesPaths::resolve(&config.layout, name);
                let report = audit_species(&paths)
                    .with_context(|| format!("Failed to audit {}", name))?;
                reports.push(report);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    if report.is_consistent() {
                        println!("✅ {}: {} rows, consistent", report.species, report.rows);
                        continue;
                    }
                    println!("⚠️  {}: {} rows", report.species, report.rows);
                    for (id, file) in &report.missing_files {
                        println!("   missing file   {} → {}", id, file);
                    }
                    for file in &report.shared_files {
                        println!("   shared file    {}", file);
                    }
                    for id in &report.repeated_ids {
                        println!("   repeated id    {}", id);
                    }
                    for path in &report.orphans {
                        println!("   unreferenced   {}", path.display());
                    }
                }
            }

            let inconsistent = reports.iter().filter(|r| !r.is_consistent()).count();
            if inconsistent > 0 {
                anyhow::bail!("{} species inconsistent", inconsistent);
            }
        }

        Commands::History { species } => {
            let paths = SpeciesPaths::resolve(&config.layout, &species);
            let records = read_history(&paths.metadata_dir)
                .with_context(|| format!("Could not read history for {}", paths.species))?;

            println!("🗂️  Cleaning history for {}:", paths.species);
            for (i, rec) in records.iter().enumerate() {
                let subject = match (&rec.occurrence_id, &rec.file) {
                    (Some(id), Some(file)) => format!("{} ({})", id, file),
                    (Some(id), None) => id.clone(),
                    (None, Some(file)) => file.clone(),
                    (None, None) => String::new(),
                };
                let what = match &rec.action {
                    HistoryAction::DeletedCorrupt { reason } => format!("deleted corrupt: {}", reason),
                    HistoryAction::DeletedSubResolution { width, height } => {
                        format!("deleted {}x{}", width, height)
                    }
                    HistoryAction::DeletedDuplicate { kept, distance } => {
                        format!("deleted duplicate of {} (distance {})", kept, distance)
                    }
                    HistoryAction::Normalized { to } => format!("normalized → {}", to),
                    HistoryAction::TableWritten { kept } => format!("table written, {} rows", kept),
                };
                println!(
                    "[{}] {} {} {}",
                    i,
                    rec.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    subject,
                    what
                );
            }
        }
    }

    Ok(())
}

fn species_or_default(species: Vec<String>, config: &Config) -> Result<Vec<String>> {
    if !species.is_empty() {
        return Ok(species);
    }
    if config.species.is_empty() {
        anyhow::bail!("No species given and none configured");
    }
    Ok(config.species.clone())
}
