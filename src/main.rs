mod config;
mod db;
mod engine;
mod error;
mod logger;
mod models;
mod recommend;
mod scoring;
mod server;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use config::Config;
use db::Database;
use models::{CompanyProfile, MatchDecision, MaterialKind, NewMaterial, OrganizationType};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "symbiosis")]
#[command(about = "Industrial symbiosis marketplace - list waste, find consumers, score matches")]
struct Cli {
    /// Path to config file (defaults to the per-user config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage companies
    Company {
        #[command(subcommand)]
        command: CompanyCommands,
    },

    /// Manage company profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Manage material listings
    Material {
        #[command(subcommand)]
        command: MaterialCommands,
    },

    /// Find and decide matches
    Match {
        #[command(subcommand)]
        command: MatchCommands,
    },

    /// Compute compatibility scores
    Score {
        #[command(subcommand)]
        command: ScoreCommands,
    },

    /// Ask the match engine for a recommendation for a company
    Recommend {
        /// Company ID
        company_id: i64,
    },

    /// List stored recommendations for a company
    Recommendations {
        /// Company ID
        company_id: i64,
    },

    /// Run the HTTP match endpoint
    Serve {
        /// Interface to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum CompanyCommands {
    /// Register a company
    Add {
        /// Company name
        name: String,

        /// Contact email
        email: String,
    },

    /// List companies
    List {
        /// Match name, organization type or materials of interest
        #[arg(short, long)]
        search: Option<String>,
    },

    /// Show company details, profile and listings
    Show {
        /// Company ID
        id: i64,
    },

    /// Switch a company between user and admin
    ToggleRole {
        /// Company ID
        id: i64,

        /// Acting company; must be an admin when given
        #[arg(long)]
        by: Option<i64>,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Create or replace a company profile
    Set {
        /// Company ID
        company_id: i64,

        /// Contact role label
        #[arg(long)]
        role: Option<String>,

        /// Location (free text)
        #[arg(short, long)]
        location: Option<String>,

        /// Organization type (manufacturing, research, recycling, waste_management, consulting, investment)
        #[arg(short, long)]
        org_type: Option<OrganizationType>,

        /// Comma-separated materials of interest
        #[arg(short, long)]
        interests: Option<String>,

        /// Sustainability goals
        #[arg(short, long)]
        goals: Option<String>,
    },

    /// Show a company profile
    Show {
        /// Company ID
        company_id: i64,
    },
}

#[derive(Subcommand)]
enum MaterialCommands {
    /// List a waste stream or a material requirement
    Add {
        /// Owning company ID
        company_id: i64,

        /// Material name
        name: String,

        /// Quantity (non-negative)
        quantity: f64,

        /// Unit (free text)
        unit: String,

        /// Listing type (waste, requirement)
        #[arg(short, long, default_value = "waste")]
        kind: MaterialKind,

        /// Description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// List materials
    List {
        /// Filter by owning company
        #[arg(long)]
        company: Option<i64>,

        /// Filter by type (waste, requirement)
        #[arg(short, long)]
        kind: Option<MaterialKind>,

        /// Match material name, description or company name
        #[arg(short, long)]
        search: Option<String>,
    },

    /// Show material details
    Show {
        /// Material ID
        id: i64,
    },

    /// Delete a material listing (and its matches)
    Delete {
        /// Material ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum MatchCommands {
    /// Match a waste listing against other companies' requirements
    Find {
        /// Waste material ID
        waste_id: i64,

        /// Minimum score in 0..=1 (overrides config)
        #[arg(short, long)]
        min_score: Option<f64>,
    },

    /// List matches where the company supplies or consumes
    List {
        /// Company ID
        company_id: i64,
    },

    /// Accept a pending match
    Accept {
        /// Match ID
        id: i64,
    },

    /// Reject a pending match
    Reject {
        /// Match ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum ScoreCommands {
    /// Organization compatibility between two companies (0-100)
    Companies {
        /// First company ID
        a: i64,

        /// Second company ID
        b: i64,
    },

    /// Material pair score between two listings (60-100)
    Materials {
        /// First material ID
        a: i64,

        /// Second material ID
        b: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose, cli.json_logs);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Serve { host, port } => {
            let mut server_config = config.server.clone();
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }
            let engine = engine::create_engine(&config.engine)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::run(&server_config, engine))?;
        }

        Commands::Init => {
            let db = open_database(&config)?;
            db.init()?;
            if let Some(path) = db.path() {
                println!("Database initialized at {}", path.display());
            }
        }

        Commands::Company { command } => {
            let db = open_database(&config)?;
            db.ensure_initialized()?;
            run_company(&db, command)?;
        }

        Commands::Profile { command } => {
            let db = open_database(&config)?;
            db.ensure_initialized()?;
            run_profile(&db, command)?;
        }

        Commands::Material { command } => {
            let db = open_database(&config)?;
            db.ensure_initialized()?;
            run_material(&db, command)?;
        }

        Commands::Match { command } => {
            let db = open_database(&config)?;
            db.ensure_initialized()?;
            run_match(&db, &config, command)?;
        }

        Commands::Score { command } => {
            let db = open_database(&config)?;
            db.ensure_initialized()?;
            run_score(&db, command)?;
        }

        Commands::Recommend { company_id } => {
            let db = open_database(&config)?;
            db.ensure_initialized()?;
            let engine = engine::create_engine(&config.engine)?;
            let runtime = tokio::runtime::Runtime::new()?;
            let recs = runtime.block_on(recommend::generate(&db, engine.as_ref(), company_id))?;
            if recs.is_empty() {
                println!("No recommendation available (see log for engine errors).");
            } else {
                for rec in recs {
                    println!("Recommendation #{} - {}", rec.id, rec.title);
                    println!("  {}", rec.description);
                    println!("  Confidence: {:.1}%", rec.confidence);
                }
            }
        }

        Commands::Recommendations { company_id } => {
            let db = open_database(&config)?;
            db.ensure_initialized()?;
            let recs = db.list_recommendations(company_id)?;
            if recs.is_empty() {
                println!("No recommendations for company #{}.", company_id);
            } else {
                println!("{:<6} {:<10} {:>10} {:<40}", "ID", "STATUS", "CONFIDENCE", "DESCRIPTION");
                println!("{}", "-".repeat(70));
                for rec in recs {
                    println!(
                        "{:<6} {:<10} {:>9.1}% {:<40}",
                        rec.id,
                        rec.status,
                        rec.confidence,
                        truncate(&rec.description, 40)
                    );
                }
            }
        }
    }

    Ok(())
}

fn open_database(config: &Config) -> Result<Database> {
    let path = config.database_path();
    Database::open(&path).with_context(|| format!("Failed to open database at {}", path.display()))
}

fn run_company(db: &Database, command: CompanyCommands) -> Result<()> {
    match command {
        CompanyCommands::Add { name, email } => {
            let id = db.create_company(&name, &email)?;
            println!("Added company #{} ({})", id, name.trim());
        }

        CompanyCommands::List { search } => {
            let companies = db.list_companies(search.as_deref())?;
            if companies.is_empty() {
                println!("No companies found.");
            } else {
                println!("{:<6} {:<6} {:<28} {:<30}", "ID", "ROLE", "NAME", "EMAIL");
                println!("{}", "-".repeat(72));
                for company in companies {
                    println!(
                        "{:<6} {:<6} {:<28} {:<30}",
                        company.id,
                        company.role,
                        truncate(&company.name, 26),
                        truncate(&company.email, 28)
                    );
                }
            }
        }

        CompanyCommands::Show { id } => match db.get_company(id)? {
            Some(company) => {
                println!("Company #{}", company.id);
                println!("Name: {}", company.name);
                println!("Email: {}", company.email);
                println!("Role: {}", company.role);
                println!("Created: {}", company.created_at);
                if let Some(profile) = db.get_profile(id)? {
                    print_profile(&profile);
                }
                let materials = db.list_materials(Some(id), None, None)?;
                if !materials.is_empty() {
                    println!("\nMaterials ({}):", materials.len());
                    for m in materials {
                        println!(
                            "  #{} - {} ({} {}, {})",
                            m.id, m.material_name, m.quantity, m.unit, m.kind
                        );
                    }
                }
                let matches = db.list_matches_for_company(id)?;
                if !matches.is_empty() {
                    println!("\nMatches: {}", matches.len());
                }
            }
            None => {
                println!("Company #{} not found.", id);
            }
        },

        CompanyCommands::ToggleRole { id, by } => {
            if let Some(actor) = by {
                if !db.is_admin(actor)? {
                    return Err(anyhow!("Company #{} is not an admin", actor));
                }
            }
            let role = db.toggle_company_role(id)?;
            println!("Company #{} is now {}.", id, role);
        }
    }
    Ok(())
}

fn print_profile(profile: &CompanyProfile) {
    println!("\n--- Profile ---");
    if let Some(role) = &profile.role {
        println!("Contact role: {}", role);
    }
    if let Some(location) = &profile.location {
        println!("Location: {}", location);
    }
    if let Some(org) = profile.organization_type {
        println!("Organization type: {}", org);
    }
    if let Some(interests) = &profile.materials_of_interest {
        println!("Materials of interest: {}", interests);
    }
    if let Some(goals) = &profile.sustainability_goals {
        println!("Sustainability goals:");
        for line in textwrap::wrap(goals, 76) {
            println!("  {}", line);
        }
    }
}

fn run_profile(db: &Database, command: ProfileCommands) -> Result<()> {
    match command {
        ProfileCommands::Set {
            company_id,
            role,
            location,
            org_type,
            interests,
            goals,
        } => {
            let profile = CompanyProfile {
                company_id,
                role,
                location,
                organization_type: org_type,
                materials_of_interest: interests,
                sustainability_goals: goals,
            };
            db.upsert_profile(&profile)?;
            println!("Saved profile for company #{}.", company_id);
        }

        ProfileCommands::Show { company_id } => match db.get_profile(company_id)? {
            Some(profile) => print_profile(&profile),
            None => println!("Company #{} has no profile.", company_id),
        },
    }
    Ok(())
}

fn run_material(db: &Database, command: MaterialCommands) -> Result<()> {
    match command {
        MaterialCommands::Add {
            company_id,
            name,
            quantity,
            unit,
            kind,
            description,
        } => {
            let id = db.add_material(&NewMaterial {
                company_id,
                material_name: name,
                quantity,
                unit,
                kind,
                description,
            })?;
            println!("Added {} listing #{}", kind, id);
        }

        MaterialCommands::List {
            company,
            kind,
            search,
        } => {
            let materials = db.list_materials(company, kind, search.as_deref())?;
            if materials.is_empty() {
                println!("No materials found.");
            } else {
                println!(
                    "{:<6} {:<12} {:<26} {:>12} {:<8} {:<20}",
                    "ID", "TYPE", "MATERIAL", "QUANTITY", "UNIT", "COMPANY"
                );
                println!("{}", "-".repeat(88));
                for m in materials {
                    println!(
                        "{:<6} {:<12} {:<26} {:>12} {:<8} {:<20}",
                        m.id,
                        m.kind,
                        truncate(&m.material_name, 24),
                        m.quantity,
                        truncate(&m.unit, 8),
                        truncate(&m.company_name.unwrap_or_default(), 18)
                    );
                }
            }
        }

        MaterialCommands::Show { id } => match db.get_material(id)? {
            Some(m) => {
                println!("Material #{}", m.id);
                println!("Name: {}", m.material_name);
                println!("Type: {}", m.kind);
                println!("Quantity: {} {}", m.quantity, m.unit);
                if let Some(company) = &m.company_name {
                    println!("Company: {} (#{})", company, m.company_id);
                }
                println!("Created: {}", m.created_at);
                if let Some(desc) = &m.description {
                    println!("\n--- Description ---");
                    for line in textwrap::wrap(desc, 78) {
                        println!("{}", line);
                    }
                }
            }
            None => {
                println!("Material #{} not found.", id);
            }
        },

        MaterialCommands::Delete { id } => {
            if db.delete_material(id)? {
                println!("Deleted material #{}.", id);
            } else {
                println!("Material #{} not found.", id);
            }
        }
    }
    Ok(())
}

fn run_match(db: &Database, config: &Config, command: MatchCommands) -> Result<()> {
    match command {
        MatchCommands::Find { waste_id, min_score } => {
            let min_score = min_score.unwrap_or(config.matching.min_score);
            if !(0.0..=1.0).contains(&min_score) {
                return Err(anyhow!("--min-score must be within 0..=1, got {}", min_score));
            }
            let created = db.find_material_matches(waste_id, min_score)?;
            if created.is_empty() {
                println!("No new matches for material #{}.", waste_id);
            } else {
                println!("Created {} match(es):", created.len());
                for m in created {
                    println!(
                        "  #{} -> {} ({:.0}%)",
                        m.id,
                        m.consumer_name.unwrap_or_else(|| format!("company #{}", m.consumer_id)),
                        m.score * 100.0
                    );
                }
            }
        }

        MatchCommands::List { company_id } => {
            let matches = db.list_matches_for_company(company_id)?;
            if matches.is_empty() {
                println!("No matches found yet.");
            } else {
                println!(
                    "{:<6} {:<10} {:>6} {:<22} {:<36}",
                    "ID", "STATUS", "SCORE", "MATERIAL", "SUPPLIER -> CONSUMER"
                );
                println!("{}", "-".repeat(84));
                for m in matches {
                    let parties = format!(
                        "{} -> {}",
                        m.supplier_name.unwrap_or_default(),
                        m.consumer_name.unwrap_or_default()
                    );
                    println!(
                        "{:<6} {:<10} {:>5.0}% {:<22} {:<36}",
                        m.id,
                        m.status,
                        m.score * 100.0,
                        truncate(&m.material_name.unwrap_or_default(), 20),
                        truncate(&parties, 36)
                    );
                }
            }
        }

        MatchCommands::Accept { id } => {
            let m = db.update_match_status(id, MatchDecision::Accept)?;
            println!("Match #{} {}.", m.id, m.status);
        }

        MatchCommands::Reject { id } => {
            let m = db.update_match_status(id, MatchDecision::Reject)?;
            println!("Match #{} {}.", m.id, m.status);
        }
    }
    Ok(())
}

fn run_score(db: &Database, command: ScoreCommands) -> Result<()> {
    match command {
        ScoreCommands::Companies { a, b } => {
            for id in [a, b] {
                if db.get_company(id)?.is_none() {
                    return Err(anyhow!("Company #{} not found", id));
                }
            }
            let profile = |id: i64| -> Result<CompanyProfile> {
                Ok(db.get_profile(id)?.unwrap_or(CompanyProfile {
                    company_id: id,
                    ..Default::default()
                }))
            };
            let score = scoring::compatibility_score(&profile(a)?, &profile(b)?);
            println!("Compatibility #{} -> #{}: {}/100", a, b, score);
        }

        ScoreCommands::Materials { a, b } => {
            let first = db
                .get_material(a)?
                .ok_or_else(|| anyhow!("Material #{} not found", a))?;
            let second = db
                .get_material(b)?
                .ok_or_else(|| anyhow!("Material #{} not found", b))?;
            let score = scoring::material_score(&first, &second);
            println!(
                "Material score '{}' vs '{}': {:.1}/100",
                first.material_name, second.material_name, score
            );
            println!(
                "Factors: {}",
                scoring::compatibility_factors(&first, &second).join(", ")
            );
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
