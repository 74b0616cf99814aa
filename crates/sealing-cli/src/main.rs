use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sealing_api::{CollectRequest, EraseReviewRequest, HydrateRequest, SealingApi};
use sealing_core::{ActorRef, CaseId, DateWindow, RecordCategory, RecordId, SealError, SealRequest};
use sealing_store_sqlite::{StoreOptions, DEFAULT_BUSY_TIMEOUT_MS};
use serde_json::Value;
use time::macros::format_description;
use time::Date;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sealctl")]
#[command(about = "Juvenile record sealing CLI")]
struct Cli {
    #[arg(long, env = "SEALING_DB", default_value = "./sealing.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "SEALING_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Case {
        #[command(subcommand)]
        command: Box<CaseCommand>,
    },
    Records {
        #[command(subcommand)]
        command: Box<RecordsCommand>,
    },
    Seal(SealArgs),
    Restore(TransitionArgs),
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    ExportLedger(DbExportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CaseCommand {
    Eligibility(EligibilityArgs),
    Records(CaseRecordsArgs),
    Review(ReviewArgs),
}

#[derive(Debug, Args)]
struct CaseArg {
    #[arg(long, value_parser = parse_case_id)]
    case_id: CaseId,
}

#[derive(Debug, Args)]
struct WindowArgs {
    #[arg(long, value_parser = parse_date, requires = "end")]
    start: Option<Date>,
    #[arg(long, value_parser = parse_date, requires = "start")]
    end: Option<Date>,
}

impl WindowArgs {
    fn window(&self) -> Result<Option<DateWindow>> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok(Some(domain(DateWindow::new(start, end))?)),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Args)]
struct EligibilityArgs {
    #[command(flatten)]
    case: CaseArg,
    #[arg(long, value_parser = parse_date)]
    as_of: Option<Date>,
}

#[derive(Debug, Args)]
struct CaseRecordsArgs {
    #[command(flatten)]
    case: CaseArg,
    #[arg(long, default_value_t = false)]
    before_eighteen_only: bool,
    #[command(flatten)]
    window: WindowArgs,
}

#[derive(Debug, Args)]
struct ReviewArgs {
    #[command(flatten)]
    case: CaseArg,
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long, value_parser = parse_date)]
    as_of: Option<Date>,
}

#[derive(Debug, Subcommand)]
enum RecordsCommand {
    Hydrate(HydrateArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CategoryArg {
    Criminal,
    Supervision,
    Substance,
}

impl From<CategoryArg> for RecordCategory {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Criminal => RecordCategory::Criminal,
            CategoryArg::Supervision => RecordCategory::Supervision,
            CategoryArg::Substance => RecordCategory::Substance,
        }
    }
}

#[derive(Debug, Args)]
struct HydrateArgs {
    #[arg(long, value_enum)]
    category: CategoryArg,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    ids: Vec<i64>,
}

#[derive(Debug, Args)]
struct TransitionArgs {
    #[command(flatten)]
    case: CaseArg,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    document_number: i64,
    #[arg(long)]
    actor_id: String,
    #[arg(long)]
    actor_origin: Option<String>,
}

#[derive(Debug, Args)]
struct SealArgs {
    #[command(flatten)]
    transition: TransitionArgs,
    #[arg(long, default_value_t = false)]
    require_eligibility: bool,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List(AuditListArgs),
    Verify,
}

#[derive(Debug, Args)]
struct AuditListArgs {
    #[arg(long, value_parser = parse_case_id)]
    case_id: Option<CaseId>,
}

fn parse_case_id(raw: &str) -> Result<CaseId, String> {
    CaseId::parse(raw).map_err(|err| err.to_string())
}

fn parse_date(raw: &str) -> Result<Date, String> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|err| format!("expected YYYY-MM-DD date: {err}"))
}

/// Prefix domain failures with their stable kind so scripts can match on it.
fn domain<T>(result: Result<T, SealError>) -> Result<T> {
    result.map_err(|err| anyhow!("{}: {err}", err.kind()))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api = SealingApi::with_options(
        cli.db,
        StoreOptions { busy_timeout_ms: cli.busy_timeout_ms },
    );
    debug!(db = %api.db_path().display(), "opened sealing api");
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Case { command } => run_case(*command, &api),
        Command::Records { command } => run_records(*command, &api),
        Command::Seal(args) => run_seal(args, &api),
        Command::Restore(args) => run_restore(args, &api),
        Command::Audit { command } => run_audit(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &SealingApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
        DbCommand::ExportLedger(args) => {
            let manifest = api.export_ledger(&args.out)?;
            emit_json(serde_json::json!({
                "out": args.out.display().to_string(),
                "manifest": manifest
            }))
        }
    }
}

fn run_case(command: CaseCommand, api: &SealingApi) -> Result<()> {
    match command {
        CaseCommand::Eligibility(args) => {
            let report = domain(api.evaluate_eligibility(&args.case.case_id, args.as_of))?;
            let eligible = report.is_eligible();
            let reason = report.ineligibility_reason();
            let mut value = serde_json::to_value(report)?;
            if let Value::Object(object) = &mut value {
                object.insert("eligible".to_string(), Value::Bool(eligible));
                object.insert("ineligibility_reason".to_string(), serde_json::to_value(reason)?);
            }
            emit_json(value)
        }
        CaseCommand::Records(args) => {
            let request = CollectRequest {
                case_id: args.case.case_id,
                before_eighteen_only: args.before_eighteen_only,
                window: args.window.window()?,
            };
            let linked = domain(api.collect_linked_record_ids(&request))?;
            emit_json(serde_json::to_value(linked)?)
        }
        CaseCommand::Review(args) => {
            let request = EraseReviewRequest {
                case_id: args.case.case_id,
                window: args.window.window()?,
                as_of: args.as_of,
            };
            let review = domain(api.erase_review(&request))?;
            emit_json(serde_json::to_value(review)?)
        }
    }
}

fn run_records(command: RecordsCommand, api: &SealingApi) -> Result<()> {
    match command {
        RecordsCommand::Hydrate(args) => {
            let request = HydrateRequest {
                category: args.category.into(),
                ids: args.ids.into_iter().map(RecordId).collect(),
            };
            let records = domain(api.hydrate(&request))?;
            emit_json(serde_json::to_value(records)?)
        }
    }
}

fn transition_request(args: TransitionArgs, require_eligibility: bool) -> SealRequest {
    SealRequest {
        case_id: args.case.case_id,
        reason: args.reason,
        document_number: args.document_number,
        actor: ActorRef { actor_id: args.actor_id, origin: args.actor_origin },
        require_eligibility,
    }
}

fn run_seal(args: SealArgs, api: &SealingApi) -> Result<()> {
    let request = transition_request(args.transition, args.require_eligibility);
    let entry = domain(api.seal(&request))?;
    emit_json(serde_json::to_value(entry)?)
}

fn run_restore(args: TransitionArgs, api: &SealingApi) -> Result<()> {
    let request = transition_request(args, false);
    let entry = domain(api.restore(&request))?;
    emit_json(serde_json::to_value(entry)?)
}

fn run_audit(command: AuditCommand, api: &SealingApi) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let entries = domain(api.list_audit(args.case_id.as_ref()))?;
            emit_json(serde_json::json!({
                "case_id": args.case_id,
                "entries": entries
            }))
        }
        AuditCommand::Verify => emit_json(serde_json::to_value(domain(api.verify_ledger())?)?),
    }
}
