//! Scheduled entry point for biobank case linkage.
//!
//! Hosts embed the job through:
//! - [`run_cli`] for full parsed CLI execution, logging setup included.
//! - [`run_with_db`] for a single reconciliation pass against a database path.
//!
//! Every setting has an environment fallback so a scheduler can invoke the
//! binary without arguments.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use biobank_link_core::{now_utc, parse_rfc3339_utc, run_reconciliation, LinkConfig, RunReport};
use biobank_link_store_sqlite::SqliteLinkStore;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status for a completed run that inserted or deleted case matches,
/// reported only with `--detailed-exit-codes`.
pub const EXIT_CHANGED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "biobank-link")]
#[command(about = "Link anesthetic cases to biobank participants")]
pub struct Cli {
    #[arg(long, env = "BIOBANK_LINK_DB", default_value = "./biobank.sqlite3")]
    db: PathBuf,

    /// Database holding the roster and the case-match table, attached under
    /// the biobank schema.
    #[arg(long, env = "BIOBANK_LINK_BIOBANK_DB")]
    biobank_db: Option<PathBuf>,

    /// Database holding the clinical case relation, attached under the
    /// report schema.
    #[arg(long, env = "BIOBANK_LINK_REPORT_DB")]
    report_db: Option<PathBuf>,

    /// Defaults to `biobank` when --biobank-db is given, `main` otherwise.
    #[arg(long, env = "BIOBANK_LINK_BIOBANK_SCHEMA")]
    biobank_schema: Option<String>,

    /// Defaults to `report` when --report-db is given, `main` otherwise.
    #[arg(long, env = "BIOBANK_LINK_REPORT_SCHEMA")]
    report_schema: Option<String>,

    #[arg(long, env = "BIOBANK_LINK_SITE_ID", allow_negative_numbers = true)]
    site_id: i64,

    #[arg(long, env = "BIOBANK_LINK_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[arg(long, env = "BIOBANK_LINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run timestamp (RFC 3339, UTC) used as the match date for new cases.
    #[arg(long)]
    run_at: Option<String>,

    /// Exit 0 when nothing changed and 2 when case matches were inserted or
    /// deleted.
    #[arg(long)]
    detailed_exit_codes: bool,

    #[arg(long)]
    json: bool,
}

impl Cli {
    #[must_use]
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            biobank_schema: schema_name(
                self.biobank_schema.as_deref(),
                self.biobank_db.is_some(),
                "biobank",
            ),
            report_schema: schema_name(
                self.report_schema.as_deref(),
                self.report_db.is_some(),
                "report",
            ),
            site_id: self.site_id,
        }
    }
}

fn schema_name(explicit: Option<&str>, attached: bool, attached_default: &str) -> String {
    match (explicit, attached) {
        (Some(schema), _) => schema.to_string(),
        (None, true) => attached_default.to_string(),
        (None, false) => "main".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    NoChanges,
    Changed,
}

impl RunOutcome {
    #[must_use]
    pub fn from_report(report: &RunReport) -> Self {
        if report.has_changes() {
            Self::Changed
        } else {
            Self::NoChanges
        }
    }

    #[must_use]
    pub fn exit_status(self, detailed: bool) -> u8 {
        match (self, detailed) {
            (Self::Changed, true) => EXIT_CHANGED,
            _ => 0,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RunSummaryJson<'a> {
    contract_version: &'static str,
    outcome: RunOutcome,
    report: &'a RunReport,
}

/// Executes the parsed CLI: logging setup, one reconciliation pass, audit
/// report. Returns the process exit status for a completed run.
///
/// # Errors
/// Returns an error when logging cannot be initialized, the configuration is
/// invalid, or any store operation fails. The run is not retried.
pub fn run_cli(cli: Cli) -> Result<u8> {
    init_logging(&cli.log_level, cli.log_file.as_deref())?;

    let config = cli.link_config();
    info!(
        db = %cli.db.display(),
        biobank_db = ?cli.biobank_db,
        report_db = ?cli.report_db,
        biobank_schema = config.biobank_schema.as_str(),
        report_schema = config.report_schema.as_str(),
        site_id = config.site_id,
        "starting biobank import"
    );

    let result = resolve_run_at(cli.run_at.as_deref())
        .and_then(|run_at| {
            let databases = AttachedDatabases {
                biobank_db: cli.biobank_db.as_deref(),
                report_db: cli.report_db.as_deref(),
            };
            run_with_db(&cli.db, databases, config, run_at)
        });

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            error!("biobank import failed: {err:#}");
            return Err(err);
        }
    };

    emit_report(&report);

    let outcome = RunOutcome::from_report(&report);
    if cli.json {
        let payload = RunSummaryJson {
            contract_version: "run_summary.v1",
            outcome,
            report: &report,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }

    Ok(outcome.exit_status(cli.detailed_exit_codes))
}

/// Optional database files attached next to the main database.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachedDatabases<'a> {
    pub biobank_db: Option<&'a Path>,
    pub report_db: Option<&'a Path>,
}

/// Runs one reconciliation pass against the database at `db_path`.
///
/// # Errors
/// Returns an error when the store cannot be opened, attached or migrated, or
/// when the run fails.
pub fn run_with_db(
    db_path: &Path,
    attached: AttachedDatabases<'_>,
    config: LinkConfig,
    run_at: time::OffsetDateTime,
) -> Result<RunReport> {
    let mut store = SqliteLinkStore::open(db_path, config)?;
    if let Some(path) = attached.biobank_db {
        store.attach_biobank_db(path)?;
    }
    if let Some(path) = attached.report_db {
        store.attach_report_db(path)?;
    }
    store.migrate()?;
    run_reconciliation(&mut store, run_at)
}

/// Installs the console layer (stderr) and, when `log_file` is set, an
/// appending plain-text file layer.
///
/// A subscriber that is already installed is left in place.
///
/// # Errors
/// Returns an error when the log file cannot be opened.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Ok(())
}

fn emit_report(report: &RunReport) {
    for line in report.stats.summary_lines() {
        info!(run_id = %report.run_id, "{line}");
    }
    info!(
        run_id = %report.run_id,
        inserted_rows = report.inserted_rows,
        deleted_rows = report.deleted_rows,
        "biobank import complete"
    );
}

fn resolve_run_at(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid --run-at: {err}")),
        None => Ok(now_utc()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use biobank_link_store_sqlite::{
        seed_case_row, seed_case_summary_table, seed_roster_row, seed_roster_table, CaseSeed,
        RosterSeed,
    };
    use rusqlite::Connection;
    use std::fs;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["biobank-link"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse cli args: {err}"),
        }
    }

    fn temp_db(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("biobank-link-{label}-{}.sqlite3", Ulid::new()))
    }

    fn seed_fixture_db(path: &Path) {
        let conn = must(Connection::open(path).map_err(Into::into));
        must(seed_roster_table(&conn, "main"));
        must(seed_case_summary_table(&conn, "main"));
        must(seed_roster_row(
            &conn,
            "main",
            &RosterSeed {
                masked_mrn: "M-1",
                mrn: "100",
                opted_out: false,
                optout_date: None,
                enroll_date: Some("2023-01-15 00:00:00"),
                import_date: "2024-02-01 00:00:00",
            },
        ));
        must(seed_case_row(
            &conn,
            "main",
            &CaseSeed {
                case_name: "C-1",
                mrn: "100",
                visit_id: Some("V-1"),
                site: 7,
                service_date: Some("2024-01-20 00:00:00"),
                case_timestamp: "2024-01-20 09:00:00",
            },
        ));
    }

    #[test]
    fn resolve_run_at_rejects_non_utc() {
        assert!(resolve_run_at(Some("2024-03-01T08:00:00+02:00")).is_err());
        assert!(resolve_run_at(Some("2024-03-01T08:00:00Z")).is_ok());
    }

    #[test]
    fn report_schema_defaults_follow_report_db() {
        let local = parse(&["--site-id", "7", "--db", "a.sqlite3"]);
        assert_eq!(local.link_config().report_schema, "main");

        let attached = parse(&["--site-id", "7", "--report-db", "r.sqlite3"]);
        assert_eq!(attached.link_config().report_schema, "report");

        let explicit = parse(&[
            "--site-id",
            "7",
            "--report-db",
            "r.sqlite3",
            "--report-schema",
            "clinical",
        ]);
        assert_eq!(explicit.link_config().report_schema, "clinical");
    }

    #[test]
    fn biobank_schema_defaults_follow_biobank_db() {
        let local = parse(&["--site-id", "7"]);
        assert_eq!(local.link_config().biobank_schema, "main");

        let attached = parse(&["--site-id", "7", "--biobank-db", "b.sqlite3"]);
        assert_eq!(attached.link_config().biobank_schema, "biobank");

        let explicit = parse(&[
            "--site-id",
            "7",
            "--biobank-db",
            "b.sqlite3",
            "--biobank-schema",
            "roster",
        ]);
        assert_eq!(explicit.link_config().biobank_schema, "roster");
    }

    #[test]
    fn negative_site_ids_parse() {
        let cli = parse(&["--site-id", "-3"]);
        assert_eq!(cli.link_config().site_id, -3);
    }

    #[test]
    fn exit_status_only_distinguishes_changes_when_requested() {
        assert_eq!(RunOutcome::Changed.exit_status(false), 0);
        assert_eq!(RunOutcome::Changed.exit_status(true), EXIT_CHANGED);
        assert_eq!(RunOutcome::NoChanges.exit_status(true), 0);
        assert_eq!(RunOutcome::NoChanges.exit_status(false), 0);
    }

    #[test]
    fn run_cli_reports_changes_then_converges() {
        let db_path = temp_db("cli");
        seed_fixture_db(&db_path);
        let db_arg = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };

        let first = must(run_cli(parse(&[
            "--db",
            &db_arg,
            "--site-id",
            "7",
            "--run-at",
            "2024-03-01T08:00:00Z",
            "--detailed-exit-codes",
        ])));
        assert_eq!(first, EXIT_CHANGED);

        let second = must(run_cli(parse(&[
            "--db",
            &db_arg,
            "--site-id",
            "7",
            "--run-at",
            "2024-03-15T08:00:00Z",
            "--detailed-exit-codes",
            "--json",
        ])));
        assert_eq!(second, 0);

        let store = must(SqliteLinkStore::open(&db_path, LinkConfig::new(7)));
        let row = match must(store.get_case_match("C-1")) {
            Some(value) => value,
            None => panic!("missing case match after cli run"),
        };
        assert_eq!(row.match_date, "2024-03-01 08:00:00");

        drop(store);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn run_with_db_fails_before_writing_when_sources_missing() {
        let db_path = temp_db("missing-sources");
        let result = run_with_db(
            &db_path,
            AttachedDatabases::default(),
            LinkConfig::new(7),
            must(resolve_run_at(Some("2024-03-01T08:00:00Z"))),
        );
        assert!(result.is_err());

        let conn = must(Connection::open(&db_path).map_err(Into::into));
        let owned_tables: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'biobank_cases'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(owned_tables, 0);

        drop(conn);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn json_summary_contract_is_stable_v1() {
        let report = RunReport {
            run_id: match Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8M2") {
                Ok(value) => value,
                Err(err) => panic!("invalid fixture ULID: {err}"),
            },
            match_date: "2024-03-01 08:00:00".to_string(),
            last_import_date: Some("2024-02-01 00:00:00".to_string()),
            stats: biobank_link_core::RunStats::default(),
            audit: Vec::new(),
            inserted_rows: 0,
            deleted_rows: 0,
        };
        let payload = RunSummaryJson {
            contract_version: "run_summary.v1",
            outcome: RunOutcome::from_report(&report),
            report: &report,
        };

        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(value["contract_version"], "run_summary.v1");
        assert_eq!(value["outcome"], "no_changes");
        assert_eq!(value["report"]["run_id"], "01J0SQQP7M70P6Y3R4T8D8G8M2");
        assert_eq!(value["report"]["stats"]["ending_cases"], 0);
    }
}
