#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use biobank_link_core::{
    format_match_date, now_utc, CandidateRow, LinkConfig, LinkStore, NewCaseMatch,
    PersistedMatch,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

const LINK_MIGRATION_VERSION: i64 = 1;

/// Text the upstream roster export writes into `bb_optout` for opted-out
/// participants.
pub const OPT_OUT_FLAG: &str = "TRUE";

pub const ROSTER_TABLE: &str = "biobank_import";
pub const CASE_SUMMARY_TABLE: &str = "case_summary";
pub const CASE_MATCH_TABLE: &str = "biobank_cases";

const ROSTER_COLUMNS: &[&str] = &[
    "masked_mrn",
    "mrn",
    "bb_optout",
    "optout_date",
    "enroll_date",
    "import_date",
];

const CASE_SUMMARY_COLUMNS: &[&str] = &[
    "case_name",
    "mrn",
    "visit_id",
    "site",
    "service_date",
    "case_timestamp",
];

const SCHEMA_LINK_V1: &str = r"
CREATE TABLE IF NOT EXISTS {schema}.schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {schema}.biobank_cases (
  case_name TEXT PRIMARY KEY,
  masked_mrn TEXT NOT NULL,
  visit_id TEXT,
  service_date TEXT,
  enroll_date TEXT,
  match_date TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS {schema}.idx_biobank_cases_masked_mrn
  ON biobank_cases(masked_mrn);
";

pub struct SqliteLinkStore {
    conn: Connection,
    config: LinkConfig,
    roster: String,
    case_summary: String,
    case_matches: String,
}

impl SqliteLinkStore {
    /// Opens the biobank database. The configuration is validated first so
    /// that schema names are safe to place in statement text.
    pub fn open(path: &Path, config: LinkConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid link configuration: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            roster: format!("{}.{ROSTER_TABLE}", config.biobank_schema),
            case_summary: format!("{}.{CASE_SUMMARY_TABLE}", config.report_schema),
            case_matches: format!("{}.{CASE_MATCH_TABLE}", config.biobank_schema),
            conn,
            config,
        })
    }

    /// Attaches the roster database under the configured biobank schema name.
    /// The case-match table is created in the same database.
    pub fn attach_biobank_db(&self, path: &Path) -> Result<()> {
        self.attach_database(path, &self.config.biobank_schema, "biobank")
    }

    /// Attaches the clinical report database under the configured report
    /// schema name.
    pub fn attach_report_db(&self, path: &Path) -> Result<()> {
        self.attach_database(path, &self.config.report_schema, "report")
    }

    fn attach_database(&self, path: &Path, schema: &str, role: &str) -> Result<()> {
        if schema == "main" || schema == "temp" {
            return Err(anyhow!(
                "cannot attach {role} database as reserved schema {schema}"
            ));
        }

        let path_text = path
            .to_str()
            .ok_or_else(|| anyhow!("{role} database path must be valid UTF-8"))?;
        let sql = format!("ATTACH DATABASE ?1 AS {schema}");
        trace_statement(&sql);
        self.conn
            .execute(&sql, params![path_text])
            .with_context(|| format!("failed to attach {role} database {}", path.display()))?;

        Ok(())
    }

    /// Creates the owned case-match table and checks the two source
    /// relations. Safe to run on every start.
    pub fn migrate(&self) -> Result<()> {
        let schema = &self.config.biobank_schema;

        ensure_schema_attached(&self.conn, schema)?;
        ensure_schema_attached(&self.conn, &self.config.report_schema)?;
        ensure_source_relation(&self.conn, schema, ROSTER_TABLE, ROSTER_COLUMNS)?;
        ensure_source_relation(
            &self.conn,
            &self.config.report_schema,
            CASE_SUMMARY_TABLE,
            CASE_SUMMARY_COLUMNS,
        )?;

        self.conn
            .execute_batch(&SCHEMA_LINK_V1.replace("{schema}", schema))
            .context("failed to apply case-match schema")?;

        let now = format_match_date(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {schema}.schema_migrations(version, applied_at) VALUES (?1, ?2)"
                ),
                params![LINK_MIGRATION_VERSION, now],
            )
            .context("failed to register case-match schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn count_case_matches(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.case_matches);
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .context("failed to count case matches")?;
        to_count(count)
    }

    pub fn get_case_match(&self, case_name: &str) -> Result<Option<PersistedMatch>> {
        let sql = format!(
            "SELECT case_name, masked_mrn, visit_id, service_date, enroll_date, match_date
             FROM {}
             WHERE case_name = ?1",
            self.case_matches
        );
        self.conn
            .query_row(&sql, params![case_name], parse_case_match_row)
            .optional()
            .with_context(|| format!("failed to load case match {case_name}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LinkStore for SqliteLinkStore {
    fn last_import_date(&self) -> Result<Option<String>> {
        let sql = format!("SELECT MAX(import_date) FROM {}", self.roster);
        trace_statement(&sql);
        let last: Option<String> = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .context("failed to query last import date")?;
        Ok(last)
    }

    fn count_opt_outs_since(&self, since: &str) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(DISTINCT masked_mrn)
             FROM {}
             WHERE bb_optout = ?1 AND optout_date >= ?2",
            self.roster
        );
        trace_statement(&sql);
        let count: i64 = self
            .conn
            .query_row(&sql, params![OPT_OUT_FLAG, since], |row| row.get(0))
            .context("failed to count recent opt-outs")?;
        to_count(count)
    }

    fn ever_opted_out(&self) -> Result<BTreeSet<String>> {
        let sql = format!(
            "SELECT DISTINCT masked_mrn FROM {} WHERE bb_optout = ?1",
            self.roster
        );
        trace_statement(&sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![OPT_OUT_FLAG], |row| row.get::<_, String>(0))?;
        Ok(collect_rows(rows)
            .context("failed to load opted-out participants")?
            .into_iter()
            .collect())
    }

    fn candidate_rows(&self) -> Result<Vec<CandidateRow>> {
        let sql = format!(
            "SELECT
                s.case_name,
                b.masked_mrn,
                CAST(s.visit_id AS TEXT),
                CAST(b.enroll_date AS TEXT)
             FROM {summary} s
             JOIN {roster} b ON b.mrn = s.mrn
             WHERE s.site = ?1
               AND b.masked_mrn NOT IN (
                 SELECT masked_mrn FROM {roster} WHERE bb_optout = ?2
               )
             ORDER BY s.case_timestamp ASC, s.case_name ASC, b.import_date DESC, b.masked_mrn ASC",
            summary = self.case_summary,
            roster = self.roster,
        );
        trace_statement(&sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![self.config.site_id, OPT_OUT_FLAG], |row| {
            Ok(CandidateRow {
                case_name: row.get(0)?,
                masked_mrn: row.get(1)?,
                visit_id: row.get(2)?,
                enroll_date: row.get(3)?,
            })
        })?;
        collect_rows(rows).context("failed to match cases against roster")
    }

    fn persisted_matches(&self) -> Result<Vec<PersistedMatch>> {
        let sql = format!(
            "SELECT case_name, masked_mrn, visit_id, service_date, enroll_date, match_date
             FROM {}
             ORDER BY case_name ASC",
            self.case_matches
        );
        trace_statement(&sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], parse_case_match_row)?;
        collect_rows(rows).context("failed to load persisted case matches")
    }

    fn insert_new_matches(&mut self, matches: &[NewCaseMatch]) -> Result<usize> {
        if matches.is_empty() {
            return Ok(0);
        }

        // Candidates are already site-scoped; the site predicate here only keeps
        // service_date from a same-named case logged at another site.
        let sql = format!(
            "INSERT INTO {cases}(case_name, masked_mrn, visit_id, service_date, enroll_date, match_date)
             SELECT s.case_name, ?2, ?3, CAST(s.service_date AS TEXT), ?4, ?5
             FROM {summary} s
             WHERE s.case_name = ?1 AND s.site = ?6
             ORDER BY s.case_timestamp ASC
             LIMIT 1",
            cases = self.case_matches,
            summary = self.case_summary,
        );
        trace_statement(&sql);

        let site_id = self.config.site_id;
        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;

        let mut inserted = 0_usize;
        {
            let mut stmt = tx.prepare(&sql)?;
            for item in matches {
                inserted += stmt
                    .execute(params![
                        item.case_name,
                        item.masked_mrn,
                        item.visit_id,
                        item.enroll_date,
                        item.match_date,
                        site_id,
                    ])
                    .with_context(|| format!("failed to insert case match {}", item.case_name))?;
            }
        }

        tx.commit().context("failed to commit insert transaction")?;
        debug!(inserted, "committed insert phase");
        Ok(inserted)
    }

    fn delete_matches(&mut self, case_names: &[String]) -> Result<usize> {
        if case_names.is_empty() {
            return Ok(0);
        }

        let sql = format!("DELETE FROM {} WHERE case_name = ?1", self.case_matches);
        trace_statement(&sql);

        let tx = self
            .conn
            .transaction()
            .context("failed to start delete transaction")?;

        let mut deleted = 0_usize;
        {
            let mut stmt = tx.prepare(&sql)?;
            for case_name in case_names {
                deleted += stmt
                    .execute(params![case_name])
                    .with_context(|| format!("failed to delete case match {case_name}"))?;
            }
        }

        tx.commit().context("failed to commit delete transaction")?;
        debug!(deleted, "committed delete phase");
        Ok(deleted)
    }
}

fn trace_statement(sql: &str) {
    debug!(statement = sql, "executing");
}

fn parse_case_match_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedMatch> {
    Ok(PersistedMatch {
        case_name: row.get(0)?,
        masked_mrn: row.get(1)?,
        visit_id: row.get(2)?,
        service_date: row.get(3)?,
        enroll_date: row.get(4)?,
        match_date: row.get(5)?,
    })
}

fn to_count(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("invalid row count: {value}"))
}

fn ensure_schema_attached(conn: &Connection, schema: &str) -> Result<()> {
    let mut stmt = conn
        .prepare("PRAGMA database_list")
        .context("failed to list attached databases")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let attached = collect_rows(rows).context("failed to list attached databases")?;

    if attached.iter().any(|name| name == schema) {
        Ok(())
    } else {
        Err(anyhow!(
            "database schema {schema} is not attached (attached: {})",
            attached.join(", ")
        ))
    }
}

fn ensure_source_relation(
    conn: &Connection,
    schema: &str,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    if !table_exists(conn, schema, table_name)? {
        return Err(anyhow!(
            "source relation check failed: expected table {schema}.{table_name}"
        ));
    }

    ensure_table_has_columns(conn, schema, table_name, columns)
}

fn table_exists(conn: &Connection, schema: &str, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            &format!(
                "SELECT 1
                 FROM {schema}.sqlite_master
                 WHERE type IN ('table', 'view') AND name = ?1
                 LIMIT 1"
            ),
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .with_context(|| format!("failed to query {schema}.sqlite_master"))?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(
    conn: &Connection,
    schema: &str,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA {schema}.table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {schema}.{table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "source relation check failed: missing column {schema}.{table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Roster row for seeding test and fixture databases.
#[derive(Debug, Clone, Copy)]
pub struct RosterSeed<'a> {
    pub masked_mrn: &'a str,
    pub mrn: &'a str,
    pub opted_out: bool,
    pub optout_date: Option<&'a str>,
    pub enroll_date: Option<&'a str>,
    pub import_date: &'a str,
}

/// Clinical case row for seeding test and fixture databases.
#[derive(Debug, Clone, Copy)]
pub struct CaseSeed<'a> {
    pub case_name: &'a str,
    pub mrn: &'a str,
    pub visit_id: Option<&'a str>,
    pub site: i64,
    pub service_date: Option<&'a str>,
    pub case_timestamp: &'a str,
}

/// Creates a minimal roster relation. The real one is owned by the upstream
/// import job.
pub fn seed_roster_table(conn: &Connection, schema: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.{ROSTER_TABLE} (
            masked_mrn TEXT NOT NULL,
            mrn TEXT NOT NULL,
            bb_optout TEXT NOT NULL DEFAULT 'FALSE',
            optout_date TEXT,
            enroll_date TEXT,
            import_date TEXT NOT NULL
         );"
    ))
    .context("failed to create roster table for fixtures")
}

/// Creates a minimal clinical case relation. The real one is owned by the
/// clinical reporting system.
pub fn seed_case_summary_table(conn: &Connection, schema: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.{CASE_SUMMARY_TABLE} (
            case_name TEXT NOT NULL,
            mrn TEXT NOT NULL,
            visit_id TEXT,
            site INTEGER NOT NULL,
            service_date TEXT,
            case_timestamp TEXT NOT NULL
         );"
    ))
    .context("failed to create case_summary table for fixtures")
}

pub fn seed_roster_row(conn: &Connection, schema: &str, seed: &RosterSeed<'_>) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {schema}.{ROSTER_TABLE}(masked_mrn, mrn, bb_optout, optout_date, enroll_date, import_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            seed.masked_mrn,
            seed.mrn,
            if seed.opted_out { OPT_OUT_FLAG } else { "FALSE" },
            seed.optout_date,
            seed.enroll_date,
            seed.import_date,
        ],
    )
    .context("failed to seed roster row")?;
    Ok(())
}

pub fn seed_case_row(conn: &Connection, schema: &str, seed: &CaseSeed<'_>) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {schema}.{CASE_SUMMARY_TABLE}(case_name, mrn, visit_id, site, service_date, case_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            seed.case_name,
            seed.mrn,
            seed.visit_id,
            seed.site,
            seed.service_date,
            seed.case_timestamp,
        ],
    )
    .context("failed to seed case_summary row")?;
    Ok(())
}
