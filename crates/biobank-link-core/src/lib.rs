//! Case linkage between the biobank participant roster and the anesthetic
//! case log.
//!
//! The crate is storage-agnostic. A store implements [`LinkStore`]; the run
//! driver [`run_reconciliation`] resolves opt-outs, builds the candidate set,
//! partitions it against the persisted mapping and applies the inserts and
//! deletes needed to converge the two.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LinkError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("format error: {0}")]
    Format(String),
}

/// Store-facing settings shared by every component of a run.
///
/// Built once at startup and never mutated. Schema names are substituted into
/// statement text, so [`LinkConfig::validate`] must pass before a store uses
/// them.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkConfig {
    pub biobank_schema: String,
    pub report_schema: String,
    pub site_id: i64,
}

impl LinkConfig {
    #[must_use]
    pub fn new(site_id: i64) -> Self {
        Self {
            biobank_schema: "main".to_string(),
            report_schema: "main".to_string(),
            site_id,
        }
    }

    /// Checks that schema names are plain identifiers.
    ///
    /// # Errors
    /// Returns [`LinkError::Configuration`] when a schema name is empty or
    /// contains anything other than ASCII letters, digits and underscores, or
    /// starts with a digit.
    pub fn validate(&self) -> Result<(), LinkError> {
        validate_identifier("biobank_schema", &self.biobank_schema)?;
        validate_identifier("report_schema", &self.report_schema)?;
        Ok(())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), LinkError> {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err(LinkError::Configuration(format!(
            "{field} MUST NOT be empty"
        )));
    };

    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(LinkError::Configuration(format!(
            "{field} MUST be a plain identifier, got {value:?}"
        )));
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    Disappeared,
    Old,
    New,
}

impl Transition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disappeared => "DISAPPEARED",
            Self::Old => "OLD",
            Self::New => "NEW",
        }
    }
}

/// One row of the case/roster join, before opt-out exclusion and
/// case-name collapse.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateRow {
    pub case_name: String,
    pub masked_mrn: String,
    pub visit_id: Option<String>,
    pub enroll_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateMatch {
    pub masked_mrn: String,
    pub visit_id: Option<String>,
    pub enroll_date: Option<String>,
}

/// A row of the persisted case mapping.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersistedMatch {
    pub case_name: String,
    pub masked_mrn: String,
    pub visit_id: Option<String>,
    pub service_date: Option<String>,
    pub enroll_date: Option<String>,
    pub match_date: String,
}

/// Insert request handed to the store for a newly matched case.
///
/// `service_date` is not carried here; the store reads it from the clinical
/// case relation while inserting.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewCaseMatch {
    pub case_name: String,
    pub masked_mrn: String,
    pub visit_id: Option<String>,
    pub enroll_date: Option<String>,
    pub match_date: String,
}

/// Narrow view of the relational store used by a run.
pub trait LinkStore {
    /// Newest roster `import_date`, or `None` when the roster is empty.
    #[allow(clippy::missing_errors_doc)]
    fn last_import_date(&self) -> anyhow::Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn count_opt_outs_since(&self, since: &str) -> anyhow::Result<usize>;

    #[allow(clippy::missing_errors_doc)]
    fn ever_opted_out(&self) -> anyhow::Result<BTreeSet<String>>;

    /// Case/roster join rows for the configured site, earliest case first.
    #[allow(clippy::missing_errors_doc)]
    fn candidate_rows(&self) -> anyhow::Result<Vec<CandidateRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn persisted_matches(&self) -> anyhow::Result<Vec<PersistedMatch>>;

    /// Inserts every match and commits. Returns the number of rows written.
    #[allow(clippy::missing_errors_doc)]
    fn insert_new_matches(&mut self, matches: &[NewCaseMatch]) -> anyhow::Result<usize>;

    /// Deletes every listed case and commits. Returns the number of rows
    /// removed.
    #[allow(clippy::missing_errors_doc)]
    fn delete_matches(&mut self, case_names: &[String]) -> anyhow::Result<usize>;
}

/// Opt-out state of the roster for one run.
///
/// Exclusion uses the flag alone, ignoring `optout_date`. A participant who
/// opted back in after opting out stays excluded until the upstream feed
/// clears the flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct OptOutSummary {
    pub last_import_date: Option<String>,
    pub recently_opted_out: usize,
    pub ever_opted_out: BTreeSet<String>,
}

/// Resolves the opt-out exclusion set and the since-last-import count.
///
/// # Errors
/// Returns an error when any roster query fails.
pub fn resolve_opt_outs<S: LinkStore + ?Sized>(store: &S) -> anyhow::Result<OptOutSummary> {
    let last_import_date = store.last_import_date()?;
    let recently_opted_out = match last_import_date.as_deref() {
        Some(since) => store.count_opt_outs_since(since)?,
        None => 0,
    };
    info!(
        last_import_date = last_import_date.as_deref().unwrap_or("none"),
        "{recently_opted_out} patient(s) have opted out since last import"
    );

    let ever_opted_out = store.ever_opted_out()?;
    info!(
        "{} patient(s) have opted out at any time",
        ever_opted_out.len()
    );

    Ok(OptOutSummary {
        last_import_date,
        recently_opted_out,
        ever_opted_out,
    })
}

/// Cases that currently qualify for linkage, keyed by case name.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CandidateSet {
    by_case: BTreeMap<String, CandidateMatch>,
    collapsed_rows: usize,
    excluded_rows: usize,
}

impl CandidateSet {
    /// Builds the candidate set from join rows.
    ///
    /// Rows for opted-out participants are dropped. When several rows share a
    /// case name the first one wins, so callers should pass rows in case
    /// timestamp order.
    pub fn from_rows<I>(rows: I, opted_out: &BTreeSet<String>) -> Self
    where
        I: IntoIterator<Item = CandidateRow>,
    {
        let mut set = Self::default();

        for row in rows {
            if opted_out.contains(&row.masked_mrn) {
                set.excluded_rows += 1;
                continue;
            }

            match set.by_case.entry(row.case_name) {
                Entry::Occupied(existing) => {
                    debug!(
                        case_name = existing.key().as_str(),
                        kept_masked_mrn = existing.get().masked_mrn.as_str(),
                        dropped_masked_mrn = row.masked_mrn.as_str(),
                        "collapsed duplicate candidate row"
                    );
                    set.collapsed_rows += 1;
                }
                Entry::Vacant(slot) => {
                    slot.insert(CandidateMatch {
                        masked_mrn: row.masked_mrn,
                        visit_id: row.visit_id,
                        enroll_date: row.enroll_date,
                    });
                }
            }
        }

        set
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_case.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_case.is_empty()
    }

    #[must_use]
    pub fn get(&self, case_name: &str) -> Option<&CandidateMatch> {
        self.by_case.get(case_name)
    }

    #[must_use]
    pub fn contains(&self, case_name: &str) -> bool {
        self.by_case.contains_key(case_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CandidateMatch)> {
        self.by_case.iter()
    }

    #[must_use]
    pub fn collapsed_rows(&self) -> usize {
        self.collapsed_rows
    }

    #[must_use]
    pub fn excluded_rows(&self) -> usize {
        self.excluded_rows
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PersistedSet {
    by_case: BTreeMap<String, PersistedMatch>,
}

impl PersistedSet {
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = PersistedMatch>,
    {
        Self {
            by_case: rows
                .into_iter()
                .map(|row| (row.case_name.clone(), row))
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_case.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_case.is_empty()
    }

    #[must_use]
    pub fn get(&self, case_name: &str) -> Option<&PersistedMatch> {
        self.by_case.get(case_name)
    }

    #[must_use]
    pub fn contains(&self, case_name: &str) -> bool {
        self.by_case.contains_key(case_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PersistedMatch)> {
        self.by_case.iter()
    }
}

/// Three-way partition of `candidates ∪ persisted` for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reconciliation {
    pub match_date: String,
    pub new_cases: BTreeMap<String, CandidateMatch>,
    pub retained_cases: BTreeMap<String, PersistedMatch>,
    pub disappeared_cases: BTreeMap<String, PersistedMatch>,
}

impl Reconciliation {
    /// Insert requests for every new case, all stamped with the run's match
    /// date.
    #[must_use]
    pub fn new_matches(&self) -> Vec<NewCaseMatch> {
        self.new_cases
            .iter()
            .map(|(case_name, candidate)| NewCaseMatch {
                case_name: case_name.clone(),
                masked_mrn: candidate.masked_mrn.clone(),
                visit_id: candidate.visit_id.clone(),
                enroll_date: candidate.enroll_date.clone(),
                match_date: self.match_date.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn disappeared_case_names(&self) -> Vec<String> {
        self.disappeared_cases.keys().cloned().collect()
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.new_cases.is_empty() || !self.disappeared_cases.is_empty()
    }

    /// One entry per case: disappeared, then old, then new, each sorted by
    /// case name.
    ///
    /// Retained and disappeared cases report their persisted metadata; new
    /// cases report candidate metadata and the run's match date.
    #[must_use]
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        let persisted_entry = |transition: Transition, row: &PersistedMatch| AuditEntry {
            transition,
            match_date: row.match_date.clone(),
            case_name: row.case_name.clone(),
            masked_mrn: row.masked_mrn.clone(),
            visit_id: row.visit_id.clone(),
        };

        let mut entries = Vec::with_capacity(
            self.disappeared_cases.len() + self.retained_cases.len() + self.new_cases.len(),
        );
        entries.extend(
            self.disappeared_cases
                .values()
                .map(|row| persisted_entry(Transition::Disappeared, row)),
        );
        entries.extend(
            self.retained_cases
                .values()
                .map(|row| persisted_entry(Transition::Old, row)),
        );
        entries.extend(
            self.new_cases
                .iter()
                .map(|(case_name, candidate)| AuditEntry {
                    transition: Transition::New,
                    match_date: self.match_date.clone(),
                    case_name: case_name.clone(),
                    masked_mrn: candidate.masked_mrn.clone(),
                    visit_id: candidate.visit_id.clone(),
                }),
        );
        entries
    }
}

/// Partitions the candidate set against the persisted mapping.
///
/// `new = C − P`, `retained = C ∩ P`, `disappeared = P − C`. Retained cases
/// keep their persisted row, including the original match date.
#[must_use]
pub fn reconcile(
    candidates: &CandidateSet,
    persisted: &PersistedSet,
    match_date: &str,
) -> Reconciliation {
    let mut reconciliation = Reconciliation {
        match_date: match_date.to_string(),
        ..Reconciliation::default()
    };

    for (case_name, candidate) in candidates.iter() {
        match persisted.get(case_name) {
            Some(existing) => {
                reconciliation
                    .retained_cases
                    .insert(case_name.clone(), existing.clone());
            }
            None => {
                reconciliation
                    .new_cases
                    .insert(case_name.clone(), candidate.clone());
            }
        }
    }

    for (case_name, existing) in persisted.iter() {
        if !candidates.contains(case_name) {
            reconciliation
                .disappeared_cases
                .insert(case_name.clone(), existing.clone());
        }
    }

    reconciliation
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEntry {
    pub transition: Transition,
    pub match_date: String,
    pub case_name: String,
    pub masked_mrn: String,
    pub visit_id: Option<String>,
}

impl Display for AuditEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.transition.as_str(),
            self.match_date,
            self.case_name,
            self.masked_mrn,
            self.visit_id.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunStats {
    pub opt_outs_since_last_import: usize,
    pub opt_outs_ever: usize,
    pub starting_cases: usize,
    pub retained_cases: usize,
    pub new_cases: usize,
    pub disappeared_cases: usize,
    pub ending_cases: usize,
    pub collapsed_candidate_rows: usize,
    pub excluded_candidate_rows: usize,
}

impl RunStats {
    #[must_use]
    pub fn derive(
        opt_outs: &OptOutSummary,
        candidates: &CandidateSet,
        persisted: &PersistedSet,
        reconciliation: &Reconciliation,
    ) -> Self {
        Self {
            opt_outs_since_last_import: opt_outs.recently_opted_out,
            opt_outs_ever: opt_outs.ever_opted_out.len(),
            starting_cases: persisted.len(),
            retained_cases: reconciliation.retained_cases.len(),
            new_cases: reconciliation.new_cases.len(),
            disappeared_cases: reconciliation.disappeared_cases.len(),
            ending_cases: candidates.len(),
            collapsed_candidate_rows: candidates.collapsed_rows(),
            excluded_candidate_rows: candidates.excluded_rows(),
        }
    }

    /// Human-readable counter lines, in reporting order.
    #[must_use]
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            format!(
                "Patients that opted out since last import: {}",
                self.opt_outs_since_last_import
            ),
            format!("Patients that opted out at any time: {}", self.opt_outs_ever),
            format!("Starting count of cases: {}", self.starting_cases),
            format!("Cases we knew about already: {}", self.retained_cases),
            format!("Cases newly found: {}", self.new_cases),
            format!("Cases that disappeared: {}", self.disappeared_cases),
            format!("Cases now: {}", self.ending_cases),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Ulid,
    pub match_date: String,
    pub last_import_date: Option<String>,
    pub stats: RunStats,
    pub audit: Vec<AuditEntry>,
    pub inserted_rows: usize,
    pub deleted_rows: usize,
}

impl RunReport {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.stats.new_cases > 0 || self.stats.disappeared_cases > 0
    }
}

/// Runs one reconciliation pass against `store`.
///
/// Audit lines for every case are logged before the first write, so they
/// survive a failure in either write phase. The insert phase is committed
/// before the delete phase starts. A failure in either phase aborts the run;
/// whatever was committed before it stands and the next run converges the
/// rest.
///
/// # Errors
/// Returns an error when `run_at` cannot be formatted or any store operation
/// fails.
pub fn run_reconciliation<S: LinkStore + ?Sized>(
    store: &mut S,
    run_at: OffsetDateTime,
) -> anyhow::Result<RunReport> {
    reconcile_run(store, Ulid::new(), run_at)
}

#[instrument(name = "reconcile", skip_all, fields(run_id = %run_id))]
fn reconcile_run<S: LinkStore + ?Sized>(
    store: &mut S,
    run_id: Ulid,
    run_at: OffsetDateTime,
) -> anyhow::Result<RunReport> {
    let match_date = format_match_date(run_at)?;
    info!(%match_date, "using run timestamp as match date for new cases");

    let opt_outs = resolve_opt_outs(store)?;

    info!("matching cases");
    let candidates = CandidateSet::from_rows(store.candidate_rows()?, &opt_outs.ever_opted_out);
    if candidates.collapsed_rows() > 0 {
        info!(
            collapsed = candidates.collapsed_rows(),
            "collapsed duplicate roster rows onto single cases"
        );
    }

    info!("determining which cases are new, old, and disappeared");
    let persisted = PersistedSet::from_rows(store.persisted_matches()?);
    let reconciliation = reconcile(&candidates, &persisted, &match_date);

    let audit = reconciliation.audit_entries();
    for entry in &audit {
        info!("{entry}");
    }

    let new_matches = reconciliation.new_matches();
    let inserted_rows = if new_matches.is_empty() {
        0
    } else {
        info!(count = new_matches.len(), "adding new cases");
        store.insert_new_matches(&new_matches)?
    };
    if inserted_rows != new_matches.len() {
        warn!(
            expected = new_matches.len(),
            inserted = inserted_rows,
            "some new cases had no clinical row to copy service_date from"
        );
    }

    let disappeared = reconciliation.disappeared_case_names();
    let deleted_rows = if disappeared.is_empty() {
        0
    } else {
        info!(count = disappeared.len(), "deleting disappeared cases");
        store.delete_matches(&disappeared)?
    };

    let stats = RunStats::derive(&opt_outs, &candidates, &persisted, &reconciliation);

    Ok(RunReport {
        run_id,
        match_date,
        last_import_date: opt_outs.last_import_date,
        stats,
        audit,
        inserted_rows,
        deleted_rows,
    })
}

/// Formats a run timestamp as a match date (`YYYY-MM-DD HH:MM:SS`, UTC).
///
/// # Errors
/// Returns [`LinkError::Format`] when the timestamp cannot be formatted.
pub fn format_match_date(value: OffsetDateTime) -> Result<String, LinkError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .map_err(|err| LinkError::Format(err.to_string()))
}

/// Parses an RFC 3339 timestamp, requiring UTC offset `Z`.
///
/// # Errors
/// Returns [`LinkError::Validation`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LinkError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| LinkError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LinkError::Validation(
            "timestamp MUST be UTC (offset Z)".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
