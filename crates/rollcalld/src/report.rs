use crate::error::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rollcall_store::{Session, Store};
use serde::Serialize;
use std::collections::HashMap;

/// Calendar window of a report, ending today (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRange {
    Today,
    /// Since Monday.
    Week,
    Month,
    Year,
}

impl ReportRange {
    /// Unrecognized names fall back to `Today`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "today" => Self::Today,
            "week" => Self::Week,
            "month" => Self::Month,
            "year" => Self::Year,
            other => {
                tracing::warn!(range = other, "unknown report range, using today");
                Self::Today
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Inclusive first and last day.
    pub fn bounds(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = match self {
            Self::Today => today,
            Self::Week => today - Duration::days(i64::from(today.weekday().num_days_from_monday())),
            Self::Month => today.with_day(1).unwrap_or(today),
            Self::Year => today.with_ordinal(1).unwrap_or(today),
        };
        (start, today)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReportFilter {
    pub department: Option<String>,
    pub term: Option<u8>,
    /// Case-insensitive substring of the recorded display name.
    pub name: Option<String>,
}

/// One ledger row joined with its session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub department: String,
    pub term: u8,
    pub subject: String,
    pub person_id: String,
    pub display_name: String,
    pub date: NaiveDate,
    pub in_time: DateTime<Utc>,
    pub confidence: f32,
}

pub async fn attendance_report(store: &Store, range: ReportRange, filter: &ReportFilter) -> Result<Vec<ReportRow>> {
    attendance_report_at(store, range, filter, Utc::now()).await
}

pub async fn attendance_report_at(
    store: &Store,
    range: ReportRange,
    filter: &ReportFilter,
    now: DateTime<Utc>,
) -> Result<Vec<ReportRow>> {
    let (start, end) = range.bounds(now.date_naive());
    let name = filter.name.as_ref().map(|n| n.to_lowercase());
    let mut sessions: HashMap<String, Option<Session>> = HashMap::new();
    let mut rows = Vec::new();

    for entry in store.attendance_log_between(start, end).await? {
        if !sessions.contains_key(&entry.session_id) {
            let loaded = store.session(&entry.session_id).await?;
            sessions.insert(entry.session_id.clone(), loaded);
        }
        let Some(Some(session)) = sessions.get(&entry.session_id) else {
            continue;
        };

        if filter.department.as_ref().is_some_and(|d| *d != session.department) {
            continue;
        }
        if filter.term.is_some_and(|t| t != session.term) {
            continue;
        }
        if name
            .as_ref()
            .is_some_and(|n| !entry.display_name.to_lowercase().contains(n.as_str()))
        {
            continue;
        }

        rows.push(ReportRow {
            department: session.department.clone(),
            term: session.term,
            subject: session.subject.clone(),
            person_id: entry.person_id,
            display_name: entry.display_name,
            date: entry.date,
            in_time: entry.in_time,
            confidence: entry.confidence,
        });
    }

    tracing::debug!(range = range.as_str(), %start, %end, rows = rows.len(), "attendance report built");
    Ok(rows)
}
