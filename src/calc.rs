use chrono::{NaiveTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::calendar;
use crate::db;
use crate::validate::ValidationFailure;

/// Buckets a recorded day can land in. `Tardy` is carried so the report keeps
/// its column and the classifier stays a one-place change, but no current flag
/// combination produces it: tardy codes fall through to the `Absent` default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Present,
    Absent,
    AbsentJustified,
    Temporal,
    #[allow(dead_code)]
    Tardy,
}

/// Classify one attendance fact by its status code and flags. Unclassified
/// custom statuses count against the student.
pub fn classify(code: &str, negative: bool, excused: bool, temporal: bool) -> Classification {
    if code == "P" {
        return Classification::Present;
    }
    if negative && excused {
        return Classification::AbsentJustified;
    }
    if negative {
        return Classification::Absent;
    }
    if temporal {
        return Classification::Temporal;
    }
    Classification::Absent
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCounts {
    pub present: i64,
    pub absent: i64,
    pub absent_justified: i64,
    pub temporal: i64,
    pub tardy: i64,
}

impl ReportCounts {
    pub fn add(&mut self, classification: Classification) {
        match classification {
            Classification::Present => self.present += 1,
            Classification::Absent => self.absent += 1,
            Classification::AbsentJustified => self.absent_justified += 1,
            Classification::Temporal => self.temporal += 1,
            Classification::Tardy => self.tardy += 1,
        }
    }

    pub fn total(&self) -> i64 {
        self.present + self.absent + self.absent_justified + self.temporal + self.tardy
    }

    /// Present and temporal days count as attended. An enrollment with no
    /// records reports 100%.
    pub fn attendance_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        (self.present + self.temporal) as f64 / total as f64 * 100.0
    }
}

/// Minutes past the late threshold, compared as minutes since midnight.
/// Arrivals under `tardy_after` minutes late are treated as on time.
pub fn minutes_late(arrival: NaiveTime, threshold: NaiveTime, tardy_after: i64) -> i64 {
    if arrival <= threshold {
        return 0;
    }
    let late = (arrival - threshold).num_minutes();
    if late < tardy_after {
        0
    } else {
        late
    }
}

pub fn parse_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

/// Trailing run of days on which every record classified as an absence
/// (excused or not), folded over the enrollment's rows in date order.
pub fn consecutive_absences(rows: &[(String, Classification)]) -> i64 {
    let mut run = 0i64;
    let mut current_date: Option<&str> = None;
    let mut day_all_absent = true;

    // Rows arrive sorted ascending; walk backwards so the trailing run comes first.
    for (date, classification) in rows.iter().rev() {
        if current_date != Some(date.as_str()) {
            if current_date.is_some() {
                if !day_all_absent {
                    return run;
                }
                run += 1;
            }
            current_date = Some(date.as_str());
            day_all_absent = true;
        }
        if !matches!(
            classification,
            Classification::Absent | Classification::AbsentJustified
        ) {
            day_all_absent = false;
        }
    }
    if current_date.is_some() {
        if !day_all_absent {
            return run;
        }
        run += 1;
    }
    run
}

struct FactRow {
    date: String,
    code: String,
    negative: bool,
    excused: bool,
    temporal: bool,
}

/// Rebuild the consolidated report for each enrollment from its attendance
/// facts. The governing bimester bounds the rows when it can be resolved:
/// explicit `bimester_id` first, else the cycle's active bimester, else the
/// full history. Returns the number of reports upserted.
pub fn recalculate_reports(
    conn: &Connection,
    enrollment_ids: &[String],
    cycle_id: Option<&str>,
    bimester_id: Option<&str>,
) -> Result<usize, ValidationFailure> {
    let bounds = match (bimester_id, cycle_id) {
        (Some(id), _) => {
            let bimester = calendar::bimester_by_id(conn, id)?.ok_or_else(|| {
                ValidationFailure::not_found("bimester_not_found", "bimester does not exist")
            })?;
            Some((bimester.start_date, bimester.end_date))
        }
        (None, Some(cycle)) => calendar::current_active_bimester(conn, cycle)?
            .map(|b| (b.start_date, b.end_date)),
        (None, None) => None,
    };

    let config = db::active_config(conn)?;
    let recalculated_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut recalculated = 0usize;

    for enrollment_id in enrollment_ids {
        let rows = fetch_facts(conn, enrollment_id, bounds.as_ref())?;

        let mut counts = ReportCounts::default();
        let mut classified: Vec<(String, Classification)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let classification = classify(&row.code, row.negative, row.excused, row.temporal);
            counts.add(classification);
            classified.push((row.date.clone(), classification));
        }

        let attendance_percentage = counts.attendance_percentage();
        let absence_percentage = 100.0 - attendance_percentage;
        let at_risk = attendance_percentage < config.risk_threshold_percentage;
        let consecutive = consecutive_absences(&classified);

        conn.execute(
            "INSERT INTO student_attendance_reports(
                enrollment_id, present_count, absent_count, absent_justified_count,
                temporal_count, tardy_count, attendance_percentage, absence_percentage,
                at_risk, consecutive_absences, last_recalculated_at
             ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(enrollment_id) DO UPDATE SET
               present_count = excluded.present_count,
               absent_count = excluded.absent_count,
               absent_justified_count = excluded.absent_justified_count,
               temporal_count = excluded.temporal_count,
               tardy_count = excluded.tardy_count,
               attendance_percentage = excluded.attendance_percentage,
               absence_percentage = excluded.absence_percentage,
               at_risk = excluded.at_risk,
               consecutive_absences = excluded.consecutive_absences,
               last_recalculated_at = excluded.last_recalculated_at",
            (
                enrollment_id,
                counts.present,
                counts.absent,
                counts.absent_justified,
                counts.temporal,
                counts.tardy,
                attendance_percentage,
                absence_percentage,
                at_risk as i64,
                consecutive,
                &recalculated_at,
            ),
        )?;
        recalculated += 1;
    }

    Ok(recalculated)
}

fn fetch_facts(
    conn: &Connection,
    enrollment_id: &str,
    bounds: Option<&(String, String)>,
) -> Result<Vec<FactRow>, ValidationFailure> {
    let base = "SELECT a.date, s.code, s.negative, s.excused, s.temporal
         FROM student_class_attendance a
         JOIN attendance_statuses s ON s.id = a.status_id
         WHERE a.enrollment_id = ?1";

    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<FactRow> {
        Ok(FactRow {
            date: r.get(0)?,
            code: r.get(1)?,
            negative: r.get::<_, i64>(2)? != 0,
            excused: r.get::<_, i64>(3)? != 0,
            temporal: r.get::<_, i64>(4)? != 0,
        })
    };

    let rows = match bounds {
        Some((start, end)) => {
            let sql = format!("{base} AND a.date >= ?2 AND a.date <= ?3 ORDER BY a.date, a.id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map((enrollment_id, start, end), map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!("{base} ORDER BY a.date, a.id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([enrollment_id], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    Ok(rows)
}
