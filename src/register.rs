use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::calc;
use crate::validate::{BulkSubmission, ScheduleSlot, ValidatedContext, ValidationFailure};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub enrollment_id: String,
    pub student_id: String,
    pub schedule_id: String,
    pub course_assignment_id: String,
    pub date: String,
    pub status_code: String,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    pub minutes_late: i64,
    pub notes: Option<String>,
    pub recorded_by: String,
    pub recorded_at: String,
}

#[derive(Debug)]
pub struct BulkOutcome {
    pub created: usize,
    pub reports: usize,
    pub records: Vec<AttendanceRecord>,
}

/// Atomic write phase for a validated submission: one record per eligible
/// enrollment per schedule slot (after allow-list filtering), then report
/// recalculation for every touched enrollment, all in one transaction.
/// Any failure rolls the whole submission back.
pub fn register_bulk(
    conn: &Connection,
    ctx: &ValidatedContext,
    sub: &BulkSubmission,
) -> Result<BulkOutcome, ValidationFailure> {
    let slots: Vec<&ScheduleSlot> = match &sub.course_assignment_ids {
        Some(allow) => ctx
            .schedules
            .iter()
            .filter(|s| allow.iter().any(|id| *id == s.assignment_id))
            .collect(),
        None => ctx.schedules.iter().collect(),
    };

    let minutes_late = match &sub.arrival_time {
        Some(raw) => {
            let arrival = calc::parse_clock(raw).ok_or_else(|| {
                ValidationFailure::invalid("bad_arrival_time", "arrivalTime must be HH:MM")
            })?;
            let threshold =
                calc::parse_clock(&ctx.config.late_threshold_time).ok_or_else(|| {
                    ValidationFailure::invalid(
                        "bad_config",
                        "configured late threshold is not a valid time",
                    )
                })?;
            calc::minutes_late(arrival, threshold, ctx.config.mark_as_tardy_after_minutes)
        }
        None => 0,
    };

    let tx = conn.unchecked_transaction()?;

    // Duplicate probe over the whole batch (the pipeline's deferred layer):
    // one set-membership query instead of a per-row pre-check. The unique
    // index backstops whatever slips between probe and insert.
    let already_recorded = enrollments_with_records(&tx, &ctx.date, ctx)?;
    if !already_recorded.is_empty() {
        return Err(ValidationFailure::invalid(
            "duplicate_attendance",
            format!(
                "attendance already recorded on {} for {} enrollment(s)",
                ctx.date,
                already_recorded.len()
            ),
        ));
    }

    let recorded_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut records: Vec<AttendanceRecord> = Vec::new();
    let mut touched: Vec<String> = Vec::new();

    for enrollment in &ctx.enrollments {
        let mut wrote_any = false;
        for slot in &slots {
            let record = AttendanceRecord {
                id: Uuid::new_v4().to_string(),
                enrollment_id: enrollment.id.clone(),
                student_id: enrollment.student_id.clone(),
                schedule_id: slot.id.clone(),
                course_assignment_id: slot.assignment_id.clone(),
                date: ctx.date.clone(),
                status_code: ctx.status.code.clone(),
                arrival_time: sub.arrival_time.clone(),
                departure_time: sub.departure_time.clone(),
                minutes_late,
                notes: sub.notes.clone(),
                recorded_by: ctx.user_id.clone(),
                recorded_at: recorded_at.clone(),
            };
            let inserted = tx.execute(
                "INSERT INTO student_class_attendance(
                    id, enrollment_id, date, schedule_id, assignment_id, status_id,
                    status_code, arrival_time, departure_time, notes, recorded_by, recorded_at
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                (
                    &record.id,
                    &record.enrollment_id,
                    &record.date,
                    &record.schedule_id,
                    &record.course_assignment_id,
                    &ctx.status.id,
                    &record.status_code,
                    &record.arrival_time,
                    &record.departure_time,
                    &record.notes,
                    &record.recorded_by,
                    &record.recorded_at,
                ),
            );
            if let Err(e) = inserted {
                // Dropping the transaction rolls everything back.
                if is_constraint_violation(&e) {
                    return Err(ValidationFailure::invalid(
                        "duplicate_attendance",
                        format!(
                            "attendance already recorded for enrollment {} on {}",
                            enrollment.id, ctx.date
                        ),
                    ));
                }
                return Err(e.into());
            }
            wrote_any = true;
            records.push(record);
        }
        if wrote_any {
            touched.push(enrollment.id.clone());
        }
    }

    let reports = calc::recalculate_reports(
        &tx,
        &touched,
        Some(&ctx.cycle_id),
        Some(&ctx.bimester_id),
    )?;

    tx.commit()?;

    tracing::info!(
        section = %ctx.section_id,
        date = %ctx.date,
        created = records.len(),
        reports,
        "bulk attendance registered"
    );

    Ok(BulkOutcome {
        created: records.len(),
        reports,
        records,
    })
}

/// Set-membership probe: which of the context's enrollments already have a
/// record on `date`.
fn enrollments_with_records(
    conn: &Connection,
    date: &str,
    ctx: &ValidatedContext,
) -> Result<Vec<String>, ValidationFailure> {
    if ctx.enrollments.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ctx.enrollments.len()].join(",");
    let sql = format!(
        "SELECT DISTINCT enrollment_id
         FROM student_class_attendance
         WHERE date = ? AND enrollment_id IN ({placeholders})"
    );
    let mut params: Vec<Value> = Vec::with_capacity(ctx.enrollments.len() + 1);
    params.push(Value::from(date.to_string()));
    for enrollment in &ctx.enrollments {
        params.push(Value::from(enrollment.id.clone()));
    }
    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(params_from_iter(params), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(info, _)
            if info.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
