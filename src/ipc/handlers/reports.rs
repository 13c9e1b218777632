use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::calc;
use crate::ipc::helpers::{opt_str, require_str, require_str_vec, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn recalculate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_ids = require_str_vec(params, "enrollmentIds")?;
    let cycle_id = opt_str(params, "cycleId");
    let bimester_id = opt_str(params, "bimesterId");

    let recalculated = calc::recalculate_reports(
        conn,
        &enrollment_ids,
        cycle_id.as_deref(),
        bimester_id.as_deref(),
    )?;

    tracing::info!(recalculated, "attendance reports recalculated");
    Ok(json!({ "recalculated": recalculated }))
}

fn get_report(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = require_str(params, "enrollmentId")?;

    let report = conn
        .query_row(
            "SELECT present_count, absent_count, absent_justified_count, temporal_count,
                    tardy_count, attendance_percentage, absence_percentage, at_risk,
                    consecutive_absences, last_recalculated_at
             FROM student_attendance_reports
             WHERE enrollment_id = ?1",
            [&enrollment_id],
            |r| {
                Ok(json!({
                    "enrollmentId": enrollment_id,
                    "presentCount": r.get::<_, i64>(0)?,
                    "absentCount": r.get::<_, i64>(1)?,
                    "absentJustifiedCount": r.get::<_, i64>(2)?,
                    "temporalCount": r.get::<_, i64>(3)?,
                    "tardyCount": r.get::<_, i64>(4)?,
                    "attendancePercentage": r.get::<_, f64>(5)?,
                    "absencePercentage": r.get::<_, f64>(6)?,
                    "atRisk": r.get::<_, i64>(7)? != 0,
                    "consecutiveAbsences": r.get::<_, i64>(8)?,
                    "lastRecalculatedAt": r.get::<_, Option<String>>(9)?,
                }))
            },
        )
        .optional()?;

    match report {
        Some(report) => Ok(json!({ "report": report })),
        None => Err(HandlerErr::not_found("no report for this enrollment")),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.recalculate" => Some(with_conn(state, req, recalculate)),
        "reports.get" => Some(with_conn(state, req, get_report)),
        _ => None,
    }
}
