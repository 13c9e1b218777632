use rusqlite::Connection;
use serde_json::json;

use crate::ipc::helpers::{opt_str, opt_str_vec, require_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::register;
use crate::validate::{self, BulkSubmission};

/// The bulk registration entry point: validation cascade, atomic write,
/// report recalculation. One teacher, one date, one section per call.
fn register_bulk(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission = BulkSubmission {
        user_id: require_str(params, "userId")?,
        role_id: require_str(params, "roleId")?,
        date: require_str(params, "date")?,
        grade_id: require_str(params, "gradeId")?,
        section_id: require_str(params, "sectionId")?,
        attendance_status_id: require_str(params, "attendanceStatusId")?,
        arrival_time: opt_str(params, "arrivalTime"),
        departure_time: opt_str(params, "departureTime"),
        notes: opt_str(params, "notes"),
        course_assignment_ids: opt_str_vec(params, "courseAssignmentIds")?,
    };

    let ctx = validate::validate_submission(conn, &submission)?;
    let outcome = register::register_bulk(conn, &ctx, &submission)?;

    let records = outcome
        .records
        .iter()
        .map(|r| serde_json::to_value(r).unwrap_or_else(|_| json!({})))
        .collect::<Vec<_>>();

    Ok(json!({
        "success": true,
        "createdAttendances": outcome.created,
        "createdClassAttendances": outcome.created,
        "createdReports": outcome.reports,
        "records": records,
    }))
}

fn list_records(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = opt_str(params, "enrollmentId");
    let section_id = opt_str(params, "sectionId");
    let date = opt_str(params, "date");

    let mut sql = String::from(
        "SELECT a.id, a.enrollment_id, e.student_id, a.schedule_id, a.assignment_id, a.date,
                a.status_code, a.arrival_time, a.departure_time, a.notes, a.recorded_by,
                a.recorded_at
         FROM student_class_attendance a
         JOIN enrollments e ON e.id = a.enrollment_id
         WHERE 1 = 1",
    );
    let mut params_vec: Vec<String> = Vec::new();
    if let Some(enrollment) = enrollment_id {
        params_vec.push(enrollment);
        sql.push_str(&format!(" AND a.enrollment_id = ?{}", params_vec.len()));
    }
    if let Some(section) = section_id {
        params_vec.push(section);
        sql.push_str(&format!(" AND e.section_id = ?{}", params_vec.len()));
    }
    if let Some(day) = date {
        params_vec.push(day);
        sql.push_str(&format!(" AND a.date = ?{}", params_vec.len()));
    }
    sql.push_str(" ORDER BY a.date, a.recorded_at, a.id");

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(rusqlite::params_from_iter(params_vec.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "enrollmentId": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "scheduleId": r.get::<_, String>(3)?,
                "courseAssignmentId": r.get::<_, String>(4)?,
                "date": r.get::<_, String>(5)?,
                "statusCode": r.get::<_, String>(6)?,
                "arrivalTime": r.get::<_, Option<String>>(7)?,
                "departureTime": r.get::<_, Option<String>>(8)?,
                "notes": r.get::<_, Option<String>>(9)?,
                "recordedBy": r.get::<_, String>(10)?,
                "recordedAt": r.get::<_, String>(11)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "count": records.len(), "records": records }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.registerBulk" => Some(with_conn(state, req, register_bulk)),
        "attendance.list" => Some(with_conn(state, req, list_records)),
        _ => None,
    }
}
