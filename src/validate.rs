use chrono::{Datelike, Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};

use crate::calendar::{self, TemporalResolution, WeekType};
use crate::db::{self, AttendanceConfig};

/// One bulk submission: one teacher, one date, one section.
#[derive(Debug, Clone)]
pub struct BulkSubmission {
    pub user_id: String,
    pub role_id: String,
    pub date: String,
    pub grade_id: String,
    pub section_id: String,
    pub attendance_status_id: String,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    pub notes: Option<String>,
    pub course_assignment_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    Forbidden,
    Validation,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::Forbidden => "forbidden",
            FailureKind::Validation => "validation",
            FailureKind::Internal => "internal",
        }
    }
}

/// The single error a failing layer raises: a stable machine-readable code
/// plus a human-readable message. Layers never aggregate failures.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub kind: FailureKind,
    pub code: &'static str,
    pub message: String,
}

impl ValidationFailure {
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NotFound,
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Forbidden,
            code,
            message: message.into(),
        }
    }

    pub fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Validation,
            code,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for ValidationFailure {
    fn from(e: rusqlite::Error) -> Self {
        Self {
            kind: FailureKind::Internal,
            code: "db_query_failed",
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceScope {
    All,
    Grade,
    Section,
    Own,
}

impl AttendanceScope {
    pub fn from_db(value: &str) -> AttendanceScope {
        match value {
            "all" => AttendanceScope::All,
            "grade" => AttendanceScope::Grade,
            "section" => AttendanceScope::Section,
            _ => AttendanceScope::Own,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleSlot {
    pub id: String,
    pub assignment_id: String,
}

#[derive(Debug, Clone)]
pub struct EligibleEnrollment {
    pub id: String,
    pub student_id: String,
}

#[derive(Debug, Clone)]
pub struct StatusRow {
    pub id: String,
    pub code: String,
}

/// Everything the write phase needs, resolved and checked once.
#[derive(Debug)]
pub struct ValidatedContext {
    pub user_id: String,
    pub role_id: String,
    pub date: String,
    pub day_of_week: u32,
    pub cycle_id: String,
    pub bimester_id: String,
    pub grade_id: String,
    pub section_id: String,
    pub schedules: Vec<ScheduleSlot>,
    pub enrollments: Vec<EligibleEnrollment>,
    pub status: StatusRow,
    pub config: AttendanceConfig,
}

/// The ordered legality cascade for a bulk submission. Layers run in a fixed
/// order and stop at the first failure; the per-enrollment duplicate check is
/// deferred to the write phase.
pub fn validate_submission(
    conn: &Connection,
    sub: &BulkSubmission,
) -> Result<ValidatedContext, ValidationFailure> {
    // Layer 1: the submitting user is an active teacher holding the role.
    let user_active: Option<i64> = conn
        .query_row(
            "SELECT active FROM users WHERE id = ?1",
            [&sub.user_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_active) = user_active else {
        return Err(ValidationFailure::not_found(
            "teacher_not_found",
            "user does not exist",
        ));
    };
    if user_active == 0 {
        return Err(ValidationFailure::forbidden(
            "teacher_inactive",
            "user account is inactive",
        ));
    }
    let teacher_active: Option<i64> = conn
        .query_row(
            "SELECT active FROM teacher_profiles WHERE user_id = ?1",
            [&sub.user_id],
            |r| r.get(0),
        )
        .optional()?;
    match teacher_active {
        Some(1) => {}
        _ => {
            return Err(ValidationFailure::forbidden(
                "not_a_teacher",
                "user has no active teacher profile",
            ));
        }
    }
    let scope_raw: Option<String> = conn
        .query_row(
            "SELECT r.attendance_scope
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             WHERE ur.user_id = ?1 AND ur.role_id = ?2 AND ur.active = 1",
            [&sub.user_id, &sub.role_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(scope_raw) = scope_raw else {
        return Err(ValidationFailure::forbidden(
            "role_not_assigned",
            "role is not actively assigned to this user",
        ));
    };
    let scope = AttendanceScope::from_db(&scope_raw);

    // Layer 2: the role's attendance-create scope must reach this section.
    check_scope(conn, scope, &sub.user_id, &sub.section_id)?;

    // Layer 3: the date is not in the future and an active cycle covers it.
    let date = NaiveDate::parse_from_str(&sub.date, "%Y-%m-%d").map_err(|_| {
        ValidationFailure::invalid("bad_date", "date must be an ISO date (YYYY-MM-DD)")
    })?;
    if date > Local::now().date_naive() {
        return Err(ValidationFailure::invalid(
            "future_date",
            "attendance cannot be recorded for a future date",
        ));
    }
    let resolved = match calendar::resolve(conn, &sub.date)? {
        TemporalResolution::NoActiveCycle => {
            return Err(ValidationFailure::invalid(
                "no_active_cycle",
                "no active school cycle covers this date",
            ));
        }
        // Layer 4: an active bimester of the cycle covers the date.
        TemporalResolution::NoActiveBimester => {
            return Err(ValidationFailure::invalid(
                "no_active_bimester",
                "no active bimester covers this date",
            ));
        }
        TemporalResolution::Resolved(ctx) => ctx,
    };

    // Layer 5: holidays block attendance unless the day was recovered.
    if let Some(holiday) = &resolved.holiday {
        if !holiday.recovered {
            return Err(ValidationFailure::invalid(
                "holiday_not_recovered",
                "date falls on a holiday that was not recovered",
            ));
        }
    }

    // Layer 6: break weeks never take attendance.
    if resolved.week_type == Some(WeekType::Break) {
        return Err(ValidationFailure::invalid(
            "break_week",
            "date falls within a break week",
        ));
    }

    // Layer 7: the teacher must have at least one class in this section that day.
    let day_of_week = date.weekday().num_days_from_sunday();
    let mut stmt = conn.prepare(
        "SELECT id, assignment_id
         FROM schedules
         WHERE section_id = ?1 AND teacher_id = ?2 AND day_of_week = ?3 AND active = 1
         ORDER BY start_time",
    )?;
    let schedules = stmt
        .query_map(
            (&sub.section_id, &sub.user_id, day_of_week),
            |r| {
                Ok(ScheduleSlot {
                    id: r.get(0)?,
                    assignment_id: r.get(1)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    if schedules.is_empty() {
        return Err(ValidationFailure::invalid(
            "no_schedules_for_day",
            "no classes are scheduled for this teacher and section on that day",
        ));
    }

    // Layer 8: the section must have eligible students for the cycle.
    let mut stmt = conn.prepare(
        "SELECT id, student_id
         FROM enrollments
         WHERE section_id = ?1 AND cycle_id = ?2 AND status = 'ACTIVE' AND date_enrolled <= ?3
         ORDER BY date_enrolled, id",
    )?;
    let enrollments = stmt
        .query_map(
            (&sub.section_id, &resolved.cycle.id, &sub.date),
            |r| {
                Ok(EligibleEnrollment {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    if enrollments.is_empty() {
        return Err(ValidationFailure::invalid(
            "no_eligible_students",
            "no active enrollments in this section were enrolled on or before the date",
        ));
    }

    // Layer 9: the status exists, is active, and the role may create with it.
    let status: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT id, code, active FROM attendance_statuses WHERE id = ?1",
            [&sub.attendance_status_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((status_id, status_code, status_active)) = status else {
        return Err(ValidationFailure::not_found(
            "status_not_found",
            "attendance status does not exist",
        ));
    };
    if status_active == 0 {
        return Err(ValidationFailure::not_found(
            "status_not_found",
            "attendance status is inactive",
        ));
    }
    let permission: Option<(i64, i64)> = conn
        .query_row(
            "SELECT can_create, can_modify
             FROM role_attendance_permissions
             WHERE role_id = ?1 AND status_id = ?2",
            [&sub.role_id, &status_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match permission {
        Some((can_create, _)) if can_create != 0 => {}
        Some((_, can_modify)) if can_modify != 0 => {
            // Modify-only grants do not cover creation.
            return Err(ValidationFailure::forbidden(
                "status_not_allowed",
                "role may modify but not create records with this status",
            ));
        }
        _ => {
            return Err(ValidationFailure::forbidden(
                "status_not_allowed",
                "role has no create permission for this status",
            ));
        }
    }

    // Layer 10: resolve the active configuration; always succeeds.
    let config = db::active_config(conn)?;

    // Layer 11: the teacher must not be on an approved/active absence.
    let on_leave: Option<i64> = conn
        .query_row(
            "SELECT 1
             FROM teacher_absences
             WHERE teacher_id = ?1
               AND status IN ('approved', 'active')
               AND start_date <= ?2 AND end_date >= ?2
             LIMIT 1",
            [&sub.user_id, &sub.date],
            |r| r.get(0),
        )
        .optional()?;
    if on_leave.is_some() {
        return Err(ValidationFailure::invalid(
            "teacher_on_leave",
            "teacher has an approved absence overlapping this date",
        ));
    }

    // Layer 12: grade and section exist, are active, and belong together.
    let grade_active: Option<i64> = conn
        .query_row(
            "SELECT active FROM grades WHERE id = ?1",
            [&sub.grade_id],
            |r| r.get(0),
        )
        .optional()?;
    match grade_active {
        None => {
            return Err(ValidationFailure::not_found(
                "grade_not_found",
                "grade does not exist",
            ));
        }
        Some(0) => {
            return Err(ValidationFailure::invalid(
                "grade_inactive",
                "grade is inactive",
            ));
        }
        Some(_) => {}
    }
    let section: Option<(String, i64)> = conn
        .query_row(
            "SELECT grade_id, active FROM sections WHERE id = ?1",
            [&sub.section_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((section_grade_id, section_active)) = section else {
        return Err(ValidationFailure::not_found(
            "section_not_found",
            "section does not exist",
        ));
    };
    if section_active == 0 {
        return Err(ValidationFailure::invalid(
            "section_inactive",
            "section is inactive",
        ));
    }
    if section_grade_id != sub.grade_id {
        return Err(ValidationFailure::invalid(
            "section_not_in_grade",
            "section does not belong to the given grade",
        ));
    }

    Ok(ValidatedContext {
        user_id: sub.user_id.clone(),
        role_id: sub.role_id.clone(),
        date: sub.date.clone(),
        day_of_week,
        cycle_id: resolved.cycle.id,
        bimester_id: resolved.bimester.id,
        grade_id: sub.grade_id.clone(),
        section_id: sub.section_id.clone(),
        schedules,
        enrollments,
        status: StatusRow {
            id: status_id,
            code: status_code,
        },
        config,
    })
}

/// `all` always passes; `grade` and `section` require the teacher to guide
/// the section; `own` requires an active course assignment in it.
fn check_scope(
    conn: &Connection,
    scope: AttendanceScope,
    user_id: &str,
    section_id: &str,
) -> Result<(), ValidationFailure> {
    let granted = match scope {
        AttendanceScope::All => true,
        AttendanceScope::Grade | AttendanceScope::Section => {
            conn.query_row(
                "SELECT 1 FROM sections WHERE id = ?1 AND guide_teacher_id = ?2",
                [section_id, user_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some()
        }
        AttendanceScope::Own => {
            conn.query_row(
                "SELECT 1
                 FROM course_assignments
                 WHERE teacher_id = ?1 AND section_id = ?2 AND active = 1
                 LIMIT 1",
                [user_id, section_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some()
        }
    };
    if granted {
        Ok(())
    } else {
        Err(ValidationFailure::forbidden(
            "scope_forbidden",
            "role scope does not grant attendance access to this section",
        ))
    }
}
