use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::helpers::{
    exists, opt_bool, opt_str, require_i64, require_str, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn create_role(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = require_str(params, "name")?;
    let scope = require_str(params, "attendanceScope")?;
    if !matches!(scope.as_str(), "all" | "grade" | "section" | "own") {
        return Err(HandlerErr::bad_params(
            "attendanceScope must be one of all, grade, section, own",
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO roles(id, name, attendance_scope) VALUES(?1, ?2, ?3)",
        (&id, &name, &scope),
    )?;
    Ok(json!({ "roleId": id }))
}

/// Creates the user row, its teacher profile, and the role link in one
/// transaction so a teacher never exists half-provisioned.
fn create_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let first_name = require_str(params, "firstName")?;
    let last_name = require_str(params, "lastName")?;
    let role_id = require_str(params, "roleId")?;
    let active = opt_bool(params, "active", true);

    if !exists(conn, "SELECT 1 FROM roles WHERE id = ?", &role_id)? {
        return Err(HandlerErr::not_found("role not found"));
    }

    let id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO users(id, first_name, last_name, active) VALUES(?1, ?2, ?3, ?4)",
        (&id, &first_name, &last_name, active as i64),
    )?;
    tx.execute(
        "INSERT INTO teacher_profiles(user_id, active) VALUES(?1, ?2)",
        (&id, active as i64),
    )?;
    tx.execute(
        "INSERT INTO user_roles(user_id, role_id, active) VALUES(?1, ?2, 1)",
        (&id, &role_id),
    )?;
    tx.commit()?;

    Ok(json!({ "userId": id }))
}

fn set_user_active(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = require_str(params, "userId")?;
    let active = opt_bool(params, "active", true);

    let changed = conn.execute(
        "UPDATE users SET active = ?1 WHERE id = ?2",
        (active as i64, &user_id),
    )?;
    if changed == 0 {
        return Err(HandlerErr::not_found("user not found"));
    }
    Ok(json!({ "ok": true }))
}

fn create_grade(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = require_str(params, "name")?;
    let active = opt_bool(params, "active", true);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, name, active) VALUES(?1, ?2, ?3)",
        (&id, &name, active as i64),
    )?;
    Ok(json!({ "gradeId": id }))
}

fn create_section(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = require_str(params, "gradeId")?;
    let name = require_str(params, "name")?;
    let guide_teacher_id = opt_str(params, "guideTeacherId");
    let active = opt_bool(params, "active", true);

    if !exists(conn, "SELECT 1 FROM grades WHERE id = ?", &grade_id)? {
        return Err(HandlerErr::not_found("grade not found"));
    }
    if let Some(teacher) = &guide_teacher_id {
        if !exists(conn, "SELECT 1 FROM teacher_profiles WHERE user_id = ?", teacher)? {
            return Err(HandlerErr::not_found("guide teacher not found"));
        }
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, grade_id, name, guide_teacher_id, active)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (&id, &grade_id, &name, &guide_teacher_id, active as i64),
    )?;
    Ok(json!({ "sectionId": id }))
}

fn create_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = require_str(params, "name")?;

    let id = Uuid::new_v4().to_string();
    conn.execute("INSERT INTO courses(id, name) VALUES(?1, ?2)", (&id, &name))?;
    Ok(json!({ "courseId": id }))
}

fn create_assignment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = require_str(params, "teacherId")?;
    let course_id = require_str(params, "courseId")?;
    let section_id = require_str(params, "sectionId")?;
    let active = opt_bool(params, "active", true);

    if !exists(conn, "SELECT 1 FROM teacher_profiles WHERE user_id = ?", &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    if !exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    if !exists(conn, "SELECT 1 FROM sections WHERE id = ?", &section_id)? {
        return Err(HandlerErr::not_found("section not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO course_assignments(id, teacher_id, course_id, section_id, active)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (&id, &teacher_id, &course_id, &section_id, active as i64),
    )?;
    Ok(json!({ "assignmentId": id }))
}

/// Section and teacher are derived from the assignment so a schedule can
/// never point across sections.
fn create_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = require_str(params, "assignmentId")?;
    let day_of_week = require_i64(params, "dayOfWeek")?;
    let start_time = require_str(params, "startTime")?;
    let end_time = require_str(params, "endTime")?;
    let active = opt_bool(params, "active", true);

    if !(0..=6).contains(&day_of_week) {
        return Err(HandlerErr::bad_params("dayOfWeek must be 0-6 (Sunday = 0)"));
    }

    let assignment: Option<(String, String)> = conn
        .query_row(
            "SELECT section_id, teacher_id FROM course_assignments WHERE id = ?1",
            [&assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((section_id, teacher_id)) = assignment else {
        return Err(HandlerErr::not_found("course assignment not found"));
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schedules(id, section_id, assignment_id, teacher_id, day_of_week,
                               start_time, end_time, active)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            &id,
            &section_id,
            &assignment_id,
            &teacher_id,
            day_of_week,
            &start_time,
            &end_time,
            active as i64,
        ),
    )?;
    Ok(json!({ "scheduleId": id }))
}

fn create_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let first_name = require_str(params, "firstName")?;
    let last_name = require_str(params, "lastName")?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, first_name, last_name) VALUES(?1, ?2, ?3)",
        (&id, &first_name, &last_name),
    )?;
    Ok(json!({ "studentId": id }))
}

fn create_enrollment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = require_str(params, "studentId")?;
    let section_id = require_str(params, "sectionId")?;
    let cycle_id = require_str(params, "cycleId")?;
    let date_enrolled = require_str(params, "dateEnrolled")?;
    let status = opt_str(params, "status").unwrap_or_else(|| "ACTIVE".to_string());

    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    if !exists(conn, "SELECT 1 FROM sections WHERE id = ?", &section_id)? {
        return Err(HandlerErr::not_found("section not found"));
    }
    if !exists(conn, "SELECT 1 FROM school_cycles WHERE id = ?", &cycle_id)? {
        return Err(HandlerErr::not_found("school cycle not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO enrollments(id, student_id, section_id, cycle_id, status, date_enrolled)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (&id, &student_id, &section_id, &cycle_id, &status, &date_enrolled),
    )?;
    Ok(json!({ "enrollmentId": id }))
}

fn create_absence(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = require_str(params, "teacherId")?;
    let start_date = require_str(params, "startDate")?;
    let end_date = require_str(params, "endDate")?;
    let status = opt_str(params, "status").unwrap_or_else(|| "approved".to_string());

    if !exists(conn, "SELECT 1 FROM teacher_profiles WHERE user_id = ?", &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teacher_absences(id, teacher_id, start_date, end_date, status)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (&id, &teacher_id, &start_date, &end_date, &status),
    )?;
    Ok(json!({ "absenceId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "school.roles.create" => Some(with_conn(state, req, create_role)),
        "school.teachers.create" => Some(with_conn(state, req, create_teacher)),
        "school.users.setActive" => Some(with_conn(state, req, set_user_active)),
        "school.grades.create" => Some(with_conn(state, req, create_grade)),
        "school.sections.create" => Some(with_conn(state, req, create_section)),
        "school.courses.create" => Some(with_conn(state, req, create_course)),
        "school.assignments.create" => Some(with_conn(state, req, create_assignment)),
        "school.schedules.create" => Some(with_conn(state, req, create_schedule)),
        "school.students.create" => Some(with_conn(state, req, create_student)),
        "school.enrollments.create" => Some(with_conn(state, req, create_enrollment)),
        "school.absences.create" => Some(with_conn(state, req, create_absence)),
        _ => None,
    }
}
