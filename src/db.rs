use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("attendance.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Bulk registration for a large section can hold the write lock for a while.
    conn.busy_timeout(Duration::from_secs(30))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_cycles(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            archived INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bimesters(
            id TEXT PRIMARY KEY,
            cycle_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(cycle_id) REFERENCES school_cycles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bimesters_cycle ON bimesters(cycle_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holidays(
            id TEXT PRIMARY KEY,
            bimester_id TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT,
            recovered INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(bimester_id) REFERENCES bimesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_holidays_bimester ON holidays(bimester_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_holidays_date ON holidays(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_weeks(
            id TEXT PRIMARY KEY,
            bimester_id TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            week_type TEXT NOT NULL DEFAULT 'regular',
            FOREIGN KEY(bimester_id) REFERENCES bimesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_weeks_bimester ON academic_weeks(bimester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            guide_teacher_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_grade ON sections(grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_profiles(
            user_id TEXT PRIMARY KEY,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS roles(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            attendance_scope TEXT NOT NULL DEFAULT 'own'
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_roles(
            user_id TEXT NOT NULL,
            role_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(user_id, role_id),
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(role_id) REFERENCES roles(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_assignments_teacher ON course_assignments(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_assignments_section ON course_assignments(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            assignment_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            day_of_week INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(assignment_id) REFERENCES course_assignments(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    // day_of_week is 0-6 with Sunday = 0.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_section_day ON schedules(section_id, day_of_week)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_teacher ON schedules(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            cycle_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            date_enrolled TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(cycle_id) REFERENCES school_cycles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_statuses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            negative INTEGER NOT NULL DEFAULT 0,
            excused INTEGER NOT NULL DEFAULT 0,
            temporal INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS role_attendance_permissions(
            role_id TEXT NOT NULL,
            status_id TEXT NOT NULL,
            can_create INTEGER NOT NULL DEFAULT 0,
            can_modify INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(role_id, status_id),
            FOREIGN KEY(role_id) REFERENCES roles(id),
            FOREIGN KEY(status_id) REFERENCES attendance_statuses(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_config(
            id TEXT PRIMARY KEY,
            risk_threshold_percentage REAL NOT NULL DEFAULT 80.0,
            late_threshold_time TEXT NOT NULL DEFAULT '08:15',
            mark_as_tardy_after_minutes INTEGER NOT NULL DEFAULT 10,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_absences(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'approved',
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_absences_teacher ON teacher_absences(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_class_attendance(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            date TEXT NOT NULL,
            schedule_id TEXT NOT NULL,
            assignment_id TEXT NOT NULL,
            status_id TEXT NOT NULL,
            status_code TEXT NOT NULL,
            arrival_time TEXT,
            departure_time TEXT,
            notes TEXT,
            recorded_by TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(schedule_id) REFERENCES schedules(id),
            FOREIGN KEY(status_id) REFERENCES attendance_statuses(id),
            UNIQUE(enrollment_id, schedule_id, date)
        )",
        [],
    )?;
    // The unique constraint above is the authoritative duplicate guard.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_attendance_enrollment_date
         ON student_class_attendance(enrollment_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_attendance_date ON student_class_attendance(date)",
        [],
    )?;
    ensure_attendance_audit_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_attendance_reports(
            enrollment_id TEXT PRIMARY KEY,
            present_count INTEGER NOT NULL DEFAULT 0,
            absent_count INTEGER NOT NULL DEFAULT 0,
            absent_justified_count INTEGER NOT NULL DEFAULT 0,
            temporal_count INTEGER NOT NULL DEFAULT 0,
            tardy_count INTEGER NOT NULL DEFAULT 0,
            attendance_percentage REAL NOT NULL DEFAULT 100.0,
            absence_percentage REAL NOT NULL DEFAULT 0.0,
            at_risk INTEGER NOT NULL DEFAULT 0,
            last_recalculated_at TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id)
        )",
        [],
    )?;
    ensure_reports_consecutive_absences(&conn)?;

    Ok(conn)
}

#[derive(Debug)]
pub struct AttendanceConfig {
    pub id: String,
    pub risk_threshold_percentage: f64,
    pub late_threshold_time: String,
    pub mark_as_tardy_after_minutes: i64,
}

fn select_active_config(conn: &Connection) -> rusqlite::Result<Option<AttendanceConfig>> {
    conn.query_row(
        "SELECT id, risk_threshold_percentage, late_threshold_time, mark_as_tardy_after_minutes
         FROM attendance_config
         WHERE active = 1
         ORDER BY id
         LIMIT 1",
        [],
        |r| {
            Ok(AttendanceConfig {
                id: r.get(0)?,
                risk_threshold_percentage: r.get(1)?,
                late_threshold_time: r.get(2)?,
                mark_as_tardy_after_minutes: r.get(3)?,
            })
        },
    )
    .optional()
}

/// Resolve the active attendance configuration, materializing the default row
/// when none is active. The fixed id keeps concurrent first calls idempotent.
pub fn active_config(conn: &Connection) -> rusqlite::Result<AttendanceConfig> {
    if let Some(cfg) = select_active_config(conn)? {
        return Ok(cfg);
    }
    conn.execute(
        "INSERT OR IGNORE INTO attendance_config(
            id, risk_threshold_percentage, late_threshold_time, mark_as_tardy_after_minutes, active
         ) VALUES('default', 80.0, '08:15', 10, 1)",
        [],
    )?;
    select_active_config(conn)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

// Older workspaces predate edit auditing on attendance facts.
fn ensure_attendance_audit_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "student_class_attendance", "last_modified_by")? {
        conn.execute(
            "ALTER TABLE student_class_attendance ADD COLUMN last_modified_by TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "student_class_attendance", "last_modified_at")? {
        conn.execute(
            "ALTER TABLE student_class_attendance ADD COLUMN last_modified_at TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "student_class_attendance", "modification_reason")? {
        conn.execute(
            "ALTER TABLE student_class_attendance ADD COLUMN modification_reason TEXT",
            [],
        )?;
    }
    Ok(())
}

fn ensure_reports_consecutive_absences(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_attendance_reports", "consecutive_absences")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE student_attendance_reports ADD COLUMN consecutive_absences INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
