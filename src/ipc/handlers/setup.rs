use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::calendar::WeekType;
use crate::db;
use crate::ipc::helpers::{
    exists, opt_bool, opt_f64, opt_i64, opt_str, require_bool, require_str, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn create_cycle(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = require_str(params, "name")?;
    let start_date = require_str(params, "startDate")?;
    let end_date = require_str(params, "endDate")?;
    let active = opt_bool(params, "active", true);
    let archived = opt_bool(params, "archived", false);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO school_cycles(id, name, start_date, end_date, active, archived)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (&id, &name, &start_date, &end_date, active as i64, archived as i64),
    )?;
    Ok(json!({ "cycleId": id }))
}

fn create_bimester(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let cycle_id = require_str(params, "cycleId")?;
    let name = require_str(params, "name")?;
    let start_date = require_str(params, "startDate")?;
    let end_date = require_str(params, "endDate")?;
    let active = opt_bool(params, "active", true);

    if !exists(conn, "SELECT 1 FROM school_cycles WHERE id = ?", &cycle_id)? {
        return Err(HandlerErr::not_found("school cycle not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO bimesters(id, cycle_id, name, start_date, end_date, active)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (&id, &cycle_id, &name, &start_date, &end_date, active as i64),
    )?;
    Ok(json!({ "bimesterId": id }))
}

fn create_holiday(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let bimester_id = require_str(params, "bimesterId")?;
    let date = require_str(params, "date")?;
    let description = opt_str(params, "description");
    let recovered = opt_bool(params, "recovered", false);

    if !exists(conn, "SELECT 1 FROM bimesters WHERE id = ?", &bimester_id)? {
        return Err(HandlerErr::not_found("bimester not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO holidays(id, bimester_id, date, description, recovered)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (&id, &bimester_id, &date, &description, recovered as i64),
    )?;
    Ok(json!({ "holidayId": id }))
}

fn create_week(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let bimester_id = require_str(params, "bimesterId")?;
    let start_date = require_str(params, "startDate")?;
    let end_date = require_str(params, "endDate")?;
    let week_type = require_str(params, "weekType")?;

    if week_type != WeekType::Regular.as_str() && week_type != WeekType::Break.as_str() {
        return Err(HandlerErr::bad_params("weekType must be regular or break"));
    }
    if !exists(conn, "SELECT 1 FROM bimesters WHERE id = ?", &bimester_id)? {
        return Err(HandlerErr::not_found("bimester not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_weeks(id, bimester_id, start_date, end_date, week_type)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (&id, &bimester_id, &start_date, &end_date, &week_type),
    )?;
    Ok(json!({ "weekId": id }))
}

fn create_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = require_str(params, "code")?;
    let name = require_str(params, "name")?;
    let negative = opt_bool(params, "negative", false);
    let excused = opt_bool(params, "excused", false);
    let temporal = opt_bool(params, "temporal", false);
    let active = opt_bool(params, "active", true);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_statuses(id, code, name, negative, excused, temporal, active)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        (
            &id,
            &code,
            &name,
            negative as i64,
            excused as i64,
            temporal as i64,
            active as i64,
        ),
    )?;
    Ok(json!({ "statusId": id }))
}

fn set_role_permission(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role_id = require_str(params, "roleId")?;
    let status_id = require_str(params, "statusId")?;
    let can_create = require_bool(params, "canCreate")?;
    let can_modify = require_bool(params, "canModify")?;

    if !exists(conn, "SELECT 1 FROM roles WHERE id = ?", &role_id)? {
        return Err(HandlerErr::not_found("role not found"));
    }
    if !exists(conn, "SELECT 1 FROM attendance_statuses WHERE id = ?", &status_id)? {
        return Err(HandlerErr::not_found("attendance status not found"));
    }

    conn.execute(
        "INSERT INTO role_attendance_permissions(role_id, status_id, can_create, can_modify)
         VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(role_id, status_id) DO UPDATE SET
           can_create = excluded.can_create,
           can_modify = excluded.can_modify",
        (&role_id, &status_id, can_create as i64, can_modify as i64),
    )?;
    Ok(json!({ "ok": true }))
}

fn config_json(cfg: &db::AttendanceConfig) -> serde_json::Value {
    json!({
        "id": cfg.id,
        "riskThresholdPercentage": cfg.risk_threshold_percentage,
        "lateThresholdTime": cfg.late_threshold_time,
        "markAsTardyAfterMinutes": cfg.mark_as_tardy_after_minutes,
    })
}

fn get_config(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let cfg = db::active_config(conn)?;
    Ok(json!({ "config": config_json(&cfg) }))
}

fn update_config(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    // Materialize the default first so updates always have a target row.
    let cfg = db::active_config(conn)?;

    if let Some(risk) = opt_f64(params, "riskThresholdPercentage") {
        conn.execute(
            "UPDATE attendance_config SET risk_threshold_percentage = ?1 WHERE id = ?2",
            (risk, &cfg.id),
        )?;
    }
    if let Some(threshold) = opt_str(params, "lateThresholdTime") {
        conn.execute(
            "UPDATE attendance_config SET late_threshold_time = ?1 WHERE id = ?2",
            (&threshold, &cfg.id),
        )?;
    }
    if let Some(minutes) = opt_i64(params, "markAsTardyAfterMinutes") {
        conn.execute(
            "UPDATE attendance_config SET mark_as_tardy_after_minutes = ?1 WHERE id = ?2",
            (minutes, &cfg.id),
        )?;
    }

    let updated = db::active_config(conn)?;
    Ok(json!({ "config": config_json(&updated) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.cycles.create" => Some(with_conn(state, req, create_cycle)),
        "setup.bimesters.create" => Some(with_conn(state, req, create_bimester)),
        "setup.holidays.create" => Some(with_conn(state, req, create_holiday)),
        "setup.weeks.create" => Some(with_conn(state, req, create_week)),
        "setup.statuses.create" => Some(with_conn(state, req, create_status)),
        "setup.rolePermissions.set" => Some(with_conn(state, req, set_role_permission)),
        "setup.config.get" => Some(with_conn(state, req, get_config)),
        "setup.config.update" => Some(with_conn(state, req, update_config)),
        _ => None,
    }
}
