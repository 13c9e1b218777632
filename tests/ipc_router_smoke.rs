use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Sidecar {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn start() -> Sidecar {
        let exe = env!("CARGO_BIN_EXE_attendanced");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn attendanced");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            _child: child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
            let code = value["error"]["code"].as_str().unwrap_or("unknown");
            assert_ne!(
                code, "not_implemented",
                "unexpected unknown method for {}",
                method
            );
        }
        value
    }

    fn request_ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("attendanced-router-smoke");
    let bundle_out = workspace.join("smoke-backup.attbackup.zip");

    let mut sidecar = Sidecar::start();

    let _ = sidecar.request("health", json!({}));
    sidecar.request_ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let cycle = sidecar.request_ok(
        "setup.cycles.create",
        json!({ "name": "2024", "startDate": "2024-03-01", "endDate": "2024-12-20" }),
    );
    let cycle_id = str_field(&cycle, "cycleId");
    let bimester = sidecar.request_ok(
        "setup.bimesters.create",
        json!({
            "cycleId": cycle_id,
            "name": "B1",
            "startDate": "2024-03-01",
            "endDate": "2024-05-10"
        }),
    );
    let bimester_id = str_field(&bimester, "bimesterId");
    let _ = sidecar.request_ok(
        "setup.holidays.create",
        json!({ "bimesterId": bimester_id, "date": "2024-05-01", "recovered": false }),
    );
    let _ = sidecar.request_ok(
        "setup.weeks.create",
        json!({
            "bimesterId": bimester_id,
            "startDate": "2024-03-04",
            "endDate": "2024-03-10",
            "weekType": "regular"
        }),
    );
    let _ = sidecar.request_ok("setup.config.get", json!({}));
    let _ = sidecar.request_ok(
        "setup.config.update",
        json!({ "markAsTardyAfterMinutes": 5 }),
    );

    let role = sidecar.request_ok(
        "school.roles.create",
        json!({ "name": "Teacher", "attendanceScope": "all" }),
    );
    let role_id = str_field(&role, "roleId");
    let teacher = sidecar.request_ok(
        "school.teachers.create",
        json!({ "firstName": "Smoke", "lastName": "Teacher", "roleId": role_id }),
    );
    let teacher_id = str_field(&teacher, "userId");
    let grade = sidecar.request_ok("school.grades.create", json!({ "name": "Smoke Grade" }));
    let grade_id = str_field(&grade, "gradeId");
    let section = sidecar.request_ok(
        "school.sections.create",
        json!({ "gradeId": grade_id, "name": "S" }),
    );
    let section_id = str_field(&section, "sectionId");
    let course = sidecar.request_ok("school.courses.create", json!({ "name": "Smoke Course" }));
    let assignment = sidecar.request_ok(
        "school.assignments.create",
        json!({
            "teacherId": teacher_id,
            "courseId": str_field(&course, "courseId"),
            "sectionId": section_id
        }),
    );
    let _ = sidecar.request_ok(
        "school.schedules.create",
        json!({
            "assignmentId": str_field(&assignment, "assignmentId"),
            "dayOfWeek": 1,
            "startTime": "08:00",
            "endTime": "08:45"
        }),
    );
    let student = sidecar.request_ok(
        "school.students.create",
        json!({ "firstName": "Smoke", "lastName": "Student" }),
    );
    let enrollment = sidecar.request_ok(
        "school.enrollments.create",
        json!({
            "studentId": str_field(&student, "studentId"),
            "sectionId": section_id,
            "cycleId": cycle_id,
            "dateEnrolled": "2024-03-01"
        }),
    );
    let enrollment_id = str_field(&enrollment, "enrollmentId");
    let _ = sidecar.request_ok(
        "school.absences.create",
        json!({
            "teacherId": teacher_id,
            "startDate": "2024-05-06",
            "endDate": "2024-05-07"
        }),
    );
    let _ = sidecar.request_ok(
        "school.users.setActive",
        json!({ "userId": teacher_id, "active": true }),
    );

    let status = sidecar.request_ok(
        "setup.statuses.create",
        json!({ "code": "P", "name": "Present" }),
    );
    let status_id = str_field(&status, "statusId");
    let _ = sidecar.request_ok(
        "setup.rolePermissions.set",
        json!({ "roleId": role_id, "statusId": status_id, "canCreate": true, "canModify": false }),
    );

    let outcome = sidecar.request_ok(
        "attendance.registerBulk",
        json!({
            "userId": teacher_id,
            "roleId": role_id,
            "date": "2024-04-08",
            "gradeId": grade_id,
            "sectionId": section_id,
            "attendanceStatusId": status_id
        }),
    );
    assert_eq!(outcome["createdAttendances"].as_u64(), Some(1));

    let _ = sidecar.request_ok("attendance.list", json!({ "sectionId": section_id }));
    let _ = sidecar.request_ok(
        "reports.recalculate",
        json!({ "enrollmentIds": [enrollment_id] }),
    );
    let _ = sidecar.request_ok("reports.get", json!({ "enrollmentId": enrollment_id }));

    let _ = sidecar.request_ok(
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = sidecar.request_ok(
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );

    let _ = std::fs::remove_dir_all(workspace);
}
