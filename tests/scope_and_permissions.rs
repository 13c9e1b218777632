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

    fn request_err(&mut self, method: &str, params: Value) -> (String, String) {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        let code = value["error"]["code"]
            .as_str()
            .unwrap_or_else(|| panic!("missing error code in {}", value))
            .to_string();
        let kind = value["error"]["details"]["kind"]
            .as_str()
            .unwrap_or("")
            .to_string();
        (code, kind)
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

fn create_teacher(sidecar: &mut Sidecar, last_name: &str, role_id: &str) -> String {
    let teacher = sidecar.request_ok(
        "school.teachers.create",
        json!({ "firstName": "Teacher", "lastName": last_name, "roleId": role_id }),
    );
    str_field(&teacher, "userId")
}

fn add_class(sidecar: &mut Sidecar, teacher_id: &str, section_id: &str, course: &str) -> String {
    let course = sidecar.request_ok("school.courses.create", json!({ "name": course }));
    let assignment = sidecar.request_ok(
        "school.assignments.create",
        json!({
            "teacherId": teacher_id,
            "courseId": str_field(&course, "courseId"),
            "sectionId": section_id
        }),
    );
    let assignment_id = str_field(&assignment, "assignmentId");
    sidecar.request_ok(
        "school.schedules.create",
        json!({
            "assignmentId": assignment_id,
            "dayOfWeek": 1,
            "startTime": "08:00",
            "endTime": "08:45"
        }),
    );
    assignment_id
}

fn enroll_student(sidecar: &mut Sidecar, section_id: &str, cycle_id: &str, name: &str) -> String {
    let student = sidecar.request_ok(
        "school.students.create",
        json!({ "firstName": name, "lastName": "Perez" }),
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
    str_field(&enrollment, "enrollmentId")
}

#[test]
fn scope_status_and_absence_gates() {
    let workspace = temp_dir("attendanced-scope");
    let mut sidecar = Sidecar::start();
    sidecar.request_ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let cycle = sidecar.request_ok(
        "setup.cycles.create",
        json!({ "name": "2024", "startDate": "2024-03-01", "endDate": "2024-12-20" }),
    );
    let cycle_id = str_field(&cycle, "cycleId");
    sidecar.request_ok(
        "setup.bimesters.create",
        json!({
            "cycleId": cycle_id,
            "name": "B1",
            "startDate": "2024-03-01",
            "endDate": "2024-05-10"
        }),
    );

    let role_own = str_field(
        &sidecar.request_ok(
            "school.roles.create",
            json!({ "name": "Subject Teacher", "attendanceScope": "own" }),
        ),
        "roleId",
    );
    let role_section = str_field(
        &sidecar.request_ok(
            "school.roles.create",
            json!({ "name": "Section Guide", "attendanceScope": "section" }),
        ),
        "roleId",
    );

    let teacher_own = create_teacher(&mut sidecar, "Own", &role_own);
    let teacher_guide = create_teacher(&mut sidecar, "Guide", &role_section);

    let grade_id = str_field(
        &sidecar.request_ok("school.grades.create", json!({ "name": "6th Grade" })),
        "gradeId",
    );
    let section_a = str_field(
        &sidecar.request_ok(
            "school.sections.create",
            json!({ "gradeId": grade_id, "name": "A" }),
        ),
        "sectionId",
    );
    let grade_two = str_field(
        &sidecar.request_ok("school.grades.create", json!({ "name": "7th Grade" })),
        "gradeId",
    );
    let section_b = str_field(
        &sidecar.request_ok(
            "school.sections.create",
            json!({
                "gradeId": grade_two,
                "name": "B",
                "guideTeacherId": teacher_guide
            }),
        ),
        "sectionId",
    );

    let status_present = str_field(
        &sidecar.request_ok(
            "setup.statuses.create",
            json!({ "code": "P", "name": "Present" }),
        ),
        "statusId",
    );
    let status_absent = str_field(
        &sidecar.request_ok(
            "setup.statuses.create",
            json!({ "code": "A", "name": "Absent", "negative": true }),
        ),
        "statusId",
    );
    for role in [&role_own, &role_section] {
        sidecar.request_ok(
            "setup.rolePermissions.set",
            json!({
                "roleId": role,
                "statusId": status_present,
                "canCreate": true,
                "canModify": false
            }),
        );
        // Absences may be corrected, never recorded, by these roles.
        sidecar.request_ok(
            "setup.rolePermissions.set",
            json!({
                "roleId": role,
                "statusId": status_absent,
                "canCreate": false,
                "canModify": true
            }),
        );
    }

    enroll_student(&mut sidecar, &section_a, &cycle_id, "Luis");
    enroll_student(&mut sidecar, &section_b, &cycle_id, "Carmen");

    // `own` scope without an active assignment in the section.
    let (code, kind) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_own,
            "roleId": role_own,
            "date": "2024-04-08",
            "gradeId": grade_id,
            "sectionId": section_a,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(code, "scope_forbidden");
    assert_eq!(kind, "forbidden");

    // An assignment grants the scope and the Monday class makes it real.
    add_class(&mut sidecar, &teacher_own, &section_a, "History");
    let outcome = sidecar.request_ok(
        "attendance.registerBulk",
        json!({
            "userId": teacher_own,
            "roleId": role_own,
            "date": "2024-04-08",
            "gradeId": grade_id,
            "sectionId": section_a,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(outcome["createdAttendances"].as_u64(), Some(1));

    // `section` scope only reaches sections the teacher guides.
    let (code, _) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_guide,
            "roleId": role_section,
            "date": "2024-04-08",
            "gradeId": grade_id,
            "sectionId": section_a,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(code, "scope_forbidden");

    add_class(&mut sidecar, &teacher_guide, &section_b, "Geometry");
    let outcome = sidecar.request_ok(
        "attendance.registerBulk",
        json!({
            "userId": teacher_guide,
            "roleId": role_section,
            "date": "2024-04-08",
            "gradeId": grade_two,
            "sectionId": section_b,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(outcome["createdAttendances"].as_u64(), Some(1));

    // Modify-only statuses cannot be used for creation.
    let (code, kind) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_guide,
            "roleId": role_section,
            "date": "2024-04-15",
            "gradeId": grade_two,
            "sectionId": section_b,
            "attendanceStatusId": status_absent
        }),
    );
    assert_eq!(code, "status_not_allowed");
    assert_eq!(kind, "forbidden");

    let (code, kind) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_guide,
            "roleId": role_section,
            "date": "2024-04-15",
            "gradeId": grade_two,
            "sectionId": section_b,
            "attendanceStatusId": "no-such-status"
        }),
    );
    assert_eq!(code, "status_not_found");
    assert_eq!(kind, "not_found");

    // A role the user does not hold is rejected outright.
    let (code, _) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_own,
            "roleId": role_section,
            "date": "2024-04-15",
            "gradeId": grade_id,
            "sectionId": section_a,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(code, "role_not_assigned");

    // Section/grade pairing is checked even when the scope allows access.
    let (code, _) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_guide,
            "roleId": role_section,
            "date": "2024-04-15",
            "gradeId": grade_id,
            "sectionId": section_b,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(code, "section_not_in_grade");

    // An approved leave blocks the overlapped date but not the week after.
    sidecar.request_ok(
        "school.absences.create",
        json!({
            "teacherId": teacher_guide,
            "startDate": "2024-04-14",
            "endDate": "2024-04-16"
        }),
    );
    let (code, _) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_guide,
            "roleId": role_section,
            "date": "2024-04-15",
            "gradeId": grade_two,
            "sectionId": section_b,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(code, "teacher_on_leave");

    let outcome = sidecar.request_ok(
        "attendance.registerBulk",
        json!({
            "userId": teacher_guide,
            "roleId": role_section,
            "date": "2024-04-22",
            "gradeId": grade_two,
            "sectionId": section_b,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(outcome["createdAttendances"].as_u64(), Some(1));

    // Deactivated accounts are cut off before any other check.
    sidecar.request_ok(
        "school.users.setActive",
        json!({ "userId": teacher_own, "active": false }),
    );
    let (code, kind) = sidecar.request_err(
        "attendance.registerBulk",
        json!({
            "userId": teacher_own,
            "roleId": role_own,
            "date": "2024-04-15",
            "gradeId": grade_id,
            "sectionId": section_a,
            "attendanceStatusId": status_present
        }),
    );
    assert_eq!(code, "teacher_inactive");
    assert_eq!(kind, "forbidden");

    let _ = std::fs::remove_dir_all(workspace);
}
