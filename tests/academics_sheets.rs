use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
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
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn start(workspace: &Path) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_campusd"))
            .arg("--workspace")
            .arg(workspace)
            .env("CAMPUS_JWT_SECRET", "academics-test-secret")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn campusd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn call(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params, "token": token });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value["id"].as_str(), Some(id.as_str()));
        value
    }

    fn ok(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        let resp = self.call(method, params, token);
        assert_eq!(resp["ok"], true, "{} failed: {}", method, resp);
        resp["result"].clone()
    }

    fn fail(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        let resp = self.call(method, params, token);
        assert_eq!(resp["ok"], false, "{} unexpectedly succeeded: {}", method, resp);
        resp["error"].clone()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn webmaster(sc: &mut Sidecar) -> String {
    sc.ok(
        "admins.bootstrap",
        json!({ "username": "root", "password": "rootpass", "email": "root@campus.test" }),
        None,
    );
    let signed = sc.ok(
        "auth.admin.signin",
        json!({ "username": "root", "password": "rootpass" }),
        None,
    );
    signed["token"].as_str().expect("token").to_string()
}

const STUDENT_SHEET: &str = "username,name,email,gender,year,branch,section,phone,password
b190001,Asha Rao,asha@campus.test,F,E2,cse,A,9000000001,secret1
b190002,\"Kumar, Ravi\",ravi@campus.test,M,E2,CSE,A,,

b190003,No Branch,nb@campus.test,M,E2,EEE,A,,
,Missing Username,x@campus.test,,,,,,
b190004,Bad Mail,not-an-email,,,,,,
";

#[test]
fn student_sheet_upload_reports_and_applies() {
    let ws = temp_dir("campus-student-sheet");
    let mut sc = Sidecar::start(&ws);
    let w = webmaster(&mut sc);
    sc.ok("branches.create", json!({ "name": "CSE" }), Some(&w));

    let dry = sc.ok(
        "students.upload",
        json!({ "csv": STUDENT_SHEET, "defaultPassword": "welcome1", "dryRun": true }),
        Some(&w),
    );
    assert_eq!(dry["dryRun"], true);
    assert_eq!(dry["rowsTotal"], 5);
    assert_eq!(dry["rowsParsed"], 3);
    assert_eq!(dry["inserted"], 2);
    // Two rows fail parsing and one names a branch that does not exist.
    assert_eq!(dry["skipped"], 3);
    assert_eq!(dry["updated"], 0);
    let codes: Vec<&str> = dry["warnings"]
        .as_array()
        .expect("warnings")
        .iter()
        .filter_map(|w| w["code"].as_str())
        .collect();
    assert!(codes.contains(&"missing_field"), "{:?}", codes);
    assert!(codes.contains(&"bad_email"), "{:?}", codes);
    assert!(codes.contains(&"unknown_branch"), "{:?}", codes);

    let none = sc.ok("students.search", json!({}), Some(&w));
    assert_eq!(none["total"], 0);

    let applied = sc.ok(
        "students.upload",
        json!({ "csv": STUDENT_SHEET, "defaultPassword": "welcome1" }),
        Some(&w),
    );
    assert_eq!(applied["inserted"], 2);
    let again = sc.ok(
        "students.upload",
        json!({ "csv": STUDENT_SHEET, "defaultPassword": "welcome1" }),
        Some(&w),
    );
    assert_eq!(again["inserted"], 0);
    assert_eq!(again["updated"], 2);
    assert_eq!(again["skipped"], 3);
    assert_eq!(again["rowsTotal"], 5);

    let found = sc.ok("students.search", json!({ "query": "kumar" }), Some(&w));
    assert_eq!(found["total"], 1);
    assert_eq!(found["students"][0]["name"], "Kumar, Ravi");
    assert_eq!(found["students"][0]["branchName"], "CSE");

    // The blank password fell back to the default.
    sc.ok(
        "auth.student.signin",
        json!({ "username": "b190002", "password": "welcome1" }),
        None,
    );

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn grades_and_attendance_roll_up_per_semester() {
    let ws = temp_dir("campus-academics");
    let mut sc = Sidecar::start(&ws);
    let w = webmaster(&mut sc);
    let branch = sc.ok("branches.create", json!({ "name": "CSE" }), Some(&w));
    let branch_id = branch["branchId"].as_str().expect("branchId").to_string();
    let sem = sc.ok(
        "semesters.create",
        json!({ "year": "e2", "name": "sem-1" }),
        Some(&w),
    );
    assert_eq!(sem["year"], "E2");
    let sem_id = sem["semesterId"].as_str().expect("semesterId").to_string();

    let mut subject_ids = Vec::new();
    for (code, name, credits) in [("MA101", "Calculus", 4), ("CS101", "Programming", 3), ("PH101", "Physics", 2)] {
        let s = sc.ok(
            "subjects.create",
            json!({ "semesterId": sem_id, "branchId": branch_id, "code": code, "name": name, "credits": credits }),
            Some(&w),
        );
        subject_ids.push(s["subjectId"].as_str().expect("subjectId").to_string());
    }
    let err = sc.fail(
        "subjects.create",
        json!({ "semesterId": sem_id, "branchId": branch_id, "code": "ZZ1", "name": "Zero", "credits": 0 }),
        Some(&w),
    );
    assert_eq!(err["code"], "bad_params");

    sc.ok(
        "students.upload",
        json!({ "csv": STUDENT_SHEET, "defaultPassword": "welcome1" }),
        Some(&w),
    );

    let graded = sc.ok(
        "grades.upload",
        json!({
            "semesterId": sem_id,
            "csv": "username,subject_code,grade
B190001,ma101,A
B190001,CS101,ex
B190001,PH101,R
B190002,MA101,Z
B190009,MA101,A
B190002,XX999,B
"
        }),
        Some(&w),
    );
    assert_eq!(graded["inserted"], 3);
    assert_eq!(graded["skipped"], 3);
    assert_eq!(graded["rowsTotal"], 6);

    let student = sc.ok(
        "auth.student.signin",
        json!({ "username": "B190001", "password": "secret1" }),
        None,
    );
    let s = student["token"].as_str().expect("token").to_string();

    // (9*4 + 10*3 + 0*2) / 9
    let g = sc.ok("grades.get", json!({ "semesterId": sem_id }), Some(&s));
    assert_eq!(g["sgpa"], 7.33);
    assert_eq!(g["hasBacklog"], true);
    assert_eq!(g["creditsEarned"], 7.0);
    assert_eq!(g["subjects"].as_array().expect("subjects").len(), 3);

    let err = sc.fail(
        "grades.get",
        json!({ "semesterId": sem_id, "username": "B190002" }),
        Some(&s),
    );
    assert_eq!(err["code"], "forbidden");

    // Clearing the backlog replaces the row in place.
    let regraded = sc.ok(
        "grades.upload",
        json!({ "semesterId": sem_id, "csv": "username,subject_code,grade\nB190001,PH101,C\n" }),
        Some(&w),
    );
    assert_eq!(regraded["updated"], 1);
    let g = sc.ok(
        "grades.get",
        json!({ "semesterId": sem_id, "username": "b190001" }),
        Some(&w),
    );
    assert_eq!(g["sgpa"], 8.89);
    assert_eq!(g["hasBacklog"], false);

    let export = sc.ok("grades.export", json!({ "semesterId": sem_id }), Some(&w));
    assert_eq!(export["rowsExported"], 3);
    let csv = export["csv"].as_str().expect("csv");
    assert!(csv.starts_with("username,name,subject_code,grade,points\n"));
    assert!(csv.contains("B190001,Asha Rao,CS101,EX,10\n"), "{}", csv);

    let sheet = ws.join("attendance.csv");
    std::fs::write(
        &sheet,
        "username,subject_code,total_classes,attended_classes
B190001,MA101,40,36
B190001,CS101,40,20
B190001,PH101,10,12
B190001,PH101,ten,5
",
    )
    .expect("write attendance sheet");
    let att = sc.ok(
        "attendance.upload",
        json!({ "semesterId": sem_id, "inPath": sheet.to_string_lossy() }),
        Some(&w),
    );
    assert_eq!(att["inserted"], 2);
    assert_eq!(att["warningsCount"], 2);
    assert_eq!(att["skipped"], 2);
    assert_eq!(att["rowsTotal"], 4);

    let a = sc.ok("attendance.get", json!({ "semesterId": sem_id }), Some(&s));
    assert_eq!(a["overallPercentage"], 70.0);
    assert_eq!(a["shortage"], true);
    let cs = a["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .find(|r| r["code"] == "CS101")
        .expect("CS101 row");
    assert_eq!(cs["percentage"], 50.0);
    assert_eq!(cs["shortage"], true);

    // Referenced curriculum cannot be removed.
    let err = sc.fail("subjects.delete", json!({ "subjectId": subject_ids[0] }), Some(&w));
    assert_eq!(err["code"], "conflict");
    let err = sc.fail("branches.delete", json!({ "branchId": branch_id }), Some(&w));
    assert_eq!(err["code"], "conflict");

    let listed = sc.ok("subjects.list", json!({ "semesterId": sem_id }), Some(&s));
    assert_eq!(listed["subjects"].as_array().expect("subjects").len(), 3);

    let _ = std::fs::remove_dir_all(ws);
}
