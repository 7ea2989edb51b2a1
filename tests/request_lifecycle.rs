use rusqlite::Connection;
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
            .env("CAMPUS_JWT_SECRET", "lifecycle-test-secret")
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

/// Bootstraps a webmaster and one student; returns (webmaster token, student token).
fn seed(sc: &mut Sidecar) -> (String, String) {
    sc.ok(
        "admins.bootstrap",
        json!({ "username": "Root", "password": "rootpass", "email": "root@campus.test" }),
        None,
    );
    let admin = sc.ok(
        "auth.admin.signin",
        json!({ "username": "root", "password": "rootpass" }),
        None,
    );
    let w = admin["token"].as_str().expect("admin token").to_string();

    let branch = sc.ok("branches.create", json!({ "name": "CSE" }), Some(&w));
    sc.ok(
        "students.create",
        json!({
            "username": "b190001",
            "name": "Asha Rao",
            "email": "asha@campus.test",
            "gender": "F",
            "year": "E2",
            "branchId": branch["branchId"],
            "password": "secret1"
        }),
        Some(&w),
    );
    let student = sc.ok(
        "auth.student.signin",
        json!({ "username": "B190001", "password": "secret1" }),
        None,
    );
    assert_eq!(student["student"]["username"], "B190001");
    let s = student["token"].as_str().expect("student token").to_string();
    (w, s)
}

fn admin_token(sc: &mut Sidecar, w: &str, username: &str, role: &str) -> String {
    sc.ok(
        "admins.create",
        json!({
            "username": username,
            "password": "staffpass",
            "email": format!("{}@campus.test", username),
            "role": role
        }),
        Some(w),
    );
    let signed = sc.ok(
        "auth.admin.signin",
        json!({ "username": username, "password": "staffpass" }),
        None,
    );
    signed["token"].as_str().expect("token").to_string()
}

/// Moves a request's window into the past behind the sidecar's back.
fn close_window(ws: &Path, table: &str, id: &str) {
    let conn = Connection::open(ws.join("campus.sqlite3")).expect("open workspace db");
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .expect("busy timeout");
    let changed = conn
        .execute(
            &format!("UPDATE {} SET ends_at = '2020-01-01T00:00:00Z' WHERE id = ?", table),
            [id],
        )
        .expect("rewrite ends_at");
    assert_eq!(changed, 1);
}

fn add_student(sc: &mut Sidecar, w: &str, username: &str) -> String {
    sc.ok(
        "students.create",
        json!({
            "username": username,
            "name": format!("Student {}", username),
            "email": format!("{}@campus.test", username),
            "gender": "M",
            "year": "E3",
            "password": "secret1"
        }),
        Some(w),
    );
    let signed = sc.ok(
        "auth.student.signin",
        json!({ "username": username, "password": "secret1" }),
        None,
    );
    signed["token"].as_str().expect("student token").to_string()
}

fn outing(sc: &mut Sidecar, s: &str, day: &str) -> String {
    let created = sc.ok(
        "outings.create",
        json!({
            "reason": "errands",
            "fromTime": format!("{}T09:00:00Z", day),
            "toTime": format!("{}T12:00:00Z", day)
        }),
        Some(s),
    );
    created["request"]["id"].as_str().expect("id").to_string()
}

#[test]
fn outing_is_approved_checked_out_and_returned() {
    let ws = temp_dir("campus-lifecycle");
    let mut sc = Sidecar::start(&ws);
    let (w, s) = seed(&mut sc);
    let gate = admin_token(&mut sc, &w, "gate1", "security");
    let warden = admin_token(&mut sc, &w, "warden1", "warden");

    let created = sc.ok(
        "outings.create",
        json!({
            "reason": "  market  ",
            "fromTime": "2099-01-10T10:00:00+05:30",
            "toTime": "2099-01-10T14:00:00+05:30"
        }),
        Some(&s),
    );
    let req = &created["request"];
    assert_eq!(req["status"], "pending");
    assert_eq!(req["reason"], "market");
    assert_eq!(req["fromTime"], "2099-01-10T04:30:00Z");
    assert_eq!(req["endsAt"], "2099-01-10T08:30:00Z");
    let id = req["id"].as_str().expect("id").to_string();

    // One open request at a time, across kinds.
    let err = sc.fail(
        "outpasses.create",
        json!({ "reason": "home", "fromDay": "2099-02-01", "toDay": "2099-02-03" }),
        Some(&s),
    );
    assert_eq!(err["code"], "conflict");
    assert_eq!(err["details"]["kind"], "outing");
    assert_eq!(err["details"]["id"], id.as_str());

    let pending = sc.ok("requests.list", json!({ "kind": "outing" }), Some(&warden));
    assert_eq!(pending["requests"].as_array().expect("rows").len(), 1);
    assert_eq!(pending["requests"][0]["username"], "B190001");

    // Security staff watch the gate but do not decide.
    let err = sc.fail(
        "requests.approve",
        json!({ "kind": "outing", "id": id }),
        Some(&gate),
    );
    assert_eq!(err["code"], "forbidden");

    let approved = sc.ok(
        "requests.approve",
        json!({ "kind": "outing", "id": id, "message": "back by 2" }),
        Some(&warden),
    );
    assert_eq!(approved["request"]["status"], "approved");
    assert_eq!(approved["request"]["issuedBy"], "warden1");
    assert_eq!(approved["request"]["message"], "back by 2");

    let err = sc.fail(
        "requests.reject",
        json!({ "kind": "outing", "id": id }),
        Some(&w),
    );
    assert_eq!(err["code"], "conflict");
    assert_eq!(err["details"]["status"], "approved");

    let out = sc.ok(
        "requests.checkOut",
        json!({ "kind": "outing", "id": id }),
        Some(&gate),
    );
    assert!(out["request"]["outTime"].is_string());

    let profile = sc.ok("students.get", json!({}), Some(&s));
    assert_eq!(profile["student"]["isInCampus"], false);
    assert_eq!(profile["student"]["openRequest"]["id"], id.as_str());

    let summary = sc.ok("presence.summary", json!({}), Some(&gate));
    assert_eq!(summary["inCampus"], 0);
    assert_eq!(summary["outOfCampus"], 1);
    let outside = sc.ok("presence.outside", json!({}), Some(&warden));
    assert_eq!(outside["students"][0]["request"]["id"], id.as_str());

    let err = sc.fail(
        "requests.checkOut",
        json!({ "kind": "outing", "id": id }),
        Some(&gate),
    );
    assert_eq!(err["code"], "conflict");

    let back = sc.ok(
        "requests.checkIn",
        json!({ "kind": "outing", "id": id }),
        Some(&gate),
    );
    assert_eq!(back["late"], false);
    assert!(back["request"]["inTime"].is_string());

    let profile = sc.ok("students.get", json!({ "username": "b190001" }), Some(&w));
    assert_eq!(profile["student"]["isInCampus"], true);
    assert!(profile["student"]["openRequest"].is_null());

    // Returned, so a new request is allowed; rejecting it frees the student again.
    let pass = sc.ok(
        "outpasses.create",
        json!({ "reason": "home", "fromDay": "2099-02-01", "toDay": "2099-02-03" }),
        Some(&s),
    );
    assert_eq!(pass["request"]["endsAt"], "2099-02-03T18:29:59Z");
    let pass_id = pass["request"]["id"].as_str().expect("id").to_string();
    let rejected = sc.ok(
        "requests.reject",
        json!({ "kind": "outpass", "id": pass_id, "message": "exams" }),
        Some(&w),
    );
    assert_eq!(rejected["request"]["status"], "rejected");
    assert_eq!(rejected["request"]["rejectedBy"], "root");

    let mine = sc.ok("requests.mine", json!({}), Some(&s));
    let mut kinds: Vec<&str> = mine["requests"]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|r| r["kind"].as_str())
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["outing", "outpass"]);

    // Decisions queue mail; the dispatcher drains it.
    let outbox = sc.ok("notifications.list", json!({ "status": "pending" }), Some(&w));
    assert_eq!(outbox["notifications"].as_array().expect("rows").len(), 2);
    assert_eq!(outbox["notifications"][0]["recipient"], "asha@campus.test");
    let sent = sc.ok("notifications.dispatch", json!({}), Some(&w));
    assert_eq!(sent["sent"], 2);
    let outbox = sc.ok("notifications.list", json!({ "status": "pending" }), Some(&w));
    assert!(outbox["notifications"].as_array().expect("rows").is_empty());

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn sweep_expires_overdue_requests_once() {
    let ws = temp_dir("campus-sweep");
    let mut sc = Sidecar::start(&ws);
    let (w, s) = seed(&mut sc);

    let created = sc.ok(
        "outings.create",
        json!({
            "reason": "bank",
            "fromTime": "2099-03-01T09:00:00Z",
            "toTime": "2099-03-01T11:00:00Z"
        }),
        Some(&s),
    );
    let id = created["request"]["id"].as_str().expect("id").to_string();

    // Nothing is overdue yet.
    let first = sc.ok("requests.sweepExpired", json!({}), Some(&w));
    assert_eq!(first["outingsExpired"], 0);

    let swept = sc.ok(
        "requests.sweepExpired",
        json!({ "now": "2100-01-01T00:00:00Z" }),
        Some(&w),
    );
    assert_eq!(swept["outingsExpired"], 1);
    assert_eq!(swept["outpassesExpired"], 0);
    let again = sc.ok(
        "requests.sweepExpired",
        json!({ "now": "2100-01-01T00:00:00Z" }),
        Some(&w),
    );
    assert_eq!(again["outingsExpired"], 0);

    let got = sc.ok("requests.get", json!({ "kind": "outing", "id": id }), Some(&s));
    assert_eq!(got["request"]["status"], "expired");
    let err = sc.fail(
        "requests.approve",
        json!({ "kind": "outing", "id": id }),
        Some(&w),
    );
    assert_eq!(err["code"], "conflict");
    assert_eq!(err["details"]["status"], "expired");

    let outbox = sc.ok("notifications.list", json!({}), Some(&w));
    let subjects: Vec<&str> = outbox["notifications"]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|n| n["subject"].as_str())
        .collect();
    assert_eq!(subjects.len(), 1);
    assert!(subjects[0].to_lowercase().contains("expired"), "{:?}", subjects);

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn deciding_after_the_window_closed_expires_instead() {
    let ws = temp_dir("campus-late-decision");
    let mut sc = Sidecar::start(&ws);
    let (w, s) = seed(&mut sc);

    let created = sc.ok(
        "outings.create",
        json!({
            "reason": "already over",
            "fromTime": "2020-05-01T09:00:00Z",
            "toTime": "2020-05-01T10:00:00Z"
        }),
        Some(&s),
    );
    let id = created["request"]["id"].as_str().expect("id").to_string();

    // Not yet swept, but no longer waiting on anyone either.
    let pending = sc.ok("requests.list", json!({ "kind": "outing" }), Some(&w));
    assert!(pending["requests"].as_array().expect("rows").is_empty());
    let summary = sc.ok("presence.summary", json!({}), Some(&w));
    assert_eq!(summary["pendingOutings"], 0);

    let err = sc.fail(
        "requests.approve",
        json!({ "kind": "outing", "id": id }),
        Some(&w),
    );
    assert_eq!(err["code"], "conflict");
    assert_eq!(err["details"]["reason"], "request_expired");

    let got = sc.ok("requests.get", json!({ "kind": "outing", "id": id }), Some(&w));
    assert_eq!(got["request"]["status"], "expired");
    assert!(got["request"]["issuedBy"].is_null());

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn submissions_are_validated() {
    let ws = temp_dir("campus-submit-validation");
    let mut sc = Sidecar::start(&ws);
    let (w, s) = seed(&mut sc);

    let cases = [
        (
            "outings.create",
            json!({ "reason": "x", "fromTime": "2099-01-10T12:00:00Z", "toTime": "2099-01-10T11:00:00Z" }),
        ),
        // 23:00 to 01:00 local crosses midnight.
        (
            "outings.create",
            json!({ "reason": "x", "fromTime": "2099-01-10T23:00:00+05:30", "toTime": "2099-01-11T01:00:00+05:30" }),
        ),
        (
            "outings.create",
            json!({ "reason": "   ", "fromTime": "2099-01-10T10:00:00Z", "toTime": "2099-01-10T11:00:00Z" }),
        ),
        (
            "outpasses.create",
            json!({ "reason": "x", "fromDay": "2099-02-05", "toDay": "2099-02-01" }),
        ),
    ];
    for (method, params) in cases {
        let err = sc.fail(method, params.clone(), Some(&s));
        assert_eq!(err["code"], "bad_params", "{} {}", method, params);
    }

    // Admins cannot submit on a student's behalf.
    let err = sc.fail(
        "outings.create",
        json!({ "reason": "x", "fromTime": "2099-01-10T10:00:00Z", "toTime": "2099-01-10T11:00:00Z" }),
        Some(&w),
    );
    assert_eq!(err["code"], "forbidden");

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn checking_out_after_the_window_closed_expires_the_pass() {
    let ws = temp_dir("campus-late-checkout");
    let mut sc = Sidecar::start(&ws);
    let (w, s) = seed(&mut sc);
    let gate = admin_token(&mut sc, &w, "gate1", "security");

    let id = outing(&mut sc, &s, "2099-04-01");
    sc.ok("requests.approve", json!({ "kind": "outing", "id": id }), Some(&w));
    close_window(&ws, "outings", &id);

    let err = sc.fail(
        "requests.checkOut",
        json!({ "kind": "outing", "id": id }),
        Some(&gate),
    );
    assert_eq!(err["code"], "conflict");
    assert_eq!(err["details"]["reason"], "request_expired");

    let got = sc.ok("requests.get", json!({ "kind": "outing", "id": id }), Some(&s));
    assert_eq!(got["request"]["status"], "expired");
    assert!(got["request"]["outTime"].is_null());
    let profile = sc.ok("students.get", json!({}), Some(&s));
    assert_eq!(profile["student"]["isInCampus"], true);
    assert!(profile["student"]["openRequest"].is_null());

    let outbox = sc.ok("notifications.list", json!({}), Some(&w));
    let expired = outbox["notifications"]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|n| n["subject"].as_str())
        .filter(|s| s.contains("expired"))
        .count();
    assert_eq!(expired, 1);

    // The dead pass no longer blocks a fresh request.
    outing(&mut sc, &s, "2099-04-02");

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn returning_after_the_window_is_late() {
    let ws = temp_dir("campus-late-return");
    let mut sc = Sidecar::start(&ws);
    let (w, s) = seed(&mut sc);
    let gate = admin_token(&mut sc, &w, "gate1", "security");

    let id = outing(&mut sc, &s, "2099-05-01");
    sc.ok("requests.approve", json!({ "kind": "outing", "id": id }), Some(&w));
    sc.ok("requests.checkOut", json!({ "kind": "outing", "id": id }), Some(&gate));
    close_window(&ws, "outings", &id);

    let back = sc.ok("requests.checkIn", json!({ "kind": "outing", "id": id }), Some(&gate));
    assert_eq!(back["late"], true);
    assert!(back["request"]["inTime"].is_string());

    let profile = sc.ok("students.get", json!({}), Some(&s));
    assert_eq!(profile["student"]["isInCampus"], true);

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn sweep_skips_rejected_and_returned_requests() {
    let ws = temp_dir("campus-selective-sweep");
    let mut sc = Sidecar::start(&ws);
    let (w, s1) = seed(&mut sc);
    let gate = admin_token(&mut sc, &w, "gate1", "security");
    let s2 = add_student(&mut sc, &w, "b190002");
    let s3 = add_student(&mut sc, &w, "b190003");

    let rejected = outing(&mut sc, &s1, "2099-06-01");
    sc.ok("requests.reject", json!({ "kind": "outing", "id": rejected }), Some(&w));

    let returned = outing(&mut sc, &s2, "2099-06-01");
    sc.ok("requests.approve", json!({ "kind": "outing", "id": returned }), Some(&w));
    sc.ok("requests.checkOut", json!({ "kind": "outing", "id": returned }), Some(&gate));
    sc.ok("requests.checkIn", json!({ "kind": "outing", "id": returned }), Some(&gate));

    let away = outing(&mut sc, &s3, "2099-06-01");
    sc.ok("requests.approve", json!({ "kind": "outing", "id": away }), Some(&w));
    sc.ok("requests.checkOut", json!({ "kind": "outing", "id": away }), Some(&gate));
    close_window(&ws, "outings", &away);

    let swept = sc.ok(
        "requests.sweepExpired",
        json!({ "now": "2100-01-01T00:00:00Z" }),
        Some(&w),
    );
    assert_eq!(swept["outingsExpired"], 1);

    for (id, token, status) in [
        (&rejected, &s1, "rejected"),
        (&returned, &s2, "approved"),
        (&away, &s3, "expired"),
    ] {
        let got = sc.ok("requests.get", json!({ "kind": "outing", "id": id }), Some(token));
        assert_eq!(got["request"]["status"], status, "{}", got);
    }

    // Expired but still outside: the gate has to see them back first.
    let err = sc.fail(
        "outpasses.create",
        json!({ "reason": "home", "fromDay": "2099-07-01", "toDay": "2099-07-02" }),
        Some(&s3),
    );
    assert_eq!(err["code"], "conflict");
    assert_eq!(err["message"], "student is currently out of campus");
    let outside = sc.ok("presence.outside", json!({}), Some(&gate));
    assert_eq!(outside["students"].as_array().expect("rows").len(), 1);

    let back = sc.ok("requests.checkIn", json!({ "kind": "outing", "id": away }), Some(&gate));
    assert_eq!(back["late"], true);
    assert_eq!(back["request"]["status"], "expired");
    sc.ok(
        "outpasses.create",
        json!({ "reason": "home", "fromDay": "2099-07-01", "toDay": "2099-07-02" }),
        Some(&s3),
    );

    let _ = std::fs::remove_dir_all(ws);
}
