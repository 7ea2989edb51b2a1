use serde_json::json;

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

pub fn warning(line: usize, code: &str, message: impl Into<String>) -> serde_json::Value {
    json!({
        "line": line,
        "code": code,
        "message": message.into()
    })
}

/// Splits sheet text into records with the 1-based line each one starts on.
/// A newline inside a quoted field belongs to the field.
fn records(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let (mut line, mut start) = (1usize, 1usize);
    let mut in_quotes = false;
    for ch in text.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                buf.push(ch);
            }
            '\n' if !in_quotes => {
                out.push((start, std::mem::take(&mut buf)));
                line += 1;
                start = line;
            }
            '\n' => {
                line += 1;
                buf.push(ch);
            }
            _ => buf.push(ch),
        }
    }
    if !buf.is_empty() {
        out.push((start, buf));
    }
    out
}

/// Data records of a sheet: header skipped, blanks dropped.
fn data_lines(text: &str) -> impl Iterator<Item = (usize, Vec<String>)> {
    records(text)
        .into_iter()
        .skip(1)
        .filter(|(_, r)| !r.trim().is_empty())
        .map(|(n, r)| (n, parse_csv_record(r.trim_end_matches('\r'))))
}

#[derive(Debug)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    pub warnings: Vec<serde_json::Value>,
    pub total: usize,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            warnings: Vec::new(),
            total: 0,
        }
    }
}

impl<T> Parsed<T> {
    /// Records dropped before reaching the database.
    pub fn rejected(&self) -> usize {
        self.total - self.rows.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StudentRow {
    pub line_no: usize,
    pub username: String,
    pub name: String,
    pub email: String,
    pub gender: String,
    pub year: String,
    pub branch: String,
    pub section: String,
    pub phone: String,
    pub password: String,
}

pub fn parse_student_rows(text: &str) -> Parsed<StudentRow> {
    let mut out = Parsed::default();
    for (line_no, fields) in data_lines(text) {
        out.total += 1;
        if fields.len() < 3 {
            out.warnings.push(warning(
                line_no,
                "bad_columns",
                "expected at least username,name,email",
            ));
            continue;
        }
        let col = |i: usize| fields.get(i).map(|s| s.trim().to_string()).unwrap_or_default();
        let row = StudentRow {
            line_no,
            username: col(0).to_ascii_uppercase(),
            name: col(1),
            email: col(2),
            gender: col(3),
            year: col(4),
            branch: col(5),
            section: col(6),
            phone: col(7),
            password: col(8),
        };
        if row.username.is_empty() || row.name.is_empty() {
            out.warnings.push(warning(
                line_no,
                "missing_field",
                "username and name are required",
            ));
            continue;
        }
        if !row.email.contains('@') {
            out.warnings
                .push(warning(line_no, "bad_email", "email must contain '@'"));
            continue;
        }
        out.rows.push(row);
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub struct GradeRow {
    pub line_no: usize,
    pub username: String,
    pub subject_code: String,
    pub grade: String,
}

pub fn parse_grade_rows(text: &str) -> Parsed<GradeRow> {
    let mut out = Parsed::default();
    for (line_no, fields) in data_lines(text) {
        out.total += 1;
        if fields.len() < 3 {
            out.warnings.push(warning(
                line_no,
                "bad_columns",
                "expected username,subject_code,grade",
            ));
            continue;
        }
        out.rows.push(GradeRow {
            line_no,
            username: fields[0].trim().to_ascii_uppercase(),
            subject_code: fields[1].trim().to_string(),
            grade: fields[2].trim().to_string(),
        });
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttendanceRow {
    pub line_no: usize,
    pub username: String,
    pub subject_code: String,
    pub total_classes: i64,
    pub attended_classes: i64,
}

pub fn parse_attendance_rows(text: &str) -> Parsed<AttendanceRow> {
    let mut out = Parsed::default();
    for (line_no, fields) in data_lines(text) {
        out.total += 1;
        if fields.len() < 4 {
            out.warnings.push(warning(
                line_no,
                "bad_columns",
                "expected username,subject_code,total_classes,attended_classes",
            ));
            continue;
        }
        let (Ok(total), Ok(attended)) = (
            fields[2].trim().parse::<i64>(),
            fields[3].trim().parse::<i64>(),
        ) else {
            out.warnings.push(warning(
                line_no,
                "bad_number",
                "class counts must be integers",
            ));
            continue;
        };
        if total < 0 || attended < 0 || attended > total {
            out.warnings.push(warning(
                line_no,
                "bad_counts",
                "attended_classes must be between 0 and total_classes",
            ));
            continue;
        }
        out.rows.push(AttendanceRow {
            line_no,
            username: fields[0].trim().to_ascii_uppercase(),
            subject_code: fields[1].trim().to_string(),
            total_classes: total,
            attended_classes: attended,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_parser_handles_quotes_and_escapes() {
        assert_eq!(
            parse_csv_record(r#"O210001,"Rao, Asha","said ""hi""",,x"#),
            vec!["O210001", "Rao, Asha", r#"said "hi""#, "", "x"]
        );
        assert_eq!(csv_quote("Rao, Asha"), "\"Rao, Asha\"");
        assert_eq!(csv_quote("plain"), "plain");
    }

    #[test]
    fn student_rows_skip_header_blank_and_invalid_lines() {
        let text = "username,name,email,gender,year,branch,section,phone,password\n\
                    o210001,Asha Rao,asha@campus.edu,F,E2,CSE,A,999,pw123456\n\
                    \n\
                    O210002,,b@campus.edu\n\
                    O210003,Ravi,no-at-sign\n\
                    O210004,Kiran,k@campus.edu\r\n";
        let p = parse_student_rows(text);
        assert_eq!(p.total, 4);
        assert_eq!(p.rows.len(), 2);
        assert_eq!(p.rows[0].username, "O210001");
        assert_eq!(p.rows[0].branch, "CSE");
        assert_eq!(p.rows[1].line_no, 6);
        assert_eq!(p.rows[1].password, "");
        let codes: Vec<&str> = p
            .warnings
            .iter()
            .filter_map(|w| w.get("code").and_then(|v| v.as_str()))
            .collect();
        assert_eq!(codes, vec!["missing_field", "bad_email"]);
    }

    #[test]
    fn attendance_rows_validate_counts() {
        let text = "username,subject_code,total,attended\n\
                    O210001,CS201,40,35\n\
                    O210001,CS202,40,41\n\
                    O210001,CS203,forty,3\n";
        let p = parse_attendance_rows(text);
        assert_eq!(p.rows.len(), 1);
        assert_eq!(p.rows[0].attended_classes, 35);
        assert_eq!(p.warnings.len(), 2);
        assert_eq!(p.warnings[0]["line"], 3);
        assert_eq!(p.warnings[0]["code"], "bad_counts");
    }

    #[test]
    fn quoted_newlines_stay_inside_one_record() {
        let name = "Asha\nRao";
        let text = format!(
            "username,name,email\nO210001,{},asha@campus.edu\nO210002,Ravi,ravi@campus.edu\n",
            csv_quote(name)
        );
        let p = parse_student_rows(&text);
        assert_eq!(p.total, 2);
        assert_eq!(p.rejected(), 0);
        assert_eq!(p.rows[0].name, name);
        assert_eq!(p.rows[0].line_no, 2);
        // The second record starts after the embedded break.
        assert_eq!(p.rows[1].line_no, 4);
    }

    #[test]
    fn rejected_counts_records_dropped_while_parsing() {
        let p = parse_grade_rows("username,subject_code,grade\nO210001,CS201\nO210001,CS201,A\n");
        assert_eq!(p.total, 2);
        assert_eq!(p.rejected(), 1);
        assert_eq!(p.warnings[0]["code"], "bad_columns");
    }
}
