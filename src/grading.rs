/// Attendance below this share of classes is a shortage.
pub const ATTENDANCE_THRESHOLD_PERCENT: f64 = 75.0;

pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    Ex,
    A,
    B,
    C,
    D,
    E,
    R,
}

impl Grade {
    pub fn parse(s: &str) -> Option<Grade> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EX" => Some(Grade::Ex),
            "A" => Some(Grade::A),
            "B" => Some(Grade::B),
            "C" => Some(Grade::C),
            "D" => Some(Grade::D),
            "E" => Some(Grade::E),
            "R" => Some(Grade::R),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::Ex => "EX",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::E => "E",
            Grade::R => "R",
        }
    }

    pub fn points(self) -> f64 {
        match self {
            Grade::Ex => 10.0,
            Grade::A => 9.0,
            Grade::B => 8.0,
            Grade::C => 7.0,
            Grade::D => 6.0,
            Grade::E => 5.0,
            Grade::R => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeSummary {
    pub sgpa: Option<f64>,
    pub credits_attempted: f64,
    pub credits_earned: f64,
    pub has_backlog: bool,
}

/// Credit-weighted grade point average over `(grade, credits)` pairs.
/// `R` counts toward attempted credits but earns none.
pub fn semester_summary<I>(entries: I) -> GradeSummary
where
    I: IntoIterator<Item = (Grade, f64)>,
{
    let mut weighted = 0.0;
    let mut attempted = 0.0;
    let mut earned = 0.0;
    let mut has_backlog = false;
    for (grade, credits) in entries {
        if credits <= 0.0 {
            continue;
        }
        attempted += credits;
        weighted += grade.points() * credits;
        if grade == Grade::R {
            has_backlog = true;
        } else {
            earned += credits;
        }
    }
    GradeSummary {
        sgpa: if attempted > 0.0 {
            Some(round_2(weighted / attempted))
        } else {
            None
        },
        credits_attempted: attempted,
        credits_earned: earned,
        has_backlog,
    }
}

pub fn attendance_percent(attended: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    round_2(attended as f64 * 100.0 / total as f64)
}

pub fn is_shortage(attended: i64, total: i64) -> bool {
    total > 0 && (attended as f64 * 100.0 / total as f64) < ATTENDANCE_THRESHOLD_PERCENT
}
