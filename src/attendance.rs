use serde::{Serialize, Serializer};
use std::collections::BTreeSet;

/// Roll-call status for one student on one day.
///
/// Stored and transmitted as a single-letter code: P, A, H, M.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Present,
    Absent,
    HalfDay,
    Medical,
}

impl Status {
    pub fn as_code(self) -> &'static str {
        match self {
            Status::Present => "P",
            Status::Absent => "A",
            Status::HalfDay => "H",
            Status::Medical => "M",
        }
    }

    pub fn parse_code(s: &str) -> Option<Status> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P" => Some(Status::Present),
            "A" => Some(Status::Absent),
            "H" => Some(Status::HalfDay),
            "M" => Some(Status::Medical),
            _ => None,
        }
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMark {
    pub student_id: String,
    pub roll_no: u32,
    pub status: Status,
}

/// One class's roll call for one calendar day.
///
/// The record is a plain value: every operation returns a new record and
/// leaves its input untouched. `marks` keeps roster order; nothing here
/// sorts or deduplicates it. Once `locked` is set the record is terminal —
/// mutators return it unchanged and there is no unlock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRecord {
    pub date: String,
    pub class_id: String,
    pub class_teacher_id: String,
    pub locked: bool,
    pub marks: Vec<StudentMark>,
}

impl DayRecord {
    /// Start a fresh roll call: every student on the roster is marked
    /// Absent, whatever status the roster entries arrived with.
    pub fn build(
        date: &str,
        class_id: &str,
        class_teacher_id: &str,
        roster: &[StudentMark],
    ) -> DayRecord {
        DayRecord {
            date: date.to_string(),
            class_id: class_id.to_string(),
            class_teacher_id: class_teacher_id.to_string(),
            locked: false,
            marks: roster
                .iter()
                .map(|m| StudentMark {
                    student_id: m.student_id.clone(),
                    roll_no: m.roll_no,
                    status: Status::Absent,
                })
                .collect(),
        }
    }

    /// Flip one student: Present becomes Absent, anything else becomes
    /// Present. Unknown ids leave the marks as they were.
    pub fn toggle(&self, student_id: &str) -> DayRecord {
        if self.locked {
            return self.clone();
        }
        let marks = self
            .marks
            .iter()
            .map(|m| {
                let status = if m.student_id == student_id {
                    match m.status {
                        Status::Present => Status::Absent,
                        _ => Status::Present,
                    }
                } else {
                    m.status
                };
                StudentMark {
                    student_id: m.student_id.clone(),
                    roll_no: m.roll_no,
                    status,
                }
            })
            .collect();
        DayRecord {
            marks,
            ..self.clone()
        }
    }

    /// Assign an explicit status to one student.
    pub fn set_status(&self, student_id: &str, status: Status) -> DayRecord {
        if self.locked {
            return self.clone();
        }
        let marks = self
            .marks
            .iter()
            .map(|m| StudentMark {
                student_id: m.student_id.clone(),
                roll_no: m.roll_no,
                status: if m.student_id == student_id {
                    status
                } else {
                    m.status
                },
            })
            .collect();
        DayRecord {
            marks,
            ..self.clone()
        }
    }

    /// Re-mark the whole sheet from a comma-separated list of present roll
    /// numbers: listed rolls become Present, everyone else Absent. An input
    /// with no usable tokens therefore marks the whole class Absent.
    pub fn mark_present_rolls(&self, input: &str) -> DayRecord {
        if self.locked {
            return self.clone();
        }
        let present = parse_roll_list(input);
        let marks = self
            .marks
            .iter()
            .map(|m| StudentMark {
                student_id: m.student_id.clone(),
                roll_no: m.roll_no,
                status: if present.contains(&m.roll_no) {
                    Status::Present
                } else {
                    Status::Absent
                },
            })
            .collect();
        DayRecord {
            marks,
            ..self.clone()
        }
    }

    /// Seal the day. Idempotent; the only way back to an open sheet is to
    /// discard the record and rebuild it.
    pub fn lock(&self) -> DayRecord {
        DayRecord {
            locked: true,
            ..self.clone()
        }
    }
}

/// Parse a roll-call entry like " 1, 2, 4 " into the set of roll numbers.
/// Tokens that are not positive integers are dropped; roll numbers are
/// 1-based, so a literal 0 is dropped too.
pub fn parse_roll_list(input: &str) -> BTreeSet<u32> {
    input
        .split(',')
        .filter_map(|tok| tok.trim().parse::<u32>().ok())
        .filter(|n| *n != 0)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub marked: usize,
    pub present: usize,
    pub absent: usize,
    pub half_day: usize,
    pub medical: usize,
    pub present_percent: f64,
}

/// Head counts plus the attendance percentage for one day.
///
/// A half day counts 0.5 toward presence. Medical leave is excused: it is
/// reported but removed from the percentage denominator.
pub fn summarize(record: &DayRecord) -> DaySummary {
    let mut present = 0usize;
    let mut absent = 0usize;
    let mut half_day = 0usize;
    let mut medical = 0usize;
    for m in &record.marks {
        match m.status {
            Status::Present => present += 1,
            Status::Absent => absent += 1,
            Status::HalfDay => half_day += 1,
            Status::Medical => medical += 1,
        }
    }
    let marked = record.marks.len();
    let denom = marked - medical;
    let present_percent = if denom > 0 {
        round1(100.0 * (present as f64 + 0.5 * half_day as f64) / denom as f64)
    } else {
        0.0
    };
    DaySummary {
        marked,
        present,
        absent,
        half_day,
        medical,
        present_percent,
    }
}

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
