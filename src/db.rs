use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "schooldesk.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            class_teacher_id TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            admission_no TEXT,
            roll_no INTEGER NOT NULL DEFAULT 0,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            address_line TEXT,
            pincode TEXT,
            admitted_on TEXT,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_roll ON students(class_id, roll_no)",
        [],
    )?;

    // Guardian/contact and the PIN-autofilled region fields arrived after
    // the first workspaces shipped. Add them when missing.
    ensure_students_contact_columns(&conn)?;
    ensure_students_region_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_days(
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            class_teacher_id TEXT NOT NULL DEFAULT '',
            locked INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(class_id, date),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_marks(
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            student_id TEXT NOT NULL,
            roll_no INTEGER NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(class_id, date, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_marks_day ON attendance_marks(class_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_marks_student ON attendance_marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_heads(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_heads_class ON fee_heads(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            receipt_no INTEGER NOT NULL,
            amount REAL NOT NULL,
            method TEXT NOT NULL DEFAULT 'cash',
            note TEXT,
            paid_on TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_class ON fee_payments(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_student ON fee_payments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transport_routes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            vehicle_no TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transport_stops(
            id TEXT PRIMARY KEY,
            route_id TEXT NOT NULL,
            name TEXT NOT NULL,
            monthly_fee REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(route_id) REFERENCES transport_routes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transport_stops_route ON transport_stops(route_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transport_assignments(
            student_id TEXT PRIMARY KEY,
            route_id TEXT NOT NULL,
            stop_id TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(route_id) REFERENCES transport_routes(id),
            FOREIGN KEY(stop_id) REFERENCES transport_stops(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transport_assignments_route ON transport_assignments(route_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notices(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            audience TEXT NOT NULL,
            class_id TEXT,
            posted_on TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notices_class ON notices(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "guardian_name")? {
        conn.execute("ALTER TABLE students ADD COLUMN guardian_name TEXT", [])?;
    }
    if !table_has_column(conn, "students", "phone")? {
        conn.execute("ALTER TABLE students ADD COLUMN phone TEXT", [])?;
    }
    Ok(())
}

fn ensure_students_region_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "district")? {
        conn.execute("ALTER TABLE students ADD COLUMN district TEXT", [])?;
    }
    if !table_has_column(conn, "students", "state")? {
        conn.execute("ALTER TABLE students ADD COLUMN state TEXT", [])?;
    }
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    // A malformed historical value falls back to defaults instead of
    // blocking the workspace.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
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
