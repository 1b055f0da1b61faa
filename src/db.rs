use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("campus.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS orgs(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_years(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            label TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            FOREIGN KEY(org_id) REFERENCES orgs(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rooms(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES orgs(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(org_id) REFERENCES orgs(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES orgs(id),
            FOREIGN KEY(school_year_id) REFERENCES school_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_year ON sections(school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            role TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(staff_id) REFERENCES staff(id),
            UNIQUE(section_id, staff_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_section ON teacher_assignments(section_id)",
        [],
    )?;

    // Lifecycle state (active) is decoupled from soft delete (archived_at).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meetings(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            days_json TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            room_id TEXT,
            period_label TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            archived_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(room_id) REFERENCES rooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_year ON meetings(school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(org_id) REFERENCES orgs(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(section_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_schemes(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'draft',
            rounding TEXT NOT NULL DEFAULT 'half_up',
            transmutation_table_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            published_at TEXT,
            FOREIGN KEY(org_id) REFERENCES orgs(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scheme_components(
            id TEXT PRIMARY KEY,
            scheme_id TEXT NOT NULL,
            code TEXT NOT NULL,
            label TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(scheme_id) REFERENCES grading_schemes(id),
            UNIQUE(scheme_id, code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS weight_profiles(
            id TEXT PRIMARY KEY,
            scheme_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(scheme_id) REFERENCES grading_schemes(id),
            UNIQUE(scheme_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_weights(
            profile_id TEXT NOT NULL,
            component_code TEXT NOT NULL,
            weight_percent REAL NOT NULL,
            PRIMARY KEY(profile_id, component_code),
            FOREIGN KEY(profile_id) REFERENCES weight_profiles(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transmutation_tables(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            below_range_policy TEXT NOT NULL DEFAULT 'fail',
            created_at TEXT NOT NULL,
            published_at TEXT,
            FOREIGN KEY(org_id) REFERENCES orgs(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transmutation_rows(
            table_id TEXT NOT NULL,
            input_grade REAL NOT NULL,
            output_grade REAL NOT NULL,
            PRIMARY KEY(table_id, input_grade),
            FOREIGN KEY(table_id) REFERENCES transmutation_tables(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS graded_items(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            component_code TEXT NOT NULL,
            title TEXT NOT NULL,
            max_points REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_items_section_term ON graded_items(section_id, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS item_scores(
            item_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            score REAL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(item_id, student_id),
            FOREIGN KEY(item_id) REFERENCES graded_items(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS compute_runs(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            scheme_id TEXT NOT NULL,
            scheme_version INTEGER NOT NULL,
            profile_name TEXT,
            table_id TEXT,
            status TEXT NOT NULL DEFAULT 'created',
            error_message TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(scheme_id) REFERENCES grading_schemes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS computed_grades(
            run_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            initial_grade REAL NOT NULL,
            transmuted_grade REAL,
            final_grade REAL NOT NULL,
            breakdown_json TEXT NOT NULL,
            PRIMARY KEY(run_id, student_id),
            FOREIGN KEY(run_id) REFERENCES compute_runs(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    // Explicit status column; archived_at is soft delete only, never a state flag.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS mastery_proposals(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            competency_code TEXT NOT NULL,
            proposed_level TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            notes TEXT,
            archived_at TEXT,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_proposals_section ON mastery_proposals(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mastery_snapshots(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            competency_code TEXT NOT NULL,
            level TEXT NOT NULL,
            proposal_id TEXT,
            recorded_by TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_student ON mastery_snapshots(student_id)",
        [],
    )?;

    Ok(conn)
}
