use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct CycleRow {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct BimesterRow {
    pub id: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone)]
pub struct HolidayRow {
    pub id: String,
    pub recovered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekType {
    Regular,
    Break,
}

impl WeekType {
    pub fn from_db(value: &str) -> WeekType {
        match value {
            "break" => WeekType::Break,
            _ => WeekType::Regular,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WeekType::Regular => "regular",
            WeekType::Break => "break",
        }
    }
}

/// Everything the calendar knows about one date. Pure lookups, no writes.
#[derive(Debug, Clone)]
pub struct TemporalContext {
    pub cycle: CycleRow,
    pub bimester: BimesterRow,
    pub holiday: Option<HolidayRow>,
    pub week_type: Option<WeekType>,
}

/// Active, non-archived cycle whose date range covers `date`.
/// ISO date strings compare lexicographically in range order.
pub fn active_cycle_for(conn: &Connection, date: &str) -> rusqlite::Result<Option<CycleRow>> {
    conn.query_row(
        "SELECT id, name
         FROM school_cycles
         WHERE active = 1 AND archived = 0 AND start_date <= ?1 AND end_date >= ?1
         ORDER BY start_date
         LIMIT 1",
        [date],
        |r| {
            Ok(CycleRow {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        },
    )
    .optional()
}

pub fn active_bimester_for(
    conn: &Connection,
    cycle_id: &str,
    date: &str,
) -> rusqlite::Result<Option<BimesterRow>> {
    conn.query_row(
        "SELECT id, start_date, end_date
         FROM bimesters
         WHERE cycle_id = ?1 AND active = 1 AND start_date <= ?2 AND end_date >= ?2
         ORDER BY start_date
         LIMIT 1",
        [cycle_id, date],
        |r| {
            Ok(BimesterRow {
                id: r.get(0)?,
                start_date: r.get(1)?,
                end_date: r.get(2)?,
            })
        },
    )
    .optional()
}

pub fn current_active_bimester(
    conn: &Connection,
    cycle_id: &str,
) -> rusqlite::Result<Option<BimesterRow>> {
    conn.query_row(
        "SELECT id, start_date, end_date
         FROM bimesters
         WHERE cycle_id = ?1 AND active = 1
         ORDER BY start_date
         LIMIT 1",
        [cycle_id],
        |r| {
            Ok(BimesterRow {
                id: r.get(0)?,
                start_date: r.get(1)?,
                end_date: r.get(2)?,
            })
        },
    )
    .optional()
}

pub fn bimester_by_id(
    conn: &Connection,
    bimester_id: &str,
) -> rusqlite::Result<Option<BimesterRow>> {
    conn.query_row(
        "SELECT id, start_date, end_date FROM bimesters WHERE id = ?1",
        [bimester_id],
        |r| {
            Ok(BimesterRow {
                id: r.get(0)?,
                start_date: r.get(1)?,
                end_date: r.get(2)?,
            })
        },
    )
    .optional()
}

pub fn holiday_on(
    conn: &Connection,
    bimester_id: &str,
    date: &str,
) -> rusqlite::Result<Option<HolidayRow>> {
    conn.query_row(
        "SELECT id, recovered FROM holidays WHERE bimester_id = ?1 AND date = ?2 LIMIT 1",
        [bimester_id, date],
        |r| {
            Ok(HolidayRow {
                id: r.get(0)?,
                recovered: r.get::<_, i64>(1)? != 0,
            })
        },
    )
    .optional()
}

pub fn week_containing(
    conn: &Connection,
    bimester_id: &str,
    date: &str,
) -> rusqlite::Result<Option<WeekType>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT week_type
             FROM academic_weeks
             WHERE bimester_id = ?1 AND start_date <= ?2 AND end_date >= ?2
             ORDER BY start_date
             LIMIT 1",
            [bimester_id, date],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.map(|v| WeekType::from_db(&v)))
}

/// Outcome of resolving a date against the school calendar. The two misses
/// are distinct so callers can report which layer failed.
#[derive(Debug, Clone)]
pub enum TemporalResolution {
    NoActiveCycle,
    NoActiveBimester,
    Resolved(TemporalContext),
}

pub fn resolve(conn: &Connection, date: &str) -> rusqlite::Result<TemporalResolution> {
    let Some(cycle) = active_cycle_for(conn, date)? else {
        return Ok(TemporalResolution::NoActiveCycle);
    };
    let Some(bimester) = active_bimester_for(conn, &cycle.id, date)? else {
        return Ok(TemporalResolution::NoActiveBimester);
    };
    let holiday = holiday_on(conn, &bimester.id, date)?;
    let week_type = week_containing(conn, &bimester.id, date)?;
    Ok(TemporalResolution::Resolved(TemporalContext {
        cycle,
        bimester,
        holiday,
        week_type,
    }))
}
