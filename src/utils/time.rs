use chrono::{DateTime, Months, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Same day next month, clamped to the last day when it does not exist
/// (31 Jan -> 28/29 Feb).
pub fn one_month_after(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.checked_add_months(Months::new(1)).unwrap_or(dt)
}
