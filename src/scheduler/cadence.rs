use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};

#[derive(Debug, Clone)]
pub(crate) struct DailyCadence {
    tz: FixedOffset,
    target: NaiveTime,
}

impl DailyCadence {
    pub(crate) fn new(tz: FixedOffset, hour: u32, minute: u32) -> Result<Self> {
        let target = NaiveTime::from_hms_opt(hour, minute, 0)
            .with_context(|| format!("invalid schedule time: {hour:02}:{minute:02}"))?;
        Ok(Self { tz, target })
    }

    /// `utc_offset_hours` 時間ずれた固定オフセットで組み立てる。
    pub(crate) fn with_utc_offset(utc_offset_hours: i32, hour: u32, minute: u32) -> Result<Self> {
        let tz = FixedOffset::east_opt(utc_offset_hours * 3600)
            .with_context(|| format!("invalid UTC offset: {utc_offset_hours}h"))?;
        Self::new(tz, hour, minute)
    }

    pub(crate) fn tz(&self) -> FixedOffset {
        self.tz
    }

    pub(crate) fn next_run_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let localized_now = now.with_timezone(&self.tz);
        let mut date = localized_now.date_naive();
        if localized_now.time() > self.target {
            date = advance_day(date);
        }

        let local_target = date.and_time(self.target);

        // 固定オフセットでは曖昧・欠落は起きない
        match self.tz.from_local_datetime(&local_target) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            LocalResult::None => now,
        }
    }
}

fn advance_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}
