//! Backup classes and the deterministic artifact naming derived from them.
//!
//! Each class owns a sub directory of the destination root and a period key
//! that makes two runs within the same period resolve to the same file name,
//! so a rerun overwrites instead of accumulating.

use chrono::{DateTime, Datelike, TimeZone};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupClass {
    Daily,
    Weekly,
    Monthly,
    AdHoc,
}

impl BackupClass {
    /// Classes driven by the scheduler, in the order "run all" executes them.
    pub const SCHEDULED: [BackupClass; 3] =
        [BackupClass::Daily, BackupClass::Weekly, BackupClass::Monthly];

    pub const ALL: [BackupClass; 4] = [
        BackupClass::Daily,
        BackupClass::Weekly,
        BackupClass::Monthly,
        BackupClass::AdHoc,
    ];

    /// Name of the class, also used as its directory under the destination root.
    pub fn name(&self) -> &'static str {
        match self {
            BackupClass::Daily => "daily",
            BackupClass::Weekly => "weekly",
            BackupClass::Monthly => "monthly",
            BackupClass::AdHoc => "ad_hoc",
        }
    }

    /// Human readable label used in notification subjects.
    pub fn label(&self) -> &'static str {
        match self {
            BackupClass::Daily => "Daily",
            BackupClass::Weekly => "Weekly",
            BackupClass::Monthly => "Monthly",
            BackupClass::AdHoc => "Ad hoc",
        }
    }

    /// Period key for `dt`.
    ///
    /// Weekly keys use the ISO week-numbering year so the last days of
    /// December that belong to week 1 never collide with the first week of
    /// the same calendar year.
    pub fn period<Tz: TimeZone>(&self, dt: &DateTime<Tz>) -> String
    where
        Tz::Offset: Display,
    {
        match self {
            BackupClass::Daily => dt.format("%Y%m%d").to_string(),
            BackupClass::Weekly => {
                let week = dt.iso_week();
                format!("{}_week{:02}", week.year(), week.week())
            }
            BackupClass::Monthly => format!("{}_{:02}", dt.year(), dt.month()),
            BackupClass::AdHoc => dt.format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    /// `<db>_<class>_<period>.<ext>`
    pub fn artifact_file_name<Tz: TimeZone>(
        &self,
        db_name: &str,
        dt: &DateTime<Tz>,
        ext: &str,
    ) -> String
    where
        Tz::Offset: Display,
    {
        format!("{}_{}_{}.{}", db_name, self.name(), self.period(dt), ext)
    }
}

impl Display for BackupClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
