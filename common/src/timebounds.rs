use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::job::{Frequency, TimeStep};

/// Cobertura temporal de un gránulo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBounds {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub center: NaiveDateTime,
}

impl TimeBounds {
    fn from_range(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        let center = start + (end - start) / 2;
        Self { start, end, center }
    }
}

pub trait TimeBoundsCalculator: Send + Sync {
    fn bounds(&self, time_step: TimeStep, period: Frequency) -> TimeBounds;
}

/// Calendario del modelo: el time step `t` marca el instante `start + t * dt`,
/// que es el final del periodo de promediado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCalendar {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub timestep_seconds: i64,
}

impl Default for ModelCalendar {
    /// ECCO V4r4: 1992-01-01T12:00 a 2018-01-01T00:00, paso horario.
    fn default() -> Self {
        let date = |y, m, d, h| {
            NaiveDate::from_ymd_opt(y, m, d)
                .and_then(|d| d.and_hms_opt(h, 0, 0))
                .unwrap_or_default()
        };
        Self {
            start: date(1992, 1, 1, 12),
            end: date(2018, 1, 1, 0),
            timestep_seconds: 3600,
        }
    }
}

impl ModelCalendar {
    pub fn instant(&self, time_step: TimeStep) -> NaiveDateTime {
        let offset = i64::try_from(time_step)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.timestep_seconds);
        // fuera de rango: se trata como el final del modelo
        Duration::try_seconds(offset)
            .and_then(|d| self.start.checked_add_signed(d))
            .unwrap_or(self.end)
    }

    fn clamp(&self, t: NaiveDateTime) -> NaiveDateTime {
        t.max(self.start).min(self.end)
    }
}

fn month_start(t: NaiveDateTime) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(t)
}

impl TimeBoundsCalculator for ModelCalendar {
    fn bounds(&self, time_step: TimeStep, period: Frequency) -> TimeBounds {
        let instant = self.instant(time_step);

        match period {
            Frequency::Snap => {
                let t = self.clamp(instant);
                TimeBounds { start: t, end: t, center: t }
            }
            Frequency::AvgDay => {
                let end = self.clamp(instant);
                let start = self.clamp(instant - Duration::days(1));
                TimeBounds::from_range(start, end)
            }
            Frequency::AvgMon => {
                let end = self.clamp(instant);
                let start = self.clamp(month_start(instant - Duration::seconds(1)));
                TimeBounds::from_range(start, end)
            }
        }
    }
}
