//! Output formatting for CLI display.

use std::fmt::Write;

use jiff::SignedDuration;

use crate::archive::UntarReport;
use crate::fleet::{InstanceRow, Launched, Market};
use crate::status::StatusSummary;

/// Uptime as `DD-HH:MM`, the way `ps -o etime` prints long runs.
pub(super) fn format_uptime(uptime: SignedDuration) -> String {
    let minutes = uptime.as_secs().max(0) / 60;
    let (days, hours, minutes) = (minutes / 1440, minutes / 60 % 24, minutes % 60);
    format!("{days:02}-{hours:02}:{minutes:02}")
}

pub(super) fn format_instance_row(row: &InstanceRow) -> String {
    let health = if row.healthy { "ok" } else { "FAILED" };
    format!(
        "{}  {:<14} {:<15}  up {}  {health}",
        row.instance.id,
        row.instance.instance_type,
        row.instance.public_ip.as_deref().unwrap_or("-"),
        format_uptime(row.uptime),
    )
}

pub(super) fn format_launched(launched: &Launched) -> String {
    match &launched.market {
        Market::OnDemand => format!(
            "launched {} on-demand ({} at ${:.4}/h, spot was ${:.4})",
            launched.instance_id,
            launched.instance_type,
            launched.on_demand_price,
            launched.spot_price
        ),
        Market::Spot {
            max_price,
            availability_zone,
        } => format!(
            "launched {} as spot in {availability_zone} ({} at ${:.4}/h, max ${max_price:.4})",
            launched.instance_id, launched.instance_type, launched.spot_price
        ),
    }
}

/// Counts per status, then the reasons shared by more than one record.
pub(super) fn format_summary(summary: &StatusSummary) -> String {
    let mut out = String::new();
    for (status, count) in &summary.by_status {
        let _ = writeln!(out, "{status:<8} {count}");
    }
    let _ = writeln!(out, "{:<8} {}", "total", summary.total());
    if !summary.common_reasons.is_empty() {
        out.push_str("\nCommon reasons:\n");
        for (reason, count) in &summary.common_reasons {
            let _ = writeln!(out, "{count:>6}  {reason}");
        }
    }
    out
}

pub(super) fn format_untar(report: &UntarReport) -> String {
    let mut out = format!(
        "{} extracted, {} already present, {} failed",
        report.extracted,
        report.skipped,
        report.failed.len()
    );
    for (name, error) in &report.failed {
        let _ = write!(out, "\n  {name}: {error}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use jiff::Timestamp;

    use crate::fleet::Instance;
    use crate::model::{BuildStatus, BuildStatusRecord, StatusDocument};

    #[test]
    fn uptime_pads_days_hours_minutes() {
        assert_eq!(format_uptime(SignedDuration::from_mins(59)), "00-00:59");
        assert_eq!(
            format_uptime(SignedDuration::from_hours(49) + SignedDuration::from_mins(5)),
            "02-01:05"
        );
        assert_eq!(format_uptime(SignedDuration::from_secs(-30)), "00-00:00");
    }

    #[test]
    fn instance_row_shows_health() {
        let row = InstanceRow {
            instance: Instance {
                id: "i-0abc".into(),
                instance_type: "c7g.2xlarge".into(),
                public_ip: None,
                launch_time: Timestamp::UNIX_EPOCH,
            },
            uptime: SignedDuration::from_hours(3),
            healthy: false,
        };
        let line = format_instance_row(&row);
        assert!(line.starts_with("i-0abc  c7g.2xlarge"));
        assert!(line.contains("up 00-03:00"));
        assert!(line.ends_with("FAILED"));
    }

    #[test]
    fn spot_launch_names_zone_and_cap() {
        let launched = Launched {
            instance_id: "i-1".into(),
            instance_type: "c7g.large".into(),
            market: Market::Spot {
                max_price: 0.42,
                availability_zone: "us-west-2a".into(),
            },
            spot_price: 0.4,
            on_demand_price: 0.5,
        };
        assert_eq!(
            format_launched(&launched),
            "launched i-1 as spot in us-west-2a (c7g.large at $0.4000/h, max $0.4200)"
        );
    }

    #[test]
    fn summary_lists_counts_then_reasons() {
        let mut doc = StatusDocument::new();
        for (name, status, reason) in [
            ("a.eb", BuildStatus::Skipped, "dependencies have errors"),
            ("b.eb", BuildStatus::Skipped, "dependencies have errors"),
            ("c.eb", BuildStatus::Success, "already installed"),
        ] {
            let mut record = BuildStatusRecord::new("2024-05-01T23:10:04-07:00");
            record.status = status;
            record.reason = reason.into();
            doc.insert(name.into(), record);
        }
        let text = format_summary(&StatusSummary::from_document(&doc));
        assert_eq!(
            text,
            "skipped  2\nsuccess  1\ntotal    3\n\nCommon reasons:\n     2  dependencies have errors\n"
        );
    }

    #[test]
    fn untar_report_lists_failures() {
        let report = UntarReport {
            extracted: 3,
            skipped: 1,
            failed: vec![("x.eb.tar.gz".into(), "corrupt".into())],
        };
        assert_eq!(
            format_untar(&report),
            "3 extracted, 1 already present, 1 failed\n  x.eb.tar.gz: corrupt"
        );
    }
}
