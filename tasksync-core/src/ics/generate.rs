//! VTODO generation.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use icalendar::{Alarm as IcsAlarm, Calendar, Component, EventLike, Property, Trigger, ValueType};

use super::recurrence;
use super::todo::{COLLAPSED_PROP, RemoteTodo, SORT_ORDER_PROP};
use crate::error::{SyncError, SyncResult};
use crate::model::{Alarm, ServerFamily, TaskTime};

/// Settings that shape the wire output.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    /// Zone used for TZID-qualified date-times
    pub zone: Tz,
    pub family: ServerFamily,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            zone: Tz::UTC,
            family: ServerFamily::Unknown,
        }
    }
}

/// Generate a VCALENDAR holding one VTODO.
pub fn generate_todo(todo: &RemoteTodo, options: &EncodeOptions) -> SyncResult<String> {
    if todo.uid.is_empty() {
        return Err(SyncError::Codec("Cannot encode a VTODO without UID".into()));
    }

    let mut cal = Calendar::new();

    let mut ics_todo = icalendar::Todo::new();
    ics_todo.uid(&todo.uid);
    if let Some(ref summary) = todo.summary {
        ics_todo.summary(summary);
    }
    if let Some(ref description) = todo.description {
        ics_todo.description(description);
    }

    // DTSTAMP - required by RFC 5545
    let dtstamp = todo.last_modified.unwrap_or_else(Utc::now);
    ics_todo.add_property("DTSTAMP", format_utc(&dtstamp));
    if let Some(created) = todo.created {
        ics_todo.add_property("CREATED", format_utc(&created));
    }
    if let Some(modified) = todo.last_modified {
        ics_todo.add_property("LAST-MODIFIED", format_utc(&modified));
    }

    if let Some(priority) = todo.priority.filter(|p| *p > 0) {
        ics_todo.add_property("PRIORITY", priority.to_string());
    }

    // All-day only when neither value carries a time of day
    let all_day =
        !todo.due.is_some_and(|t| t.has_time()) && !todo.start.is_some_and(|t| t.has_time());
    let start = match (todo.start, todo.due) {
        (Some(start), Some(due)) if start.instant() > due.instant() => Some(due),
        (start, _) => start,
    };
    if let Some(due) = todo.due {
        add_time_property(&mut ics_todo, "DUE", &due, all_day, options.zone);
    }
    if let Some(start) = start {
        add_time_property(&mut ics_todo, "DTSTART", &start, all_day, options.zone);
    }

    if let Some(completed) = todo.completed {
        ics_todo.add_property("COMPLETED", format_utc(&completed));
    }
    if todo.completed.is_some() || todo.status_completed {
        ics_todo.add_property("STATUS", "COMPLETED");
        ics_todo.add_property("PERCENT-COMPLETE", "100");
    } else {
        ics_todo.add_property("STATUS", "NEEDS-ACTION");
    }

    if let Some(ref rec) = todo.recurrence {
        ics_todo.add_property("RRULE", recurrence::encode(rec));
    }

    if let Some(ref parent) = todo.parent_uid {
        let mut prop = Property::new("RELATED-TO", parent);
        prop.add_parameter("RELTYPE", "PARENT");
        ics_todo.append_property(prop);
    }

    if let Some(order) = todo.order {
        ics_todo.add_property(SORT_ORDER_PROP, order.to_string());
    }
    if todo.collapsed {
        ics_todo.add_property(COLLAPSED_PROP, "1");
    }

    // CATEGORIES (one property per tag)
    for tag in &todo.categories {
        ics_todo.append_multi_property(Property::new("CATEGORIES", escape_list_item(tag)));
    }

    if let Some(geo) = todo.geo {
        ics_todo.add_property("GEO", format!("{};{}", geo.latitude, geo.longitude));
    }

    // TRIGGER is written explicitly so offsets and RELATED survive any client
    for alarm in &todo.alarms {
        let mut ics_alarm =
            IcsAlarm::display("Reminder", Trigger::before_start(chrono::Duration::zero()));
        ics_alarm.append_property(trigger_property(alarm));
        ics_todo.alarm(ics_alarm);
    }

    // Custom properties (preserved for round-tripping)
    for (key, value) in &todo.custom_properties {
        ics_todo.append_multi_property(Property::new(key, value));
    }

    let ics_todo = ics_todo.done();
    cal.push(ics_todo);
    let cal = cal.done();

    Ok(strip_ics_bloat(&cal.to_string()))
}

fn format_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

fn add_time_property(
    todo: &mut icalendar::Todo,
    name: &str,
    time: &TaskTime,
    all_day: bool,
    zone: Tz,
) {
    match (time, all_day) {
        (TaskTime::AllDay(d), true) => {
            let mut prop = Property::new(name, d.format("%Y%m%d").to_string());
            prop.append_parameter(ValueType::Date);
            todo.append_property(prop);
        }
        (TaskTime::AllDay(d), false) => {
            let local = d.and_time(NaiveTime::MIN);
            let mut prop = Property::new(name, local.format("%Y%m%dT%H%M%S").to_string());
            prop.add_parameter("TZID", zone.name());
            todo.append_property(prop);
        }
        (TaskTime::Timed(dt), _) => {
            let local = dt.with_timezone(&zone);
            let mut prop = Property::new(name, local.format("%Y%m%dT%H%M%S").to_string());
            prop.add_parameter("TZID", zone.name());
            todo.append_property(prop);
        }
    }
}

fn trigger_property(alarm: &Alarm) -> Property {
    match alarm {
        Alarm::RelativeToStart(secs) => Property::new("TRIGGER", format_duration(*secs)),
        Alarm::RelativeToDue(secs) => {
            let mut prop = Property::new("TRIGGER", format_duration(*secs));
            prop.add_parameter("RELATED", "END");
            prop
        }
        Alarm::At(at) => {
            let mut prop = Property::new("TRIGGER", format_utc(at));
            prop.add_parameter("VALUE", "DATE-TIME");
            prop
        }
    }
}

/// Format signed seconds as an ISO 8601 duration (-PT15M, P1D, PT0S)
fn format_duration(secs: i64) -> String {
    let sign = if secs < 0 { "-" } else { "" };
    let abs = secs.unsigned_abs();
    if abs > 0 && abs % 86_400 == 0 {
        return format!("{}P{}D", sign, abs / 86_400);
    }

    let (days, rest) = (abs / 86_400, abs % 86_400);
    let (hours, minutes, seconds) = (rest / 3600, rest % 3600 / 60, rest % 60);
    let mut out = format!("{}P", sign);
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    out.push('T');
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    if seconds > 0 || (hours == 0 && minutes == 0) {
        out.push_str(&format!("{}S", seconds));
    }
    out
}

fn escape_list_item(value: &str) -> String {
    value.replace('\\', "\\\\").replace(',', "\\,").replace(';', "\\;")
}

/// Clean up ICS output from the icalendar crate
/// - Replace PRODID with our own
/// - Remove CALSCALE:GREGORIAN (it's the default)
/// - Remove DTSTAMP and UID inside VALARM sections (not required by RFC 5545)
fn strip_ics_bloat(ics: &str) -> String {
    let mut result = String::with_capacity(ics.len());
    let mut in_valarm = false;

    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            result.push_str("PRODID:-//tasksync//EN\r\n");
            continue;
        }

        if line == "CALSCALE:GREGORIAN" {
            continue;
        }

        if line == "BEGIN:VALARM" {
            in_valarm = true;
        } else if line == "END:VALARM" {
            in_valarm = false;
        }

        if in_valarm && (line.starts_with("DTSTAMP:") || line.starts_with("UID:")) {
            continue;
        }

        result.push_str(line);
        result.push_str("\r\n");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ics::parse_todo;
    use crate::model::{Place, Recurrence};
    use chrono::{NaiveDate, TimeZone};

    fn make_test_todo() -> RemoteTodo {
        RemoteTodo {
            uid: "todo-123@tasksync".to_string(),
            summary: Some("Test Todo".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_timed_values_are_tzid_qualified() {
        let mut todo = make_test_todo();
        todo.due = Some(TaskTime::Timed(
            Utc.with_ymd_and_hms(2025, 7, 1, 16, 30, 0).unwrap(),
        ));
        let options = EncodeOptions {
            zone: chrono_tz::Europe::Berlin,
            family: ServerFamily::Unknown,
        };

        let ics = generate_todo(&todo, &options).unwrap();
        println!("Generated ICS:\n{}", ics);

        assert!(ics.contains("DUE;TZID=Europe/Berlin:20250701T183000"));
        assert!(ics.contains("PRODID:-//tasksync//EN"));
    }

    #[test]
    fn test_all_day_only_without_time_of_day() {
        let mut todo = make_test_todo();
        todo.due = Some(TaskTime::AllDay(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()));
        let ics = generate_todo(&todo, &EncodeOptions::default()).unwrap();
        assert!(ics.contains("DUE;VALUE=DATE:20250701"));

        todo.start = Some(TaskTime::Timed(
            Utc.with_ymd_and_hms(2025, 6, 30, 9, 0, 0).unwrap(),
        ));
        let ics = generate_todo(&todo, &EncodeOptions::default()).unwrap();
        assert!(ics.contains("DUE;TZID=UTC:20250701T000000"));
        assert!(ics.contains("DTSTART;TZID=UTC:20250630T090000"));
    }

    #[test]
    fn test_start_is_clamped_to_due() {
        let mut todo = make_test_todo();
        todo.due = Some(TaskTime::AllDay(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()));
        todo.start = Some(TaskTime::AllDay(NaiveDate::from_ymd_opt(2025, 7, 5).unwrap()));
        let ics = generate_todo(&todo, &EncodeOptions::default()).unwrap();
        assert!(ics.contains("DTSTART;VALUE=DATE:20250701"));
    }

    #[test]
    fn test_completion_properties() {
        let mut todo = make_test_todo();
        todo.completed = Some(Utc.with_ymd_and_hms(2025, 7, 2, 8, 0, 0).unwrap());
        let ics = generate_todo(&todo, &EncodeOptions::default()).unwrap();
        assert!(ics.contains("COMPLETED:20250702T080000Z"));
        assert!(ics.contains("STATUS:COMPLETED"));
        assert!(ics.contains("PERCENT-COMPLETE:100"));
    }

    #[test]
    fn test_duration_format() {
        assert_eq!(format_duration(-900), "-PT15M");
        assert_eq!(format_duration(0), "PT0S");
        assert_eq!(format_duration(86_400), "P1D");
        assert_eq!(format_duration(90_061), "P1DT1H1M1S");
        assert_eq!(format_duration(-5_400), "-PT1H30M");
    }

    #[test]
    fn test_no_bloat_inside_valarm() {
        let mut todo = make_test_todo();
        todo.alarms = vec![Alarm::RelativeToStart(-600)];
        let ics = generate_todo(&todo, &EncodeOptions::default()).unwrap();
        let alarm_section: String = ics
            .split("BEGIN:VALARM")
            .nth(1)
            .expect("Should contain an alarm")
            .to_string();
        assert!(!alarm_section.contains("UID:"));
        assert!(!ics.contains("CALSCALE"));
    }

    #[test]
    fn test_round_trip_preserves_mapped_fields() {
        let mut todo = make_test_todo();
        todo.description = Some("Some notes".into());
        todo.priority = Some(1);
        todo.due = Some(TaskTime::Timed(
            Utc.with_ymd_and_hms(2025, 3, 20, 15, 0, 0).unwrap(),
        ));
        todo.start = Some(TaskTime::Timed(
            Utc.with_ymd_and_hms(2025, 3, 19, 15, 0, 0).unwrap(),
        ));
        todo.recurrence = Some(Recurrence {
            rule: "FREQ=MONTHLY;BYMONTHDAY=20".into(),
            from_completion: true,
        });
        todo.parent_uid = Some("parent-1".into());
        todo.order = Some(-3);
        todo.collapsed = true;
        todo.categories = vec!["errands".into(), "home".into()];
        todo.geo = Some(Place {
            latitude: 48.8566,
            longitude: 2.3522,
        });
        todo.alarms = vec![
            Alarm::RelativeToStart(-900),
            Alarm::RelativeToDue(0),
            Alarm::At(Utc.with_ymd_and_hms(2025, 3, 20, 14, 0, 0).unwrap()),
        ];
        todo.created = Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        todo.last_modified = Some(Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap());
        todo.custom_properties = vec![("X-MOZ-GENERATION".into(), "7".into())];

        let options = EncodeOptions {
            zone: chrono_tz::America::Los_Angeles,
            family: ServerFamily::Unknown,
        };
        let ics = generate_todo(&todo, &options).expect("Should generate");
        println!("Generated ICS:\n{}", ics);
        let parsed = parse_todo(&ics, options.zone).expect("Should reparse");

        assert_eq!(parsed, todo);
    }
}
