//! VTODO parsing using the icalendar crate's parser.
//!
//! Malformed values never abort a sync: they are logged and dropped.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::{
    CalendarDateTime, DatePerhapsTime,
    parser::{Component, Property, read_calendar, unfold},
};

use super::recurrence;
use super::todo::{COLLAPSED_PROP, RemoteTodo, SORT_ORDER_PROP};
use crate::model::{Alarm, Place, TaskTime};

/// Parse ICS content into a [`RemoteTodo`].
///
/// Floating date-times and unknown TZIDs are read in `zone`.
pub fn parse_todo(content: &str, zone: Tz) -> Option<RemoteTodo> {
    let unfolded = unfold(content);
    let calendar = match read_calendar(&unfolded) {
        Ok(calendar) => calendar,
        Err(e) => {
            log::warn!("Skipping unparsable calendar object: {}", e);
            return None;
        }
    };
    let vtodo = calendar.components.iter().find(|c| c.name == "VTODO")?;

    let Some(uid) = vtodo.find_prop("UID").map(|p| p.val.to_string()) else {
        log::warn!("Skipping VTODO without UID");
        return None;
    };

    let summary = vtodo.find_prop("SUMMARY").map(|p| unescape_text(p.val.as_ref()));
    let description = vtodo
        .find_prop("DESCRIPTION")
        .map(|p| unescape_text(p.val.as_ref()));

    let priority = vtodo.find_prop("PRIORITY").and_then(|p| {
        let value = p.val.as_ref().trim().parse::<u8>().ok();
        if value.is_none() {
            log::warn!("Ignoring malformed PRIORITY '{}' on {}", p.val, uid);
        }
        value
    });

    let due = vtodo.find_prop("DUE").and_then(|p| to_task_time(p, zone, &uid));
    let start = vtodo
        .find_prop("DTSTART")
        .and_then(|p| to_task_time(p, zone, &uid));
    let completed = vtodo
        .find_prop("COMPLETED")
        .and_then(|p| to_utc(p, zone, &uid));
    let status_completed = vtodo
        .find_prop("STATUS")
        .is_some_and(|p| p.val.as_ref().eq_ignore_ascii_case("COMPLETED"));

    let recurrence = vtodo
        .find_prop("RRULE")
        .and_then(|p| recurrence::decode(p.val.as_ref()));

    // RELATED-TO without RELTYPE defaults to PARENT
    let parent_uid = vtodo
        .properties
        .iter()
        .filter(|p| p.name == "RELATED-TO")
        .find(|p| {
            param(p, "RELTYPE")
                .map(|t| t.eq_ignore_ascii_case("PARENT"))
                .unwrap_or(true)
        })
        .map(|p| p.val.to_string())
        .filter(|v| !v.is_empty());

    let order = vtodo
        .find_prop(SORT_ORDER_PROP)
        .and_then(|p| p.val.as_ref().trim().parse::<i64>().ok());
    let collapsed = vtodo
        .find_prop(COLLAPSED_PROP)
        .is_some_and(|p| p.val.as_ref().trim() == "1");

    // CATEGORIES may repeat and may hold comma-separated lists
    let mut categories: Vec<String> = Vec::new();
    for prop in vtodo.properties.iter().filter(|p| p.name == "CATEGORIES") {
        for tag in split_text_list(prop.val.as_ref()) {
            if !tag.is_empty() && !categories.contains(&tag) {
                categories.push(tag);
            }
        }
    }

    let geo = vtodo.find_prop("GEO").and_then(|p| {
        let place = parse_geo(p.val.as_ref());
        if place.is_none() {
            log::warn!("Ignoring malformed GEO '{}' on {}", p.val, uid);
        }
        place
    });

    let alarms = vtodo
        .components
        .iter()
        .filter(|c| c.name == "VALARM")
        .filter_map(|alarm| parse_alarm(alarm, zone, &uid))
        .collect();

    let created = vtodo.find_prop("CREATED").and_then(|p| to_utc(p, zone, &uid));
    let last_modified = vtodo
        .find_prop("LAST-MODIFIED")
        .and_then(|p| to_utc(p, zone, &uid));

    // Custom X- properties (preserved for round-tripping client-specific data)
    let custom_properties = vtodo
        .properties
        .iter()
        .filter(|p| {
            let name = p.name.as_ref();
            name.starts_with("X-") && name != SORT_ORDER_PROP && name != COLLAPSED_PROP
        })
        .map(|p| (p.name.to_string(), p.val.to_string()))
        .collect();

    Some(RemoteTodo {
        uid,
        summary,
        description,
        priority,
        due,
        start,
        completed,
        status_completed,
        recurrence,
        parent_uid,
        order,
        collapsed,
        categories,
        geo,
        alarms,
        created,
        last_modified,
        custom_properties,
    })
}

fn param<'a>(prop: &'a Property, key: &str) -> Option<&'a str> {
    prop.params
        .iter()
        .find(|p| p.key == key)
        .and_then(|p| p.val.as_ref())
        .map(|v| v.as_ref())
}

fn to_task_time(prop: &Property, zone: Tz, uid: &str) -> Option<TaskTime> {
    let Ok(dpt) = DatePerhapsTime::try_from(prop) else {
        log::warn!(
            "Ignoring malformed {} '{}' on {}",
            prop.name,
            prop.val,
            uid
        );
        return None;
    };
    match dpt {
        DatePerhapsTime::Date(d) => Some(TaskTime::AllDay(d)),
        DatePerhapsTime::DateTime(dt) => resolve(dt, zone).map(TaskTime::Timed),
    }
}

fn to_utc(prop: &Property, zone: Tz, uid: &str) -> Option<DateTime<Utc>> {
    match to_task_time(prop, zone, uid)? {
        TaskTime::Timed(dt) => Some(dt),
        TaskTime::AllDay(d) => d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
    }
}

/// Convert icalendar's CalendarDateTime to UTC, reading floating values in `zone`
fn resolve(dt: CalendarDateTime, zone: Tz) -> Option<DateTime<Utc>> {
    match dt {
        CalendarDateTime::Utc(dt) => Some(dt),
        CalendarDateTime::Floating(naive) => local_to_utc(zone, &naive),
        CalendarDateTime::WithTimezone { date_time, tzid } => {
            let tz = match tzid.parse::<Tz>() {
                Ok(tz) => tz,
                Err(_) => {
                    log::debug!("Unknown TZID {}, reading in {}", tzid, zone);
                    zone
                }
            };
            local_to_utc(tz, &date_time)
        }
    }
}

fn local_to_utc(tz: Tz, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_geo(value: &str) -> Option<Place> {
    let (lat, lon) = value.split_once(';')?;
    let latitude = lat.trim().parse::<f64>().ok()?;
    let longitude = lon.trim().parse::<f64>().ok()?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some(Place {
        latitude,
        longitude,
    })
}

/// Parse a VALARM into an alarm (relative to start, relative to due, or absolute)
fn parse_alarm(alarm: &Component, zone: Tz, uid: &str) -> Option<Alarm> {
    let trigger = alarm.find_prop("TRIGGER")?;
    let value = trigger.val.as_ref().trim();

    if param(trigger, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE-TIME")) {
        return to_utc(trigger, zone, uid).map(Alarm::At);
    }

    let Some(offset) = parse_duration_secs(value) else {
        log::warn!("Ignoring malformed TRIGGER '{}' on {}", value, uid);
        return None;
    };

    if param(trigger, "RELATED").is_some_and(|r| r.eq_ignore_ascii_case("END")) {
        Some(Alarm::RelativeToDue(offset))
    } else {
        Some(Alarm::RelativeToStart(offset))
    }
}

/// Parse a signed ISO 8601 duration (-PT15M, P1D, +PT1H) into seconds
fn parse_duration_secs(value: &str) -> Option<i64> {
    let (negative, rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.trim_start_matches('+')),
    };

    let duration = iso8601::duration(rest).ok()?;
    let std_duration: std::time::Duration = duration.into();
    let secs = i64::try_from(std_duration.as_secs()).ok()?;

    Some(if negative { -secs } else { secs })
}

/// Undo RFC 5545 TEXT escaping.
pub(crate) fn unescape_text(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => result.push('\n'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}

/// Split a TEXT list on unescaped commas and unescape each item.
fn split_text_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            items.push(unescape_text(current.trim()));
            current.clear();
        } else {
            current.push(c);
        }
    }
    items.push(unescape_text(current.trim()));
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const TODO: &str = r#"BEGIN:VCALENDAR
VERSION:2.0
PRODID:+//IDN bitfire.at//ical4android
BEGIN:VTODO
UID:6ba4c6aa-7d4c-4a7b-9d10-f0a1a0d4a1bb
SUMMARY:Water the plants
DESCRIPTION:Both balconies
PRIORITY:6
DUE;TZID=Europe/Berlin:20250320T180000
DTSTART;TZID=Europe/Berlin:20250320T090000
RRULE:FREQ=WEEKLY;BYDAY=TH
RELATED-TO;RELTYPE=PARENT:0d8f8a44-0aa7-4b7c-9a43-6a4b2d1d0c11
X-APPLE-SORT-ORDER:512
CATEGORIES:home,garden
CATEGORIES:weekly
GEO:52.52;13.405
X-MOZ-GENERATION:3
CREATED:20250301T100000Z
LAST-MODIFIED:20250302T100000Z
BEGIN:VALARM
ACTION:DISPLAY
DESCRIPTION:Reminder
TRIGGER;RELATED=END:-PT15M
END:VALARM
BEGIN:VALARM
ACTION:DISPLAY
DESCRIPTION:Reminder
TRIGGER;VALUE=DATE-TIME:20250320T070000Z
END:VALARM
END:VTODO
END:VCALENDAR"#;

    #[test]
    fn test_parse_full_vtodo() {
        let todo = parse_todo(TODO, Tz::UTC).expect("Should parse");

        assert_eq!(todo.uid, "6ba4c6aa-7d4c-4a7b-9d10-f0a1a0d4a1bb");
        assert_eq!(todo.summary.as_deref(), Some("Water the plants"));
        assert_eq!(todo.description.as_deref(), Some("Both balconies"));
        assert_eq!(todo.priority, Some(6));
        assert_eq!(
            todo.due,
            Some(TaskTime::Timed(
                Utc.with_ymd_and_hms(2025, 3, 20, 17, 0, 0).unwrap()
            ))
        );
        assert_eq!(
            todo.start,
            Some(TaskTime::Timed(
                Utc.with_ymd_and_hms(2025, 3, 20, 8, 0, 0).unwrap()
            ))
        );
        let recurrence = todo.recurrence.expect("Should have recurrence");
        assert_eq!(recurrence.rule, "FREQ=WEEKLY;BYDAY=TH");
        assert!(!recurrence.from_completion);
        assert_eq!(
            todo.parent_uid.as_deref(),
            Some("0d8f8a44-0aa7-4b7c-9a43-6a4b2d1d0c11")
        );
        assert_eq!(todo.order, Some(512));
        assert_eq!(todo.categories, vec!["home", "garden", "weekly"]);
        assert_eq!(
            todo.geo,
            Some(Place {
                latitude: 52.52,
                longitude: 13.405
            })
        );
        assert_eq!(
            todo.alarms,
            vec![
                Alarm::RelativeToDue(-15 * 60),
                Alarm::At(Utc.with_ymd_and_hms(2025, 3, 20, 7, 0, 0).unwrap()),
            ]
        );
        assert_eq!(
            todo.custom_properties,
            vec![("X-MOZ-GENERATION".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn test_missing_uid_is_skipped() {
        let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VTODO\r\nSUMMARY:No uid\r\nEND:VTODO\r\nEND:VCALENDAR\r\n";
        assert!(parse_todo(ics, Tz::UTC).is_none());
    }

    #[test]
    fn test_malformed_fields_fail_closed() {
        let ics = r#"BEGIN:VCALENDAR
VERSION:2.0
BEGIN:VTODO
UID:broken-fields
SUMMARY:Still here
PRIORITY:urgent
DUE:not-a-date
GEO:north;east
RRULE:BYDAY=MO
BEGIN:VALARM
ACTION:DISPLAY
TRIGGER:soon
END:VALARM
END:VTODO
END:VCALENDAR"#;

        let todo = parse_todo(ics, Tz::UTC).expect("Should still parse");
        assert_eq!(todo.summary.as_deref(), Some("Still here"));
        assert_eq!(todo.priority, None);
        assert_eq!(todo.due, None);
        assert_eq!(todo.geo, None);
        assert_eq!(todo.recurrence, None);
        assert!(todo.alarms.is_empty());
    }

    #[test]
    fn test_all_day_and_floating_values() {
        let ics = r#"BEGIN:VCALENDAR
VERSION:2.0
BEGIN:VTODO
UID:dates
SUMMARY:Dates
DUE;VALUE=DATE:20250401
DTSTART:20250331T080000
STATUS:COMPLETED
END:VTODO
END:VCALENDAR"#;

        let todo = parse_todo(ics, chrono_tz::America::New_York).expect("Should parse");
        assert_eq!(
            todo.due,
            Some(TaskTime::AllDay(NaiveDate::from_ymd_opt(2025, 4, 1).unwrap()))
        );
        assert_eq!(
            todo.start,
            Some(TaskTime::Timed(
                Utc.with_ymd_and_hms(2025, 3, 31, 12, 0, 0).unwrap()
            ))
        );
        assert!(todo.status_completed);
        assert!(todo.completed.is_none());
    }

    #[test]
    fn test_related_to_sibling_is_not_a_parent() {
        let ics = r#"BEGIN:VCALENDAR
VERSION:2.0
BEGIN:VTODO
UID:child
SUMMARY:Child
RELATED-TO;RELTYPE=SIBLING:other
RELATED-TO:parent
END:VTODO
END:VCALENDAR"#;

        let todo = parse_todo(ics, Tz::UTC).expect("Should parse");
        assert_eq!(todo.parent_uid.as_deref(), Some("parent"));
    }

    #[test]
    fn test_text_list_unescaping() {
        assert_eq!(split_text_list("a\\,b,c"), vec!["a,b", "c"]);
        assert_eq!(unescape_text("line\\none\\;two"), "line\none;two");
    }
}
