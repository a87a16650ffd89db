//! Entity extraction: targets, actions, objects, assignees, due dates,
//! priority, and project names. Korean relative-date phrases resolve
//! through a first-match table; English falls back to a forward-only
//! parser.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{Entities, ExtractedEntity};

static TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"notion|노션|slack|슬랙|github|깃허브|linear|리니어|jira|지라|asana|아사나|airtable|에어테이블",
    )
    .expect("target pattern")
});

static ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"만들|생성|추가|create|add|수정|변경|업데이트|update|edit|삭제|지워|delete|remove|찾|검색|search|find|조회|list|할당|assign|보고|report",
    )
    .expect("action pattern")
});

static OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"작업|할\s*일|태스크|task|todo|티켓|ticket|이슈|issue|문서|document|페이지|page|메시지|message|일정|schedule|회의|meeting",
    )
    .expect("object pattern")
});

static ASSIGNEE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([\w가-힣.\-]+)").expect("assignee pattern"));

static PRIORITY_URGENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"긴급|급해|asap|urgent|critical").expect("priority pattern"));
static PRIORITY_HIGH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"중요|high|important").expect("priority pattern"));
static PRIORITY_LOW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"나중에|천천히|low\s*priority|whenever").expect("priority pattern"));

static PROJECT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\w가-힣\-]+)\s*프로젝트").expect("project pattern"));
static PROJECT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"project\s+([\w\-]+)").expect("project pattern"));

static ENGLISH_IN_DAYS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"in\s+(\d{1,3})\s+days?").expect("date pattern"));

/// Canonical spelling for a matched target
fn canonical_target(raw: &str) -> &'static str {
    match raw {
        "notion" | "노션" => "notion",
        "slack" | "슬랙" => "slack",
        "github" | "깃허브" => "github",
        "linear" | "리니어" => "linear",
        "jira" | "지라" => "jira",
        "asana" | "아사나" => "asana",
        _ => "airtable",
    }
}

fn canonical_action(raw: &str) -> &'static str {
    match raw {
        "만들" | "생성" | "추가" | "create" | "add" => "create",
        "수정" | "변경" | "업데이트" | "update" | "edit" => "update",
        "삭제" | "지워" | "delete" | "remove" => "delete",
        "찾" | "검색" | "search" | "find" => "search",
        "조회" | "list" => "list",
        "할당" | "assign" => "assign",
        _ => "report",
    }
}

fn canonical_object(raw: &str) -> &'static str {
    if raw.contains("작업") || raw.contains('할') || raw == "태스크" || raw == "task" || raw == "todo" {
        "task"
    } else if raw == "티켓" || raw == "ticket" || raw == "이슈" || raw == "issue" {
        "issue"
    } else if raw == "문서" || raw == "document" || raw == "페이지" || raw == "page" {
        "document"
    } else if raw == "메시지" || raw == "message" {
        "message"
    } else {
        "schedule"
    }
}

/// Extract all entities from the (lowercased) text
pub fn extract(text: &str, reference_time: DateTime<Utc>) -> Entities {
    let mut entities = Entities::default();

    if let Some(m) = TARGET.find(text) {
        entities.target = Some(ExtractedEntity::new(
            canonical_target(m.as_str()),
            0.9,
            m.start(),
        ));
    }

    if let Some(m) = ACTION.find(text) {
        entities.action = Some(ExtractedEntity::new(
            canonical_action(m.as_str()),
            0.7,
            m.start(),
        ));
    }

    if let Some(m) = OBJECT.find(text) {
        entities.object = Some(ExtractedEntity::new(
            canonical_object(m.as_str()),
            0.6,
            m.start(),
        ));
    }

    if let Some(captures) = ASSIGNEE.captures(text) {
        let m = captures.get(1).expect("assignee capture");
        entities.assignee = Some(ExtractedEntity::new(m.as_str(), 0.95, m.start()));
    }

    if let Some((date, position)) = resolve_due_date(text, reference_time) {
        entities.due_date = Some(ExtractedEntity::new(
            date.format("%Y-%m-%d").to_string(),
            0.8,
            position,
        ));
    }

    entities.priority = extract_priority(text);
    entities.project = extract_project(text);

    entities
}

fn extract_priority(text: &str) -> Option<ExtractedEntity> {
    if let Some(m) = PRIORITY_URGENT.find(text) {
        return Some(ExtractedEntity::new("urgent", 0.8, m.start()));
    }
    if let Some(m) = PRIORITY_HIGH.find(text) {
        return Some(ExtractedEntity::new("high", 0.7, m.start()));
    }
    PRIORITY_LOW
        .find(text)
        .map(|m| ExtractedEntity::new("low", 0.7, m.start()))
}

fn extract_project(text: &str) -> Option<ExtractedEntity> {
    let m = PROJECT_SUFFIX
        .captures(text)
        .and_then(|c| c.get(1))
        .or_else(|| PROJECT_PREFIX.captures(text).and_then(|c| c.get(1)))?;
    // "그" / "이" before 프로젝트 are referents, not names
    if matches!(m.as_str(), "그" | "이" | "저" | "the" | "this" | "that") {
        return None;
    }
    Some(ExtractedEntity::new(m.as_str(), 0.5, m.start()))
}

/// Count distinct integration targets mentioned
pub fn count_targets(text: &str) -> usize {
    let mut seen = Vec::new();
    for m in TARGET.find_iter(text) {
        let canonical = canonical_target(m.as_str());
        if !seen.contains(&canonical) {
            seen.push(canonical);
        }
    }
    seen.len()
}

/// Korean relative-date table, first match wins; then English,
/// forward-only.
fn resolve_due_date(text: &str, reference: DateTime<Utc>) -> Option<(NaiveDate, usize)> {
    let today = reference.date_naive();

    let korean_table: [(&str, i64); 7] = [
        ("오늘", 0),
        ("내일", 1),
        ("모레", 2),
        ("다음 주", days_until(today, Weekday::Mon, true)),
        ("다음주", days_until(today, Weekday::Mon, true)),
        ("이번 주", days_until(today, Weekday::Fri, false)),
        ("이번주", days_until(today, Weekday::Fri, false)),
    ];
    for (phrase, offset) in korean_table {
        if let Some(position) = text.find(phrase) {
            return Some((today + Duration::days(offset), position));
        }
    }

    let korean_weekdays: [(&str, Weekday); 7] = [
        ("월요일", Weekday::Mon),
        ("화요일", Weekday::Tue),
        ("수요일", Weekday::Wed),
        ("목요일", Weekday::Thu),
        ("금요일", Weekday::Fri),
        ("토요일", Weekday::Sat),
        ("일요일", Weekday::Sun),
    ];
    for (phrase, weekday) in korean_weekdays {
        if let Some(position) = text.find(phrase) {
            let offset = days_until(today, weekday, true);
            return Some((today + Duration::days(offset), position));
        }
    }

    // English fallback
    if let Some(position) = text.find("day after tomorrow") {
        return Some((today + Duration::days(2), position));
    }
    if let Some(position) = text.find("tomorrow") {
        return Some((today + Duration::days(1), position));
    }
    if let Some(position) = text.find("today") {
        return Some((today, position));
    }
    if let Some(position) = text.find("next week") {
        let offset = days_until(today, Weekday::Mon, true);
        return Some((today + Duration::days(offset), position));
    }
    if let Some(captures) = ENGLISH_IN_DAYS.captures(text) {
        let days: i64 = captures.get(1)?.as_str().parse().ok()?;
        let position = captures.get(0)?.start();
        return Some((today + Duration::days(days), position));
    }
    let english_weekdays: [(&str, Weekday); 7] = [
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    for (phrase, weekday) in english_weekdays {
        if let Some(position) = text.find(phrase) {
            let offset = days_until(today, weekday, true);
            return Some((today + Duration::days(offset), position));
        }
    }

    None
}

/// Days from `from` to the next `target` weekday. With `strict`, a
/// matching today rolls a full week forward.
fn days_until(from: NaiveDate, target: Weekday, strict: bool) -> i64 {
    let diff = (target.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    if diff == 0 && strict {
        7
    } else {
        diff
    }
}
