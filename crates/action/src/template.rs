//! 알림 템플릿 렌더링
//!
//! `{{alarm.*}}`, `{{alert.*}}`, `{{target.*}}`, `{{dimensions.*}}`
//! 네임스페이스의 변수를 발송 시점에 해석합니다. 없는 변수는 빈
//! 문자열이 되며 렌더링은 절대 발송을 실패시키지 않습니다.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use watchpost_core::types::Alert;

static VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap());

/// 알림에서 템플릿 변수 표를 만듭니다.
pub fn template_context(alert: &Alert) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    vars.insert("alert.id".to_owned(), alert.id.clone());
    vars.insert("alert.name".to_owned(), alert.alert_name.clone());
    vars.insert(
        "alert.severity".to_owned(),
        alert.severity.level().to_string(),
    );
    vars.insert(
        "alert.status".to_owned(),
        format!("{:?}", alert.status).to_uppercase(),
    );
    vars.insert("alert.begin_time".to_owned(), alert.begin_time.to_string());
    vars.insert("alert.latest_time".to_owned(), alert.latest_time.to_string());
    vars.insert("alert.duration".to_owned(), alert.duration.to_string());
    vars.insert(
        "alert.assignee".to_owned(),
        alert.assignee.join(","),
    );

    vars.insert("alarm.id".to_owned(), alert.id.clone());
    vars.insert("alarm.name".to_owned(), alert.alert_name.clone());
    vars.insert(
        "alarm.level".to_owned(),
        alert.severity.level().to_string(),
    );
    vars.insert(
        "alarm.strategy_id".to_owned(),
        alert.strategy_id.to_string(),
    );
    vars.insert("alarm.bk_biz_id".to_owned(), alert.bk_biz_id.to_string());
    if let Some(log) = alert.logs.first() {
        vars.insert("alarm.description".to_owned(), log.description.clone());
    }

    for (key, value) in &alert.tags {
        vars.insert(format!("target.{key}"), value.clone());
    }
    for dim in &alert.dimensions {
        vars.insert(format!("dimensions.{}", dim.key), dim.display_value.clone());
    }
    vars
}

/// 템플릿 문자열을 렌더링합니다. 없는 변수는 빈 문자열입니다.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    VAR_PATTERN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}
