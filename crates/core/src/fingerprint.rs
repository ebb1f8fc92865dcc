//! md5 지문 유틸리티
//!
//! 차원 맵과 쿼리 설정의 결정적 지문을 계산합니다. 직렬화 키 순서가
//! 항상 정렬되도록 `serde_json::Value` 기반으로 정규화한 뒤 해시합니다.
//! (serde_json의 기본 Map은 BTreeMap이므로 오브젝트 키는 정렬됩니다.)

use serde::Serialize;

use crate::types::DimensionMap;

/// 직렬화 가능한 값의 md5 hex 지문
///
/// 동일한 내용은 필드 선언 순서와 무관하게 동일한 지문을 냅니다.
pub fn object_md5<T: Serialize>(value: &T) -> String {
    // Value를 경유해 오브젝트 키를 정렬된 형태로 고정한다.
    let canonical = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    format!("{:x}", md5::compute(bytes))
}

/// 차원 맵의 md5 hex 지문
pub fn dimensions_md5(dimensions: &DimensionMap) -> String {
    object_md5(dimensions)
}

/// 알림 dedupe 키: `md5(strategy_id, item_name, dims_md5, level)`
pub fn dedupe_md5(strategy_id: u64, item_name: &str, dims_md5: &str, level: u8) -> String {
    let tuple = serde_json::json!([strategy_id, item_name, dims_md5, level]);
    let bytes = serde_json::to_vec(&tuple).unwrap_or_default();
    format!("{:x}", md5::compute(bytes))
}
