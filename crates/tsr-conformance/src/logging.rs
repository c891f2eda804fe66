use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// One JSON line per executed case: enough to find the fixture, replay the
/// case and see why it passed or failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub suite_id: String,
    pub fixture_id: String,
    pub case_id: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        case_id: &str,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: "tsr-conformance-log-v1",
            suite_id: suite_id.to_string(),
            fixture_id: fixture_id.to_string(),
            case_id: case_id.to_string(),
            artifact_refs: vec![format!("crates/tsr-conformance/fixtures/{fixture_id}")],
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }

    pub fn to_json_line(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|error| format!("failed encoding case log: {error}"))
    }
}

pub(crate) fn replay_command(suite: &str, case: &str) -> String {
    format!("cargo test -p tsr-conformance {suite}_conformance_is_green -- --nocapture # case={case}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::StructuredCaseLog;

    #[test]
    fn extra_fields_flatten_into_the_json_line() {
        let log = StructuredCaseLog::new(
            "tiling",
            "tiling_cases.json",
            "row_10_over_4",
            "replay".to_string(),
            "pass",
            "parity_ok",
        )
        .with_extra_fields(BTreeMap::from([("numtiles".to_string(), json!(4))]));
        assert!(log.passed());
        let line = log.to_json_line().expect("json");
        let parsed: serde_json::Value = serde_json::from_str(&line).expect("parse");
        assert_eq!(parsed["numtiles"], json!(4));
        assert_eq!(parsed["suite_id"], json!("tiling"));
        assert_eq!(
            parsed["artifact_refs"][0],
            json!("crates/tsr-conformance/fixtures/tiling_cases.json")
        );
    }
}
