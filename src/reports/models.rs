//! Response models for the history and report endpoints.
//!
//! Every field is optional on the wire. Sub-objects whose shape the server
//! does not pin down are kept as raw JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::websocket::{AnalysisResult, OverallState};
use crate::wire::{null_as_default, sparse_scores};

/// A monitored person as embedded in report responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonSummary {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub full_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default)]
    pub date_joined: Option<String>,
}

/// `GET /persons/`, newest first.
///
/// Read from a bare array or from a paginated `{count, results}` page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersonList {
    pub persons: Vec<PersonSummary>,
}

impl<'de> Deserialize<'de> for PersonList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Bare(Vec<PersonSummary>),
            Page {
                #[serde(default, deserialize_with = "null_as_default")]
                results: Vec<PersonSummary>,
            },
        }

        let persons = match Option::<Shape>::deserialize(deserializer)? {
            Some(Shape::Bare(persons)) | Some(Shape::Page { results: persons }) => persons,
            None => Vec::new(),
        };
        Ok(Self { persons })
    }
}

/// `GET /persons/{id}/`, and the echo of `POST /persons/`.
///
/// The creation echo carries no `id`; it reads as 0.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersonDetail {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub first_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default)]
    pub date_joined: Option<String>,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub birthdate: Option<String>,
    #[serde(rename = "genere", default, deserialize_with = "null_as_default")]
    pub gender: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sessions_count: u64,
}

impl PersonDetail {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Body of `POST /persons/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewPerson {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
    #[serde(rename = "genere")]
    pub gender: String,
}

/// Result of `POST /analyze/` for one still image.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageAnalysis {
    #[serde(default, deserialize_with = "null_as_default")]
    pub success: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub analysis: StillAnalysis,
}

/// Per-frame result plus what only the still-image endpoint reports.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StillAnalysis {
    #[serde(flatten)]
    pub result: AnalysisResult,
    #[serde(default)]
    pub age: Option<f64>,
    #[serde(default)]
    pub gender: Option<String>,
    /// Set when emotion inference failed; the posture part may still hold
    #[serde(default)]
    pub emotion_error: Option<String>,
    #[serde(default)]
    pub posture_error: Option<String>,
}

/// One row of a session listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionSummary {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub person_name: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    /// Human-readable, e.g. `"3m 12s"`; absent while the session is running.
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub overall_state: OverallState,
}

impl SessionSummary {
    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// `GET /persons/{id}/sessions/`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersonSessions {
    #[serde(default)]
    pub person: Option<PersonSummary>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_sessions: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sessions: Vec<SessionSummary>,
}

/// Posture flag counters over a whole session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PostureSummary {
    #[serde(default, deserialize_with = "null_as_default")]
    pub head_down_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hunched_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hands_on_face_count: u64,
}

/// A behavior alert raised during a session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub alert_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub severity: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_reviewed: bool,
}

/// `GET /sessions/{id}/`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionDetail {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub person: Option<PersonSummary>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub overall_state: OverallState,
    /// Percentage per emotion label
    #[serde(default, deserialize_with = "sparse_scores")]
    pub emotion_summary: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub posture_summary: PostureSummary,
    #[serde(default, deserialize_with = "null_as_default")]
    pub alerts: Vec<Alert>,
    /// Per-frame records and every other field, untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionDetail {
    /// Emotion with the highest percentage, if any were recorded.
    pub fn dominant_emotion(&self) -> Option<&str> {
        self.emotion_summary
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(label, _)| label.as_str())
    }
}

/// `GET /persons/{id}/alerts/`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersonAlerts {
    #[serde(default)]
    pub person_id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub person_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_alerts: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unreviewed_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Recommendation {
    #[serde(default, deserialize_with = "null_as_default")]
    pub level: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub suggestions: Vec<String>,
}

/// `GET /persons/{id}/report/`
///
/// A person without sessions gets only `person` and a `message`. Servers that
/// wrap the aggregates in a `summary` object are accepted too; that object is
/// kept raw.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BehaviorReport {
    #[serde(default)]
    pub person: Option<PersonSummary>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_sessions: u64,
    #[serde(default, deserialize_with = "sparse_scores")]
    pub average_emotions: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub state_distribution: BTreeMap<String, u64>,
    /// Alert count per alert type
    #[serde(default, deserialize_with = "null_as_default")]
    pub alert_summary: BTreeMap<String, u64>,
    #[serde(default)]
    pub overall_tendency: Option<String>,
    #[serde(default)]
    pub recommendation: Option<Recommendation>,
    #[serde(default)]
    pub summary: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl BehaviorReport {
    /// False for the "no sessions recorded" answer.
    pub fn has_data(&self) -> bool {
        self.total_sessions > 0 || self.recommendation.is_some() || self.summary.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DashboardTotals {
    #[serde(default, deserialize_with = "null_as_default")]
    pub persons: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sessions: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub alerts: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unreviewed_alerts: u64,
}

/// `GET /dashboard/`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Dashboard {
    #[serde(default, deserialize_with = "null_as_default")]
    pub totals: DashboardTotals,
    #[serde(default, deserialize_with = "null_as_default")]
    pub state_distribution: BTreeMap<String, u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub recent_sessions: Vec<SessionSummary>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub recent_alerts: Vec<Alert>,
}

/// Plain `{message}` acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Acknowledgement {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_listing() {
        let json = r#"{
            "person": {"id": 3, "full_name": "Ana Ruiz", "email": "ana@example.com", "date_joined": null},
            "total_sessions": 2,
            "sessions": [
                {"id": 9, "person_name": "Ana Ruiz", "started_at": "2024-05-01T10:00:00Z",
                 "ended_at": "2024-05-01T10:03:12Z", "duration": "3m 12s", "overall_state": "anxious"},
                {"id": 8, "person_name": "Ana Ruiz", "started_at": "2024-04-30T09:00:00Z",
                 "ended_at": null, "duration": null, "overall_state": null}
            ]
        }"#;

        let listing: PersonSessions = serde_json::from_str(json).unwrap();
        assert_eq!(listing.person.unwrap().full_name, "Ana Ruiz");
        assert_eq!(listing.total_sessions, 2);
        assert_eq!(listing.sessions[0].overall_state, OverallState::Anxious);
        assert!(listing.sessions[0].is_finished());
        assert_eq!(listing.sessions[1].overall_state, OverallState::Normal);
        assert!(!listing.sessions[1].is_finished());
    }

    #[test]
    fn test_session_detail_keeps_extra_fields() {
        let json = r#"{
            "id": 9,
            "overall_state": "stressed",
            "emotion_summary": {"happy": 10.0, "sad": 55.5, "fear": null},
            "posture_summary": {"head_down_count": 4, "hunched_count": 1},
            "alerts": [{"id": 1, "alert_type": "sadness", "severity": "high",
                        "message": "Sustained sadness", "is_reviewed": false}],
            "emotions": [{"dominant_emotion": "sad"}]
        }"#;

        let detail: SessionDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.overall_state, OverallState::Stressed);
        assert_eq!(detail.dominant_emotion(), Some("sad"));
        assert_eq!(detail.emotion_summary.len(), 2);
        assert_eq!(detail.posture_summary.head_down_count, 4);
        assert_eq!(detail.posture_summary.hands_on_face_count, 0);
        assert_eq!(detail.alerts[0].severity, "high");
        assert!(detail.extra.contains_key("emotions"));
    }

    #[test]
    fn test_report_with_data() {
        let json = r#"{
            "person": {"id": 3, "full_name": "Ana Ruiz"},
            "total_sessions": 4,
            "average_emotions": {"sad": 40.2, "fear": 12.0},
            "state_distribution": {"normal": 3, "anxious": 1},
            "alert_summary": {"sadness": 2},
            "overall_tendency": "requiere_atencion",
            "recommendation": {"level": "moderado", "message": "Follow up",
                               "suggestions": ["Daily exercise", "Weekly check-in"]}
        }"#;

        let report: BehaviorReport = serde_json::from_str(json).unwrap();
        assert!(report.has_data());
        assert_eq!(report.state_distribution["normal"], 3);
        assert_eq!(report.alert_summary["sadness"], 2);
        let recommendation = report.recommendation.unwrap();
        assert_eq!(recommendation.level, "moderado");
        assert_eq!(recommendation.suggestions.len(), 2);
    }

    #[test]
    fn test_report_without_sessions() {
        let json = r#"{"person": {"id": 3}, "message": "No sessions recorded"}"#;
        let report: BehaviorReport = serde_json::from_str(json).unwrap();
        assert!(!report.has_data());
        assert_eq!(report.message.as_deref(), Some("No sessions recorded"));
    }

    #[test]
    fn test_report_summary_shape() {
        let json = r#"{"summary": {"sessions": 2}, "recommendation": {"level": "normal"}}"#;
        let report: BehaviorReport = serde_json::from_str(json).unwrap();
        assert!(report.has_data());
        assert_eq!(report.summary.unwrap()["sessions"], 2);
        assert!(report.recommendation.unwrap().suggestions.is_empty());
    }

    #[test]
    fn test_person_list_shapes() {
        let bare: PersonList = serde_json::from_str(
            r#"[{"id": 2, "full_name": "Bo Li", "email": "bo@example.com", "date_joined": "2024-01-01T00:00:00Z"}]"#,
        )
        .unwrap();
        assert_eq!(bare.persons[0].id, 2);
        assert_eq!(bare.persons[0].full_name, "Bo Li");

        let page: PersonList =
            serde_json::from_str(r#"{"count": 1, "next": null, "results": [{"id": 3}]}"#).unwrap();
        assert_eq!(page.persons.len(), 1);
        assert_eq!(page.persons[0].id, 3);

        let empty: PersonList = serde_json::from_str("null").unwrap();
        assert!(empty.persons.is_empty());
    }

    #[test]
    fn test_person_detail() {
        let json = r#"{
            "id": 3, "first_name": "Ana", "last_name": "Ruiz", "email": "ana@example.com",
            "date_joined": "2024-01-01T00:00:00Z", "birthdate": "2001-02-03",
            "genere": "F", "age": 23, "sessions_count": 4
        }"#;
        let person: PersonDetail = serde_json::from_str(json).unwrap();
        assert_eq!(person.full_name(), "Ana Ruiz");
        assert_eq!(person.gender, "F");
        assert_eq!(person.age, Some(23));
        assert_eq!(person.sessions_count, 4);

        let echo: PersonDetail =
            serde_json::from_str(r#"{"first_name": "Bo", "last_name": "", "birthdate": null}"#)
                .unwrap();
        assert_eq!(echo.id, 0);
        assert_eq!(echo.full_name(), "Bo");
    }

    #[test]
    fn test_new_person_body() {
        let body = serde_json::to_value(NewPerson {
            first_name: "Bo".to_string(),
            last_name: "Li".to_string(),
            email: "bo@example.com".to_string(),
            password: "pw".to_string(),
            birthdate: None,
            gender: "M".to_string(),
        })
        .unwrap();
        assert_eq!(body["genere"], "M");
        assert!(body.get("birthdate").is_none());
        assert!(body.get("gender").is_none());
    }

    #[test]
    fn test_image_analysis() {
        let json = r#"{
            "success": true,
            "analysis": {
                "emotion": "fear", "emotion_scores": {"fear": 71.0, "sad": null},
                "age": 31, "gender": "Woman", "head_down": true, "hunched": false,
                "hands_on_face": false, "overall_state": "anxious",
                "timestamp": "2024-05-01T10:00:00+00:00", "posture_error": "no keypoints"
            }
        }"#;
        let analysis: ImageAnalysis = serde_json::from_str(json).unwrap();
        assert!(analysis.success);
        let still = analysis.analysis;
        assert_eq!(still.result.emotion.as_deref(), Some("fear"));
        assert_eq!(still.result.emotion_scores.len(), 1);
        assert_eq!(still.result.overall_state, OverallState::Anxious);
        assert!(still.result.head_down);
        assert_eq!(still.age, Some(31.0));
        assert_eq!(still.gender.as_deref(), Some("Woman"));
        assert_eq!(still.posture_error.as_deref(), Some("no keypoints"));
        assert_eq!(still.emotion_error, None);
    }

    #[test]
    fn test_dashboard() {
        let json = r#"{
            "totals": {"persons": 5, "sessions": 20, "alerts": 7, "unreviewed_alerts": 2},
            "state_distribution": {"normal": 15},
            "recent_sessions": [],
            "recent_alerts": [{"id": 4, "alert_type": "posture", "is_reviewed": false}]
        }"#;

        let dashboard: Dashboard = serde_json::from_str(json).unwrap();
        assert_eq!(dashboard.totals.unreviewed_alerts, 2);
        assert_eq!(dashboard.recent_alerts[0].alert_type, "posture");
        assert!(dashboard.recent_sessions.is_empty());
    }
}
