//! Monitored persons, session history, alerts and aggregated behavior
//! reports.

pub mod client;
pub mod models;

pub use client::ReportClient;
pub use models::{
    Acknowledgement, Alert, BehaviorReport, Dashboard, DashboardTotals, ImageAnalysis, NewPerson,
    PersonAlerts, PersonDetail, PersonList, PersonSessions, PersonSummary, PostureSummary,
    Recommendation, SessionDetail, SessionSummary, StillAnalysis,
};
