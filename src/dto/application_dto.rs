use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    application::ApplicationStatus, payment::PaymentSplit, profile::StudentType,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SubmitApplicationRequest {
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptApplicationRequest {
    pub room_id: Uuid,
    pub student_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentProfileSummary {
    pub university: String,
    pub course: String,
    pub student_type: StudentType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicantSummary {
    pub id: Uuid,
    pub full_name: String,
    pub age: i32,
    pub bio: String,
    pub student_profile: Option<StudentProfileSummary>,
}

/// One application as the room owner sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationWithApplicant {
    pub id: Uuid,
    pub status: ApplicationStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub student: ApplicantSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: Uuid,
    pub title: String,
    pub location: String,
    pub owner_name: String,
}

/// One application as the applying student sees it. `room` is empty when
/// the room has since been removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentApplicationView {
    pub id: Uuid,
    pub status: ApplicationStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub room: Option<RoomSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizePreview {
    pub application_id: Uuid,
    pub room_id: Uuid,
    pub room_title: String,
    pub owner_name: String,
    #[serde(flatten)]
    pub split: PaymentSplit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasAppliedResponse {
    pub applied: bool,
    pub status: Option<ApplicationStatus>,
}
