//! Contains the data models for API requests and responses.

use crate::hardware::link::LinkStatus;
use crate::print::PrintStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Combined status of the print controller and the firmware link.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub print: PrintStatus,
    pub link: LinkStatus,
}

/// Returned when a print job is accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct PrintStartedResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
