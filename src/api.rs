use bigdecimal::{BigDecimal, Zero};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{money, FeeRequest, FeeTransaction, PaymentProof, Role, Student, StudentFields, StudentPublic};

static ENROLLMENT_SESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-(\d{2}|\d{4})$").expect("valid session regex"));

/// Body of every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

/// Parses a required id field, 400 when missing or malformed.
pub fn parse_id(raw: Option<&str>, field: &str) -> Result<Uuid> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation(format!("{} is required", field)))?;
    raw.parse::<Uuid>()
        .map_err(|_| AppError::Validation(format!("{} is not a valid id", field)))
}

// Form inputs arrive as strings or numbers depending on the client.
fn opt_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn required(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    pub user_id: Uuid,
}

/// Student create/update body. Every field is optional at the wire level so
/// missing input yields a readable 400 instead of a parse failure.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPayload {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub roll_no: Option<String>,
    #[serde(rename = "class", default, deserialize_with = "opt_text")]
    pub class_name: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub session: Option<String>,
    #[serde(default)]
    pub parent_name: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub contact: Option<String>,
    #[serde(default, deserialize_with = "money::deserialize_option")]
    pub total_fees: Option<BigDecimal>,
}

impl StudentPayload {
    pub fn into_fields(self) -> Result<StudentFields> {
        let (Some(name), Some(roll_no), Some(class_name), Some(session), Some(total_fees)) = (
            required(self.name),
            required(self.roll_no),
            required(self.class_name),
            required(self.session),
            self.total_fees,
        ) else {
            return Err(AppError::Validation(
                "All fields including session are required".to_string(),
            ));
        };
        if total_fees <= BigDecimal::zero() {
            return Err(AppError::Validation("Total fees must be greater than 0".to_string()));
        }
        if !ENROLLMENT_SESSION.is_match(&session) {
            return Err(AppError::Validation(format!(
                "Session '{}' must look like 2024-25",
                session
            )));
        }
        Ok(StudentFields {
            name,
            roll_no,
            class_name,
            session,
            parent_name: self.parent_name.map(|s| s.trim().to_string()).unwrap_or_default(),
            contact: self.contact.map(|s| s.trim().to_string()).unwrap_or_default(),
            total_fees,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StudentResponse {
    pub success: bool,
    pub message: String,
    pub student: Student,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentLoginRequest {
    #[serde(default, deserialize_with = "opt_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub roll_no: Option<String>,
    #[serde(rename = "class", default, deserialize_with = "opt_text")]
    pub class_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StudentLoginResponse {
    pub success: bool,
    pub student: StudentPublic,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentIdQuery {
    pub student_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeeRequest {
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "money::deserialize_option")]
    pub amount: Option<BigDecimal>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateFeeRequestResponse {
    pub success: bool,
    pub message: String,
    pub request: FeeRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayFeeRequest {
    pub request_id: Option<String>,
    pub payment_mode: Option<String>,
    #[serde(flatten)]
    pub proof: PaymentProof,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PayFeeResponse {
    pub success: bool,
    pub transaction: FeeTransaction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentRequest {
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "money::deserialize_option")]
    pub amount: Option<BigDecimal>,
    pub payment_mode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordPaymentResponse {
    pub success: bool,
    pub message: String,
    pub transaction: FeeTransaction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSkip {
    pub student_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub student_id: Uuid,
    pub message: String,
    pub attempts: u32,
}

/// Outcome of a bulk send, one entry per student.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSendReport {
    pub sent: Vec<Uuid>,
    pub skipped: Vec<BulkSkip>,
    pub failed: Vec<BulkFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: serde_json::Value) -> StudentPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn student_payload_trims_and_accepts_numbers() {
        let fields = payload(serde_json::json!({
            "name": "  Asha Verma ",
            "rollNo": 7,
            "class": "5B",
            "session": "2024-25",
            "totalFees": "12000"
        }))
        .into_fields()
        .unwrap();
        assert_eq!(fields.name, "Asha Verma");
        assert_eq!(fields.roll_no, "7");
        assert_eq!(fields.total_fees, BigDecimal::from(12000));
        assert_eq!(fields.parent_name, "");
    }

    #[test]
    fn student_payload_requires_session() {
        let err = payload(serde_json::json!({
            "name": "Asha", "rollNo": "7", "class": "5B", "totalFees": 100
        }))
        .into_fields()
        .unwrap_err();
        assert_eq!(err.to_string(), "All fields including session are required");
    }

    #[test]
    fn student_payload_rejects_bad_session_and_fees() {
        let bad_session = payload(serde_json::json!({
            "name": "Asha", "rollNo": "7", "class": "5B", "session": "spring", "totalFees": 100
        }));
        assert!(bad_session.into_fields().is_err());

        let zero_fees = payload(serde_json::json!({
            "name": "Asha", "rollNo": "7", "class": "5B", "session": "2024-2025", "totalFees": 0
        }));
        assert!(zero_fees.into_fields().is_err());
    }

    #[test]
    fn parse_id_distinguishes_missing_and_malformed() {
        assert_eq!(parse_id(None, "studentId").unwrap_err().to_string(), "studentId is required");
        assert_eq!(
            parse_id(Some("abc"), "studentId").unwrap_err().to_string(),
            "studentId is not a valid id"
        );
        let id = Uuid::new_v4();
        assert_eq!(parse_id(Some(&id.to_string()), "studentId").unwrap(), id);
    }

    #[test]
    fn pay_request_collects_bank_details() {
        let req: PayFeeRequest = serde_json::from_value(serde_json::json!({
            "requestId": "x",
            "paymentMode": "Bank",
            "studentBankName": "SBI",
            "transactionId": "UTR99"
        }))
        .unwrap();
        assert_eq!(req.proof.student_bank_name.as_deref(), Some("SBI"));
        assert_eq!(req.proof.transaction_id.as_deref(), Some("UTR99"));
        assert!(req.proof.account_number.is_none());
    }
}
